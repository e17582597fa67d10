//! Log setup
//!
//! The subscriber is built from [`LoggingConfig`]: `level` seeds the filter
//! unless the caller exported `RUST_LOG` directives, and `format` picks the
//! event encoding. A bad directive string is a configuration error in the
//! gateway taxonomy, not a panic.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use litrest_common::config::{LogFormat, LoggingConfig};
use litrest_common::{GatewayError, Result};

pub fn init(config: &LoggingConfig) -> Result<()> {
    let directives =
        std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| config.level.clone());
    let filter = EnvFilter::try_new(&directives).map_err(|e| {
        GatewayError::Validation(format!("bad log directives {directives:?}: {e}"))
    })?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer().compact()).init(),
    }
    Ok(())
}
