//! litrest common library
//!
//! Shared types for the litrest gateway: the error taxonomy, the
//! configuration schema, and SQL identifier rules.

pub mod config;
pub mod error;
pub mod ident;

// Re-export commonly used types
pub use config::{
    AccessMode, AuthCacheConfig, AuthConfig, CacheConfig, DatabaseConfig, DefaultAction,
    GatewayConfig, JwtConfig, LogFormat, LoggingConfig, PoliciesConfig, PoolConfig, ReturnKind,
    RpcEntryConfig, RpcMethod, ServerConfig, UdfConfig,
};
pub use error::{ErrorKind, GatewayError, Result};
pub use ident::{quote_ident, validate_ident};
