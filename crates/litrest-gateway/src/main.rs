//! litrest gateway binary

use anyhow::Context;
use clap::Parser;
use tracing::info;

use litrest_common::{AccessMode, DatabaseConfig, GatewayConfig};
use litrest_gateway::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "litrest-gateway")]
#[command(about = "SQLite REST gateway with PostgREST-style querying")]
struct Args {
    /// Listen host
    #[arg(long, env = "LITREST_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(long, env = "LITREST_PORT", default_value = "8080")]
    port: u16,

    /// Path of the default database
    #[arg(long, env = "LITREST_DB", default_value = "./data/main.db")]
    database: String,

    /// Open the default database read-only
    #[arg(long, env = "LITREST_READ_ONLY", default_value = "false")]
    read_only: bool,

    /// Seed the demo policy set into an empty policy table
    #[arg(long, env = "LITREST_SEED_POLICIES", default_value = "false")]
    seed_policies: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = GatewayConfig::default();
    config.server.host = args.host;
    config.server.port = args.port;
    config.logging.level = args.log_level;
    config.databases = vec![DatabaseConfig {
        name: "main".to_string(),
        path: args.database,
        mode: if args.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        },
    }];
    config.policies.seed_defaults = args.seed_policies;
    config.apply_env();

    litrest_gateway::telemetry::init(&config.logging)?;

    info!("Starting litrest gateway");
    info!("  listen: {}:{}", config.server.host, config.server.port);
    info!("  database: {}", config.databases[0].path);
    info!("  auth: {}", if config.auth.jwt.enabled { "jwt" } else { "disabled" });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::initialize(config)
        .await
        .context("failed to initialize gateway state")?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");
    axum::serve(listener, router).await?;
    Ok(())
}
