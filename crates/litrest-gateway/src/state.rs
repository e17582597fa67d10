//! Shared application state

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use litrest_common::{GatewayConfig, Result};

use crate::auth::Verifier;
use crate::engine::schema::SchemaCache;
use crate::policy::PolicyEngine;
use crate::pool::PoolManager;
use crate::rpc::RpcRegistry;

/// Everything the HTTP handlers share, cheaply cloneable
#[derive(Clone)]
pub struct AppState {
    pub pools: Arc<PoolManager>,
    pub schemas: Arc<SchemaCache>,
    pub policies: Arc<PolicyEngine>,
    pub auth: Arc<Verifier>,
    pub rpc: Arc<RpcRegistry>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    /// Attach the configured databases, load policies, and wire up every
    /// subsystem.
    pub async fn initialize(config: GatewayConfig) -> Result<Self> {
        let pools = Arc::new(
            PoolManager::from_config(config.pool.clone(), &config.databases).await?,
        );
        let schemas = Arc::new(SchemaCache::new(
            Arc::clone(&pools),
            Duration::from_secs(config.cache.schema_ttl_secs),
        ));

        let policies = Arc::new(PolicyEngine::new(config.policies.default_action));
        for db in &config.databases {
            let count = policies
                .load(&pools, &db.name, config.policies.seed_defaults)
                .await?;
            info!(db = %db.name, policies = count, "database ready");
        }

        let auth = Arc::new(Verifier::with_cache(
            config.auth.jwt.clone(),
            config.auth.cache.clone(),
        )?);
        let rpc = Arc::new(RpcRegistry::from_config(&config.rpc));

        Ok(Self {
            pools,
            schemas,
            policies,
            auth,
            rpc,
            config: Arc::new(config),
        })
    }

    /// The database used when the URL names none
    pub fn default_db(&self) -> &str {
        self.config.default_database()
    }
}
