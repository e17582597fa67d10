//! Configuration schema for the litrest gateway
//!
//! The structs below are the configuration contract; they deserialize from
//! any serde format and carry environment-variable overrides for the fields
//! operators most commonly set.

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub databases: Vec<DatabaseConfig>,
    pub pool: PoolConfig,
    pub auth: AuthConfig,
    pub policies: PoliciesConfig,
    pub cache: CacheConfig,
    /// Startup allow-list of callable procedures
    pub rpc: Vec<RpcEntryConfig>,
    /// SQL-callable helper functions (consumed by the page engine, carried
    /// here as part of the shared configuration contract)
    pub udf: Vec<UdfConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            databases: vec![DatabaseConfig {
                name: "main".to_string(),
                path: "./data/main.db".to_string(),
                mode: AccessMode::ReadWrite,
            }],
            pool: PoolConfig::default(),
            auth: AuthConfig::default(),
            policies: PoliciesConfig::default(),
            cache: CacheConfig::default(),
            rpc: RpcEntryConfig::builtins(),
            udf: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Apply environment-variable overrides on top of the current values
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LITREST_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("LITREST_PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
        if let Ok(v) = std::env::var("LITREST_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "text" => self.logging.format = LogFormat::Text,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("LITREST_READERS_PER_DB") {
            if let Ok(n) = v.parse() {
                self.pool.readers_per_db = n;
            }
        }
        if let Ok(v) = std::env::var("LITREST_JWT_SECRET") {
            self.auth.jwt.enabled = true;
            self.auth.jwt.secret = Some(v);
        }
        if let Ok(v) = std::env::var("LITREST_JWKS_URL") {
            self.auth.jwt.enabled = true;
            self.auth.jwt.jwks_url = Some(v);
        }
        if let Ok(v) = std::env::var("LITREST_DEFAULT_ACTION") {
            match v.as_str() {
                "deny" => self.policies.default_action = DefaultAction::Deny,
                "allow" => self.policies.default_action = DefaultAction::Allow,
                _ => {}
            }
        }
    }

    /// The implicit database used when the URL omits one
    pub fn default_database(&self) -> &str {
        self.databases
            .first()
            .map(|d| d.name.as_str())
            .unwrap_or("main")
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Log output shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-oriented console lines
    #[default]
    Text,
    /// One JSON object per event, for log shippers
    Json,
}

/// Logging settings. `RUST_LOG` directives override `level` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// How a database file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
    InMemory,
}

/// One attached database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub path: String,
    pub mode: AccessMode,
}

/// Connection-pool settings, applied per attached database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Reader connections per database (clamped to [1, 32])
    pub readers_per_db: usize,
    /// Acquisition deadline and SQLite busy handler, in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            readers_per_db: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn clamped_readers(&self) -> usize {
        self.readers_per_db.clamp(1, 32)
    }
}

/// Authentication settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt: JwtConfig,
    pub cache: AuthCacheConfig,
}

/// Cache of successfully verified tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthCacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_secs: u64,
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1024,
            ttl_secs: 60,
        }
    }
}

/// Bearer-token verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub enabled: bool,
    /// Accepted signing algorithms; anything else is rejected outright
    pub algorithm_allow_list: Vec<String>,
    /// Shared secret for the HMAC family
    pub secret: Option<String>,
    /// JWKS document location for the RSA/EC families
    pub jwks_url: Option<String>,
    /// JWKS re-fetch interval in seconds
    pub jwks_refresh_secs: u64,
    pub issuer: Option<String>,
    pub audience: Vec<String>,
    /// Claim carrying the caller's role
    pub role_claim: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm_allow_list: vec!["HS256".to_string()],
            secret: None,
            jwks_url: None,
            jwks_refresh_secs: 300,
            issuer: None,
            audience: Vec::new(),
            role_claim: "role".to_string(),
        }
    }
}

/// What happens when no policy matches a (table, action)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    #[default]
    Allow,
    Deny,
}

/// Row-level policy settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
    pub default_action: DefaultAction,
    /// Seed the demo policy set into an empty policy table at startup
    pub seed_defaults: bool,
}

/// Schema-cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub schema_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_ttl_secs: 300,
        }
    }
}

/// HTTP method a procedure is callable with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RpcMethod {
    Get,
    Post,
}

/// Shape of a procedure's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    Object,
    String,
    Integer,
}

/// One SQL-callable helper function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdfConfig {
    pub name: String,
    /// Whether the function is callable from page SQL
    pub expose: bool,
    pub readonly: bool,
    pub deterministic: bool,
}

/// One entry in the procedure allow-list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEntryConfig {
    pub name: String,
    pub method: RpcMethod,
    pub parameters: Vec<String>,
    pub returns: ReturnKind,
}

impl RpcEntryConfig {
    /// The built-in procedures exposed by default
    pub fn builtins() -> Vec<Self> {
        vec![
            Self {
                name: "ping".to_string(),
                method: RpcMethod::Get,
                parameters: vec![],
                returns: ReturnKind::String,
            },
            Self {
                name: "count_rows".to_string(),
                method: RpcMethod::Post,
                parameters: vec!["table".to_string()],
                returns: ReturnKind::Integer,
            },
            Self {
                name: "whoami".to_string(),
                method: RpcMethod::Get,
                parameters: vec![],
                returns: ReturnKind::Object,
            },
        ]
    }
}
