//! Bearer-token verification
//!
//! A missing token never fails: it yields the anonymous principal. A token
//! that is present but wrong always fails; nothing downgrades silently.
//! Token location order: `Authorization: Bearer`, then `?token=`, then the
//! `jwt_token` cookie.

pub mod jwks;

use std::collections::HashMap;
use std::time::Duration;

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use tracing::debug;

use litrest_common::{GatewayError, JwtConfig, Result};

/// Role sentinel for unauthenticated callers
pub const ANONYMOUS_ROLE: &str = "anonymous";
/// Role assigned when a valid token carries no role claim
const DEFAULT_ROLE: &str = "authenticated";
/// Accepted clock drift for not-before checks, in seconds
const CLOCK_SKEW_SECS: i64 = 60;

/// The authenticated (or anonymous) caller identity, valid for one request
#[derive(Debug, Clone)]
pub struct Principal {
    pub authenticated: bool,
    pub user_id: String,
    pub role: String,
    pub tenant_id: Option<String>,
    /// Every token claim, verbatim
    pub claims: HashMap<String, serde_json::Value>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            authenticated: false,
            user_id: String::new(),
            role: ANONYMOUS_ROLE.to_string(),
            tenant_id: None,
            claims: HashMap::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.authenticated && self.role == "admin"
    }

    /// Debug/whoami rendering
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "authenticated": self.authenticated,
            "user_id": if self.authenticated { Some(self.user_id.as_str()) } else { None },
            "role": self.role,
            "tenant_id": self.tenant_id,
        })
    }
}

/// Cache of successfully verified tokens.
///
/// Entries expire at the cache TTL or the token's own `exp`, whichever
/// comes first; failures are never cached.
struct TokenCache {
    entries: parking_lot::RwLock<std::collections::HashMap<String, CacheEntry>>,
    max_size: usize,
    ttl: Duration,
}

struct CacheEntry {
    principal: Principal,
    expires_at: std::time::Instant,
}

impl TokenCache {
    fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: parking_lot::RwLock::new(std::collections::HashMap::new()),
            max_size,
            ttl,
        }
    }

    fn get(&self, token: &str) -> Option<Principal> {
        let entries = self.entries.read();
        entries.get(token).and_then(|entry| {
            if std::time::Instant::now() < entry.expires_at {
                Some(entry.principal.clone())
            } else {
                None
            }
        })
    }

    fn put(&self, token: String, principal: Principal, token_exp: Option<i64>) {
        let now = std::time::Instant::now();
        let mut expires_at = now + self.ttl;
        if let Some(exp) = token_exp {
            let remaining = exp - chrono::Utc::now().timestamp();
            if remaining <= 0 {
                return;
            }
            expires_at = expires_at.min(now + Duration::from_secs(remaining as u64));
        }

        let mut entries = self.entries.write();
        if entries.len() >= self.max_size {
            entries.retain(|_, entry| entry.expires_at > now);
        }
        if entries.len() >= self.max_size {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            token,
            CacheEntry {
                principal,
                expires_at,
            },
        );
    }
}

/// Verifies bearer tokens against the configured algorithms and keys
pub struct Verifier {
    config: JwtConfig,
    allowed: Vec<Algorithm>,
    jwks: Option<jwks::JwksCache>,
    cache: Option<TokenCache>,
}

impl Verifier {
    pub fn new(config: JwtConfig) -> Result<Self> {
        Self::with_cache(config, litrest_common::config::AuthCacheConfig::default())
    }

    pub fn with_cache(
        config: JwtConfig,
        cache: litrest_common::config::AuthCacheConfig,
    ) -> Result<Self> {
        let mut allowed = Vec::with_capacity(config.algorithm_allow_list.len());
        for name in &config.algorithm_allow_list {
            let algorithm: Algorithm = name.parse().map_err(|_| {
                GatewayError::Validation(format!("unknown algorithm in allow-list: {name}"))
            })?;
            allowed.push(algorithm);
        }
        if config.enabled && config.secret.is_none() && config.jwks_url.is_none() {
            return Err(GatewayError::Validation(
                "auth.jwt.enabled requires a secret or a jwks_url".to_string(),
            ));
        }
        let jwks = config.jwks_url.clone().map(|url| {
            jwks::JwksCache::new(url, Duration::from_secs(config.jwks_refresh_secs))
        });
        let cache = cache
            .enabled
            .then(|| TokenCache::new(cache.max_size, Duration::from_secs(cache.ttl_secs)));
        Ok(Self {
            config,
            allowed,
            jwks,
            cache,
        })
    }

    /// Authenticate a request from its headers and raw query string
    pub async fn verify(&self, headers: &HeaderMap, raw_query: &str) -> Result<Principal> {
        if !self.config.enabled {
            return Ok(Principal::anonymous());
        }
        let Some(token) = extract_token(headers, raw_query) else {
            return Ok(Principal::anonymous());
        };
        self.verify_token(&token).await
    }

    pub async fn verify_token(&self, token: &str) -> Result<Principal> {
        if let Some(cache) = &self.cache {
            if let Some(principal) = cache.get(token) {
                return Ok(principal);
            }
        }
        let principal = self.verify_token_uncached(token).await?;
        if let Some(cache) = &self.cache {
            let exp = principal.claims.get("exp").and_then(|v| v.as_i64());
            cache.put(token.to_string(), principal.clone(), exp);
        }
        Ok(principal)
    }

    async fn verify_token_uncached(&self, token: &str) -> Result<Principal> {
        let header = decode_header(token)
            .map_err(|e| GatewayError::AuthFailed(format!("malformed token: {e}")))?;

        if !self.allowed.contains(&header.alg) {
            return Err(GatewayError::AlgorithmNotAllowed(format!("{:?}", header.alg)));
        }

        let key = self.resolve_key(&header).await?;

        let mut validation = Validation::new(header.alg);
        // Time and audience checks run manually below: expiry tolerates no
        // skew, not-before tolerates CLOCK_SKEW_SECS
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = Default::default();

        let data = decode::<HashMap<String, serde_json::Value>>(token, &key, &validation)
            .map_err(|e| GatewayError::AuthFailed(format!("invalid token: {e}")))?;
        let claims = data.claims;

        let now = chrono::Utc::now().timestamp();
        if let Some(exp) = claims.get("exp").and_then(|v| v.as_i64()) {
            if exp <= now {
                return Err(GatewayError::TokenExpired);
            }
        }
        if let Some(nbf) = claims.get("nbf").and_then(|v| v.as_i64()) {
            if nbf > now + CLOCK_SKEW_SECS {
                return Err(GatewayError::AuthFailed("token not yet valid".to_string()));
            }
        }
        if let Some(expected) = &self.config.issuer {
            match claims.get("iss").and_then(|v| v.as_str()) {
                Some(iss) if iss == expected => {}
                _ => return Err(GatewayError::AuthFailed("wrong issuer".to_string())),
            }
        }
        if !self.config.audience.is_empty() {
            let token_audiences = audience_values(claims.get("aud"));
            let intersects = token_audiences
                .iter()
                .any(|aud| self.config.audience.iter().any(|cfg| cfg == aud));
            if !intersects {
                return Err(GatewayError::AuthFailed("audience mismatch".to_string()));
            }
        }

        let user_id = claims
            .get("sub")
            .or_else(|| claims.get("user_id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::AuthFailed("token missing subject".to_string()))?
            .to_string();
        let role = claims
            .get(&self.config.role_claim)
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_ROLE)
            .to_string();
        let tenant_id = claims
            .get("tenant_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        debug!(%user_id, %role, "request authenticated");
        Ok(Principal {
            authenticated: true,
            user_id,
            role,
            tenant_id,
            claims,
        })
    }

    async fn resolve_key(&self, header: &jsonwebtoken::Header) -> Result<DecodingKey> {
        match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = self.config.secret.as_ref().ok_or_else(|| {
                    GatewayError::AuthFailed("no shared secret configured".to_string())
                })?;
                Ok(DecodingKey::from_secret(secret.as_bytes()))
            }
            _ => {
                let jwks = self.jwks.as_ref().ok_or_else(|| {
                    GatewayError::AuthFailed("no JWKS endpoint configured".to_string())
                })?;
                let kid = header.kid.as_deref().ok_or_else(|| {
                    GatewayError::AuthFailed("token missing key id".to_string())
                })?;
                jwks.resolve(kid).await
            }
        }
    }
}

/// `aud` can be a single string or an array of them
fn audience_values(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// Locate the bearer token: header, query parameter, cookie, in that order
pub fn extract_token(headers: &HeaderMap, raw_query: &str) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    for (key, value) in form_urlencoded::parse(raw_query.as_bytes()) {
        if key == "token" && !value.is_empty() {
            return Some(value.into_owned());
        }
    }
    if let Some(cookies) = headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == "jwt_token" && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit-test-secret";

    fn verifier() -> Verifier {
        Verifier::new(JwtConfig {
            enabled: true,
            algorithm_allow_list: vec!["HS256".to_string()],
            secret: Some(SECRET.to_string()),
            issuer: Some("litrest".to_string()),
            audience: vec!["litrest-api".to_string()],
            ..Default::default()
        })
        .unwrap()
    }

    fn sign(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn valid_claims() -> serde_json::Value {
        let now = chrono::Utc::now().timestamp();
        serde_json::json!({
            "sub": "42",
            "role": "editor",
            "tenant_id": "acme",
            "iss": "litrest",
            "aud": "litrest-api",
            "exp": now + 3600,
            "custom": {"shoe_size": 44},
        })
    }

    #[tokio::test]
    async fn valid_token_maps_claims() {
        let principal = verifier().verify_token(&sign(valid_claims())).await.unwrap();
        assert!(principal.authenticated);
        assert_eq!(principal.user_id, "42");
        assert_eq!(principal.role, "editor");
        assert_eq!(principal.tenant_id.as_deref(), Some("acme"));
        // Unknown claims survive in the bag
        assert_eq!(principal.claims["custom"]["shoe_size"], 44);
    }

    #[tokio::test]
    async fn missing_token_is_anonymous_not_an_error() {
        let principal = verifier()
            .verify(&HeaderMap::new(), "")
            .await
            .unwrap();
        assert!(!principal.authenticated);
        assert_eq!(principal.role, ANONYMOUS_ROLE);
    }

    #[tokio::test]
    async fn expiry_at_now_fails_with_no_leeway() {
        let mut claims = valid_claims();
        claims["exp"] = chrono::Utc::now().timestamp().into();
        let err = verifier().verify_token(&sign(claims)).await.unwrap_err();
        assert_eq!(err.details(), Some("expired"));
    }

    #[tokio::test]
    async fn not_before_gets_sixty_seconds_of_skew() {
        let now = chrono::Utc::now().timestamp();

        let mut claims = valid_claims();
        claims["nbf"] = (now + 30).into();
        assert!(verifier().verify_token(&sign(claims)).await.is_ok());

        let mut claims = valid_claims();
        claims["nbf"] = (now + 120).into();
        assert!(verifier().verify_token(&sign(claims)).await.is_err());
    }

    #[tokio::test]
    async fn disallowed_algorithm_is_rejected_by_name() {
        let token = encode(
            &Header::new(Algorithm::HS512),
            &valid_claims(),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let err = verifier().verify_token(&token).await.unwrap_err();
        assert_eq!(err.details(), Some("algorithm_not_allowed"));
    }

    #[tokio::test]
    async fn wrong_issuer_and_audience_fail() {
        let mut claims = valid_claims();
        claims["iss"] = "someone-else".into();
        assert!(verifier().verify_token(&sign(claims)).await.is_err());

        let mut claims = valid_claims();
        claims["aud"] = serde_json::json!(["other-api"]);
        assert!(verifier().verify_token(&sign(claims)).await.is_err());

        // Array audiences intersect
        let mut claims = valid_claims();
        claims["aud"] = serde_json::json!(["other-api", "litrest-api"]);
        assert!(verifier().verify_token(&sign(claims)).await.is_ok());
    }

    #[tokio::test]
    async fn tampered_signature_fails() {
        let mut token = sign(valid_claims());
        token.pop();
        token.push('x');
        let err = verifier().verify_token(&token).await.unwrap_err();
        assert_eq!(err.kind(), litrest_common::ErrorKind::Auth);
    }

    #[tokio::test]
    async fn role_claim_is_configurable_with_a_default() {
        let verifier = Verifier::new(JwtConfig {
            enabled: true,
            algorithm_allow_list: vec!["HS256".to_string()],
            secret: Some(SECRET.to_string()),
            role_claim: "grp".to_string(),
            ..Default::default()
        })
        .unwrap();

        let now = chrono::Utc::now().timestamp();
        let claims = serde_json::json!({"sub": "1", "grp": "ops", "exp": now + 60});
        let principal = verifier.verify_token(&sign(claims)).await.unwrap();
        assert_eq!(principal.role, "ops");

        let claims = serde_json::json!({"sub": "1", "exp": now + 60});
        let principal = verifier.verify_token(&sign(claims)).await.unwrap();
        assert_eq!(principal.role, "authenticated");
    }

    #[tokio::test]
    async fn cache_serves_repeat_verifications_but_respects_exp() {
        let verifier = verifier();
        let token = sign(valid_claims());
        let first = verifier.verify_token(&token).await.unwrap();
        let second = verifier.verify_token(&token).await.unwrap();
        assert_eq!(first.user_id, second.user_id);

        // A token already at expiry never enters the cache
        let mut claims = valid_claims();
        claims["exp"] = chrono::Utc::now().timestamp().into();
        let expiring = sign(claims);
        assert!(verifier.verify_token(&expiring).await.is_err());
        assert!(verifier.verify_token(&expiring).await.is_err());
    }

    #[test]
    fn extraction_order_is_header_query_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer from-header".parse().unwrap());
        headers.insert(COOKIE, "jwt_token=from-cookie".parse().unwrap());
        assert_eq!(
            extract_token(&headers, "token=from-query").as_deref(),
            Some("from-header")
        );

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "a=b; jwt_token=from-cookie".parse().unwrap());
        assert_eq!(
            extract_token(&headers, "token=from-query").as_deref(),
            Some("from-query")
        );
        assert_eq!(extract_token(&headers, "").as_deref(), Some("from-cookie"));
        assert_eq!(extract_token(&HeaderMap::new(), ""), None);
    }
}
