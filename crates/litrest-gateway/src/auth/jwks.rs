//! JWKS key resolution for the RSA/EC token families
//!
//! Fetches the configured JWKS document, indexes keys by `kid`, and
//! re-fetches once the refresh interval elapses. A `kid` that is missing
//! after a fresh fetch is an authentication failure, not a retry loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use litrest_common::{GatewayError, Result};

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

struct State {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

/// Interval-refreshed JWKS document
pub struct JwksCache {
    url: String,
    refresh: Duration,
    client: reqwest::Client,
    state: RwLock<State>,
}

impl JwksCache {
    pub fn new(url: String, refresh: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            url,
            refresh,
            client,
            state: RwLock::new(State {
                keys: HashMap::new(),
                fetched_at: None,
            }),
        }
    }

    /// Resolve a key by `kid`, fetching the document when stale
    pub async fn resolve(&self, kid: &str) -> Result<DecodingKey> {
        {
            let state = self.state.read().await;
            if let Some(fetched_at) = state.fetched_at {
                if fetched_at.elapsed() < self.refresh {
                    return state.keys.get(kid).cloned().ok_or_else(|| {
                        GatewayError::AuthFailed(format!("unknown key id: {kid}"))
                    });
                }
            }
        }

        let mut state = self.state.write().await;
        let stale = match state.fetched_at {
            Some(fetched_at) => fetched_at.elapsed() >= self.refresh,
            None => true,
        };
        if stale {
            let document: JwksDocument = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| GatewayError::AuthFailed(format!("JWKS fetch failed: {e}")))?
                .json()
                .await
                .map_err(|e| GatewayError::AuthFailed(format!("JWKS parse failed: {e}")))?;
            state.keys = build_keys(document);
            state.fetched_at = Some(Instant::now());
            debug!(url = %self.url, keys = state.keys.len(), "JWKS refreshed");
        }

        state
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| GatewayError::AuthFailed(format!("unknown key id: {kid}")))
    }
}

fn build_keys(document: JwksDocument) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    for jwk in document.keys {
        let Some(kid) = jwk.kid.clone() else {
            continue;
        };
        let decoded = match jwk.kty.as_str() {
            "RSA" => match (&jwk.n, &jwk.e) {
                (Some(n), Some(e)) => DecodingKey::from_rsa_components(n, e).ok(),
                _ => None,
            },
            "EC" => match (&jwk.x, &jwk.y) {
                (Some(x), Some(y)) => DecodingKey::from_ec_components(x, y).ok(),
                _ => None,
            },
            _ => None,
        };
        match decoded {
            Some(key) => {
                keys.insert(kid, key);
            }
            None => warn!(%kid, kty = %jwk.kty, "skipping unusable JWKS entry"),
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_rsa_keys_and_skips_junk() {
        // 512-bit throwaway modulus, base64url
        let doc: JwksDocument = serde_json::from_value(serde_json::json!({
            "keys": [
                {"kid": "k1", "kty": "RSA",
                 "n": "y8Sil5TJ0cCtVF3XZ0bIo7FXpvs3wWVNRWy4tD1HWqy1japK52J5bt0hKWs0Ke9d0dVHXoVcGnVbHrYmPx1PoQ",
                 "e": "AQAB"},
                {"kid": "k2", "kty": "oct"},
                {"kty": "RSA", "n": "AQAB", "e": "AQAB"}
            ]
        }))
        .unwrap();
        let keys = build_keys(doc);
        assert!(keys.contains_key("k1"));
        assert!(!keys.contains_key("k2"));
        assert_eq!(keys.len(), 1);
    }
}
