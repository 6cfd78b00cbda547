use dashmap::DashMap;
use gatehouse_core::config::AuthConfig;
use gatehouse_core::error::GatewayError;
use gatehouse_plugin::plugin::Identity;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

/// Body returned by the auth service's verify endpoint.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedIdentity {
    identity: Identity,
    expires_at: Instant,
}

/// Verifies bearer tokens against the external auth service and caches
/// positive results for `cache_ttl`, keyed by the token's SHA-256.
///
/// Fails closed: if the auth service cannot be reached the request is
/// rejected with [`GatewayError::AuthServiceUnavailable`].
pub struct AuthValidator {
    client: reqwest::Client,
    verify_url: String,
    timeout: Duration,
    cache_ttl: Duration,
    cache: DashMap<String, CachedIdentity>,
}

impl AuthValidator {
    pub fn new(client: reqwest::Client, cfg: &AuthConfig) -> Self {
        Self {
            client,
            verify_url: cfg.verify_url(),
            timeout: cfg.timeout(),
            cache_ttl: cfg.cache_ttl(),
            cache: DashMap::new(),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<Identity, GatewayError> {
        let key = cache_key(token);
        let now = Instant::now();
        if let Some(identity) = self.cached_at(&key, now) {
            debug!(user_id = %identity.user_id, "Auth cache hit");
            return Ok(identity);
        }

        let identity = self.verify_remote(token).await?;
        self.insert_at(key, identity.clone(), Instant::now());
        Ok(identity)
    }

    async fn verify_remote(&self, token: &str) -> Result<Identity, GatewayError> {
        let resp = self
            .client
            .post(&self.verify_url)
            .bearer_auth(token)
            .json(&VerifyRequest { token })
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, timeout = e.is_timeout(), "Auth service unreachable");
                GatewayError::AuthServiceUnavailable
            })?;

        let status = resp.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Auth service rejected token");
            return Err(GatewayError::AuthInvalid);
        }

        let body: VerifyResponse = resp.json().await.map_err(|e| {
            warn!(error = %e, "Auth service returned an unreadable response");
            GatewayError::AuthServiceUnavailable
        })?;

        match body {
            VerifyResponse {
                valid: true,
                user_id: Some(user_id),
                email,
            } if !user_id.is_empty() => Ok(Identity { user_id, email }),
            _ => Err(GatewayError::AuthInvalid),
        }
    }

    /// Cached identity for a token hash, dropping it if expired.
    fn cached_at(&self, key: &str, now: Instant) -> Option<Identity> {
        let hit = self
            .cache
            .get(key)
            .map(|e| (e.identity.clone(), e.expires_at));
        match hit {
            Some((identity, expires_at)) if now < expires_at => Some(identity),
            Some(_) => {
                self.cache.remove_if(key, |_, e| now >= e.expires_at);
                None
            }
            None => None,
        }
    }

    fn insert_at(&self, key: String, identity: Identity, now: Instant) {
        if self.cache_ttl.is_zero() {
            return;
        }
        self.cache.insert(
            key,
            CachedIdentity {
                identity,
                expires_at: now + self.cache_ttl,
            },
        );
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Remove expired cache entries. Returns the number removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, e| now < e.expires_at);
        before.saturating_sub(self.cache.len())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Hex SHA-256 of the token; raw tokens are never kept.
pub fn cache_key(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(ttl_secs: u64) -> AuthValidator {
        let cfg = AuthConfig {
            cache_ttl_secs: ttl_secs,
            ..Default::default()
        };
        AuthValidator::new(reqwest::Client::new(), &cfg)
    }

    fn alice() -> Identity {
        Identity {
            user_id: "alice".into(),
            email: Some("alice@example.com".into()),
        }
    }

    #[test]
    fn cache_key_is_hex_sha256() {
        let key = cache_key("token");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, cache_key("token2"));
        assert!(!key.contains("token"));
    }

    #[test]
    fn cached_identity_expires() {
        let v = validator(60);
        let t0 = Instant::now();
        v.insert_at(cache_key("t"), alice(), t0);

        assert_eq!(v.cached_at(&cache_key("t"), t0 + Duration::from_secs(59)), Some(alice()));
        assert_eq!(v.cached_at(&cache_key("t"), t0 + Duration::from_secs(60)), None);
        // expired entry was dropped on lookup
        assert_eq!(v.cache_len(), 0);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let v = validator(60);
        let t0 = Instant::now();
        v.insert_at(cache_key("a"), alice(), t0);
        v.insert_at(cache_key("b"), alice(), t0 + Duration::from_secs(30));

        assert_eq!(v.sweep_at(t0 + Duration::from_secs(61)), 1);
        assert_eq!(v.cache_len(), 1);
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let v = validator(0);
        v.insert_at(cache_key("a"), alice(), Instant::now());
        assert_eq!(v.cache_len(), 0);
    }
}
