//! Per-broker auth credential generation and token caching (§4.7).
//!
//! Credentials are recomputed per-broker rather than once globally, since
//! `none`/`password`/`token` auth methods can differ broker to broker. Token
//! minting is cached with a refresh margin so a broker that reconnects
//! frequently doesn't mint a fresh token on every attempt.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::config::{AuthConfig, AuthMethod, TlsConfig};
use crate::constants::{client_version_string, BROKER_TOKEN_TTL_SECS, TOKEN_REFRESH_MARGIN_SECS};
use crate::identity::NodeIdentity;
use crate::token;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: u64,
}

/// Minted tokens, keyed by broker index. Mutex-guarded rather than
/// per-broker because misses are rare and contention is negligible.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<usize, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any cached token for `broker_idx`, forcing the next credential
    /// generation to mint fresh. Called before a reconnect attempt.
    pub fn invalidate(&self, broker_idx: usize) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&broker_idx);
    }
}

/// Resolved username/password pair to hand to the MQTT client.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Build the credentials for one broker's connect attempt. Returns `None`
/// when token auth is requested but the device never disclosed a private
/// key — callers should treat that as "this broker cannot connect" rather
/// than falling back to unauthenticated.
pub fn generate_credentials(
    identity: &NodeIdentity,
    broker_idx: usize,
    auth: &AuthConfig,
    tls: &TlsConfig,
    cache: &TokenCache,
    force_refresh: bool,
) -> Option<Credentials> {
    match auth.method {
        AuthMethod::None => Some(Credentials::default()),
        AuthMethod::Password => Some(Credentials {
            username: non_empty(&auth.username),
            password: non_empty(&auth.password),
        }),
        AuthMethod::Token => {
            let private_key_hex = identity.private_key.as_deref()?;
            let token = cached_or_fresh_token(identity, broker_idx, auth, tls, cache, force_refresh, private_key_hex)?;
            Some(Credentials {
                username: Some(format!("v1_{}", identity.public_key)),
                password: Some(token),
            })
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cached_or_fresh_token(
    identity: &NodeIdentity,
    broker_idx: usize,
    auth: &AuthConfig,
    tls: &TlsConfig,
    cache: &TokenCache,
    force_refresh: bool,
    private_key_hex: &str,
) -> Option<String> {
    if !force_refresh {
        let entries = cache.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = entries.get(&broker_idx) {
            if cached.expires_at.saturating_sub(now_secs()) > TOKEN_REFRESH_MARGIN_SECS {
                return Some(cached.token.clone());
            }
        }
    }

    let signing_key = token::signing_key_from_hex(private_key_hex)?;

    let mut claims = std::collections::BTreeMap::new();
    claims.insert(
        "client".to_string(),
        serde_json::Value::from(client_version_string()),
    );
    if let Some(audience) = non_empty(&auth.audience) {
        claims.insert("aud".to_string(), serde_json::Value::from(audience));
    }

    let owner = non_empty(&auth.owner);
    let email = non_empty(&auth.email);
    if owner.is_some() || email.is_some() {
        if tls.enabled && tls.verify {
            if let Some(owner) = &owner {
                claims.insert("owner".to_string(), serde_json::Value::from(owner.clone()));
            }
            if let Some(email) = &email {
                claims.insert("email".to_string(), serde_json::Value::from(email.to_lowercase()));
            }
        } else {
            warn!(
                "Broker {broker_idx}: owner/email claims configured but suppressed — \
                 TLS verification is not enabled for this broker"
            );
        }
    }

    let minted = token::create(&signing_key, &claims, BROKER_TOKEN_TTL_SECS).ok()?;
    let expires_at = now_secs() + BROKER_TOKEN_TTL_SECS;

    cache.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(
        broker_idx,
        CachedToken {
            token: minted.clone(),
            expires_at,
        },
    );

    Some(minted)
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn identity(with_private_key: bool) -> NodeIdentity {
        let key = SigningKey::generate(&mut OsRng);
        NodeIdentity {
            name: "Repeater One".to_string(),
            public_key: hex_upper(&key.verifying_key().to_bytes()),
            private_key: with_private_key.then(|| hex_upper(&key.to_bytes())),
            radio_info: None,
            firmware_version: None,
            board_type: None,
        }
    }

    fn hex_upper(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02X}")).collect()
    }

    #[test]
    fn none_auth_yields_empty_credentials() {
        let identity = identity(false);
        let cache = TokenCache::new();
        let auth = AuthConfig::default();
        let tls = TlsConfig::default();
        let creds = generate_credentials(&identity, 0, &auth, &tls, &cache, false).unwrap();
        assert!(creds.username.is_none());
        assert!(creds.password.is_none());
    }

    #[test]
    fn password_auth_passes_through_configured_values() {
        let identity = identity(false);
        let cache = TokenCache::new();
        let auth = AuthConfig {
            method: AuthMethod::Password,
            username: "bridge".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        };
        let tls = TlsConfig::default();
        let creds = generate_credentials(&identity, 0, &auth, &tls, &cache, false).unwrap();
        assert_eq!(creds.username.as_deref(), Some("bridge"));
        assert_eq!(creds.password.as_deref(), Some("secret"));
    }

    #[test]
    fn token_auth_without_private_key_yields_none() {
        let identity = identity(false);
        let cache = TokenCache::new();
        let auth = AuthConfig {
            method: AuthMethod::Token,
            ..Default::default()
        };
        let tls = TlsConfig::default();
        assert!(generate_credentials(&identity, 0, &auth, &tls, &cache, false).is_none());
    }

    #[test]
    fn token_auth_mints_a_v1_prefixed_username() {
        let identity = identity(true);
        let cache = TokenCache::new();
        let auth = AuthConfig {
            method: AuthMethod::Token,
            ..Default::default()
        };
        let tls = TlsConfig::default();
        let creds = generate_credentials(&identity, 0, &auth, &tls, &cache, false).unwrap();
        assert_eq!(creds.username, Some(format!("v1_{}", identity.public_key)));
        assert!(creds.password.is_some());
    }

    #[test]
    fn token_auth_reuses_the_cached_token_until_force_refresh() {
        let identity = identity(true);
        let cache = TokenCache::new();
        let auth = AuthConfig {
            method: AuthMethod::Token,
            ..Default::default()
        };
        let tls = TlsConfig::default();
        let first = generate_credentials(&identity, 0, &auth, &tls, &cache, false).unwrap();
        let second = generate_credentials(&identity, 0, &auth, &tls, &cache, false).unwrap();
        assert_eq!(first.password, second.password);

        let refreshed = generate_credentials(&identity, 0, &auth, &tls, &cache, true).unwrap();
        assert!(refreshed.password.is_some());
    }

    #[test]
    fn owner_and_email_claims_require_verified_tls() {
        let identity = identity(true);
        let cache = TokenCache::new();
        let auth = AuthConfig {
            method: AuthMethod::Token,
            owner: "ops@example.com".to_string(),
            email: "OPS@Example.COM".to_string(),
            ..Default::default()
        };

        let tls_unverified = TlsConfig {
            enabled: true,
            verify: false,
        };
        let creds = generate_credentials(&identity, 0, &auth, &tls_unverified, &cache, false).unwrap();
        let claims = token::decode_payload(&creds.password.unwrap()).unwrap();
        assert!(!claims.contains_key("owner"));

        cache.invalidate(0);
        let tls_verified = TlsConfig {
            enabled: true,
            verify: true,
        };
        let creds = generate_credentials(&identity, 0, &auth, &tls_verified, &cache, false).unwrap();
        let claims = token::decode_payload(&creds.password.unwrap()).unwrap();
        assert_eq!(claims.get("owner").unwrap().as_str(), Some("ops@example.com"));
        assert_eq!(claims.get("email").unwrap().as_str(), Some("ops@example.com"));
    }
}
