//! Remote serial command handling: MQTT-delivered, signed commands that let
//! an authorized companion run a command on the attached repeater over the
//! Device Link.
//!
//! Processing follows a fixed order — decode, validate shape, check target,
//! check allowlist, check expiry, check nonce, verify signature, record
//! nonce, check the disallow list, execute, respond — so that cheap checks
//! reject malformed or clearly-unauthorized traffic before the signature
//! verification and serial round trip are paid for.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::config::RemoteSerialConfig;
use crate::device::DeviceLink;
use crate::identity::NodeIdentity;
use crate::token;

/// Replay-protection store: each nonce seen is remembered until its TTL
/// elapses, then purged lazily on the next command.
#[derive(Debug, Default)]
pub struct NonceStore {
    seen: Mutex<HashMap<String, u64>>,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn cleanup(&self, ttl_secs: u64) {
        let cutoff = Self::now().saturating_sub(ttl_secs);
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let before = seen.len();
        seen.retain(|_, ts| *ts >= cutoff);
        let removed = before - seen.len();
        if removed > 0 {
            debug!("[SERIAL] Cleaned up {removed} expired nonces");
        }
    }

    /// Purges expired entries and reports whether `nonce` is still a
    /// replay candidate, without recording it. Recording happens
    /// separately via [`NonceStore::record`], only once the signature
    /// over the envelope carrying that nonce has been verified.
    fn is_fresh(&self, nonce: &str, ttl_secs: u64) -> bool {
        self.cleanup(ttl_secs);
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        !seen.contains_key(nonce)
    }

    fn record(&self, nonce: &str) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(nonce.to_string(), Self::now());
    }

    #[cfg(test)]
    fn record_if_fresh(&self, nonce: &str, ttl_secs: u64) -> bool {
        if !self.is_fresh(nonce, ttl_secs) {
            return false;
        }
        self.record(nonce);
        true
    }
}

/// Something that can fan a signed response out to every connected broker.
/// Implemented by the broker manager; kept abstract here so the command
/// handler doesn't need to know about broker/connection bookkeeping.
pub trait ResponsePublisher {
    /// Publish `payload` to `topic` on every currently connected broker.
    /// Returns whether at least one publish succeeded.
    fn publish_to_all(&self, topic: &str, payload: &str) -> bool;
}

/// Validate and normalize the configured companion allowlist: each entry
/// must be a 64-character uppercase hex public key. Invalid entries are
/// dropped with a warning rather than rejected at config-load time, so a
/// typo in one entry doesn't take the whole allowlist down.
pub fn normalize_allowed_companions(raw: &[String]) -> Vec<String> {
    let mut companions = Vec::new();
    for key in raw {
        let key = key.trim().to_uppercase();
        if key.is_empty() {
            continue;
        }
        if key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
            if !companions.contains(&key) {
                companions.push(key);
            }
        } else {
            warn!(
                "Invalid companion public key in allowlist: {}...",
                &key[..key.len().min(16)]
            );
        }
    }
    if !companions.is_empty() {
        info!("Remote serial enabled with {} allowed companion(s)", companions.len());
    }
    companions
}

fn is_command_allowed(command: &str, disallowed: &[String]) -> Result<(), String> {
    let lowered = command.trim().to_lowercase();
    for rule in disallowed {
        if lowered.starts_with(&rule.to_lowercase()) {
            return Err(rule.clone());
        }
    }
    Ok(())
}

/// Process one inbound command JWT end to end: validate, execute over the
/// Device Link if authorized, and publish a signed response. Unauthorized
/// or malformed traffic that never reached a recognizable companion/target
/// pairing is dropped silently; everything past that point gets a signed
/// failure response so a legitimate companion can tell what went wrong.
#[allow(clippy::too_many_arguments)]
pub fn handle_serial_command(
    jwt_token: &str,
    config: &RemoteSerialConfig,
    identity: &NodeIdentity,
    device: Option<&DeviceLink>,
    nonces: &NonceStore,
    publisher: &dyn ResponsePublisher,
    response_topic: &str,
) {
    if !config.enabled {
        warn!("[SERIAL] Remote serial command received but feature is disabled");
        return;
    }
    if config.allowed_companions.is_empty() {
        warn!("[SERIAL] Remote serial command received but no companions are allowed");
        return;
    }

    let payload = match token::decode_payload(jwt_token) {
        Ok(p) => p,
        Err(e) => {
            warn!("[SERIAL] Failed to decode command JWT: {e}");
            return;
        }
    };

    let companion_pubkey = payload
        .get("publicKey")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_uppercase();
    let command = payload
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let target = payload
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_uppercase();
    let nonce = payload
        .get("nonce")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let exp = payload.get("exp").and_then(Value::as_u64);

    if companion_pubkey.is_empty() || command.is_empty() || target.is_empty() || nonce.is_empty() {
        warn!("[SERIAL] Missing required fields in command JWT");
        return;
    }

    if target != identity.public_key {
        debug!(
            "[SERIAL] Command target {}... doesn't match our key {}...",
            &target[..target.len().min(8)],
            &identity.public_key[..identity.public_key.len().min(8)]
        );
        return;
    }

    if !config
        .allowed_companions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&companion_pubkey))
    {
        warn!(
            "[SERIAL] Command from unauthorized companion: {}...",
            &companion_pubkey[..companion_pubkey.len().min(16)]
        );
        respond(publisher, response_topic, identity, &command, &nonce, false, "Unauthorized companion");
        return;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if let Some(exp) = exp {
        if now > exp {
            warn!("[SERIAL] Command JWT expired (exp={exp}, now={now})");
            respond(publisher, response_topic, identity, &command, &nonce, false, "Command expired");
            return;
        }
    }

    if !nonces.is_fresh(&nonce, config.nonce_ttl) {
        warn!(
            "[SERIAL] Duplicate nonce detected (replay attack?): {}...",
            &nonce[..nonce.len().min(16)]
        );
        return;
    }

    let verifying_key = match token::verifying_key_from_hex(&companion_pubkey) {
        Some(key) => key,
        None => {
            warn!("[SERIAL] Companion public key is not valid Ed25519 key material");
            respond(publisher, response_topic, identity, &command, &nonce, false, "Invalid signature");
            return;
        }
    };

    if token::verify(&verifying_key, jwt_token).is_err() {
        warn!(
            "[SERIAL] JWT signature verification failed for companion {}...",
            &companion_pubkey[..companion_pubkey.len().min(16)]
        );
        respond(publisher, response_topic, identity, &command, &nonce, false, "Invalid signature");
        return;
    }
    nonces.record(&nonce);
    debug!(
        "[SERIAL] JWT signature verified for companion {}...",
        &companion_pubkey[..companion_pubkey.len().min(16)]
    );

    if let Err(matched_rule) = is_command_allowed(&command, &config.disallowed_commands) {
        warn!("[SERIAL] Command blocked by rule '{matched_rule}': {command}");
        respond(
            publisher,
            response_topic,
            identity,
            &command,
            &nonce,
            false,
            &format!("Command blocked: {matched_rule}"),
        );
        return;
    }

    let device = match device {
        Some(d) => d,
        None => {
            respond(publisher, response_topic, identity, &command, &nonce, false, "Serial port not connected");
            return;
        }
    };

    info!(
        "[SERIAL] Executing command from {}...: {command}",
        &companion_pubkey[..companion_pubkey.len().min(16)]
    );
    let timeout = std::time::Duration::from_secs(config.command_timeout);
    let (success, response) = device.execute_command(&command, timeout);
    respond(publisher, response_topic, identity, &command, &nonce, success, &response);
}

fn respond(
    publisher: &dyn ResponsePublisher,
    topic: &str,
    identity: &NodeIdentity,
    command: &str,
    request_id: &str,
    success: bool,
    response: &str,
) {
    let Some(private_key_hex) = identity.private_key.as_deref() else {
        error!("[SERIAL] Cannot sign response - private key not available");
        return;
    };

    let signing_key = match token::signing_key_from_hex(private_key_hex) {
        Some(key) => key,
        None => {
            error!("[SERIAL] Cannot sign response - private key material is malformed");
            return;
        }
    };

    let mut claims = std::collections::BTreeMap::new();
    claims.insert("command".to_string(), Value::from(command));
    claims.insert("request_id".to_string(), Value::from(request_id));
    claims.insert("success".to_string(), Value::from(success));
    claims.insert("response".to_string(), Value::from(response));

    let response_jwt = match token::create(&signing_key, &claims, crate::constants::COMMAND_RESPONSE_TTL_SECS) {
        Ok(jwt) => jwt,
        Err(e) => {
            error!("[SERIAL] Failed to create response token: {e}");
            return;
        }
    };

    if publisher.publish_to_all(topic, &response_jwt) {
        info!(
            "[SERIAL] Response published (success={success}, request_id={}...)",
            &request_id[..request_id.len().min(16)]
        );
    } else {
        error!("[SERIAL] Failed to publish response to any broker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::cell::RefCell;

    fn identity() -> NodeIdentity {
        let key = SigningKey::generate(&mut OsRng);
        NodeIdentity {
            name: "Repeater One".to_string(),
            public_key: hex_upper(&key.verifying_key().to_bytes()),
            private_key: Some(hex_upper(&key.to_bytes())),
            radio_info: None,
            firmware_version: None,
            board_type: None,
        }
    }

    fn hex_upper(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02X}")).collect()
    }

    struct RecordingPublisher {
        published: RefCell<Vec<(String, String)>>,
    }

    impl ResponsePublisher for RecordingPublisher {
        fn publish_to_all(&self, topic: &str, payload: &str) -> bool {
            self.published
                .borrow_mut()
                .push((topic.to_string(), payload.to_string()));
            true
        }
    }

    fn command_jwt(
        companion_key: &SigningKey,
        target: &str,
        command: &str,
        nonce: &str,
        expiry_seconds: u64,
    ) -> String {
        let mut claims = std::collections::BTreeMap::new();
        claims.insert(
            "publicKey".to_string(),
            Value::from(hex_upper(&companion_key.verifying_key().to_bytes())),
        );
        claims.insert("command".to_string(), Value::from(command));
        claims.insert("target".to_string(), Value::from(target));
        claims.insert("nonce".to_string(), Value::from(nonce));
        token::create(companion_key, &claims, expiry_seconds).unwrap()
    }

    #[test]
    fn rejects_disallowed_command_with_signed_response() {
        let companion = SigningKey::generate(&mut OsRng);
        let identity = identity();
        let config = RemoteSerialConfig {
            enabled: true,
            allowed_companions: vec![hex_upper(&companion.verifying_key().to_bytes())],
            ..Default::default()
        };
        let jwt = command_jwt(&companion, &identity.public_key, "get prv.key", "nonce-1", 60);
        let nonces = NonceStore::new();
        let publisher = RecordingPublisher {
            published: RefCell::new(Vec::new()),
        };

        handle_serial_command(&jwt, &config, &identity, None, &nonces, &publisher, "resp/topic");

        let published = publisher.published.borrow();
        assert_eq!(published.len(), 1);
        assert!(!published[0].1.is_empty());
    }

    #[test]
    fn drops_command_for_unauthorized_companion_silently_after_signed_reject() {
        let companion = SigningKey::generate(&mut OsRng);
        let identity = identity();
        let config = RemoteSerialConfig {
            enabled: true,
            allowed_companions: vec!["0".repeat(64)],
            ..Default::default()
        };
        let jwt = command_jwt(&companion, &identity.public_key, "ver", "nonce-2", 60);
        let nonces = NonceStore::new();
        let publisher = RecordingPublisher {
            published: RefCell::new(Vec::new()),
        };

        handle_serial_command(&jwt, &config, &identity, None, &nonces, &publisher, "resp/topic");

        assert_eq!(publisher.published.borrow().len(), 1);
    }

    #[test]
    fn duplicate_nonce_is_dropped_without_a_response() {
        let companion = SigningKey::generate(&mut OsRng);
        let identity = identity();
        let config = RemoteSerialConfig {
            enabled: true,
            allowed_companions: vec![hex_upper(&companion.verifying_key().to_bytes())],
            ..Default::default()
        };
        let nonces = NonceStore::new();
        assert!(nonces.record_if_fresh("dupe", config.nonce_ttl));
        assert!(!nonces.record_if_fresh("dupe", config.nonce_ttl));

        let jwt = command_jwt(&companion, &identity.public_key, "ver", "dupe", 60);
        let publisher = RecordingPublisher {
            published: RefCell::new(Vec::new()),
        };
        handle_serial_command(&jwt, &config, &identity, None, &nonces, &publisher, "resp/topic");
        assert!(publisher.published.borrow().is_empty());
    }

    #[test]
    fn normalize_companions_drops_invalid_entries_and_dedups() {
        let valid = "A".repeat(64);
        let raw = vec![valid.clone(), "not-hex".to_string(), valid.to_lowercase(), "".to_string()];
        let normalized = normalize_allowed_companions(&raw);
        assert_eq!(normalized, vec![valid]);
    }

    #[test]
    fn mismatched_target_is_ignored() {
        let companion = SigningKey::generate(&mut OsRng);
        let identity = identity();
        let config = RemoteSerialConfig {
            enabled: true,
            allowed_companions: vec![hex_upper(&companion.verifying_key().to_bytes())],
            ..Default::default()
        };
        let jwt = command_jwt(&companion, &"F".repeat(64), "ver", "nonce-3", 60);
        let nonces = NonceStore::new();
        let publisher = RecordingPublisher {
            published: RefCell::new(Vec::new()),
        };
        handle_serial_command(&jwt, &config, &identity, None, &nonces, &publisher, "resp/topic");
        assert!(publisher.published.borrow().is_empty());
    }
}
