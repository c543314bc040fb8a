//! Signed bearer tokens: three base64url-unpadded segments
//! (`header.payload.signature`), EdDSA-signed over `header.payload`.
//!
//! The header is always the literal `{"alg":"EdDSA"}`. This format is used
//! both for MQTT broker auth credentials and for signed remote-command
//! envelopes/responses.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const HEADER_JSON: &str = r#"{"alg":"EdDSA"}"#;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: expected 3 dot-separated segments")]
    Malformed,
    #[error("invalid base64 in token segment")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("invalid JSON payload")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unsupported algorithm in header")]
    UnsupportedAlgorithm,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("signing key has unexpected length")]
    InvalidKeyMaterial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header<'a> {
    alg: &'a str,
}

/// Mint a token whose payload is `claims` plus a standard `exp` claim
/// `expiry_seconds` in the future, signed with the given Ed25519 private key.
pub fn create(
    signing_key: &SigningKey,
    claims: &BTreeMap<String, Value>,
    expiry_seconds: u64,
) -> Result<String, TokenError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut full_claims = claims.clone();
    full_claims.insert("exp".to_string(), Value::from(now + expiry_seconds));
    full_claims.insert("iat".to_string(), Value::from(now));

    let header_b64 = URL_SAFE_NO_PAD.encode(HEADER_JSON);
    let payload_json = serde_json::to_vec(&full_claims)?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json);

    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature: Signature = signing_key.sign(signing_input.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify a token's signature and expiry against the given Ed25519 public
/// key. Returns the decoded claims on success.
pub fn verify(
    verifying_key: &VerifyingKey,
    token: &str,
) -> Result<BTreeMap<String, Value>, TokenError> {
    let (header_b64, payload_b64, signature_b64) = split_segments(token)?;

    let header_bytes = URL_SAFE_NO_PAD.decode(header_b64)?;
    let header: Header = serde_json::from_slice(&header_bytes)?;
    if header.alg != "EdDSA" {
        return Err(TokenError::UnsupportedAlgorithm);
    }

    let signature_bytes = URL_SAFE_NO_PAD.decode(signature_b64)?;
    let signature_array: [u8; 64] = signature_bytes
        .try_into()
        .map_err(|_| TokenError::InvalidSignature)?;
    let signature = Signature::from_bytes(&signature_array);

    let signing_input = format!("{header_b64}.{payload_b64}");
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims = decode_payload(token)?;

    if let Some(exp) = claims.get("exp").and_then(Value::as_u64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now > exp {
            return Err(TokenError::InvalidSignature);
        }
    }

    Ok(claims)
}

/// Decode a token's payload without checking the signature. Used by the
/// command handler to read `nonce`/`target`/`exp` before full verification,
/// mirroring the "decode, don't trust yet" step of the processing pipeline.
pub fn decode_payload(token: &str) -> Result<BTreeMap<String, Value>, TokenError> {
    let (_, payload_b64, _) = split_segments(token)?;
    let payload_bytes = URL_SAFE_NO_PAD.decode(payload_b64)?;
    let claims: BTreeMap<String, Value> = serde_json::from_slice(&payload_bytes)?;
    Ok(claims)
}

/// Decode 64 hex chars into an Ed25519 signing (private) key.
pub fn signing_key_from_hex(hex: &str) -> Option<SigningKey> {
    let bytes = hex_to_32_bytes(hex)?;
    Some(SigningKey::from_bytes(&bytes))
}

/// Decode 64 hex chars into an Ed25519 verifying (public) key.
pub fn verifying_key_from_hex(hex: &str) -> Option<VerifyingKey> {
    let bytes = hex_to_32_bytes(hex)?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn hex_to_32_bytes(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).ok()?;
        bytes[i] = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(bytes)
}

fn split_segments(token: &str) -> Result<(&str, &str, &str), TokenError> {
    let mut parts = token.split('.');
    let header = parts.next().ok_or(TokenError::Malformed)?;
    let payload = parts.next().ok_or(TokenError::Malformed)?;
    let signature = parts.next().ok_or(TokenError::Malformed)?;
    if parts.next().is_some() {
        return Err(TokenError::Malformed);
    }
    Ok((header, payload, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (SigningKey, VerifyingKey) {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        (signing_key, verifying_key)
    }

    #[test]
    fn round_trips_claims_through_create_and_verify() {
        let (signing_key, verifying_key) = keypair();
        let mut claims = BTreeMap::new();
        claims.insert("client".to_string(), Value::from("meshcoretomqtt/1.0"));

        let token = create(&signing_key, &claims, 3600).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let decoded = verify(&verifying_key, &token).unwrap();
        assert_eq!(decoded.get("client").unwrap().as_str(), Some("meshcoretomqtt/1.0"));
    }

    #[test]
    fn rejects_signature_from_a_different_key() {
        let (signing_key, _) = keypair();
        let (_, other_verifying_key) = keypair();
        let token = create(&signing_key, &BTreeMap::new(), 3600).unwrap();
        assert!(verify(&other_verifying_key, &token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let (signing_key, verifying_key) = keypair();
        let token = create(&signing_key, &BTreeMap::new(), 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(verify(&verifying_key, &token).is_err());
    }

    #[test]
    fn decode_payload_does_not_require_a_verifying_key() {
        let (signing_key, _) = keypair();
        let mut claims = BTreeMap::new();
        claims.insert("nonce".to_string(), Value::from("abc123"));
        let token = create(&signing_key, &claims, 60).unwrap();
        let decoded = decode_payload(&token).unwrap();
        assert_eq!(decoded.get("nonce").unwrap().as_str(), Some("abc123"));
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert!(decode_payload("not-a-token").is_err());
        assert!(decode_payload("a.b").is_err());
        assert!(decode_payload("a.b.c.d").is_err());
    }
}
