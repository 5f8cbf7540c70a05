//! Ed25519 command signature verification.
//!
//! The control plane signs commands; the agent verifies. The signature
//! covers a canonical form, not the wire bytes: envelope fields are
//! stripped, the remainder is re-serialized with lexicographically sorted
//! keys and no whitespace, wrapped as
//! `{command, timestamp, nonce, user_id, origin}`, and serialized the same
//! way again. Nonces are checked before the signature itself: rejecting a
//! replay leaks nothing, because a valid signature would not have replayed.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Maximum age of a signed message before it is rejected. The check is
/// bilateral: both stale replays and future-dated (clock-skewed) messages
/// fail it.
pub const MAX_TIMESTAMP_AGE: Duration = Duration::from_secs(30);

const ENVELOPE_FIELDS: &[&str] = &["signature", "timestamp", "nonce", "user_id", "origin"];

/// Outcome of verifying one inbound frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub reason: Option<String>,
    pub user_id: String,
    pub origin: String,
    pub timestamp: i64,
}

impl Verification {
    fn reject(reason: impl Into<String>) -> Self {
        Verification {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Checks Ed25519 signatures, timestamp freshness, and nonce uniqueness on
/// incoming messages.
pub struct Verifier {
    key: VerifyingKey,
    nonces: NonceStore,
}

impl Verifier {
    pub fn new(key: VerifyingKey) -> Self {
        // Nonces outlive the freshness window by 2x, so a clock-nudge
        // attack cannot straddle both limits.
        Self {
            key,
            nonces: NonceStore::new(MAX_TIMESTAMP_AGE * 2),
        }
    }

    /// Verify a raw JSON frame. On success returns the command bytes with
    /// the envelope fields stripped, canonically serialized.
    pub fn verify(&self, raw: &[u8]) -> (Option<Vec<u8>>, Verification) {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(err) => return (None, Verification::reject(format!("invalid JSON: {err}"))),
        };
        let Some(object) = value.as_object() else {
            return (None, Verification::reject("invalid JSON: not an object"));
        };

        let signature = object.get("signature").and_then(Value::as_str).unwrap_or("");
        if signature.is_empty() {
            return (None, Verification::reject("missing signature"));
        }
        let nonce = object.get("nonce").and_then(Value::as_str).unwrap_or("");
        if nonce.is_empty() {
            return (None, Verification::reject("missing nonce"));
        }

        let timestamp = object.get("timestamp").and_then(Value::as_i64).unwrap_or(0);
        let user_id = object
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let origin = object
            .get("origin")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut result = Verification {
            valid: false,
            reason: None,
            user_id,
            origin,
            timestamp,
        };

        let max_age = MAX_TIMESTAMP_AGE.as_secs() as i64;
        let age = (chrono::Utc::now().timestamp() - timestamp).abs();
        if age > max_age {
            result.reason = Some(format!(
                "timestamp too old or in future: age={age}s, max={max_age}s"
            ));
            return (None, result);
        }

        if !self.nonces.add(nonce) {
            result.reason = Some("duplicate nonce (replay detected)".to_string());
            return (None, result);
        }

        let mut command = value.clone();
        if let Some(map) = command.as_object_mut() {
            for field in ENVELOPE_FIELDS {
                map.remove(*field);
            }
        }
        let command_bytes = canonical_json(&command).into_bytes();

        let payload = signed_payload(&command, timestamp, nonce, &result.user_id, &result.origin);
        let canonical = canonical_json(&payload);

        let sig_bytes = match decode_base64(signature) {
            Some(b) => b,
            None => {
                result.reason = Some("invalid signature encoding".to_string());
                return (None, result);
            }
        };
        let sig = match Signature::from_slice(&sig_bytes) {
            Ok(s) => s,
            Err(_) => {
                result.reason = Some("invalid signature encoding".to_string());
                return (None, result);
            }
        };

        if self.key.verify(canonical.as_bytes(), &sig).is_err() {
            result.reason = Some("signature verification failed".to_string());
            return (None, result);
        }

        result.valid = true;
        (Some(command_bytes), result)
    }
}

/// Create a signed message. This is the control-plane side of the protocol;
/// the agent only uses it from tests.
pub fn sign(
    key: &SigningKey,
    command: &[u8],
    timestamp: i64,
    nonce: &str,
    user_id: &str,
    origin: &str,
) -> anyhow::Result<Vec<u8>> {
    let command: Value = serde_json::from_slice(command)?;
    anyhow::ensure!(command.is_object(), "command must be a JSON object");

    let payload = signed_payload(&command, timestamp, nonce, user_id, origin);
    let signature = key.sign(canonical_json(&payload).as_bytes());

    let mut wire = command;
    let map = wire.as_object_mut().expect("checked above");
    map.insert(
        "signature".into(),
        Value::String(STANDARD.encode(signature.to_bytes())),
    );
    map.insert("timestamp".into(), timestamp.into());
    map.insert("nonce".into(), nonce.into());
    map.insert("user_id".into(), user_id.into());
    map.insert("origin".into(), origin.into());
    Ok(canonical_json(&wire).into_bytes())
}

fn signed_payload(command: &Value, timestamp: i64, nonce: &str, user_id: &str, origin: &str) -> Value {
    serde_json::json!({
        "command": command,
        "timestamp": timestamp,
        "nonce": nonce,
        "user_id": user_id,
        "origin": origin,
    })
}

/// Serialize with lexicographically sorted keys and no whitespace, at every
/// nesting level. Both signer and verifier must produce identical bytes for
/// semantically equal objects, regardless of wire key order.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let elems: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", elems.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

/// Decode a hex or base64-encoded Ed25519 public key.
pub fn parse_verifying_key(s: &str) -> anyhow::Result<VerifyingKey> {
    let s = s.trim();
    anyhow::ensure!(!s.is_empty(), "empty public key");

    // 64 hex chars = 32 bytes
    if s.len() == 64 {
        if let Ok(bytes) = hex::decode(s) {
            if let Ok(key) = VerifyingKey::from_bytes(&bytes.try_into().expect("32 bytes")) {
                return Ok(key);
            }
        }
    }

    if let Some(bytes) = decode_base64(s) {
        if bytes.len() == 32 {
            let arr: [u8; 32] = bytes.try_into().expect("32 bytes");
            if let Ok(key) = VerifyingKey::from_bytes(&arr) {
                return Ok(key);
            }
        }
    }

    anyhow::bail!("invalid public key: must be 32 bytes, hex or base64 encoded")
}

fn decode_base64(s: &str) -> Option<Vec<u8>> {
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(bytes) = engine.decode(s) {
            return Some(bytes);
        }
    }
    None
}

/// Tracks seen nonces with TTL-based expiration. Expired entries are reaped
/// opportunistically on insert, so the store stays bounded without a
/// background task.
struct NonceStore {
    inner: Mutex<NonceStoreInner>,
    ttl: Duration,
}

struct NonceStoreInner {
    nonces: HashMap<String, Instant>,
    last_gc: Instant,
}

impl NonceStore {
    fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(NonceStoreInner {
                nonces: HashMap::new(),
                last_gc: Instant::now(),
            }),
            ttl,
        }
    }

    /// Returns true if the nonce is new, false on replay.
    fn add(&self, nonce: &str) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if now.duration_since(inner.last_gc) > self.ttl {
            let ttl = self.ttl;
            inner.nonces.retain(|_, seen| now.duration_since(*seen) <= ttl);
            inner.last_gc = now;
        }

        if inner.nonces.contains_key(nonce) {
            return false;
        }
        inner.nonces.insert(nonce.to_string(), now);
        true
    }
}
