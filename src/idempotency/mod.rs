//! Idempotency engine: single-flight leader election and response replay.
//!
//! Two store backends implement the same [`IdemStore`] contract: an
//! in-memory store behind one mutex, and a Redis store whose mutating
//! operations are single-key Lua scripts. The middleware layer in
//! `crate::middleware::idempotency` drives the leader/follower protocol.

pub mod memory;
pub mod redis_store;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use memory::InMemoryIdemStore;
pub use redis_store::RedisIdemStore;

/// Cached downstream response, replayed verbatim to followers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    /// Header names are stored lower-cased; insertion order is irrelevant.
    pub headers: HashMap<String, String>,
    #[serde(with = "body_b64")]
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub stored_at: f64,
    pub replay_count: u64,
    pub body_sha256: String,
}

mod body_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

impl StoredResponse {
    pub fn new(
        status: u16,
        headers: HashMap<String, String>,
        body: Vec<u8>,
        content_type: Option<String>,
    ) -> Self {
        let body_sha256 = body_hash(&body);
        Self {
            status,
            headers,
            body,
            content_type,
            stored_at: epoch_now(),
            replay_count: 0,
            body_sha256,
        }
    }
}

/// Lifecycle state of a key as reported by `meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Idle,
    InProgress,
    Stored,
    Released,
}

/// Per-key metadata. `payload_fingerprint` comes from the live lock while
/// a leader is in progress, or from the stored entry afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct KeyMeta {
    pub state: Option<KeyState>,
    pub lock: bool,
    pub payload_fingerprint: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Outcome of a leader-election attempt.
#[derive(Debug, Clone)]
pub struct AcquireOutcome {
    pub acquired: bool,
    /// Owner token held by the caller while the lock is live.
    pub owner: Option<String>,
}

#[async_trait]
pub trait IdemStore: Send + Sync {
    /// Atomic: exactly one caller receives `acquired = true` per key while
    /// the lock has not expired.
    async fn acquire_leader(
        &self,
        key: &str,
        ttl_s: u64,
        payload_fingerprint: &str,
    ) -> Result<AcquireOutcome, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<StoredResponse>, StoreError>;

    /// Transitions to `stored`, clears the lock, and resets the value TTL
    /// in one atomic step. The payload fingerprint is persisted with the
    /// entry so later arrivals can detect a body mismatch.
    async fn put(
        &self,
        key: &str,
        resp: StoredResponse,
        payload_fingerprint: &str,
        ttl_s: u64,
    ) -> Result<(), StoreError>;

    /// Owner-scoped release; a mismatched owner is a no-op. `None` deletes
    /// unconditionally and is reserved for the admin path.
    async fn release(&self, key: &str, owner: Option<&str>) -> Result<bool, StoreError>;

    async fn meta(&self, key: &str) -> Result<KeyMeta, StoreError>;

    /// Atomically increment the stored replay counter; with `touch_ttl_s`
    /// also refresh TTLs without altering the stored value. Returns the new
    /// count, or `None` when no value is stored.
    async fn bump_replay(
        &self,
        key: &str,
        touch_ttl_s: Option<u64>,
    ) -> Result<Option<u64>, StoreError>;

    async fn purge(&self, key: &str) -> Result<bool, StoreError>;

    /// Most-recent-first `(key, ts)` pairs, deduplicated.
    async fn list_recent(&self, limit: usize) -> Result<Vec<(String, f64)>, StoreError>;
}

pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn body_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// `sha256(method|path|tenant|bot|body_sha256)`, hex.
pub fn payload_fingerprint(
    method: &str,
    path: &str,
    tenant: &str,
    bot: &str,
    body: &[u8],
) -> String {
    let joined = format!(
        "{}|{}|{}|{}|{}",
        method,
        path,
        tenant,
        bot,
        body_hash(body)
    );
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// 128-bit urlsafe owner token embedded in the lock value.
pub fn new_owner_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Keys are never logged whole: keep the first and last 8 chars. Short
/// keys fall back to a hash prefix so nothing recognizable leaks.
pub fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 20 {
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 8..].iter().collect();
        format!("{head}\u{2026}{tail}")
    } else {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        format!("sha256:{}", &digest[..10])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_changes_with_body() {
        let a = payload_fingerprint("POST", "/echo", "t1", "b1", b"{\"x\":1}");
        let b = payload_fingerprint("POST", "/echo", "t1", "b1", b"{\"x\":2}");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_tenant() {
        let a = payload_fingerprint("POST", "/echo", "t1", "b1", b"{}");
        let b = payload_fingerprint("POST", "/echo", "t2", "b1", b"{}");
        assert_ne!(a, b);
    }

    #[test]
    fn test_mask_key_long() {
        let masked = mask_key("abcdefgh-0123456789-ijklmnop");
        assert!(masked.starts_with("abcdefgh"));
        assert!(masked.ends_with("ijklmnop"));
        assert!(masked.contains('\u{2026}'));
        assert!(!masked.contains("0123456789"));
    }

    #[test]
    fn test_mask_key_short_uses_hash() {
        let masked = mask_key("short");
        assert!(masked.starts_with("sha256:"));
        assert!(!masked.contains("short"));
    }

    #[test]
    fn test_owner_tokens_are_unique() {
        assert_ne!(new_owner_token(), new_owner_token());
    }

    #[test]
    fn test_stored_response_round_trips_body() {
        let resp = StoredResponse::new(
            200,
            HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            b"{\"ok\":true}".to_vec(),
            Some("application/json".to_string()),
        );
        let json = serde_json::to_string(&resp).unwrap();
        let back: StoredResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, resp.body);
        assert_eq!(back.body_sha256, resp.body_sha256);
    }
}
