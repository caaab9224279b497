//! Verifier caches: decisive-result cache (hybrid memory + Redis), the
//! per-request ingress-to-egress reuse cache, quota-skip registry, and the
//! harmful-fingerprint memory.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::provider::VerdictStatus;
use crate::idempotency::epoch_now;

fn decisive(status: VerdictStatus) -> bool {
    status.is_decisive()
}

struct MemCache {
    ttl_s: f64,
    data: HashMap<String, (VerdictStatus, f64)>,
}

impl MemCache {
    fn get(&mut self, key: &str) -> Option<VerdictStatus> {
        let now = epoch_now();
        match self.data.get(key) {
            Some((outcome, ts)) if now - ts <= self.ttl_s => Some(*outcome),
            Some(_) => {
                self.data.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&mut self, key: &str, outcome: VerdictStatus) {
        self.data.insert(key.to_string(), (outcome, epoch_now()));
    }
}

/// Hybrid result cache. Only `safe`/`unsafe` outcomes are stored;
/// `ambiguous` is never cached. Redis tier is optional and best-effort.
pub struct ResultCache {
    enabled: bool,
    ttl_s: u64,
    mem: Mutex<MemCache>,
    redis: Option<ConnectionManager>,
}

impl ResultCache {
    pub fn new(enabled: bool, ttl_s: u64, redis: Option<ConnectionManager>) -> Self {
        Self {
            enabled,
            ttl_s: ttl_s.max(1),
            mem: Mutex::new(MemCache {
                ttl_s: ttl_s.max(1) as f64,
                data: HashMap::new(),
            }),
            redis,
        }
    }

    pub fn key(tenant: &str, bot: &str, policy_version: &str, fingerprint: &str) -> String {
        let t = if tenant.is_empty() { "unknown-tenant" } else { tenant };
        let b = if bot.is_empty() { "unknown-bot" } else { bot };
        let pv = if policy_version.is_empty() {
            "unknown-policy"
        } else {
            policy_version
        };
        format!("veri:v1:{t}:{b}:{pv}:{fingerprint}")
    }

    pub async fn get(&self, key: &str) -> Option<VerdictStatus> {
        if !self.enabled {
            return None;
        }
        if let Some(hit) = self.mem.lock().get(key) {
            return Some(hit);
        }
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let raw: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .unwrap_or_else(|e| {
                    debug!(error = %e, "verifier result cache read failed");
                    None
                });
            let outcome = match raw.as_deref() {
                Some("safe") => Some(VerdictStatus::Safe),
                Some("unsafe") => Some(VerdictStatus::Unsafe),
                _ => None,
            };
            if let Some(outcome) = outcome {
                self.mem.lock().set(key, outcome);
                return Some(outcome);
            }
        }
        None
    }

    pub async fn set(&self, key: &str, outcome: VerdictStatus) {
        if !self.enabled || !decisive(outcome) {
            return;
        }
        self.mem.lock().set(key, outcome);
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let res: Result<(), _> = redis::cmd("SETEX")
                .arg(key)
                .arg(self.ttl_s)
                .arg(outcome.as_str())
                .query_async(&mut conn)
                .await;
            if let Err(e) = res {
                debug!(error = %e, "verifier result cache write failed");
            }
        }
    }

    /// Clear only the in-process tier.
    pub fn reset_memory(&self) {
        self.mem.lock().data.clear();
    }
}

/// Per-request reuse of a decisive ingress verdict on the egress leg.
pub struct ReuseCache {
    enabled: bool,
    mem: Mutex<MemCache>,
}

impl ReuseCache {
    pub fn new(enabled: bool, ttl_s: u64) -> Self {
        Self {
            enabled,
            mem: Mutex::new(MemCache {
                ttl_s: ttl_s.max(1) as f64,
                data: HashMap::new(),
            }),
        }
    }

    pub fn key(
        request_id: &str,
        tenant: &str,
        bot: &str,
        policy_version: &str,
        fingerprint: &str,
    ) -> String {
        let rid = if request_id.is_empty() { "unknown" } else { request_id };
        format!(
            "reuse:v1:{rid}:{}:{}:{}:{fingerprint}",
            if tenant.is_empty() { "unknown-tenant" } else { tenant },
            if bot.is_empty() { "unknown-bot" } else { bot },
            if policy_version.is_empty() { "unknown-policy" } else { policy_version },
        )
    }

    pub fn get(&self, key: &str) -> Option<VerdictStatus> {
        if !self.enabled {
            return None;
        }
        self.mem.lock().get(key)
    }

    pub fn set(&self, key: &str, outcome: VerdictStatus) {
        if !self.enabled || !decisive(outcome) {
            return;
        }
        self.mem.lock().set(key, outcome);
    }
}

/// Tracks per-provider "skip until" deadlines derived from rate-limit
/// signals. Durations are clamped to [1 s, max].
pub struct QuotaSkipRegistry {
    default_skip_s: f64,
    max_skip_s: f64,
    until: Mutex<HashMap<String, f64>>,
}

impl QuotaSkipRegistry {
    pub fn new(default_skip_s: f64, max_skip_s: f64) -> Self {
        Self {
            default_skip_s,
            max_skip_s,
            until: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_skipped(&self, provider: &str) -> bool {
        self.until
            .lock()
            .get(provider)
            .map(|t| *t > epoch_now())
            .unwrap_or(false)
    }

    /// Returns the applied skip duration in seconds.
    pub fn on_rate_limited(&self, provider: &str, retry_after_s: Option<f64>) -> f64 {
        let dur = retry_after_s
            .unwrap_or(self.default_skip_s)
            .clamp(1.0, self.max_skip_s);
        self.until
            .lock()
            .insert(provider.to_string(), epoch_now() + dur);
        dur
    }

    pub fn clear(&self, provider: &str) {
        self.until.lock().remove(provider);
    }
}

/// Fingerprints previously judged unsafe. Consulted only on the
/// all-providers-exhausted path.
pub struct HarmfulFingerprints {
    enabled: bool,
    mem: Mutex<HashSet<String>>,
    redis: Option<ConnectionManager>,
    redis_key: String,
    ttl: Duration,
}

impl HarmfulFingerprints {
    pub fn new(enabled: bool, redis: Option<ConnectionManager>) -> Self {
        Self {
            enabled,
            mem: Mutex::new(HashSet::new()),
            redis,
            redis_key: "veri:harm:v1".to_string(),
            ttl: Duration::from_secs(86_400),
        }
    }

    pub async fn mark_harmful(&self, fingerprint: &str) {
        if !self.enabled || fingerprint.is_empty() {
            return;
        }
        self.mem.lock().insert(fingerprint.to_string());
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let res: Result<(), _> = redis::pipe()
                .cmd("SADD")
                .arg(&self.redis_key)
                .arg(fingerprint)
                .ignore()
                .cmd("EXPIRE")
                .arg(&self.redis_key)
                .arg(self.ttl.as_secs())
                .ignore()
                .query_async(&mut conn)
                .await;
            if let Err(e) = res {
                debug!(error = %e, "harm cache write failed");
            }
        }
    }

    pub async fn contains(&self, fingerprint: &str) -> bool {
        if !self.enabled || fingerprint.is_empty() {
            return false;
        }
        if self.mem.lock().contains(fingerprint) {
            return true;
        }
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let hit: bool = redis::cmd("SISMEMBER")
                .arg(&self.redis_key)
                .arg(fingerprint)
                .query_async(&mut conn)
                .await
                .unwrap_or(false);
            if hit {
                self.mem.lock().insert(fingerprint.to_string());
            }
            return hit;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_result_cache_never_stores_ambiguous() {
        let cache = ResultCache::new(true, 60, None);
        let key = ResultCache::key("t", "b", "pv", "fp");
        cache.set(&key, VerdictStatus::Ambiguous).await;
        assert_eq!(cache.get(&key).await, None);
        cache.set(&key, VerdictStatus::Unsafe).await;
        assert_eq!(cache.get(&key).await, Some(VerdictStatus::Unsafe));
    }

    #[tokio::test]
    async fn test_result_cache_disabled_is_noop() {
        let cache = ResultCache::new(false, 60, None);
        let key = ResultCache::key("t", "b", "pv", "fp");
        cache.set(&key, VerdictStatus::Safe).await;
        assert_eq!(cache.get(&key).await, None);
    }

    #[test]
    fn test_cache_key_scopes() {
        let a = ResultCache::key("t1", "b1", "pv1", "fp");
        let b = ResultCache::key("t1", "b1", "pv2", "fp");
        assert_ne!(a, b);
        assert!(a.starts_with("veri:v1:t1:b1:pv1:"));
    }

    #[test]
    fn test_cache_key_defaults_for_empty() {
        let k = ResultCache::key("", "", "", "fp");
        assert_eq!(k, "veri:v1:unknown-tenant:unknown-bot:unknown-policy:fp");
    }

    #[test]
    fn test_quota_skip_clamps() {
        let reg = QuotaSkipRegistry::new(30.0, 600.0);
        assert_eq!(reg.on_rate_limited("p", Some(0.01)), 1.0);
        assert_eq!(reg.on_rate_limited("p", Some(10_000.0)), 600.0);
        assert_eq!(reg.on_rate_limited("p", None), 30.0);
        assert!(reg.is_skipped("p"));
        reg.clear("p");
        assert!(!reg.is_skipped("p"));
    }

    #[tokio::test]
    async fn test_harm_cache_round_trip() {
        let harm = HarmfulFingerprints::new(true, None);
        assert!(!harm.contains("fp1").await);
        harm.mark_harmful("fp1").await;
        assert!(harm.contains("fp1").await);
    }

    #[tokio::test]
    async fn test_harm_cache_disabled() {
        let harm = HarmfulFingerprints::new(false, None);
        harm.mark_harmful("fp1").await;
        assert!(!harm.contains("fp1").await);
    }

    #[test]
    fn test_reuse_cache_decisive_only() {
        let reuse = ReuseCache::new(true, 60);
        let key = ReuseCache::key("rid", "t", "b", "pv", "fp");
        reuse.set(&key, VerdictStatus::Ambiguous);
        assert_eq!(reuse.get(&key), None);
        reuse.set(&key, VerdictStatus::Safe);
        assert_eq!(reuse.get(&key), Some(VerdictStatus::Safe));
    }
}
