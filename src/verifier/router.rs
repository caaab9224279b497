//! Provider routing: default-order ranking with optional adaptive
//! reranking on moving success rate and p95 latency, plus bounded rank
//! snapshots for diagnostics.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;

use crate::idempotency::epoch_now;
use crate::observability::metrics::verifier_router_rank;

const EMA_ALPHA: f64 = 0.2;
const LATENCY_WINDOW: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct RankSnapshot {
    pub tenant: String,
    pub bot: String,
    pub order: Vec<String>,
    pub last_ranked_at: f64,
}

#[derive(Debug, Default, Clone)]
struct ProviderStats {
    ema_success: f64,
    samples: u64,
    latencies_ms: VecDeque<f64>,
}

impl ProviderStats {
    fn p95_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        sorted.get(idx).copied().unwrap_or(0.0)
    }

    fn record(&mut self, ok: bool, latency_ms: Option<f64>) {
        let x = if ok { 1.0 } else { 0.0 };
        self.ema_success = if self.samples == 0 {
            x
        } else {
            EMA_ALPHA * x + (1.0 - EMA_ALPHA) * self.ema_success
        };
        self.samples += 1;
        if let Some(ms) = latency_ms {
            self.latencies_ms.push_back(ms);
            while self.latencies_ms.len() > LATENCY_WINDOW {
                self.latencies_ms.pop_front();
            }
        }
    }
}

struct RouterInner {
    stats: HashMap<(String, String, String), ProviderStats>,
    last_rerank: HashMap<(String, String), f64>,
    snapshots: VecDeque<RankSnapshot>,
}

pub struct ProviderRouter {
    adaptive: bool,
    min_samples: u64,
    sticky_s: f64,
    snapshot_max: usize,
    inner: Mutex<RouterInner>,
}

impl ProviderRouter {
    pub fn new(adaptive: bool, min_samples: u64, sticky_s: u64, snapshot_max: usize) -> Self {
        Self {
            adaptive,
            min_samples,
            sticky_s: sticky_s as f64,
            snapshot_max: snapshot_max.max(1),
            inner: Mutex::new(RouterInner {
                stats: HashMap::new(),
                last_rerank: HashMap::new(),
                snapshots: VecDeque::new(),
            }),
        }
    }

    /// Produce the provider call order for `(tenant, bot)`. Every rank is
    /// snapshotted (bounded) and counted.
    pub fn rank(&self, tenant: &str, bot: &str, providers: &[String]) -> Vec<String> {
        let mut order: Vec<String> = providers.to_vec();
        let now = epoch_now();
        let mut inner = self.inner.lock();

        if self.adaptive {
            let pair = (tenant.to_string(), bot.to_string());
            let since_last = inner
                .last_rerank
                .get(&pair)
                .map(|t| now - t)
                .unwrap_or(f64::MAX);
            let all_sampled = providers.iter().all(|p| {
                inner
                    .stats
                    .get(&(tenant.to_string(), bot.to_string(), p.clone()))
                    .map(|s| s.samples >= self.min_samples)
                    .unwrap_or(false)
            });
            if all_sampled && since_last >= self.sticky_s {
                // Higher success rate first; p95 latency breaks ties.
                order.sort_by(|a, b| {
                    let sa = inner
                        .stats
                        .get(&(tenant.to_string(), bot.to_string(), a.clone()))
                        .cloned()
                        .unwrap_or_default();
                    let sb = inner
                        .stats
                        .get(&(tenant.to_string(), bot.to_string(), b.clone()))
                        .cloned()
                        .unwrap_or_default();
                    sb.ema_success
                        .partial_cmp(&sa.ema_success)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(
                            sa.p95_ms()
                                .partial_cmp(&sb.p95_ms())
                                .unwrap_or(std::cmp::Ordering::Equal),
                        )
                });
                inner.last_rerank.insert(pair, now);
            }
        }

        inner.snapshots.push_back(RankSnapshot {
            tenant: tenant.to_string(),
            bot: bot.to_string(),
            order: order.clone(),
            last_ranked_at: now,
        });
        while inner.snapshots.len() > self.snapshot_max {
            inner.snapshots.pop_front();
        }
        drop(inner);

        verifier_router_rank(tenant, bot);
        order
    }

    pub fn record_success(&self, tenant: &str, bot: &str, provider: &str, latency_ms: f64) {
        self.record(tenant, bot, provider, true, Some(latency_ms));
    }

    pub fn record_timeout(&self, tenant: &str, bot: &str, provider: &str) {
        self.record(tenant, bot, provider, false, None);
    }

    pub fn record_rate_limited(&self, tenant: &str, bot: &str, provider: &str) {
        self.record(tenant, bot, provider, false, None);
    }

    pub fn record_error(&self, tenant: &str, bot: &str, provider: &str) {
        self.record(tenant, bot, provider, false, None);
    }

    fn record(&self, tenant: &str, bot: &str, provider: &str, ok: bool, latency_ms: Option<f64>) {
        let mut inner = self.inner.lock();
        inner
            .stats
            .entry((tenant.to_string(), bot.to_string(), provider.to_string()))
            .or_default()
            .record(ok, latency_ms);
    }

    pub fn snapshots(&self) -> Vec<RankSnapshot> {
        self.inner.lock().snapshots.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identity_order_without_adaptive() {
        let router = ProviderRouter::new(false, 10, 60, 200);
        let order = router.rank("t", "b", &providers(&["a", "b", "c"]));
        assert_eq!(order, providers(&["a", "b", "c"]));
    }

    #[test]
    fn test_snapshots_are_bounded() {
        let router = ProviderRouter::new(false, 10, 60, 5);
        for _ in 0..20 {
            router.rank("t", "b", &providers(&["a"]));
        }
        assert_eq!(router.snapshots().len(), 5);
    }

    #[test]
    fn test_adaptive_needs_min_samples() {
        let router = ProviderRouter::new(true, 3, 0, 200);
        router.record_error("t", "b", "a");
        router.record_success("t", "b", "b", 10.0);
        // Under-sampled: order untouched.
        let order = router.rank("t", "b", &providers(&["a", "b"]));
        assert_eq!(order, providers(&["a", "b"]));
    }

    #[test]
    fn test_adaptive_prefers_successful_provider() {
        let router = ProviderRouter::new(true, 3, 0, 200);
        for _ in 0..5 {
            router.record_error("t", "b", "flaky");
            router.record_success("t", "b", "steady", 20.0);
        }
        let order = router.rank("t", "b", &providers(&["flaky", "steady"]));
        assert_eq!(order, providers(&["steady", "flaky"]));
    }

    #[test]
    fn test_sticky_window_prevents_immediate_rerank() {
        let router = ProviderRouter::new(true, 1, 3_600, 200);
        for _ in 0..3 {
            router.record_error("t", "b", "a");
            router.record_success("t", "b", "b", 5.0);
        }
        // First rank reranks (no prior timestamp)...
        let first = router.rank("t", "b", &providers(&["a", "b"]));
        assert_eq!(first, providers(&["b", "a"]));
        // ...then the sticky window pins the order even as stats change.
        for _ in 0..3 {
            router.record_success("t", "b", "a", 5.0);
            router.record_error("t", "b", "b");
        }
        let second = router.rank("t", "b", &providers(&["a", "b"]));
        assert_eq!(second, providers(&["a", "b"]));
    }

    #[test]
    fn test_p95_of_window() {
        let mut stats = ProviderStats::default();
        for i in 1..=100 {
            stats.record(true, Some(i as f64));
        }
        // Window keeps the last 64 samples (37..=100); p95 lands near 98.
        let p95 = stats.p95_ms();
        assert!(p95 >= 95.0 && p95 <= 100.0, "p95 {p95}");
    }
}
