//! Metric helpers with bounded label cardinality.
//!
//! Every tenant/bot-labelled emission goes through the limiter: once more
//! than `METRICS_LABEL_CARD_MAX` distinct values (or label pairs) have been
//! seen, further values collapse to the overflow label so the exporter's
//! series count stays bounded. Emission helpers never panic.

use std::collections::HashSet;
use std::time::Duration;

use lazy_static::lazy_static;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;

use crate::config::{env_str, env_usize};

/// Histogram buckets used for request/verifier latencies, in seconds.
pub const LATENCY_BUCKETS_S: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

struct LabelLimiter {
    card_max: usize,
    pair_max: usize,
    overflow: String,
    tenants: HashSet<String>,
    bots: HashSet<String>,
    pairs: HashSet<(String, String)>,
}

impl LabelLimiter {
    fn new() -> Self {
        let card_max = env_usize("METRICS_LABEL_CARD_MAX", 1_000);
        Self {
            card_max,
            pair_max: env_usize("METRICS_LABEL_PAIR_CARD_MAX", card_max),
            overflow: env_str("METRICS_LABEL_OVERFLOW", "__overflow__"),
            tenants: HashSet::new(),
            bots: HashSet::new(),
            pairs: HashSet::new(),
        }
    }

    fn safe(&mut self, val: &str, which: Which) -> String {
        if val.is_empty() {
            return "unknown".to_string();
        }
        let cache = match which {
            Which::Tenant => &mut self.tenants,
            Which::Bot => &mut self.bots,
        };
        if cache.contains(val) {
            return val.to_string();
        }
        if cache.len() < self.card_max {
            cache.insert(val.to_string());
            return val.to_string();
        }
        self.overflow.clone()
    }

    fn limit_pair(&mut self, tenant: &str, bot: &str) -> (String, String) {
        let t = self.safe(tenant, Which::Tenant);
        let b = self.safe(bot, Which::Bot);
        if t == self.overflow || b == self.overflow {
            return (self.overflow.clone(), self.overflow.clone());
        }
        let pair = (t.clone(), b.clone());
        if self.pairs.contains(&pair) {
            return pair;
        }
        if self.pairs.len() < self.pair_max {
            self.pairs.insert(pair.clone());
            return pair;
        }
        (self.overflow.clone(), self.overflow.clone())
    }
}

enum Which {
    Tenant,
    Bot,
}

lazy_static! {
    static ref LIMITER: Mutex<LabelLimiter> = Mutex::new(LabelLimiter::new());
}

/// Clamp a `(tenant, bot)` pair to the bounded label space.
pub fn limit_tenant_bot_labels(tenant: &str, bot: &str) -> (String, String) {
    LIMITER.lock().limit_pair(tenant, bot)
}

/// Reset the limiter caches. Test hook only.
pub fn reset_label_limiter_for_tests() {
    *LIMITER.lock() = LabelLimiter::new();
}

// --- Request / decision counters --------------------------------------------

pub fn inc_request(endpoint: &'static str) {
    counter!("guardrail_requests_total", 1, "endpoint" => endpoint);
}

pub fn observe_request_latency(endpoint: &'static str, elapsed: Duration) {
    histogram!("guardrail_request_latency_seconds", elapsed.as_secs_f64(), "endpoint" => endpoint);
}

pub fn inc_decision(action: &str) {
    counter!("guardrail_decisions_total", 1, "action" => action.to_string());
}

pub fn inc_decision_family(tenant: &str, bot: &str, family: &str) {
    counter!("guardrail_decisions_family_total", 1, "family" => family.to_string());
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!(
        "guardrail_decisions_family_bot_total", 1,
        "tenant" => t, "bot" => b, "family" => family.to_string()
    );
}

pub fn inc_clarify(direction: &'static str) {
    counter!("guardrail_clarify_total", 1, "direction" => direction);
}

pub fn inc_redaction(tag: &str) {
    counter!("guardrail_redactions_total", 1, "tag" => tag.to_string());
}

// --- Ingress guards ----------------------------------------------------------

pub fn ingress_path_violation_report(reason: &'static str) {
    counter!("ingress_path_violation_report", 1, "reason" => reason);
}

pub fn trace_guard_violation_report(kind: &'static str) {
    counter!("guardrail_trace_guard_violations_total", 1, "kind" => kind);
}

/// Allowlist for duplicate-header metric labels; everything else collapses
/// so a hostile client cannot mint label values.
const DUP_HEADER_LABEL_ALLOWLIST: &[&str] = &[
    "content-length",
    "content-type",
    "host",
    "authorization",
    "idempotency-key",
    "x-request-id",
    "traceparent",
];

fn dup_header_label(name: &str) -> String {
    if DUP_HEADER_LABEL_ALLOWLIST.contains(&name) {
        name.to_string()
    } else {
        "_other".to_string()
    }
}

pub fn duplicate_header_seen(tenant: &str, bot: &str, mode: &str, name: &str) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!(
        "guardrail_duplicate_header_seen_total", 1,
        "tenant" => t, "bot" => b, "mode" => mode.to_string(), "name" => dup_header_label(name)
    );
}

pub fn duplicate_header_blocked(tenant: &str, bot: &str, name: &str) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!(
        "guardrail_duplicate_header_blocked_total", 1,
        "tenant" => t, "bot" => b, "name" => dup_header_label(name)
    );
}

pub fn header_limit_blocked(tenant: &str, bot: &str, reason: &'static str) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!(
        "guardrail_header_limit_blocked_total", 1,
        "tenant" => t, "bot" => b, "reason" => reason
    );
}

pub fn unicode_ingress_report(tenant: &str, bot: &str, flags: &[String], blocked: bool) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    for flag in flags {
        counter!(
            "guardrail_unicode_flags_total", 1,
            "tenant" => t.clone(), "bot" => b.clone(), "flag" => flag.clone()
        );
    }
    if blocked {
        counter!("guardrail_unicode_blocked_total", 1, "tenant" => t, "bot" => b);
    }
}

pub fn decode_ingress_report(tenant: &str, bot: &str, b64: u64, hexn: u64, url: u64) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    if b64 > 0 {
        counter!("guardrail_decode_base64_total", b64, "tenant" => t.clone(), "bot" => b.clone());
    }
    if hexn > 0 {
        counter!("guardrail_decode_hex_total", hexn, "tenant" => t.clone(), "bot" => b.clone());
    }
    if url > 0 {
        counter!("guardrail_decode_url_total", url, "tenant" => t, "bot" => b);
    }
}

pub fn archive_ingress_report(
    tenant: &str,
    bot: &str,
    candidates: u64,
    detected: u64,
    filenames: u64,
    samples: u64,
    nested_blocked: u64,
    errors: u64,
) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    if candidates > 0 {
        counter!("guardrail_archive_candidates_total", candidates, "tenant" => t.clone(), "bot" => b.clone());
    }
    if detected > 0 {
        counter!("guardrail_archives_detected_total", detected, "tenant" => t.clone(), "bot" => b.clone());
    }
    if filenames > 0 {
        counter!("guardrail_archive_filenames_total", filenames, "tenant" => t.clone(), "bot" => b.clone());
    }
    if samples > 0 {
        counter!("guardrail_archive_text_samples_total", samples, "tenant" => t.clone(), "bot" => b.clone());
    }
    if nested_blocked > 0 {
        counter!("guardrail_archive_nested_blocked_total", nested_blocked, "tenant" => t.clone(), "bot" => b.clone());
    }
    if errors > 0 {
        counter!("guardrail_archive_errors_total", errors, "tenant" => t, "bot" => b);
    }
}

pub fn token_scan_report(tenant: &str, bot: &str, term: &str, hits: u64) {
    if hits == 0 {
        return;
    }
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!(
        "guardrail_token_scan_hits_total", hits,
        "tenant" => t, "bot" => b, "term" => term.to_string()
    );
}

pub fn session_risk_report(tenant: &str, bot: &str, score: f64) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    histogram!("guardrail_session_risk_score", score, "tenant" => t, "bot" => b);
}

// --- Idempotency -------------------------------------------------------------

pub fn idempotency_seen(tenant: &str, bot: &str, method: &str) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!(
        "guardrail_idemp_seen_total", 1,
        "tenant" => t, "bot" => b, "method" => method.to_string()
    );
}

pub fn idempotency_replayed(tenant: &str, bot: &str, replay_count: u64) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!("guardrail_idemp_replayed_total", 1, "tenant" => t, "bot" => b);
    // Contract sum/count pair: exported as a histogram-free aggregate.
    counter!("guardrail_idemp_replay_count_sum", replay_count);
    counter!("guardrail_idemp_replay_count_count", 1);
}

pub fn idempotency_conflict(tenant: &str, bot: &str, reason: &'static str) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!(
        "guardrail_idemp_conflict_total", 1,
        "tenant" => t, "bot" => b, "reason" => reason
    );
}

pub fn idempotency_skipped(tenant: &str, bot: &str, reason: &'static str) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!(
        "guardrail_idemp_skipped_total", 1,
        "tenant" => t, "bot" => b, "reason" => reason
    );
}

pub fn idempotency_touch() {
    counter!("guardrail_idemp_touches_total", 1);
}

pub fn idempotency_stuck_lock() {
    counter!("guardrail_idemp_stuck_locks_total", 1);
}

pub fn idempotency_backoff_step() {
    counter!("guardrail_idemp_follower_backoff_steps_total", 1);
}

// --- Policy ------------------------------------------------------------------

pub fn policy_reload_blocked(reason: &'static str) {
    counter!("policy_reload_blocked_total", 1, "reason" => reason);
}

// --- Verifier ----------------------------------------------------------------

pub fn verifier_router_rank(tenant: &str, bot: &str) {
    let (t, b) = limit_tenant_bot_labels(tenant, bot);
    counter!("verifier_router_rank_total", 1, "tenant" => t, "bot" => b);
}

pub fn verifier_outcome(provider: &str, status: &str) {
    counter!(
        "guardrail_verifier_outcomes_total", 1,
        "provider" => provider.to_string(), "status" => status.to_string()
    );
}

pub fn verifier_latency(provider: &str, elapsed: Duration) {
    histogram!(
        "guardrail_verifier_latency_seconds", elapsed.as_secs_f64(),
        "provider" => provider.to_string()
    );
}

pub fn verifier_shadow(provider: &str, status: &str) {
    counter!(
        "guardrail_verifier_shadow_total", 1,
        "provider" => provider.to_string(), "status" => status.to_string()
    );
}

// --- Webhooks ----------------------------------------------------------------

pub fn webhook_event(state: &'static str) {
    counter!("guardrail_webhook_events_total", 1, "state" => state);
}

pub fn webhook_abort(reason: &'static str) {
    counter!("webhook_abort_total", 1, "reason" => reason);
}

pub fn webhook_dlq_length_set(len: u64) {
    gauge!("guardrail_webhook_dlq_length", len as f64);
}

// --- Decision bus ------------------------------------------------------------

pub fn bus_subscribers(count: i64) {
    gauge!("guardrail_decision_subscribers", count as f64);
}

// --- Arm runtime -------------------------------------------------------------

pub fn arm_mode_gauge(mode: &'static str, active: bool) {
    gauge!("guardrail_arm_mode", if active { 1.0 } else { 0.0 }, "mode" => mode);
}

pub fn arm_status_gauge(arm: &'static str, state: &'static str, active: bool) {
    gauge!(
        "guardrail_arm_status", if active { 1.0 } else { 0.0 },
        "arm" => arm, "state" => state
    );
}

pub fn arm_transition(from: &str, to: &str) {
    counter!(
        "guardrail_arm_transitions_total", 1,
        "from" => from.to_string(), "to" => to.to_string()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_limiter_overflow() {
        let mut limiter = LabelLimiter {
            card_max: 3,
            pair_max: 3,
            overflow: "__overflow__".to_string(),
            tenants: HashSet::new(),
            bots: HashSet::new(),
            pairs: HashSet::new(),
        };
        for i in 0..3 {
            let (t, _) = limiter.limit_pair(&format!("t{i}"), "bot");
            assert_eq!(t, format!("t{i}"));
        }
        let (t, b) = limiter.limit_pair("t99", "bot");
        assert_eq!(t, "__overflow__");
        assert_eq!(b, "__overflow__");
        // Cardinality never exceeds cap + overflow.
        assert!(limiter.tenants.len() <= 3);
    }

    #[test]
    fn test_label_limiter_empty_is_unknown() {
        let mut limiter = LabelLimiter {
            card_max: 10,
            pair_max: 10,
            overflow: "__overflow__".to_string(),
            tenants: HashSet::new(),
            bots: HashSet::new(),
            pairs: HashSet::new(),
        };
        let (t, b) = limiter.limit_pair("", "");
        assert_eq!(t, "unknown");
        assert_eq!(b, "unknown");
    }

    #[test]
    fn test_known_pair_is_stable_after_overflow() {
        let mut limiter = LabelLimiter {
            card_max: 2,
            pair_max: 2,
            overflow: "__overflow__".to_string(),
            tenants: HashSet::new(),
            bots: HashSet::new(),
            pairs: HashSet::new(),
        };
        limiter.limit_pair("a", "x");
        limiter.limit_pair("b", "y");
        limiter.limit_pair("c", "z"); // overflows
        let (t, b) = limiter.limit_pair("a", "x");
        assert_eq!((t.as_str(), b.as_str()), ("a", "x"));
    }

    #[test]
    fn test_dup_header_label_allowlist() {
        assert_eq!(dup_header_label("host"), "host");
        assert_eq!(dup_header_label("x-evil-header"), "_other");
    }
}
