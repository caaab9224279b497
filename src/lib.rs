//! Guardrail gateway library.
//!
//! A multi-tenant policy gateway for LLM-serving and tool-invoking
//! services: layered ingress checks, an idempotency engine, a streaming
//! egress guard, a hardened verifier pipeline, session-risk escalation,
//! quotas, webhook delivery with a DLQ, and a decision bus.

pub mod api;
pub mod bus;
pub mod config;
pub mod idempotency;
pub mod ingress;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod policy;
pub mod quota;
pub mod risk;
pub mod runtime;
pub mod state;
pub mod stream_guard;
pub mod verifier;
pub mod webhooks;

pub use api::router;
pub use state::AppState;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::VerifierSettings;

    /// Deterministic verifier settings for unit tests; env-independent.
    pub fn verifier_settings() -> VerifierSettings {
        VerifierSettings {
            enabled: true,
            providers: vec!["local_rules".to_string()],
            timeout_ms: 2_500,
            provider_timeout_ms: 500,
            max_retries: 0,
            max_tokens_per_request: 800,
            daily_token_budget: 100_000,
            circuit_fails: 5,
            circuit_window_s: 300,
            circuit_cooldown_s: 600,
            quota_default_skip_s: 30.0,
            quota_max_skip_s: 600.0,
            result_cache_enabled: true,
            result_cache_url: None,
            result_cache_ttl_s: 600,
            reuse_cache_enabled: true,
            reuse_cache_ttl_s: 120,
            adaptive_routing: false,
            router_min_samples: 20,
            router_sticky_s: 60,
            router_snapshot_max: 200,
            shadow_enabled: false,
            shadow_sample_rate: 0.0,
            shadow_max_concurrency: 2,
            shadow_max_results: 4,
            shadow_timeout_ms: 800,
            shadow_sync_for_tests: true,
            harm_cache_enabled: true,
        }
    }
}
