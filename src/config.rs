//! Typed runtime configuration loaded from the environment.
//!
//! Every subsystem gets its own settings struct with a `from_env()`
//! constructor; values are clamped per deployment environment so a
//! misconfigured prod instance cannot end up with unsafe TTLs.

use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Deployment environment, from `APP_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Dev,
    Stage,
    Prod,
    Test,
}

impl AppEnv {
    pub fn from_env() -> Self {
        match env::var("APP_ENV").unwrap_or_default().to_lowercase().as_str() {
            "prod" | "production" => AppEnv::Prod,
            "stage" | "staging" => AppEnv::Stage,
            "test" => AppEnv::Test,
            _ => AppEnv::Dev,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppEnv::Dev => "dev",
            AppEnv::Stage => "stage",
            AppEnv::Prod => "prod",
            AppEnv::Test => "test",
        }
    }
}

pub fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on" | "ON"))
        .unwrap_or(default)
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

pub fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

pub fn env_str(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

pub fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_csv_set(name: &str, default: &[&str]) -> HashSet<String> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Enforcement mode shared by several ingress guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    Off,
    Log,
    Block,
}

impl GuardMode {
    fn parse(raw: &str, default: GuardMode) -> GuardMode {
        match raw.trim().to_lowercase().as_str() {
            "off" => GuardMode::Off,
            "log" => GuardMode::Log,
            "block" => GuardMode::Block,
            _ => default,
        }
    }

    pub fn from_env(name: &str, default: GuardMode) -> GuardMode {
        env::var(name)
            .map(|v| GuardMode::parse(&v, default))
            .unwrap_or(default)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuardMode::Off => "off",
            GuardMode::Log => "log",
            GuardMode::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyMode {
    Observe,
    Enforce,
}

#[derive(Debug, Clone)]
pub struct IdempotencySettings {
    pub enabled: bool,
    pub backend: IdempotencyBackend,
    pub mode: IdempotencyMode,
    pub redis_url: Option<String>,
    pub methods: HashSet<String>,
    pub lock_ttl_s: u64,
    pub value_ttl_s: u64,
    pub body_max_bytes: usize,
    pub wait_budget_ms: u64,
    pub in_progress_retry_after_s: u64,
    pub touch_on_replay: bool,
    pub strict_fail_closed: bool,
    pub recent_limit: usize,
}

impl IdempotencySettings {
    pub fn from_env(app_env: AppEnv) -> Self {
        let backend = match env_str("IDEMPOTENCY_BACKEND", "memory").to_lowercase().as_str() {
            "redis" => IdempotencyBackend::Redis,
            _ => IdempotencyBackend::Memory,
        };
        let mode = match env_str("IDEMPOTENCY_MODE", "enforce").to_lowercase().as_str() {
            "observe" => IdempotencyMode::Observe,
            _ => IdempotencyMode::Enforce,
        };

        // Lock TTL floors: prod must not run with sub-minute leader locks.
        let min_lock = match app_env {
            AppEnv::Prod => 60,
            AppEnv::Stage => 30,
            _ => 1,
        };
        let lock_ttl_s = env_u64("IDEMPOTENCY_LOCK_TTL_S", 60).max(min_lock);

        Self {
            enabled: env_bool("IDEMPOTENCY_ENABLED", true),
            backend,
            mode,
            redis_url: env_opt("IDEMP_REDIS_URL").or_else(|| env_opt("REDIS_URL")),
            methods: env_csv_set("IDEMPOTENCY_METHODS", &["POST", "PUT", "PATCH", "DELETE"]),
            lock_ttl_s,
            value_ttl_s: env_u64("IDEMPOTENCY_TTL_SECONDS", 86_400).max(1),
            body_max_bytes: env_usize("IDEMPOTENCY_BODY_MAX_BYTES", 131_072),
            wait_budget_ms: env_u64("IDEMPOTENCY_WAIT_BUDGET_MS", 2_000),
            in_progress_retry_after_s: env_u64("IDEMPOTENCY_IN_PROGRESS_RETRY_AFTER", 1).max(1),
            touch_on_replay: env_bool("IDEMP_TOUCH_ON_REPLAY", false),
            strict_fail_closed: env_bool(
                "IDEMPOTENCY_STRICT_FAIL_CLOSED",
                app_env == AppEnv::Prod,
            ),
            recent_limit: env_usize("IDEMPOTENCY_RECENT_LIMIT", 10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuotaSettings {
    pub enabled: bool,
    pub per_day: u64,
    pub per_month: u64,
}

impl QuotaSettings {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("QUOTA_ENABLED", true),
            per_day: env_u64("QUOTA_PER_DAY", 100_000),
            per_month: env_u64("QUOTA_PER_MONTH", 2_000_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifierSettings {
    pub enabled: bool,
    pub providers: Vec<String>,
    pub timeout_ms: u64,
    pub provider_timeout_ms: u64,
    pub max_retries: u32,
    pub max_tokens_per_request: u64,
    pub daily_token_budget: u64,
    pub circuit_fails: u32,
    pub circuit_window_s: u64,
    pub circuit_cooldown_s: u64,
    pub quota_default_skip_s: f64,
    pub quota_max_skip_s: f64,
    pub result_cache_enabled: bool,
    pub result_cache_url: Option<String>,
    pub result_cache_ttl_s: u64,
    pub reuse_cache_enabled: bool,
    pub reuse_cache_ttl_s: u64,
    pub adaptive_routing: bool,
    pub router_min_samples: u64,
    pub router_sticky_s: u64,
    pub router_snapshot_max: usize,
    pub shadow_enabled: bool,
    pub shadow_sample_rate: f64,
    pub shadow_max_concurrency: usize,
    pub shadow_max_results: usize,
    pub shadow_timeout_ms: u64,
    pub shadow_sync_for_tests: bool,
    pub harm_cache_enabled: bool,
}

impl VerifierSettings {
    pub fn from_env() -> Self {
        let providers = env_str("VERIFIER_PROVIDERS", "local_rules")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            enabled: env_bool("VERIFIER_ENABLED", true),
            providers,
            timeout_ms: env_u64("VERIFIER_TIMEOUT_MS", 2_500),
            provider_timeout_ms: env_u64("VERIFIER_PROVIDER_TIMEOUT_MS", 1_500),
            max_retries: env_u64("VERIFIER_MAX_RETRIES", 1) as u32,
            max_tokens_per_request: env_u64("VERIFIER_MAX_TOKENS_PER_REQUEST", 800),
            daily_token_budget: env_u64("VERIFIER_DAILY_TOKEN_BUDGET", 100_000),
            circuit_fails: env_u64("VERIFIER_CIRCUIT_FAILS", 5) as u32,
            circuit_window_s: env_u64("VERIFIER_CIRCUIT_WINDOW_S", 300),
            circuit_cooldown_s: env_u64("VERIFIER_CIRCUIT_COOLDOWN_S", 600),
            quota_default_skip_s: env_f64("VERIFIER_PROVIDER_QUOTA_DEFAULT_SKIP_S", 30.0),
            quota_max_skip_s: env_f64("VERIFIER_PROVIDER_QUOTA_MAX_SKIP_S", 600.0),
            result_cache_enabled: env_bool("VERIFIER_RESULT_CACHE_ENABLED", true),
            result_cache_url: env_opt("VERIFIER_RESULT_CACHE_URL"),
            result_cache_ttl_s: env_u64("VERIFIER_RESULT_CACHE_TTL_SECONDS", 600),
            reuse_cache_enabled: env_bool("VERIFIER_EGRESS_REUSE_ENABLED", true),
            reuse_cache_ttl_s: env_u64("VERIFIER_EGRESS_REUSE_TTL_SECONDS", 120),
            adaptive_routing: env_bool("VERIFIER_ADAPTIVE_ROUTING", false),
            router_min_samples: env_u64("VERIFIER_ROUTER_MIN_SAMPLES", 20),
            router_sticky_s: env_u64("VERIFIER_ROUTER_STICKY_S", 60),
            router_snapshot_max: env_usize("VERIFIER_ROUTER_SNAPSHOT_MAX", 200).max(1),
            shadow_enabled: env_bool("VERIFIER_SANDBOX_ENABLED", false),
            shadow_sample_rate: env_f64("VERIFIER_SANDBOX_SAMPLE_RATE", 0.05),
            shadow_max_concurrency: env_usize("VERIFIER_SANDBOX_MAX_CONCURRENCY", 2).max(1),
            shadow_max_results: env_usize("VERIFIER_SANDBOX_MAX_RESULTS", 4).max(1),
            shadow_timeout_ms: env_u64("VERIFIER_SANDBOX_TIMEOUT_MS", 800),
            shadow_sync_for_tests: env_bool("VERIFIER_SANDBOX_SYNC_FOR_TESTS", false),
            harm_cache_enabled: env_bool("VERIFIER_HARM_CACHE_ENABLED", true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub url: Option<String>,
    pub secret: String,
    pub sign_v0_also: bool,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_horizon_ms: u64,
    pub cb_error_threshold: u32,
    pub cb_window: usize,
    pub cb_cooldown_sec: u64,
    pub dlq_path: String,
    pub queue_max: usize,
    pub timeout: Duration,
}

impl WebhookSettings {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("WEBHOOK_ENABLED", false),
            url: env_opt("WEBHOOK_URL"),
            secret: env_str("WEBHOOK_SECRET", ""),
            sign_v0_also: env_bool("WEBHOOK_SIGN_V0_ALSO", false),
            max_attempts: env_u64("WEBHOOK_MAX_ATTEMPTS", 5) as u32,
            backoff_base_ms: env_u64("WEBHOOK_BACKOFF_BASE_MS", 250),
            backoff_cap_ms: env_u64("WEBHOOK_BACKOFF_CAP_MS", 10_000),
            backoff_horizon_ms: env_u64("WEBHOOK_BACKOFF_HORIZON_MS", 900_000),
            cb_error_threshold: env_u64("WEBHOOK_CB_ERROR_THRESHOLD", 8) as u32,
            cb_window: env_usize("WEBHOOK_CB_WINDOW", 30).max(1),
            cb_cooldown_sec: env_u64("WEBHOOK_CB_COOLDOWN_SEC", 60),
            dlq_path: env_str("WEBHOOK_DLQ_PATH", "var/webhook_deadletter.jsonl"),
            queue_max: env_usize("WEBHOOK_QUEUE_MAX", 1_024),
            timeout: Duration::from_millis(env_u64("WEBHOOK_TIMEOUT_MS", 5_000)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngressSettings {
    pub duplicate_header_mode: GuardMode,
    pub duplicate_header_unique: HashSet<String>,
    pub header_limits_enabled: bool,
    pub max_header_count: usize,
    pub max_header_value_bytes: usize,
    pub unicode_mode: GuardMode,
    pub unicode_blocked_flags: HashSet<String>,
    pub unicode_path_sample_chars: usize,
    pub unicode_query_sample_bytes: usize,
    pub unicode_header_sample_bytes: usize,
}

impl IngressSettings {
    pub fn from_env() -> Self {
        let unique: HashSet<String> = match env::var("INGRESS_DUPLICATE_HEADER_UNIQUE") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => ["content-length", "host", "authorization", "content-type"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let blocked: HashSet<String> = match env::var("INGRESS_UNICODE_BLOCKED_FLAGS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => ["bidi", "zwc"].iter().map(|s| s.to_string()).collect(),
        };
        Self {
            duplicate_header_mode: GuardMode::from_env(
                "INGRESS_DUPLICATE_HEADER_GUARD_MODE",
                GuardMode::Off,
            ),
            duplicate_header_unique: unique,
            header_limits_enabled: env_bool("INGRESS_HEADER_LIMITS_ENABLED", false),
            max_header_count: env_usize("INGRESS_MAX_HEADER_COUNT", 0),
            max_header_value_bytes: env_usize("INGRESS_MAX_HEADER_VALUE_BYTES", 0),
            unicode_mode: GuardMode::from_env("INGRESS_UNICODE_SANITIZER_MODE", GuardMode::Off),
            unicode_blocked_flags: blocked,
            unicode_path_sample_chars: env_usize("INGRESS_UNICODE_PATH_SAMPLE_CHARS", 1_024),
            unicode_query_sample_bytes: env_usize("INGRESS_UNICODE_QUERY_SAMPLE_BYTES", 4_096),
            unicode_header_sample_bytes: env_usize("INGRESS_UNICODE_HEADER_SAMPLE_BYTES", 4_096),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamGuardSettings {
    pub enabled: bool,
    pub lookback_chars: usize,
    pub flush_min_bytes: usize,
    pub deny_on_private_key: bool,
}

impl StreamGuardSettings {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("STREAM_EGRESS_ENABLED", true),
            lookback_chars: env_usize("STREAM_GUARD_MAX_LOOKBACK_CHARS", 1_024),
            flush_min_bytes: env_usize("STREAM_GUARD_FLUSH_MIN_BYTES", 0),
            deny_on_private_key: env_bool("STREAM_GUARD_DENY_ON_PRIVATE_KEY", true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskSettings {
    pub half_life_s: f64,
    pub ttl_s: f64,
}

impl RiskSettings {
    pub fn from_env() -> Self {
        Self {
            half_life_s: env_f64("RISK_HALF_LIFE_SECONDS", 180.0),
            ttl_s: env_f64("RISK_TTL_SECONDS", 900.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EscalationSettings {
    pub enabled: bool,
    pub deny_threshold: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
}

impl EscalationSettings {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("ESCALATION_ENABLED", false),
            deny_threshold: (env_u64("ESCALATION_DENY_THRESHOLD", 3).max(1)) as u32,
            window_secs: env_u64("ESCALATION_WINDOW_SECS", 300).max(1),
            cooldown_secs: env_u64("ESCALATION_COOLDOWN_SECS", 900).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEnforce {
    Warn,
    Block,
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub enforce: PolicyEnforce,
    pub packs_dir: String,
    pub default_packs: Vec<String>,
}

impl PolicySettings {
    pub fn from_env() -> Self {
        let enforce = match env_str("POLICY_VALIDATE_ENFORCE", "warn").to_lowercase().as_str() {
            "block" => PolicyEnforce::Block,
            _ => PolicyEnforce::Warn,
        };
        let default_packs = env_str("POLICY_DEFAULT_PACKS", "baseline")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            enforce,
            packs_dir: env_str("POLICY_PACKS_DIR", "rules/policies"),
            default_packs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub path: String,
    pub buffer_max: usize,
    pub keepalive: Duration,
}

impl BusSettings {
    pub fn from_env() -> Self {
        Self {
            path: env_str("DECISIONS_AUDIT_PATH", "var/decisions.jsonl"),
            buffer_max: env_usize("DECISIONS_BUFFER_MAX", 2_000).max(1),
            keepalive: Duration::from_secs(env_u64("DECISIONS_SSE_KEEPALIVE_S", 15)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditSettings {
    pub enabled: bool,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub hmac_secret: Option<String>,
}

impl AuditSettings {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("AUDIT_FORWARD_ENABLED", false),
            url: env_opt("AUDIT_FORWARD_URL"),
            api_key: env_opt("AUDIT_FORWARD_API_KEY"),
            hmac_secret: env_opt("AUDIT_FORWARD_HMAC_SECRET"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArmSettings {
    pub ingress_enabled: bool,
    pub egress_enabled: bool,
    pub egress_only_on_ingress_degraded: bool,
    pub ingress_degraded_lag_ms: f64,
}

impl ArmSettings {
    pub fn from_env() -> Self {
        Self {
            ingress_enabled: env_bool("ARM_INGRESS_ENABLED", true),
            egress_enabled: env_bool("ARM_EGRESS_ENABLED", true),
            egress_only_on_ingress_degraded: env_bool("EGRESS_ONLY_ON_INGRESS_DEGRADED", true),
            ingress_degraded_lag_ms: env_f64("INGRESS_DEGRADED_LAG_MS", 2_000.0),
        }
    }
}

/// Top-level settings bundle threaded through `AppState`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub app_env: AppEnv,
    pub bind_addr: String,
    pub admin_token: Option<String>,
    pub idempotency: IdempotencySettings,
    pub quota: QuotaSettings,
    pub verifier: VerifierSettings,
    pub webhooks: WebhookSettings,
    pub ingress: IngressSettings,
    pub stream: StreamGuardSettings,
    pub risk: RiskSettings,
    pub escalation: EscalationSettings,
    pub policy: PolicySettings,
    pub bus: BusSettings,
    pub audit: AuditSettings,
    pub arm: ArmSettings,
    pub config_audit_path: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let app_env = AppEnv::from_env();
        Self {
            app_env,
            bind_addr: env_str("BIND_ADDR", "0.0.0.0:8080"),
            admin_token: env_opt("ADMIN_UI_TOKEN"),
            idempotency: IdempotencySettings::from_env(app_env),
            quota: QuotaSettings::from_env(),
            verifier: VerifierSettings::from_env(),
            webhooks: WebhookSettings::from_env(),
            ingress: IngressSettings::from_env(),
            stream: StreamGuardSettings::from_env(),
            risk: RiskSettings::from_env(),
            escalation: EscalationSettings::from_env(),
            policy: PolicySettings::from_env(),
            bus: BusSettings::from_env(),
            audit: AuditSettings::from_env(),
            arm: ArmSettings::from_env(),
            config_audit_path: env_str("CONFIG_AUDIT_PATH", "var/config_audit.jsonl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_mode_parse() {
        assert_eq!(GuardMode::parse("block", GuardMode::Off), GuardMode::Block);
        assert_eq!(GuardMode::parse("LOG", GuardMode::Off), GuardMode::Log);
        assert_eq!(GuardMode::parse("bogus", GuardMode::Off), GuardMode::Off);
    }

    #[test]
    fn test_prod_lock_ttl_floor() {
        // Without IDEMPOTENCY_LOCK_TTL_S set, prod gets the 60s floor.
        let s = IdempotencySettings::from_env(AppEnv::Prod);
        assert!(s.lock_ttl_s >= 60);
        let s = IdempotencySettings::from_env(AppEnv::Dev);
        assert!(s.lock_ttl_s >= 1);
    }

    #[test]
    fn test_default_methods() {
        let s = IdempotencySettings::from_env(AppEnv::Test);
        assert!(s.methods.contains("POST"));
        assert!(s.methods.contains("DELETE"));
        assert!(!s.methods.contains("GET"));
    }
}
