//! Shared application state threaded through every handler and layer.

use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

use crate::bus::DecisionBus;
use crate::config::{IdempotencyBackend, Settings};
use crate::idempotency::{IdemStore, InMemoryIdemStore, RedisIdemStore};
use crate::observability::audit::AuditForwarder;
use crate::observability::metrics::LATENCY_BUCKETS_S;
use crate::policy::PolicyStore;
use crate::quota::FixedWindowQuotaStore;
use crate::risk::escalation::EscalationStore;
use crate::risk::SessionRiskStore;
use crate::runtime::ArmRuntime;
use crate::verifier::provider::build_providers;
use crate::verifier::VerifierService;
use crate::webhooks::WebhookService;

/// Request-scoped context attached by the trace guard.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub traceparent: Option<String>,
}

/// Unicode scan results attached by the ingress sanitizer.
#[derive(Debug, Clone, Default)]
pub struct UnicodeScan {
    pub flags: Vec<String>,
    pub normalized: String,
    pub skeleton: String,
}

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub policy: Arc<PolicyStore>,
    pub idem: Arc<dyn IdemStore>,
    pub quota: Arc<FixedWindowQuotaStore>,
    pub risk: Arc<SessionRiskStore>,
    pub escalation: Arc<EscalationStore>,
    pub verifier: Arc<VerifierService>,
    pub webhooks: Arc<WebhookService>,
    pub bus: Arc<DecisionBus>,
    pub arm: Arc<ArmRuntime>,
    pub audit: AuditForwarder,
    pub http_client: reqwest::Client,
    pub metrics_handle: PrometheusHandle,
    /// True when the Redis readiness probe should be consulted.
    pub redis_configured: bool,
}

fn build_metrics_handle() -> PrometheusHandle {
    // Install once per process; tests constructing several states fall
    // back to a detached recorder.
    let builder = PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS_S)
        .expect("bucket list is non-empty");
    match builder.install_recorder() {
        Ok(handle) => handle,
        Err(_) => PrometheusBuilder::new()
            .set_buckets(LATENCY_BUCKETS_S)
            .expect("bucket list is non-empty")
            .build_recorder()
            .handle(),
    }
}

impl AppState {
    pub async fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        let metrics_handle = build_metrics_handle();

        let policy = Arc::new(PolicyStore::new(settings.policy.clone())?);

        let mut redis_conn = None;
        if let Some(url) = &settings.idempotency.redis_url {
            match redis::Client::open(url.as_str()) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(conn) => redis_conn = Some(conn),
                    Err(e) => warn!(error = %e, "redis connection failed; memory fallbacks active"),
                },
                Err(e) => warn!(error = %e, "invalid redis url; memory fallbacks active"),
            }
        }

        let idem: Arc<dyn IdemStore> = match (settings.idempotency.backend, redis_conn.clone()) {
            (IdempotencyBackend::Redis, Some(conn)) => {
                info!("idempotency backend: redis");
                Arc::new(RedisIdemStore::new(
                    conn,
                    "default",
                    settings.idempotency.recent_limit,
                ))
            }
            (IdempotencyBackend::Redis, None) => {
                warn!("IDEMPOTENCY_BACKEND=redis but no connection; using memory store");
                Arc::new(InMemoryIdemStore::new(settings.idempotency.recent_limit))
            }
            (IdempotencyBackend::Memory, _) => {
                Arc::new(InMemoryIdemStore::new(settings.idempotency.recent_limit))
            }
        };

        let audit = AuditForwarder::new(settings.audit.clone(), http_client.clone());
        let providers = build_providers(
            &settings.verifier.providers,
            &http_client,
            std::time::Duration::from_millis(settings.verifier.provider_timeout_ms.max(50)),
        );
        let verifier = Arc::new(VerifierService::new(
            settings.verifier.clone(),
            providers,
            redis_conn.clone(),
            audit.clone(),
        ));

        let webhooks = WebhookService::new(settings.webhooks.clone(), http_client.clone());

        Ok(Self {
            quota: Arc::new(FixedWindowQuotaStore::new(
                settings.quota.per_day,
                settings.quota.per_month,
            )),
            risk: Arc::new(SessionRiskStore::new(settings.risk.ttl_s)),
            escalation: Arc::new(EscalationStore::new(settings.escalation.clone())),
            bus: Arc::new(DecisionBus::new(&settings.bus)),
            arm: Arc::new(ArmRuntime::new(settings.arm.clone())),
            redis_configured: redis_conn.is_some(),
            settings: Arc::new(settings),
            policy,
            idem,
            verifier,
            webhooks,
            audit,
            http_client,
            metrics_handle,
        })
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        Self::from_settings(Settings::from_env()).await
    }
}
