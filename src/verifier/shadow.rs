//! Shadow ("sandbox") execution of non-primary verifier providers.
//!
//! Sampled per request; shadow calls run concurrently with bounded
//! parallelism and individual timeouts, and never influence the live
//! decision. Production runs are fire-and-forget on a detached task;
//! synchronous mode exists for tests only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;

use super::provider::{VerifyMeta, VerifyProvider};
use crate::config::VerifierSettings;
use crate::observability::metrics::{verifier_latency, verifier_shadow};

#[derive(Debug, Clone, Serialize)]
pub struct ShadowObservation {
    pub provider: String,
    pub status: String,
    pub reason: String,
    pub latency_s: f64,
}

async fn one_shadow_call(
    provider: Arc<dyn VerifyProvider>,
    text: String,
    meta: VerifyMeta,
    timeout: Duration,
) -> ShadowObservation {
    let name = provider.name().to_string();
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, provider.assess(&text, &meta)).await;
    let latency = started.elapsed();
    verifier_latency(&name, latency);

    let (status, reason) = match result {
        Ok(Ok(verdict)) => (verdict.status.as_str().to_string(), verdict.reason),
        Ok(Err(e)) => ("error".to_string(), e.to_string()),
        Err(_) => ("timeout".to_string(), "shadow_timeout".to_string()),
    };
    verifier_shadow(&name, &status);
    ShadowObservation {
        provider: name,
        status,
        reason,
        latency_s: latency.as_secs_f64(),
    }
}

pub async fn run_shadow_for_providers(
    providers: Vec<Arc<dyn VerifyProvider>>,
    text: String,
    meta: VerifyMeta,
    max_concurrency: usize,
    timeout: Duration,
    max_results: usize,
) -> Vec<ShadowObservation> {
    if providers.is_empty() {
        return Vec::new();
    }
    let sem = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut handles = Vec::new();
    for provider in providers {
        let sem = sem.clone();
        let text = text.clone();
        let meta = meta.clone();
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            one_shadow_call(provider, text, meta, timeout).await
        }));
    }
    let mut results = Vec::new();
    for handle in handles {
        if let Ok(obs) = handle.await {
            results.push(obs);
        }
    }
    results.truncate(max_results.max(1));
    results
}

fn should_run(settings: &VerifierSettings) -> bool {
    settings.shadow_enabled && rand::thread_rng().gen::<f64>() < settings.shadow_sample_rate
}

/// Schedule shadow calls for every configured provider except the one
/// that produced the live decision. Returns observations only in the
/// synchronous test mode.
pub async fn maybe_schedule_shadow(
    settings: &VerifierSettings,
    registry: &HashMap<String, Arc<dyn VerifyProvider>>,
    primary: &str,
    text: &str,
    meta: &VerifyMeta,
) -> Option<Vec<ShadowObservation>> {
    if !should_run(settings) {
        return None;
    }
    let others: Vec<Arc<dyn VerifyProvider>> = settings
        .providers
        .iter()
        .filter(|name| name.as_str() != primary)
        .filter_map(|name| registry.get(name).cloned())
        .collect();
    if others.is_empty() {
        return None;
    }

    let timeout = Duration::from_millis(settings.shadow_timeout_ms.max(50));
    let fut = run_shadow_for_providers(
        others,
        text.to_string(),
        meta.clone(),
        settings.shadow_max_concurrency,
        timeout,
        settings.shadow_max_results,
    );

    if settings.shadow_sync_for_tests {
        return Some(fut.await);
    }
    // Detached task: survives request cancellation by construction.
    tokio::spawn(fut);
    None
}
