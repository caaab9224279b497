//! Webhook delivery: signed POSTs with per-host circuit breaking,
//! decorrelated-jitter backoff bounded by a total horizon, and a DLQ for
//! everything that cannot be delivered.

pub mod breaker;
pub mod dlq;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::WebhookSettings;
use crate::observability::metrics::{webhook_abort, webhook_event};

use breaker::HostBreakerRegistry;
use dlq::DeadLetterQueue;

type HmacSha256 = Hmac<Sha256>;

/// v1 signature: HMAC over `<unix_ts>\n<body>`.
pub fn sign_v1(secret: &str, ts: i64, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(ts.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Legacy v0 signature: HMAC over the body alone.
pub fn sign_v0(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// `uniform(0.5, 1.5) * min(base * 2^attempt, cap)`
pub fn backoff_with_jitter_ms(base_ms: u64, attempt: u32, cap_ms: u64) -> u64 {
    let raw = base_ms.saturating_mul(1u64 << attempt.min(32));
    let capped = raw.min(cap_ms) as f64;
    let factor = 0.5 + rand::thread_rng().gen::<f64>();
    (capped * factor) as u64
}

/// Delivery result for a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed,
    Aborted,
    Failed,
    DlqCircuitOpen,
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct WebhookStats {
    pub queued: u64,
    pub processed: u64,
    pub dropped: u64,
    pub aborted: u64,
    pub failed: u64,
}

/// Injectable transport seam; the default posts over reqwest. Tests plug
/// a fake to script status codes without sockets.
#[async_trait::async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Returns the HTTP status, or Err for network/timeout failures.
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<u16, String>;
}

struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

#[async_trait::async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<u16, String> {
        let mut req = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        match req.send().await {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(e) => Err(e.to_string()),
        }
    }
}

pub struct WebhookService {
    settings: WebhookSettings,
    transport: Arc<dyn WebhookTransport>,
    breakers: Arc<HostBreakerRegistry>,
    pub dlq: Arc<DeadLetterQueue>,
    tx: mpsc::Sender<Value>,
    stats: Arc<Mutex<WebhookStats>>,
}

impl WebhookService {
    pub fn new(settings: WebhookSettings, client: reqwest::Client) -> Arc<Self> {
        let transport: Arc<dyn WebhookTransport> = Arc::new(ReqwestTransport {
            client,
            timeout: settings.timeout,
        });
        Self::with_transport(settings, transport)
    }

    pub fn with_transport(
        settings: WebhookSettings,
        transport: Arc<dyn WebhookTransport>,
    ) -> Arc<Self> {
        let dlq = Arc::new(DeadLetterQueue::new(settings.dlq_path.clone()));
        let breakers = Arc::new(HostBreakerRegistry::new(
            settings.cb_error_threshold,
            settings.cb_window,
            settings.cb_cooldown_sec,
        ));
        let (tx, rx) = mpsc::channel(settings.queue_max.max(1));
        let service = Arc::new(Self {
            settings,
            transport,
            breakers,
            dlq,
            tx,
            stats: Arc::new(Mutex::new(WebhookStats::default())),
        });
        service.clone().spawn_worker(rx);
        service
    }

    fn spawn_worker(self: Arc<Self>, mut rx: mpsc::Receiver<Value>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let _ = self.deliver(event).await;
            }
        });
    }

    /// Non-blocking enqueue; a full queue drops the event (counted).
    pub fn enqueue(&self, event: Value) {
        match self.tx.try_send(event) {
            Ok(()) => {
                webhook_event("enqueued");
                self.stats.lock().queued += 1;
            }
            Err(_) => {
                webhook_event("dropped");
                self.stats.lock().dropped += 1;
            }
        }
    }

    pub fn stats(&self) -> WebhookStats {
        self.stats.lock().clone()
    }

    pub fn breaker_state(&self, url: &str) -> &'static str {
        self.breakers.state(url).as_str()
    }

    /// Requeue everything in the DLQ, in chunks. Returns the number of
    /// requeued records.
    pub fn retry_dlq(&self) -> usize {
        let records = self.dlq.drain_all();
        let mut requeued = 0;
        for chunk in records.chunks(1_000) {
            for record in chunk {
                match self.tx.try_send(record.event.clone()) {
                    Ok(()) => requeued += 1,
                    Err(_) => {
                        // Queue full: put the record back so nothing is lost.
                        self.dlq.push(&record.reason, record.event.clone());
                    }
                }
            }
        }
        requeued
    }

    fn signed_headers(&self, body: &[u8]) -> Vec<(String, String)> {
        let ts = chrono::Utc::now().timestamp();
        let mut headers = vec![
            ("X-Guardrail-Timestamp".to_string(), ts.to_string()),
            (
                "X-Guardrail-Signature-V1".to_string(),
                sign_v1(&self.settings.secret, ts, body),
            ),
        ];
        if self.settings.sign_v0_also {
            headers.push((
                "X-Guardrail-Signature".to_string(),
                sign_v0(&self.settings.secret, body),
            ));
        }
        headers
    }

    pub async fn deliver(&self, event: Value) -> DeliveryOutcome {
        let Some(url) = self.settings.url.clone() else {
            // No destination configured: sink the event.
            webhook_event("processed");
            self.stats.lock().processed += 1;
            return DeliveryOutcome::Processed;
        };
        let body = serde_json::to_vec(&event).unwrap_or_default();

        let mut total_delay_ms: u64 = 0;
        let mut last_error = String::new();
        for attempt in 0..self.settings.max_attempts.max(1) {
            // Breaker is re-checked before every attempt, and an open
            // breaker never opens an HTTP connection.
            if self.breakers.should_dlq_now(&url) {
                webhook_abort("cb_open");
                self.dlq.push("cb_open", event);
                self.stats.lock().failed += 1;
                return DeliveryOutcome::DlqCircuitOpen;
            }

            let headers = self.signed_headers(&body);
            match self.transport.post(&url, &headers, &body).await {
                Ok(status) if (200..300).contains(&status) => {
                    self.breakers.on_success(&url);
                    webhook_event("processed");
                    self.stats.lock().processed += 1;
                    return DeliveryOutcome::Processed;
                }
                Ok(status) if status != 429 && (400..500).contains(&status) => {
                    // Permanent client error: abort without retry.
                    self.breakers.on_failure(&url);
                    webhook_abort("client_error");
                    self.stats.lock().aborted += 1;
                    debug!(status, "webhook aborted on client error");
                    return DeliveryOutcome::Aborted;
                }
                Ok(status) => {
                    self.breakers.on_failure(&url);
                    last_error = format!("status {status}");
                }
                Err(e) => {
                    self.breakers.on_failure(&url);
                    last_error = e;
                }
            }

            if attempt + 1 < self.settings.max_attempts {
                let delay = backoff_with_jitter_ms(
                    self.settings.backoff_base_ms,
                    attempt,
                    self.settings.backoff_cap_ms,
                );
                if total_delay_ms.saturating_add(delay) > self.settings.backoff_horizon_ms {
                    warn!("webhook backoff horizon exhausted");
                    break;
                }
                total_delay_ms += delay;
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        webhook_event("failed");
        self.stats.lock().failed += 1;
        self.dlq.push(
            if last_error.is_empty() { "exhausted" } else { &last_error },
            event,
        );
        DeliveryOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTransport {
        statuses: Vec<Result<u16, String>>,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl WebhookTransport for ScriptedTransport {
        async fn post(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _body: &[u8],
        ) -> Result<u16, String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.statuses
                .get(i.min(self.statuses.len().saturating_sub(1)))
                .cloned()
                .unwrap_or(Ok(200))
        }
    }

    fn settings(dir: &tempfile::TempDir, url: Option<&str>, attempts: u32) -> WebhookSettings {
        WebhookSettings {
            enabled: true,
            url: url.map(String::from),
            secret: "s3cret".to_string(),
            sign_v0_also: true,
            max_attempts: attempts,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            backoff_horizon_ms: 900_000,
            cb_error_threshold: 8,
            cb_window: 30,
            cb_cooldown_sec: 60,
            dlq_path: dir
                .path()
                .join("dlq.jsonl")
                .to_string_lossy()
                .into_owned(),
            queue_max: 16,
            timeout: Duration::from_millis(100),
        }
    }

    fn service(
        dir: &tempfile::TempDir,
        url: Option<&str>,
        attempts: u32,
        statuses: Vec<Result<u16, String>>,
    ) -> (Arc<WebhookService>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport {
            statuses,
            calls: AtomicU32::new(0),
        });
        let svc =
            WebhookService::with_transport(settings(dir, url, attempts), transport.clone());
        (svc, transport)
    }

    #[test]
    fn test_signature_v1_includes_timestamp() {
        let a = sign_v1("k", 1_700_000_000, b"{}");
        let b = sign_v1("k", 1_700_000_001, b"{}");
        assert_ne!(a, b);
        assert!(a.starts_with("sha256="));
    }

    #[test]
    fn test_signature_v0_is_body_only() {
        assert_eq!(sign_v0("k", b"{}"), sign_v0("k", b"{}"));
        assert_ne!(sign_v0("k", b"{}"), sign_v0("k", b"[]"));
    }

    #[test]
    fn test_backoff_bounds() {
        for attempt in 0..8 {
            let d = backoff_with_jitter_ms(250, attempt, 10_000);
            // factor in [0.5, 1.5] over min(250 * 2^n, 10_000)
            assert!(d <= 15_000);
        }
    }

    #[tokio::test]
    async fn test_2xx_is_processed() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, transport) =
            service(&dir, Some("https://h.example.com/x"), 3, vec![Ok(200)]);
        let out = svc.deliver(serde_json::json!({"a": 1})).await;
        assert_eq!(out, DeliveryOutcome::Processed);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(svc.dlq.count(), 0);
    }

    #[tokio::test]
    async fn test_4xx_aborts_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, transport) =
            service(&dir, Some("https://h.example.com/x"), 5, vec![Ok(404)]);
        let out = svc.deliver(serde_json::json!({"a": 1})).await;
        assert_eq!(out, DeliveryOutcome::Aborted);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_5xx_retries_then_dlq() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, transport) = service(
            &dir,
            Some("https://h.example.com/x"),
            3,
            vec![Ok(500), Ok(502), Ok(503)],
        );
        let out = svc.deliver(serde_json::json!({"a": 1})).await;
        assert_eq!(out, DeliveryOutcome::Failed);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(svc.dlq.count(), 1);
    }

    #[tokio::test]
    async fn test_429_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, transport) = service(
            &dir,
            Some("https://h.example.com/x"),
            3,
            vec![Ok(429), Ok(200)],
        );
        let out = svc.deliver(serde_json::json!({"a": 1})).await;
        assert_eq!(out, DeliveryOutcome::Processed);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_http_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://h.example.com/x";
        let (svc, transport) = service(&dir, Some(url), 3, vec![Ok(200)]);
        // Force the breaker open.
        for _ in 0..8 {
            svc.breakers.on_failure(url);
        }
        let out = svc.deliver(serde_json::json!({"a": 1})).await;
        assert_eq!(out, DeliveryOutcome::DlqCircuitOpen);
        // No HTTP connection was opened.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        let stats = svc.dlq.stats();
        assert_eq!(stats.last_error.as_deref(), Some("cb_open"));
    }

    #[tokio::test]
    async fn test_network_error_retries() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, transport) = service(
            &dir,
            Some("https://h.example.com/x"),
            2,
            vec![Err("connection refused".to_string()), Ok(204)],
        );
        let out = svc.deliver(serde_json::json!({"a": 1})).await;
        assert_eq!(out, DeliveryOutcome::Processed);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_url_sinks_event() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, transport) = service(&dir, None, 3, vec![Ok(200)]);
        let out = svc.deliver(serde_json::json!({"a": 1})).await;
        assert_eq!(out, DeliveryOutcome::Processed);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_dlq_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, _) = service(&dir, Some("https://h.example.com/x"), 1, vec![Ok(500)]);
        svc.dlq.push("exhausted", serde_json::json!({"replay": true}));
        let requeued = svc.retry_dlq();
        assert_eq!(requeued, 1);
        assert_eq!(svc.dlq.count(), 0);
    }
}
