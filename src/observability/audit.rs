//! Best-effort audit event forwarding.
//!
//! Events are POSTed to an external collector with a bearer token, a
//! gzip-compressed JSON body, and an HMAC signature over `ts.body`.
//! Forwarding failures are swallowed at debug level; the request path
//! never observes them.

use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use crate::config::AuditSettings;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AuditForwarder {
    settings: Arc<AuditSettings>,
    client: reqwest::Client,
}

impl AuditForwarder {
    pub fn new(settings: AuditSettings, client: reqwest::Client) -> Self {
        Self {
            settings: Arc::new(settings),
            client,
        }
    }

    fn configured(&self) -> Option<(&str, &str)> {
        if !self.settings.enabled {
            return None;
        }
        match (&self.settings.url, &self.settings.api_key) {
            (Some(url), Some(key)) => Some((url.as_str(), key.as_str())),
            _ => None,
        }
    }

    /// Fire-and-forget emission. Spawns a detached task so the caller is
    /// never blocked on collector latency.
    pub fn emit(&self, event: &str, mut payload: Value) {
        let Some((url, _)) = self.configured() else {
            return;
        };
        if let Value::Object(map) = &mut payload {
            map.insert("event".to_string(), Value::String(event.to_string()));
        }
        let url = url.to_string();
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.post(&url, &payload).await {
                debug!(error = %e, "audit forward failed");
            }
        });
    }

    async fn post(&self, url: &str, payload: &Value) -> anyhow::Result<()> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .unwrap_or_default()
            .to_string();
        let body = serde_json::to_vec(payload)?;
        let ts = chrono::Utc::now().timestamp().to_string();

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&body)?;
        let compressed = gz.finish()?;

        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
            .header("Authorization", format!("Bearer {api_key}"))
            .header("X-Audit-Timestamp", &ts);

        if let Some(secret) = &self.settings.hmac_secret {
            req = req.header("X-Audit-Signature", sign_ts_body(secret, &ts, &body));
        }

        req.body(compressed).send().await?.error_for_status()?;
        Ok(())
    }
}

/// `sha256=hex(HMAC(secret, "<ts>." + body))`
pub fn sign_ts_body(secret: &str, ts: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
