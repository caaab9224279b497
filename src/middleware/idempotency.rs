//! Idempotency middleware: single-flight leader election, response
//! caching, follower replay, and conflict detection.
//!
//! The leader lock is held behind an RAII guard, so a panic or early
//! return on the downstream path still releases it. Streaming and
//! oversize responses are never cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use http_body::Body as _;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::IdempotencyMode;
use crate::idempotency::{mask_key, payload_fingerprint, IdemStore, StoredResponse};
use crate::observability::metrics as obs;
use crate::state::{AppState, RequestContext};

use super::tenant_bot;

lazy_static! {
    static ref KEY_RE: Regex = Regex::new(r"^[A-Za-z0-9._\-:/]{1,200}$").expect("static regex");
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

fn tag_response(response: &mut Response, key: &str, status_tag: &str, replayed: bool) {
    let headers = response.headers_mut();
    set_header(headers, "idempotency-key", key);
    set_header(headers, "x-idempotency-status", status_tag);
    set_header(
        headers,
        "idempotency-replayed",
        if replayed { "true" } else { "false" },
    );
}

fn invalid_key_response(key: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "code": "bad_request",
        "detail": "invalid idempotency key",
        "request_id": request_id,
    });
    let mut response = (StatusCode::BAD_REQUEST, Json(body)).into_response();
    tag_response(&mut response, key, "invalid", false);
    response
}

fn conflict_response(key: &str, retry_after_s: u64, tag: &'static str) -> Response {
    let mut response =
        (StatusCode::CONFLICT, "Idempotency conflict: request in flight or body mismatch")
            .into_response();
    tag_response(&mut response, key, tag, false);
    set_header(
        response.headers_mut(),
        "retry-after",
        &retry_after_s.to_string(),
    );
    response
}

fn replay_response(stored: &StoredResponse, key: &str, replay_count: u64) -> Response {
    let mut builder = Response::builder().status(stored.status);
    for (name, value) in &stored.headers {
        // Replay headers are recomputed below.
        if name == "idempotency-key"
            || name == "idempotency-replayed"
            || name == "idempotency-replay-count"
            || name == "x-idempotency-status"
            || name == "content-length"
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(ctype) = &stored.content_type {
        if !stored.headers.contains_key("content-type") {
            builder = builder.header("content-type", ctype.as_str());
        }
    }
    let mut response = builder
        .body(Body::from(stored.body.clone()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    tag_response(&mut response, key, "replayed", true);
    set_header(
        response.headers_mut(),
        "idempotency-replay-count",
        &replay_count.to_string(),
    );
    response
}

/// Releases the leader lock on drop unless disarmed. Covers the panic
/// and early-return paths of the downstream call.
struct LeaderGuard {
    store: Arc<dyn IdemStore>,
    key: String,
    owner: String,
    armed: bool,
}

impl LeaderGuard {
    fn new(store: Arc<dyn IdemStore>, key: &str, owner: String) -> Self {
        Self {
            store,
            key: key.to_string(),
            owner,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        let _ = self.store.release(&self.key, Some(&self.owner)).await;
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.release(&key, Some(&owner)).await;
            });
        }
    }
}

fn reinject(parts: axum::http::request::Parts, bytes: Bytes) -> Request<Body> {
    Request::from_parts(parts, Body::from(bytes))
}

pub async fn idempotency_layer(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let cfg = state.settings.idempotency.clone();
    if !cfg.enabled {
        return next.run(request).await;
    }
    let method = request.method().as_str().to_uppercase();
    if !cfg.methods.contains(&method) {
        return next.run(request).await;
    }
    let Some(key) = request
        .headers()
        .get("idempotency-key")
        .or_else(|| request.headers().get("x-idempotency-key"))
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return next.run(request).await;
    };

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|c| c.request_id.clone())
        .unwrap_or_default();

    if !KEY_RE.is_match(&key) {
        return invalid_key_response(&key, &request_id);
    }

    let (tenant, bot) = tenant_bot(request.headers());
    obs::idempotency_seen(&tenant, &bot, &method);

    let path = request.uri().path().to_string();
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return crate::models::ApiError::BadRequest("unreadable body".to_string())
                .into_response()
        }
    };

    if cfg.body_max_bytes > 0 && bytes.len() > cfg.body_max_bytes {
        obs::idempotency_skipped(&tenant, &bot, "size");
        let mut response = next.run(reinject(parts, bytes)).await;
        tag_response(&mut response, &key, "skipped:size", false);
        return response;
    }

    let fingerprint = payload_fingerprint(&method, &path, &tenant, &bot, &bytes);
    let masked = mask_key(&key);

    // Observe mode: account and tag, never replay or conflict.
    if cfg.mode == IdempotencyMode::Observe {
        let mut response = next.run(reinject(parts, bytes)).await;
        tag_response(&mut response, &key, "observed", false);
        return response;
    }

    // Fast path: a stored value already exists.
    match state.idem.get(&key).await {
        Ok(Some(stored)) => {
            let stored_fp = state
                .idem
                .meta(&key)
                .await
                .ok()
                .and_then(|m| m.payload_fingerprint);
            if stored_fp.as_deref() == Some(fingerprint.as_str()) {
                let touch = cfg.touch_on_replay.then_some(cfg.value_ttl_s);
                let count = match state.idem.bump_replay(&key, touch).await {
                    Ok(Some(count)) => count,
                    _ => stored.replay_count + 1,
                };
                if touch.is_some() {
                    obs::idempotency_touch();
                }
                obs::idempotency_replayed(&tenant, &bot, count);
                debug!(tenant = %tenant, key = %masked, count, "idempotent replay");
                return replay_response(&stored, &key, count);
            }
            // Fingerprint mismatch after stored: fresh run overwrites.
            debug!(tenant = %tenant, key = %masked, "fingerprint mismatch; fresh execution");
        }
        Ok(None) => {}
        Err(e) => {
            warn!(tenant = %tenant, key = %masked, error = %e, "idempotency store error");
            if cfg.strict_fail_closed {
                return crate::models::ApiError::StoreUnavailable.into_response();
            }
            let mut response = next.run(reinject(parts, bytes)).await;
            tag_response(&mut response, &key, "bypass", false);
            return response;
        }
    }

    // Leader election.
    let acquired = match state
        .idem
        .acquire_leader(&key, cfg.lock_ttl_s, &fingerprint)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(tenant = %tenant, key = %masked, error = %e, "leader acquire failed");
            if cfg.strict_fail_closed {
                return crate::models::ApiError::StoreUnavailable.into_response();
            }
            let mut response = next.run(reinject(parts, bytes)).await;
            tag_response(&mut response, &key, "bypass", false);
            return response;
        }
    };

    if acquired.acquired {
        let owner = acquired.owner.unwrap_or_default();
        return run_as_leader(
            state, cfg, parts, bytes, key, fingerprint, tenant, bot, owner, next,
        )
        .await;
    }

    // Follower: someone else holds the lock.
    if let Ok(meta) = state.idem.meta(&key).await {
        if meta.lock && meta.payload_fingerprint.as_deref() != Some(fingerprint.as_str()) {
            obs::idempotency_conflict(&tenant, &bot, "fingerprint_mismatch");
            return conflict_response(&key, cfg.in_progress_retry_after_s, "conflict");
        }
    }

    // Same fingerprint: poll for the leader's stored value.
    let budget = Duration::from_millis(cfg.wait_budget_ms);
    let started = Instant::now();
    let mut delay = Duration::from_millis(20);
    while started.elapsed() < budget {
        obs::idempotency_backoff_step();
        let remaining = budget.saturating_sub(started.elapsed());
        tokio::time::sleep(delay.min(remaining)).await;
        let jitter = rand::thread_rng().gen_range(0..10);
        delay = (delay * 2).min(Duration::from_millis(250)) + Duration::from_millis(jitter);

        match state.idem.get(&key).await {
            Ok(Some(stored)) => {
                let touch = cfg.touch_on_replay.then_some(cfg.value_ttl_s);
                let count = match state.idem.bump_replay(&key, touch).await {
                    Ok(Some(count)) => count,
                    _ => stored.replay_count + 1,
                };
                obs::idempotency_replayed(&tenant, &bot, count);
                return replay_response(&stored, &key, count);
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }

    // Wait budget exhausted: try once more to become a fresh leader.
    match state
        .idem
        .acquire_leader(&key, cfg.lock_ttl_s, &fingerprint)
        .await
    {
        Ok(outcome) if outcome.acquired => {
            let owner = outcome.owner.unwrap_or_default();
            run_as_leader(
                state, cfg, parts, bytes, key, fingerprint, tenant, bot, owner, next,
            )
            .await
        }
        _ => {
            obs::idempotency_stuck_lock();
            if cfg.strict_fail_closed {
                obs::idempotency_conflict(&tenant, &bot, "in_progress");
                conflict_response(&key, cfg.in_progress_retry_after_s, "in_progress")
            } else {
                let mut response = next.run(reinject(parts, bytes)).await;
                tag_response(&mut response, &key, "bypass", false);
                response
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_as_leader(
    state: AppState,
    cfg: crate::config::IdempotencySettings,
    parts: axum::http::request::Parts,
    bytes: Bytes,
    key: String,
    fingerprint: String,
    tenant: String,
    bot: String,
    owner: String,
    next: Next,
) -> Response {
    let guard = LeaderGuard::new(state.idem.clone(), &key, owner);

    // Rebuild the request and run downstream. The guard releases the lock
    // if anything unwinds past us.
    let response = next.run(reinject(parts, bytes)).await;

    finalize_leader(state, cfg, response, key, fingerprint, tenant, bot, guard).await
}

#[allow(clippy::too_many_arguments)]
async fn finalize_leader(
    _state: AppState,
    cfg: crate::config::IdempotencySettings,
    response: Response,
    key: String,
    fingerprint: String,
    tenant: String,
    bot: String,
    guard: LeaderGuard,
) -> Response {
    // Streaming responses are never cached.
    let is_streaming = response.body().size_hint().exact().is_none()
        || response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|c| c.contains("text/event-stream"))
            .unwrap_or(false);

    if is_streaming {
        obs::idempotency_skipped(&tenant, &bot, "stream");
        guard.release().await;
        let mut response = response;
        tag_response(&mut response, &key, "skipped:stream", false);
        return response;
    }

    let (parts, body) = response.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => {
            guard.release().await;
            return crate::models::ApiError::Internal("response body read".to_string())
                .into_response();
        }
    };

    if cfg.body_max_bytes > 0 && body_bytes.len() > cfg.body_max_bytes {
        obs::idempotency_skipped(&tenant, &bot, "size");
        guard.release().await;
        let mut response = Response::from_parts(parts, Body::from(body_bytes));
        tag_response(&mut response, &key, "skipped:size", false);
        return response;
    }

    let mut header_map: HashMap<String, String> = HashMap::new();
    for (name, value) in parts.headers.iter() {
        if let Ok(v) = value.to_str() {
            header_map.insert(name.as_str().to_lowercase(), v.to_string());
        }
    }
    let content_type = header_map.get("content-type").cloned();
    let stored = StoredResponse::new(
        parts.status.as_u16(),
        header_map,
        body_bytes.to_vec(),
        content_type,
    );

    match guard
        .store
        .put(&key, stored, &fingerprint, cfg.value_ttl_s)
        .await
    {
        Ok(()) => guard.disarm(), // put cleared the lock atomically
        Err(e) => {
            warn!(key = %mask_key(&key), error = %e, "idempotency put failed");
            guard.release().await;
        }
    }

    let mut response = Response::from_parts(parts, Body::from(body_bytes));
    tag_response(&mut response, &key, "stored", false);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pattern() {
        assert!(KEY_RE.is_match("order-123.retry:2/a_b"));
        assert!(KEY_RE.is_match(&"k".repeat(200)));
        assert!(!KEY_RE.is_match(""));
        assert!(!KEY_RE.is_match(&"k".repeat(201)));
        assert!(!KEY_RE.is_match("has space"));
        assert!(!KEY_RE.is_match("emoji\u{1F600}"));
    }

    #[test]
    fn test_replay_response_shape() {
        let stored = StoredResponse::new(
            201,
            HashMap::from([
                ("content-type".to_string(), "application/json".to_string()),
                ("x-custom".to_string(), "kept".to_string()),
            ]),
            b"{\"ok\":true}".to_vec(),
            Some("application/json".to_string()),
        );
        let response = replay_response(&stored, "k1", 3);
        assert_eq!(response.status(), StatusCode::CREATED);
        let headers = response.headers();
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        assert_eq!(headers.get("idempotency-replayed").unwrap(), "true");
        assert_eq!(headers.get("idempotency-replay-count").unwrap(), "3");
        assert_eq!(headers.get("x-idempotency-status").unwrap(), "replayed");
    }

    #[test]
    fn test_conflict_response_headers() {
        let response = conflict_response("k1", 2, "conflict");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get("x-idempotency-status").unwrap(),
            "conflict"
        );
        assert_eq!(response.headers().get("retry-after").unwrap(), "2");
    }
}
