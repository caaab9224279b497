//! Admin diagnostics: decisions feed (list + SSE), idempotency
//! inspection, quota management, policy validation and bindings, webhook
//! DLQ operations, verifier router snapshots, and arm overrides.
//!
//! Every route requires `X-Admin-Key` matching `ADMIN_UI_TOKEN`.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;

use crate::bus::DecisionFilter;
use crate::idempotency::mask_key;
use crate::models::ApiError;
use crate::quota::ResetWhich;
use crate::runtime::ArmProbeState;
use crate::state::AppState;

/// Append one config-audit record (`{ts, actor, patch, before, after}`)
/// to the append-only NDJSON log. Best-effort.
fn record_config_audit(state: &AppState, patch: Value, before: Value, after: Value) {
    let record = json!({
        "ts": chrono::Utc::now().timestamp(),
        "actor": "admin",
        "patch": patch,
        "before": before,
        "after": after,
    });
    let path = std::path::Path::new(&state.settings.config_audit_path);
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let appended = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| {
            use std::io::Write;
            writeln!(f, "{record}")
        });
    if let Err(e) = appended {
        tracing::debug!(error = %e, "config audit append failed");
    }
}

/// Admin auth middleware: compares `X-Admin-Key` against the configured
/// token. No token configured means the admin surface is disabled.
pub async fn admin_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.settings.admin_token.clone() else {
        return ApiError::Forbidden.into_response();
    };
    let provided = request
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() || provided != expected {
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

/// GET /admin/decisions
pub async fn decisions(
    State(state): State<AppState>,
    Query(filter): Query<DecisionFilter>,
) -> Json<Value> {
    let events = state.bus.query(&filter);
    Json(json!({
        "count": events.len(),
        "decisions": events,
    }))
}

/// GET /admin/decisions/stream: SSE: historical slice as `init` events,
/// then live events, with periodic keep-alives.
pub async fn decisions_stream(
    State(state): State<AppState>,
    Query(filter): Query<DecisionFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let history = state.bus.query(&filter);
    let init = stream::iter(history.into_iter().map(|evt| {
        Ok(Event::default()
            .event("init")
            .data(serde_json::to_string(&evt).unwrap_or_default()))
    }));

    let live = BroadcastStream::new(state.bus.subscribe()).filter_map(move |item| {
        let filter = filter.clone();
        async move {
            match item {
                // Live events pass the same filter as the historical slice.
                Ok(evt) if filter.matches(&evt) => Some(Ok(Event::default()
                    .data(serde_json::to_string(&evt).unwrap_or_default()))),
                Ok(_) => None,
                // Lagged receiver: drop silently, never reorder.
                Err(_) => None,
            }
        }
    });

    Sse::new(init.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(state.settings.bus.keepalive)
            .text("keep-alive"),
    )
}

/// GET /admin/idempotency/recent
pub async fn idem_recent(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let recent = state
        .idem
        .list_recent(50)
        .await
        .map_err(|_| ApiError::StoreUnavailable)?;
    let items: Vec<Value> = recent
        .into_iter()
        .map(|(key, ts)| json!({ "key_masked": mask_key(&key), "key": key, "ts": ts }))
        .collect();
    Ok(Json(json!({ "recent": items })))
}

/// GET /admin/idempotency/:key
pub async fn idem_inspect(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let meta = state
        .idem
        .meta(&key)
        .await
        .map_err(|_| ApiError::StoreUnavailable)?;
    let stored = state
        .idem
        .get(&key)
        .await
        .map_err(|_| ApiError::StoreUnavailable)?;
    Ok(Json(json!({
        "key_masked": mask_key(&key),
        "meta": meta,
        "stored": stored.map(|s| json!({
            "status": s.status,
            "stored_at": s.stored_at,
            "replay_count": s.replay_count,
            "body_sha256": s.body_sha256,
            "content_type": s.content_type,
        })),
    })))
}

/// DELETE /admin/idempotency/:key
pub async fn idem_purge(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let existed = state
        .idem
        .purge(&key)
        .await
        .map_err(|_| ApiError::StoreUnavailable)?;
    if !existed {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "purged": true })))
}

/// GET /admin/quota/:key
pub async fn quota_peek(State(state): State<AppState>, Path(key): Path<String>) -> Json<Value> {
    Json(serde_json::to_value(state.quota.peek(&key)).unwrap_or(Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct QuotaResetBody {
    #[serde(default)]
    pub which: Option<String>,
}

/// POST /admin/quota/:key/reset
pub async fn quota_reset(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<QuotaResetBody>,
) -> Result<Json<Value>, ApiError> {
    let which = match body.which.as_deref().unwrap_or("both") {
        "day" => ResetWhich::Day,
        "month" => ResetWhich::Month,
        "both" => ResetWhich::Both,
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown reset target '{other}'"
            )))
        }
    };
    state.quota.reset_key(&key, which);
    Ok(Json(json!({ "reset": true })))
}

#[derive(Debug, Deserialize)]
pub struct ValidateBody {
    pub yaml: String,
}

/// POST /admin/policy/validate
pub async fn policy_validate(
    State(state): State<AppState>,
    Json(body): Json<ValidateBody>,
) -> Json<Value> {
    let validation = state.policy.validate_text(&body.yaml);
    Json(serde_json::to_value(validation).unwrap_or(Value::Null))
}

/// GET /admin/policy/packs
pub async fn policy_packs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "packs": state.policy.pack_names(),
        "bindings": state.policy.bindings(),
        "default_version": state.policy.default_policy().version,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BindBody {
    pub tenant: String,
    pub bot: String,
    pub packs: Vec<String>,
}

/// POST /admin/policy/bind
pub async fn policy_bind(
    State(state): State<AppState>,
    Json(body): Json<BindBody>,
) -> Result<Json<Value>, ApiError> {
    let before = json!({ "bindings": state.policy.bindings() });
    match state.policy.bind(&body.tenant, &body.bot, &body.packs) {
        Ok(version) => {
            record_config_audit(
                &state,
                json!({ "op": "bind", "tenant": body.tenant, "bot": body.bot, "packs": body.packs }),
                before,
                json!({ "bindings": state.policy.bindings() }),
            );
            Ok(Json(json!({ "bound": true, "policy_version": version })))
        }
        Err(validation) => Err(ApiError::ValidationFailed(
            serde_json::to_string(&validation.issues).unwrap_or_default(),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct UnbindBody {
    pub tenant: String,
    pub bot: String,
}

/// POST /admin/policy/unbind
pub async fn policy_unbind(
    State(state): State<AppState>,
    Json(body): Json<UnbindBody>,
) -> Result<Json<Value>, ApiError> {
    let before = json!({ "bindings": state.policy.bindings() });
    if state.policy.unbind(&body.tenant, &body.bot) {
        record_config_audit(
            &state,
            json!({ "op": "unbind", "tenant": body.tenant, "bot": body.bot }),
            before,
            json!({ "bindings": state.policy.bindings() }),
        );
        Ok(Json(json!({ "unbound": true })))
    } else {
        Err(ApiError::NotFound)
    }
}

#[derive(Debug, Deserialize)]
pub struct ReloadBody {
    pub packs: Vec<String>,
}

/// POST /admin/policy/reload
pub async fn policy_reload(
    State(state): State<AppState>,
    Json(body): Json<ReloadBody>,
) -> Result<Json<Value>, ApiError> {
    let before = json!({ "policy_version": state.policy.default_policy().version });
    match state.policy.reload_default(&body.packs) {
        Ok(version) => {
            record_config_audit(
                &state,
                json!({ "op": "reload", "packs": body.packs }),
                before,
                json!({ "policy_version": version }),
            );
            Ok(Json(json!({ "reloaded": true, "policy_version": version })))
        }
        Err(validation) => Err(ApiError::ValidationFailed(
            serde_json::to_string(&validation.issues).unwrap_or_default(),
        )),
    }
}

/// GET /admin/webhooks/dlq
pub async fn webhook_dlq_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "stats": state.webhooks.dlq.stats(),
        "delivery": state.webhooks.stats(),
    }))
}

/// POST /admin/webhooks/dlq/retry
pub async fn webhook_dlq_retry(State(state): State<AppState>) -> Json<Value> {
    let requeued = state.webhooks.retry_dlq();
    Json(json!({ "requeued": requeued }))
}

/// POST /admin/webhooks/dlq/purge
pub async fn webhook_dlq_purge(State(state): State<AppState>) -> Json<Value> {
    let purged = state.webhooks.dlq.purge_all();
    Json(json!({ "purged": purged }))
}

/// GET /admin/verifier/router
pub async fn verifier_router(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "snapshots": state.verifier.router_snapshots(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ArmForceBody {
    pub state: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /admin/arm/force
pub async fn arm_force(
    State(state): State<AppState>,
    Json(body): Json<ArmForceBody>,
) -> Result<Json<Value>, ApiError> {
    let probe = match body.state.as_str() {
        "up" => ArmProbeState::Up,
        "degraded" => ArmProbeState::Degraded,
        "down" => ArmProbeState::Down,
        other => return Err(ApiError::BadRequest(format!("invalid state '{other}'"))),
    };
    state.arm.force_ingress(Some(probe), body.reason.as_deref());
    Ok(Json(
        serde_json::to_value(state.arm.snapshot()).unwrap_or(Value::Null),
    ))
}

/// POST /admin/arm/clear
pub async fn arm_clear(State(state): State<AppState>) -> Json<Value> {
    state.arm.force_ingress(None, None);
    Json(serde_json::to_value(state.arm.snapshot()).unwrap_or(Value::Null))
}

/// GET /admin/overview: one-page operational snapshot.
pub async fn overview(State(state): State<AppState>, _headers: HeaderMap) -> Json<Value> {
    Json(json!({
        "env": state.settings.app_env.as_str(),
        "policy_version": state.policy.default_policy().version,
        "bindings": state.policy.bindings().len(),
        "arm": state.arm.snapshot(),
        "webhooks": state.webhooks.stats(),
        "dlq": state.webhooks.dlq.stats(),
        "bus_subscribers": state.bus.subscriber_count(),
    }))
}

/// Catch-all for unknown admin paths.
pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "code": "not_found" }))).into_response()
}
