//! Per-API-key quota middleware: fixed UTC day/month windows, X-Quota-*
//! headers on every response, 429 with `quota_exhausted` when exceeded.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use crate::quota::QuotaDecision;
use crate::state::AppState;

use super::api_key;

fn attach_quota_headers(response: &mut Response, state: &AppState, decision: &QuotaDecision) {
    let (per_day, per_month) = state.quota.limits();
    let headers = response.headers_mut();
    let set = |headers: &mut axum::http::HeaderMap, name: &'static str, value: String| {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };
    set(headers, "x-quota-limit-day", per_day.to_string());
    set(headers, "x-quota-limit-month", per_month.to_string());
    set(
        headers,
        "x-quota-remaining-day",
        decision.day_remaining.to_string(),
    );
    set(
        headers,
        "x-quota-remaining-month",
        decision.month_remaining.to_string(),
    );
    set(
        headers,
        "x-quota-reset",
        decision.retry_after_s.max(1).to_string(),
    );
}

pub async fn quota_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.settings.quota.enabled {
        return next.run(request).await;
    }

    let key = api_key(request.headers());
    let decision = state.quota.check_and_inc(&key);

    if !decision.allowed {
        let body = serde_json::json!({
            "code": "quota_exhausted",
            "detail": format!("{} quota exceeded", decision.reason),
            "retry_after_seconds": decision.retry_after_s,
            "trace_id": Uuid::new_v4().simple().to_string(),
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        if let Ok(v) = HeaderValue::from_str(&decision.retry_after_s.to_string()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("retry-after"), v);
        }
        attach_quota_headers(&mut response, &state, &decision);
        return response;
    }

    let mut response = next.run(request).await;
    attach_quota_headers(&mut response, &state, &decision);
    response
}
