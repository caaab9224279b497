//! Duplicate-header guard: `off | log | block` on repeated occurrences of
//! headers that must be unique.

use std::collections::HashMap;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::GuardMode;
use crate::observability::metrics::{duplicate_header_blocked, duplicate_header_seen};
use crate::state::AppState;

use super::tenant_bot;

pub async fn duplicate_header_guard(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let cfg = &state.settings.ingress;
    let mode = cfg.duplicate_header_mode;
    if mode == GuardMode::Off {
        return next.run(request).await;
    }

    // HeaderMap::keys yields each name once; count actual occurrences.
    let mut counts: HashMap<String, usize> = request
        .headers()
        .keys()
        .map(|name| {
            let n = request.headers().get_all(name).iter().count();
            (name.as_str().to_lowercase(), n)
        })
        .collect();
    counts.retain(|_, n| *n > 1);

    if counts.is_empty() {
        return next.run(request).await;
    }

    let mut duplicates: Vec<String> = counts.into_keys().collect();
    duplicates.sort();

    let (tenant, bot) = tenant_bot(request.headers());
    for name in &duplicates {
        duplicate_header_seen(&tenant, &bot, mode.as_str(), name);
    }

    let blocked: Vec<String> = duplicates
        .iter()
        .filter(|name| cfg.duplicate_header_unique.contains(name.as_str()))
        .cloned()
        .collect();

    if mode == GuardMode::Block && !blocked.is_empty() {
        for name in &blocked {
            duplicate_header_blocked(&tenant, &bot, name);
        }
        let mut response = (
            StatusCode::BAD_REQUEST,
            "Bad Request: duplicate unique header",
        )
            .into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&blocked.join(",")) {
            headers.insert(
                HeaderName::from_static("x-guardrail-duplicate-header-blocked"),
                value,
            );
        }
        headers.insert(
            HeaderName::from_static("connection"),
            HeaderValue::from_static("close"),
        );
        return response;
    }

    let audit_value = duplicates.join(",");
    let mut response = next.run(request).await;
    if mode == GuardMode::Log {
        if let Ok(value) = HeaderValue::from_str(&audit_value) {
            response.headers_mut().insert(
                HeaderName::from_static("x-guardrail-duplicate-header-audit"),
                value,
            );
        }
    }
    response
}
