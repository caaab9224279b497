//! Inbound header count and value-size limits (431 on breach).

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::observability::metrics::header_limit_blocked;
use crate::state::AppState;

use super::tenant_bot;

fn reject(reason: &'static str, detail: &'static str) -> Response {
    let mut response = (StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, detail).into_response();
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-guardrail-header-limit-blocked"),
        HeaderValue::from_static(reason),
    );
    headers.insert(
        HeaderName::from_static("connection"),
        HeaderValue::from_static("close"),
    );
    response
}

pub async fn header_limits(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let cfg = &state.settings.ingress;
    if !cfg.header_limits_enabled {
        return next.run(request).await;
    }

    let headers = request.headers();
    let (tenant, bot) = tenant_bot(headers);

    if cfg.max_header_count > 0 {
        let count = headers.iter().count();
        if count > cfg.max_header_count {
            header_limit_blocked(&tenant, &bot, "count");
            return reject("count", "Request header limit exceeded: too many headers");
        }
    }

    if cfg.max_header_value_bytes > 0 {
        for (_, value) in headers.iter() {
            if value.as_bytes().len() > cfg.max_header_value_bytes {
                header_limit_blocked(&tenant, &bot, "value_len");
                return reject(
                    "value_len",
                    "Request header limit exceeded: header value too large",
                );
            }
        }
    }

    next.run(request).await
}
