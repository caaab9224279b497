//! Guardrail mode header: every response surfaces the current arm mode
//! unless a stage already set a more specific one.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};

use crate::state::AppState;

pub async fn guardrail_mode(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mode = state.arm.evaluate_mode();
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if !headers.contains_key("x-guardrail-mode") {
        headers.insert(
            HeaderName::from_static("x-guardrail-mode"),
            HeaderValue::from_static(mode.as_str()),
        );
    }
    response
}
