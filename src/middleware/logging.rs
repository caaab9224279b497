//! Request logging for the guardrail pipeline.
//!
//! Each log line carries the tenant/bot identity and the terminal
//! guardrail decision and mode read back off the response, so operators
//! can follow a tenant's traffic without joining against the decision
//! bus. Health probes are skipped to reduce noise.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

use crate::observability::metrics::observe_request_latency;

use super::tenant_bot;

fn response_header<'a>(response: &'a Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if matches!(path.as_str(), "/health" | "/readyz" | "/metrics") {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let (tenant, bot) = tenant_bot(request.headers());

    let start = Instant::now();
    let response = next.run(request).await;
    let latency = start.elapsed();
    let status = response.status().as_u16();

    observe_request_latency("all", latency);

    let decision = response_header(&response, "x-guardrail-decision");
    let mode = response_header(&response, "x-guardrail-mode");
    let incident = response_header(&response, "x-guardrail-incident-id");

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            tenant = %tenant,
            bot = %bot,
            latency_ms = latency.as_millis() as u64,
            "guardrail request failed"
        );
    } else if decision == "deny" || status == 429 {
        warn!(
            method = %method,
            path = %path,
            status,
            tenant = %tenant,
            bot = %bot,
            decision,
            mode,
            incident_id = incident,
            latency_ms = latency.as_millis() as u64,
            "guardrail request blocked"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            tenant = %tenant,
            bot = %bot,
            decision,
            mode,
            latency_ms = latency.as_millis() as u64,
            "guardrail request evaluated"
        );
    }

    response
}
