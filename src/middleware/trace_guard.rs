//! Trace guard: validates `traceparent`, normalizes `X-Request-ID`, and
//! rewrites scope headers so downstream only ever sees sanitized values.

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use lazy_static::lazy_static;
use rand::RngCore;
use regex::Regex;

use crate::observability::metrics::trace_guard_violation_report;
use crate::state::RequestContext;

lazy_static! {
    // W3C traceparent: version-traceid-spanid-flags, lower-hex.
    static ref RE_TRACEPARENT: Regex = Regex::new(
        r"^[ \t]*[0-9a-f]{2}-[0-9a-f]{32}-[0-9a-f]{16}-[0-9a-f]{2}[ \t]*$"
    )
    .expect("static regex");
    // 16..64 hex chars covers the common proxy formats.
    static ref RE_REQ_ID: Regex = Regex::new(r"^(?i)[a-f0-9]{16,64}$").expect("static regex");
}

fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub async fn trace_guard(mut request: Request<Body>, next: Next) -> Response {
    let tp_in = request
        .headers()
        .get("traceparent")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let tp_valid = tp_in
        .as_deref()
        .map(|v| RE_TRACEPARENT.is_match(v))
        .unwrap_or(false);
    if tp_in.is_some() && !tp_valid {
        trace_guard_violation_report("traceparent_invalid");
    }
    let traceparent = if tp_valid {
        tp_in.map(|v| v.trim().to_string())
    } else {
        None
    };

    let rid_in = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let request_id = match &rid_in {
        Some(rid) if RE_REQ_ID.is_match(rid) => rid.to_lowercase(),
        Some(_) => {
            trace_guard_violation_report("request_id_invalid");
            new_request_id()
        }
        None => {
            trace_guard_violation_report("request_id_new");
            new_request_id()
        }
    };

    // Rewrite inbound headers: canonical request id, no invalid traceparent.
    let headers = request.headers_mut();
    headers.remove("traceparent");
    if let Some(tp) = &traceparent {
        if let Ok(value) = HeaderValue::from_str(tp) {
            headers.insert(HeaderName::from_static("traceparent"), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }

    let ctx = RequestContext {
        request_id: request_id.clone(),
        traceparent: traceparent.clone(),
    };
    request.extensions_mut().insert(ctx);

    let mut response = next.run(request).await;

    // Echo sanitized values; never leak an invalid traceparent on egress.
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
    headers.remove("traceparent");
    if let Some(tp) = traceparent {
        if let Ok(value) = HeaderValue::from_str(&tp) {
            headers.insert(HeaderName::from_static("traceparent"), value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceparent_pattern() {
        assert!(RE_TRACEPARENT
            .is_match("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"));
        assert!(RE_TRACEPARENT
            .is_match("  00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01  "));
        assert!(!RE_TRACEPARENT.is_match("00-XYZ-b7ad6b7169203331-01"));
        assert!(!RE_TRACEPARENT
            .is_match("00-0AF7651916CD43DD8448EB211C80319C-B7AD6B7169203331-01"));
    }

    #[test]
    fn test_request_id_pattern() {
        assert!(RE_REQ_ID.is_match("0123456789abcdef"));
        assert!(RE_REQ_ID.is_match(&"a".repeat(64)));
        assert!(!RE_REQ_ID.is_match("short"));
        assert!(!RE_REQ_ID.is_match(&"a".repeat(65)));
        assert!(!RE_REQ_ID.is_match("gggggggggggggggg"));
    }

    #[test]
    fn test_new_request_id_is_128_bit_hex() {
        let rid = new_request_id();
        assert_eq!(rid.len(), 32);
        assert!(RE_REQ_ID.is_match(&rid));
    }
}
