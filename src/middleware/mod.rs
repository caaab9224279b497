//! Ingress middleware chain.
//!
//! Stage order (outermost first): logging, path guard, trace guard,
//! duplicate-header guard, header limits, unicode sanitizer, quota,
//! mode header, idempotency. Each stage may short-circuit with a
//! terminal response.

pub mod duplicate_header;
pub mod header_limits;
pub mod idempotency;
pub mod logging;
pub mod mode;
pub mod path_guard;
pub mod quota;
pub mod trace_guard;
pub mod unicode_guard;

use axum::http::HeaderMap;

/// Tenant/bot identity headers; the short forms are accepted as aliases.
pub fn tenant_bot(headers: &HeaderMap) -> (String, String) {
    let get = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| headers.get(*n))
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    (
        get(&["x-guardrail-tenant", "x-tenant-id"]),
        get(&["x-guardrail-bot", "x-bot-id"]),
    )
}

/// Session identity with an ip/user-agent fallback when the session
/// header is absent.
pub fn session_id(headers: &HeaderMap) -> String {
    if let Some(sess) = headers
        .get("x-guardrail-session")
        .and_then(|v| v.to_str().ok())
    {
        if !sess.is_empty() {
            return sess.to_string();
        }
    }
    let ua = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let ua_prefix: String = ua.chars().take(64).collect();
    format!("anon:{ua_prefix}")
}

/// API key from `X-API-Key` or a bearer token; "anon" otherwise.
pub fn api_key(headers: &HeaderMap) -> String {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.trim().is_empty() {
            return key.trim().to_string();
        }
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let mut parts = auth.split_whitespace();
        if let (Some(scheme), Some(token)) = (parts.next(), parts.next()) {
            if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
                return token.to_string();
            }
        }
    }
    "anon".to_string()
}
