//! Unicode sanitizer: samples path + query + headers, computes NFKC
//! normalization and the confusable skeleton, and attaches ingress flags.
//! In block mode the configured flag set rejects the request.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::GuardMode;
use crate::ingress::unicode::{normalize, scan_flags, skeleton};
use crate::observability::metrics::unicode_ingress_report;
use crate::state::{AppState, UnicodeScan};

use super::tenant_bot;

fn sample_headers(request: &Request<Body>, cap_bytes: usize) -> String {
    if cap_bytes == 0 {
        return String::new();
    }
    let mut parts: Vec<String> = Vec::new();
    let mut used = 0usize;
    for (_, value) in request.headers() {
        if used >= cap_bytes {
            break;
        }
        let remaining = cap_bytes - used;
        let chunk = &value.as_bytes()[..value.as_bytes().len().min(remaining)];
        if chunk.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(chunk).into_owned();
        if !text.is_empty() {
            parts.push(text);
        }
        used += chunk.len();
    }
    parts.join(" ")
}

pub async fn unicode_guard(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let cfg = &state.settings.ingress;
    if cfg.unicode_mode == GuardMode::Off {
        return next.run(request).await;
    }

    let path_sample: String = request
        .uri()
        .path()
        .chars()
        .take(cfg.unicode_path_sample_chars)
        .collect();
    let query_sample: String = request
        .uri()
        .query()
        .map(|q| {
            let capped: String = q.chars().take(cfg.unicode_query_sample_bytes).collect();
            crate::ingress::decode::decode_string_once(&capped).0
        })
        .unwrap_or_default();
    let header_sample = sample_headers(&request, cfg.unicode_header_sample_bytes);

    let sample = [path_sample, query_sample, header_sample]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let normalized = normalize(&sample);
    let flags = scan_flags(&sample, &normalized);
    let flag_list: Vec<String> = flags.iter().cloned().collect();
    let flag_csv = flag_list.join(",");

    let blocked: Vec<String> = flag_list
        .iter()
        .filter(|f| cfg.unicode_blocked_flags.contains(f.as_str()))
        .cloned()
        .collect();
    let is_block = cfg.unicode_mode == GuardMode::Block && !blocked.is_empty();

    let (tenant, bot) = tenant_bot(request.headers());
    unicode_ingress_report(&tenant, &bot, &flag_list, is_block);

    if is_block {
        let mut response = (StatusCode::BAD_REQUEST, "Bad Request: unicode policy").into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&blocked.join(",")) {
            headers.insert(HeaderName::from_static("x-guardrail-unicode-blocked"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&flag_csv) {
            headers.insert(HeaderName::from_static("x-guardrail-ingress-flags"), value);
        }
        return response;
    }

    request.extensions_mut().insert(UnicodeScan {
        flags: flag_list,
        skeleton: skeleton(&sample),
        normalized,
    });

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&flag_csv) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-guardrail-ingress-flags"), value);
    }
    response
}
