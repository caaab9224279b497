//! Path guard: rejects traversal and homoglyph-slash tricks at ingress.
//!
//! Never rewrites the path; either passes through or returns 400. Checks
//! run on the raw path, after one decode, and after a second decode to
//! catch double-encoding (`%252e%252e` -> `%2e%2e` -> `..`).

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use regex::Regex;

use crate::observability::metrics::ingress_path_violation_report;

// Characters easily confused with "/" or "\": U+2215 DIVISION SLASH,
// U+2044 FRACTION SLASH, U+2216 SET MINUS, plus literal backslash.
const SLASH_HOMOGLYPHS: &[char] = &['\u{2215}', '\u{2044}', '\u{2216}', '\\'];

lazy_static! {
    static ref SUSPICIOUS_RAW: Regex =
        Regex::new(r"(?i)(%2e){2}|%2f|%5c|%u2215|%u2044|%u2216").expect("static regex");
    static ref SEP_RUN: Regex = Regex::new(r"[\\/]+").expect("static regex");
}

fn decode_once(p: &str) -> String {
    let bytes = p.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let pair = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            );
            if let (Some(h), Some(l)) = pair {
                out.push(((h << 4) | l) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn contains_homoglyph_slash(p: &str) -> bool {
    p.chars().any(|c| SLASH_HOMOGLYPHS.contains(&c))
}

fn looks_traversal(decoded: &str) -> bool {
    let norm = SEP_RUN.replace_all(decoded, "/");
    if norm.contains("/../") || norm.starts_with("../") || norm.ends_with("/..") {
        return true;
    }
    norm.split('/').any(|seg| seg.trim() == "..")
}

pub async fn path_guard(request: Request<Body>, next: Next) -> Response {
    let raw_path = request.uri().path().to_string();

    let mut reason: Option<&'static str> = None;

    if SUSPICIOUS_RAW.is_match(&raw_path) {
        reason = Some("raw-encodings");
    }

    let once = decode_once(&raw_path);
    let twice = decode_once(&once);

    if reason.is_none() && (looks_traversal(&once) || looks_traversal(&twice)) {
        reason = Some("traversal");
    }
    if reason.is_none() && (contains_homoglyph_slash(&raw_path) || contains_homoglyph_slash(&once))
    {
        reason = Some("homoglyph-slash");
    }

    if let Some(reason) = reason {
        ingress_path_violation_report(reason);
        return (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"error":"bad_request","detail":"invalid path"}"#,
        )
            .into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_once() {
        assert_eq!(decode_once("%2e%2e%2f"), "../");
        assert_eq!(decode_once("/plain"), "/plain");
        assert_eq!(decode_once("%252e"), "%2e");
    }

    #[test]
    fn test_traversal_detection() {
        assert!(looks_traversal("/a/../b"));
        assert!(looks_traversal("../x"));
        assert!(looks_traversal("/a/.."));
        assert!(looks_traversal("\\..\\windows"));
        assert!(!looks_traversal("/a/b.c/d"));
        assert!(!looks_traversal("/a/..b/c"));
    }

    #[test]
    fn test_double_encoding_caught_by_second_decode() {
        let raw = "/files/%252e%252e/etc";
        let once = decode_once(raw);
        let twice = decode_once(&once);
        assert!(!looks_traversal(&once));
        assert!(looks_traversal(&twice));
    }

    #[test]
    fn test_homoglyph_slash() {
        assert!(contains_homoglyph_slash("a\u{2215}b"));
        assert!(contains_homoglyph_slash("a\\b"));
        assert!(!contains_homoglyph_slash("/a/b"));
    }

    #[test]
    fn test_suspicious_raw_patterns() {
        assert!(SUSPICIOUS_RAW.is_match("/x/%2e%2e/y"));
        assert!(SUSPICIOUS_RAW.is_match("/x/%2F"));
        assert!(!SUSPICIOUS_RAW.is_match("/x/normal"));
    }
}
