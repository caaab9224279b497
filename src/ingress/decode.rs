//! Single-layer decoders for obfuscated string fields.
//!
//! Exactly one decoding layer is attempted per string, in priority order
//! base64 -> hex -> url, with the same acceptance heuristics across all
//! three: minimum length, strict alphabet, and a 64 KiB output cap.
//! Applying `decode_string_once` to its own output with `changed == false`
//! is a fixed point.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

const MAX_DECODE_BYTES: usize = 64 * 1024;

lazy_static! {
    static ref RE_BASE64: Regex = Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").expect("static regex");
    static ref RE_HEX: Regex = Regex::new(r"^[0-9A-Fa-f]+$").expect("static regex");
    static ref RE_URL_HINT: Regex = Regex::new(r"%[0-9A-Fa-f]{2}").expect("static regex");
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecodeStats {
    pub decoded_base64: u64,
    pub decoded_hex: u64,
    pub decoded_url: u64,
    pub changed: bool,
}

impl DecodeStats {
    fn merge(&mut self, other: DecodeStats) {
        self.decoded_base64 += other.decoded_base64;
        self.decoded_hex += other.decoded_hex;
        self.decoded_url += other.decoded_url;
        self.changed |= other.changed;
    }
}

fn maybe_decode_base64(text: &str) -> Option<String> {
    let t = text.trim();
    if t.len() < 8 || t.len() % 4 != 0 {
        return None;
    }
    // Pure even-length hex prefers the hex decoder to avoid false positives.
    if t.len() % 2 == 0 && RE_HEX.is_match(t) {
        return None;
    }
    if !RE_BASE64.is_match(t) {
        return None;
    }
    let data = STANDARD.decode(t).ok()?;
    if data.is_empty() || data.len() > MAX_DECODE_BYTES {
        return None;
    }
    Some(String::from_utf8_lossy(&data).into_owned())
}

fn maybe_decode_hex(text: &str) -> Option<String> {
    let t = text.trim();
    if t.len() < 8 || t.len() % 2 != 0 {
        return None;
    }
    if !RE_HEX.is_match(t) {
        return None;
    }
    let data = hex::decode(t).ok()?;
    if data.is_empty() || data.len() > MAX_DECODE_BYTES {
        return None;
    }
    Some(String::from_utf8_lossy(&data).into_owned())
}

fn url_unquote_plus(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let pair = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                );
                if let (Some(h), Some(l)) = pair {
                    out.push(((h << 4) | l) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn maybe_decode_url(text: &str) -> Option<String> {
    if !text.contains('+') && !RE_URL_HINT.is_match(text) {
        return None;
    }
    let decoded = url_unquote_plus(text);
    if decoded == text {
        return None;
    }
    if decoded.len() > MAX_DECODE_BYTES {
        return None;
    }
    Some(decoded)
}

/// Attempt one layer of decoding. Returns the decoded (or original)
/// string plus per-codec stats.
pub fn decode_string_once(text: &str) -> (String, DecodeStats) {
    let mut stats = DecodeStats::default();
    if let Some(out) = maybe_decode_base64(text) {
        stats.decoded_base64 = 1;
        stats.changed = true;
        return (out, stats);
    }
    if let Some(out) = maybe_decode_hex(text) {
        stats.decoded_hex = 1;
        stats.changed = true;
        return (out, stats);
    }
    if let Some(out) = maybe_decode_url(text) {
        stats.decoded_url = 1;
        stats.changed = true;
        return (out, stats);
    }
    (text.to_string(), stats)
}

/// Walk a JSON value and decode every string field once, in place.
pub fn decode_json_once(value: &mut Value) -> DecodeStats {
    let mut stats = DecodeStats::default();
    match value {
        Value::String(s) => {
            let (out, st) = decode_string_once(s);
            if st.changed {
                *s = out;
            }
            stats.merge(st);
        }
        Value::Array(items) => {
            for item in items {
                stats.merge(decode_json_once(item));
            }
        }
        Value::Object(map) => {
            // Keys stay untouched so schemas keep working.
            for (_, v) in map.iter_mut() {
                stats.merge(decode_json_once(v));
            }
        }
        _ => {}
    }
    stats
}
