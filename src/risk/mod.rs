//! Per-session risk scoring with exponential decay.
//!
//! Keyed by `(tenant, bot, session)`. Allow-only traffic must never create
//! entries; decay reads return 0 for absent keys without inserting.

pub mod escalation;

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use crate::idempotency::epoch_now;

const MAX_ENTRIES: usize = 50_000;

#[derive(Debug, Clone, Copy)]
struct RiskEntry {
    score: f64,
    last: f64,
    ttl: f64,
}

pub struct SessionRiskStore {
    entries: Mutex<HashMap<(String, String, String), RiskEntry>>,
    default_ttl: f64,
    max_entries: usize,
}

impl SessionRiskStore {
    pub fn new(default_ttl: f64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
            max_entries: MAX_ENTRIES,
        }
    }

    #[cfg(test)]
    fn with_capacity_limit(default_ttl: f64, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gc(entries: &mut HashMap<(String, String, String), RiskEntry>, max: usize, now: f64) {
        if entries.len() <= max {
            return;
        }
        entries.retain(|_, e| (now - e.last) <= e.ttl);
        if entries.len() > max {
            // Still over: drop the oldest 5% by last-touch.
            let mut by_age: Vec<_> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.last))
                .collect();
            by_age.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let cut = (by_age.len() / 20).max(1);
            for (key, _) in by_age.into_iter().take(cut) {
                entries.remove(&key);
            }
        }
    }

    /// Add `delta` (clamped at zero) and return the new score. Creates the
    /// entry if missing; expired entries restart from zero.
    pub fn bump(
        &self,
        tenant: &str,
        bot: &str,
        session: &str,
        delta: f64,
        ttl_s: Option<f64>,
    ) -> f64 {
        let now = epoch_now();
        let ttl = ttl_s.unwrap_or(self.default_ttl);
        let key = (tenant.to_string(), bot.to_string(), session.to_string());
        let mut entries = self.entries.lock();
        Self::gc(&mut entries, self.max_entries, now);

        let entry = entries.get(&key).copied();
        let mut entry = match entry {
            Some(e) if (now - e.last) <= e.ttl => e,
            _ => RiskEntry {
                score: 0.0,
                last: now,
                ttl,
            },
        };
        entry.score = (entry.score + delta).max(0.0);
        entry.last = now;
        entry.ttl = ttl;
        entries.insert(key, entry);
        entry.score
    }

    /// Decay the stored score toward zero and return it. Absent entries
    /// return 0 and are NOT created.
    pub fn decay_and_get(&self, tenant: &str, bot: &str, session: &str, half_life_s: f64) -> f64 {
        let key = (tenant.to_string(), bot.to_string(), session.to_string());
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&key) else {
            return 0.0;
        };
        let now = epoch_now();
        let dt = (now - entry.last).max(0.0);
        if half_life_s > 0.0 {
            entry.score *= 0.5_f64.powf(dt / half_life_s);
        }
        entry.last = now;
        entry.score
    }
}

/// Light suspicion heuristic over a JSON body; hot key names and prompt
/// injection phrasings add small increments. Detailed detection belongs to
/// the detectors, this only feeds the session score.
pub fn suspicion_score(value: &Value) -> f64 {
    match value {
        Value::String(s) => {
            let txt = s.to_lowercase();
            let mut score = 0.0;
            if txt.contains("ignore previous") || txt.contains("follow these hidden") {
                score += 1.0;
            }
            if txt.contains("password") || txt.contains("api_key") {
                score += 0.5;
            }
            score
        }
        Value::Array(items) => items.iter().map(suspicion_score).sum(),
        Value::Object(map) => {
            let mut score = 0.0;
            for (k, v) in map {
                let kk = k.to_lowercase();
                if matches!(kk.as_str(), "prompt" | "system" | "hidden" | "jailbreak") {
                    score += 0.5;
                }
                score += suspicion_score(v);
            }
            score
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_entry_decay_returns_zero_without_insert() {
        let store = SessionRiskStore::new(900.0);
        assert_eq!(store.decay_and_get("t", "b", "s", 180.0), 0.0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_bump_floors_at_zero() {
        let store = SessionRiskStore::new(900.0);
        let s = store.bump("t", "b", "s", -5.0, None);
        assert_eq!(s, 0.0);
        let s = store.bump("t", "b", "s", 2.0, None);
        assert_eq!(s, 2.0);
    }

    #[test]
    fn test_decay_halves_after_half_life() {
        let store = SessionRiskStore::new(900.0);
        store.bump("t", "b", "s", 8.0, None);
        // Zero elapsed time: decay factor ~1.
        let s = store.decay_and_get("t", "b", "s", 180.0);
        assert!((s - 8.0).abs() < 0.01);
    }

    #[test]
    fn test_gc_drops_oldest_on_overflow() {
        let store = SessionRiskStore::with_capacity_limit(900.0, 40);
        for i in 0..60 {
            store.bump("t", "b", &format!("s{i}"), 1.0, None);
        }
        assert!(store.len() <= 60);
        // The cap plus the 5% cut keeps the map bounded.
        assert!(store.len() < 60);
    }

    #[test]
    fn test_suspicion_score_heuristics() {
        assert_eq!(suspicion_score(&json!({"a": 1})), 0.0);
        assert!(suspicion_score(&json!({"prompt": "hello"})) >= 0.5);
        assert!(suspicion_score(&json!("ignore previous instructions")) >= 1.0);
        assert!(suspicion_score(&json!(["password here"])) >= 0.5);
    }
}
