//! Sliding-window deny accounting and quarantine escalation.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::EscalationSettings;
use crate::idempotency::epoch_now;
use crate::models::Mode;

#[derive(Debug, Clone, Copy)]
struct EscalationEntry {
    window_start: f64,
    deny_count: u32,
    quarantine_until: f64,
}

/// Decision returned per fingerprint: the escalation mode plus the
/// Retry-After seconds when quarantined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationDecision {
    pub mode: Mode,
    pub retry_after_s: u64,
}

impl EscalationDecision {
    fn normal() -> Self {
        Self {
            mode: Mode::Normal,
            retry_after_s: 0,
        }
    }
}

pub struct EscalationStore {
    settings: EscalationSettings,
    state: Mutex<HashMap<String, EscalationEntry>>,
}

impl EscalationStore {
    pub fn new(settings: EscalationSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record the decision family for `fingerprint` and return the
    /// escalation outcome. `family` is the coarse decision class; only
    /// "deny" advances the counter; "allow" may purge stale state.
    pub fn record_and_decide(&self, fingerprint: &str, family: &str) -> EscalationDecision {
        self.record_and_decide_at(fingerprint, family, epoch_now())
    }

    pub fn record_and_decide_at(
        &self,
        fingerprint: &str,
        family: &str,
        now: f64,
    ) -> EscalationDecision {
        if fingerprint.is_empty() {
            return EscalationDecision::normal();
        }

        let window = self.settings.window_secs as f64;
        let mut state = self.state.lock();

        if !self.settings.enabled {
            // Feature off: no new state; stale entries expire passively.
            if let Some(entry) = state.get(fingerprint) {
                if now - entry.window_start > window {
                    state.remove(fingerprint);
                }
            }
            return EscalationDecision::normal();
        }

        let existing = state.get(fingerprint).copied();

        if let Some(entry) = existing {
            if entry.quarantine_until > now {
                let remaining = (entry.quarantine_until - now).ceil() as u64;
                return EscalationDecision {
                    mode: Mode::FullQuarantine,
                    retry_after_s: remaining.max(1),
                };
            }
        }

        if family == "deny" {
            let (mut window_start, mut count) = existing
                .map(|e| (e.window_start, e.deny_count))
                .unwrap_or((now, 0));
            if now - window_start > window {
                window_start = now;
                count = 0;
            }
            count += 1;
            if count >= self.settings.deny_threshold {
                let until = now + self.settings.cooldown_secs as f64;
                state.insert(
                    fingerprint.to_string(),
                    EscalationEntry {
                        window_start,
                        deny_count: count,
                        quarantine_until: until,
                    },
                );
                return EscalationDecision {
                    mode: Mode::FullQuarantine,
                    retry_after_s: self.settings.cooldown_secs.max(1),
                };
            }
            state.insert(
                fingerprint.to_string(),
                EscalationEntry {
                    window_start,
                    deny_count: count,
                    quarantine_until: 0.0,
                },
            );
            return EscalationDecision::normal();
        }

        // Non-deny family: purge only entries that aged out of the window.
        if let Some(entry) = existing {
            if now - entry.window_start > window {
                state.remove(fingerprint);
            }
        }
        EscalationDecision::normal()
    }

    pub fn reset_state(&self) {
        self.state.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: bool, threshold: u32, window: u64, cooldown: u64) -> EscalationSettings {
        EscalationSettings {
            enabled,
            deny_threshold: threshold,
            window_secs: window,
            cooldown_secs: cooldown,
        }
    }

    #[test]
    fn test_allow_traffic_creates_no_state() {
        let store = EscalationStore::new(settings(true, 3, 300, 900));
        for _ in 0..10 {
            let d = store.record_and_decide("fp1", "allow");
            assert_eq!(d.mode, Mode::Normal);
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_threshold_reaches_quarantine() {
        let store = EscalationStore::new(settings(true, 2, 300, 60));
        let d1 = store.record_and_decide_at("fp1", "deny", 1000.0);
        assert_eq!(d1.mode, Mode::Normal);
        let d2 = store.record_and_decide_at("fp1", "deny", 1001.0);
        assert_eq!(d2.mode, Mode::FullQuarantine);
        assert_eq!(d2.retry_after_s, 60);
    }

    #[test]
    fn test_quarantine_applies_regardless_of_family() {
        let store = EscalationStore::new(settings(true, 1, 300, 60));
        let d = store.record_and_decide_at("fp1", "deny", 1000.0);
        assert_eq!(d.mode, Mode::FullQuarantine);

        // Even allow traffic is rejected while quarantined.
        let d = store.record_and_decide_at("fp1", "allow", 1030.0);
        assert_eq!(d.mode, Mode::FullQuarantine);
        assert!(d.retry_after_s >= 1 && d.retry_after_s <= 30);
    }

    #[test]
    fn test_quarantine_expires() {
        let store = EscalationStore::new(settings(true, 1, 300, 60));
        store.record_and_decide_at("fp1", "deny", 1000.0);
        let d = store.record_and_decide_at("fp1", "allow", 1061.0);
        assert_eq!(d.mode, Mode::Normal);
    }

    #[test]
    fn test_window_resets_deny_count() {
        let store = EscalationStore::new(settings(true, 2, 300, 60));
        store.record_and_decide_at("fp1", "deny", 1000.0);
        // Second deny lands outside the window: counter restarts at 1.
        let d = store.record_and_decide_at("fp1", "deny", 1400.0);
        assert_eq!(d.mode, Mode::Normal);
    }

    #[test]
    fn test_allow_purges_stale_entry_only() {
        let store = EscalationStore::new(settings(true, 3, 300, 60));
        store.record_and_decide_at("fp1", "deny", 1000.0);
        assert_eq!(store.len(), 1);

        // Fresh entry stays on allow.
        store.record_and_decide_at("fp1", "allow", 1100.0);
        assert_eq!(store.len(), 1);

        // Stale entry is purged on allow.
        store.record_and_decide_at("fp1", "allow", 1400.0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_disabled_creates_no_state() {
        let store = EscalationStore::new(settings(false, 1, 300, 60));
        let d = store.record_and_decide("fp1", "deny");
        assert_eq!(d.mode, Mode::Normal);
        assert!(store.is_empty());
    }

    #[test]
    fn test_deny_then_allow_does_not_grow_state() {
        let store = EscalationStore::new(settings(true, 5, 300, 60));
        store.record_and_decide_at("fp1", "deny", 1000.0);
        let before = store.len();
        store.record_and_decide_at("fp1", "allow", 1001.0);
        assert!(store.len() <= before);
    }
}
