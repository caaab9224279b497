//! Per-provider circuit breaker: failure counting in a rolling window,
//! cooldown, and a single half-open probe.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::idempotency::epoch_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerSlot {
    failures: VecDeque<f64>,
    opened_at: Option<f64>,
    half_open_inflight: bool,
}

impl BreakerSlot {
    fn new() -> Self {
        Self {
            failures: VecDeque::new(),
            opened_at: None,
            half_open_inflight: false,
        }
    }
}

pub struct ProviderBreaker {
    max_failures: u32,
    window_s: f64,
    cooldown_s: f64,
    slots: Mutex<HashMap<String, BreakerSlot>>,
}

impl ProviderBreaker {
    pub fn new(max_failures: u32, window_s: u64, cooldown_s: u64) -> Self {
        Self {
            max_failures: max_failures.max(1),
            window_s: window_s as f64,
            cooldown_s: cooldown_s as f64,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn state_of(&self, slot: &BreakerSlot, now: f64) -> BreakerState {
        match slot.opened_at {
            None => BreakerState::Closed,
            Some(opened_at) if now - opened_at >= self.cooldown_s => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    pub fn state(&self, provider: &str) -> BreakerState {
        self.state_at(provider, epoch_now())
    }

    pub fn state_at(&self, provider: &str, now: f64) -> BreakerState {
        let slots = self.slots.lock();
        slots
            .get(provider)
            .map(|s| self.state_of(s, now))
            .unwrap_or(BreakerState::Closed)
    }

    /// Returns true when a call may proceed. A half-open breaker admits at
    /// most one inflight probe.
    pub fn before_call(&self, provider: &str) -> bool {
        self.before_call_at(provider, epoch_now())
    }

    pub fn before_call_at(&self, provider: &str, now: f64) -> bool {
        let mut slots = self.slots.lock();
        let slot = slots.entry(provider.to_string()).or_insert_with(BreakerSlot::new);
        match self.state_of(slot, now) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if slot.half_open_inflight {
                    false
                } else {
                    slot.half_open_inflight = true;
                    true
                }
            }
        }
    }

    pub fn on_success(&self, provider: &str) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(provider.to_string()).or_insert_with(BreakerSlot::new);
        slot.failures.clear();
        slot.opened_at = None;
        slot.half_open_inflight = false;
    }

    pub fn on_failure(&self, provider: &str) -> BreakerState {
        self.on_failure_at(provider, epoch_now())
    }

    pub fn on_failure_at(&self, provider: &str, now: f64) -> BreakerState {
        let mut slots = self.slots.lock();
        let slot = slots.entry(provider.to_string()).or_insert_with(BreakerSlot::new);
        let state = self.state_of(slot, now);

        if state == BreakerState::HalfOpen {
            // Probe failed: re-open and restart cooldown.
            slot.opened_at = Some(now);
            slot.half_open_inflight = false;
            return BreakerState::Open;
        }

        slot.failures.push_back(now);
        while let Some(oldest) = slot.failures.front() {
            if now - oldest > self.window_s {
                slot.failures.pop_front();
            } else {
                break;
            }
        }
        if slot.failures.len() as u32 >= self.max_failures {
            slot.opened_at = Some(now);
            slot.half_open_inflight = false;
            return BreakerState::Open;
        }
        BreakerState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold_within_window() {
        let breaker = ProviderBreaker::new(3, 60, 30);
        assert_eq!(breaker.on_failure_at("p", 100.0), BreakerState::Closed);
        assert_eq!(breaker.on_failure_at("p", 101.0), BreakerState::Closed);
        assert_eq!(breaker.on_failure_at("p", 102.0), BreakerState::Open);
        assert!(!breaker.before_call_at("p", 103.0));
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let breaker = ProviderBreaker::new(2, 10, 30);
        breaker.on_failure_at("p", 100.0);
        // 100.0 ages out before the second failure lands.
        assert_eq!(breaker.on_failure_at("p", 120.0), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_single_probe() {
        let breaker = ProviderBreaker::new(1, 60, 30);
        breaker.on_failure_at("p", 100.0);
        assert_eq!(breaker.state_at("p", 110.0), BreakerState::Open);

        // Cooldown elapsed: exactly one probe is admitted.
        assert_eq!(breaker.state_at("p", 131.0), BreakerState::HalfOpen);
        assert!(breaker.before_call_at("p", 131.0));
        assert!(!breaker.before_call_at("p", 131.5));
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = ProviderBreaker::new(1, 60, 30);
        breaker.on_failure_at("p", 100.0);
        assert!(breaker.before_call_at("p", 131.0));
        assert_eq!(breaker.on_failure_at("p", 131.2), BreakerState::Open);
        assert!(!breaker.before_call_at("p", 132.0));
    }

    #[test]
    fn test_probe_success_closes() {
        let breaker = ProviderBreaker::new(1, 60, 30);
        breaker.on_failure_at("p", 100.0);
        assert!(breaker.before_call_at("p", 131.0));
        breaker.on_success("p");
        assert_eq!(breaker.state_at("p", 132.0), BreakerState::Closed);
        assert!(breaker.before_call_at("p", 132.0));
    }

    #[test]
    fn test_providers_are_independent() {
        let breaker = ProviderBreaker::new(1, 60, 30);
        breaker.on_failure_at("a", 100.0);
        assert!(!breaker.before_call_at("a", 101.0));
        assert!(breaker.before_call_at("b", 101.0));
    }
}
