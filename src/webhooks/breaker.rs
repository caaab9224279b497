//! Per-destination-host circuit breaker for webhook delivery.
//!
//! Outcomes are tracked in a bounded rolling window; crossing the error
//! threshold opens the breaker for a cooldown, after which a single
//! half-open probe decides between closing and re-opening.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::idempotency::epoch_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    error_threshold: u32,
    window: usize,
    cooldown_sec: f64,
    outcomes: VecDeque<bool>,
    opened_at: Option<f64>,
    half_open_inflight: bool,
}

impl CircuitBreaker {
    pub fn new(error_threshold: u32, window: usize, cooldown_sec: u64) -> Self {
        Self {
            error_threshold: error_threshold.max(1),
            window: window.max(1),
            cooldown_sec: cooldown_sec as f64,
            outcomes: VecDeque::new(),
            opened_at: None,
            half_open_inflight: false,
        }
    }

    pub fn state(&self, now: f64) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened_at) if now - opened_at >= self.cooldown_sec => CircuitState::HalfOpen,
            Some(_) => CircuitState::Open,
        }
    }

    /// Gate before any send attempt. Half-open admits one inflight probe.
    pub fn before_send(&mut self, now: f64) -> bool {
        match self.state(now) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.half_open_inflight {
                    false
                } else {
                    self.half_open_inflight = true;
                    true
                }
            }
        }
    }

    pub fn after_success(&mut self, now: f64) {
        self.record(true);
        if self.opened_at.is_some() && self.state(now) == CircuitState::HalfOpen {
            self.opened_at = None;
            self.outcomes.clear();
        }
        self.half_open_inflight = false;
    }

    pub fn after_failure(&mut self, now: f64) {
        self.record(false);
        if self.state(now) == CircuitState::HalfOpen {
            self.opened_at = Some(now);
        } else if self.failures_in_window() >= self.error_threshold {
            self.opened_at = Some(now);
        }
        self.half_open_inflight = false;
    }

    fn record(&mut self, ok: bool) {
        self.outcomes.push_back(ok);
        while self.outcomes.len() > self.window {
            self.outcomes.pop_front();
        }
    }

    fn failures_in_window(&self) -> u32 {
        self.outcomes.iter().filter(|ok| !**ok).count() as u32
    }
}

/// Breaker registry keyed by destination host. State transitions are
/// atomic with respect to `should_dlq_now`: both run under the map lock.
pub struct HostBreakerRegistry {
    error_threshold: u32,
    window: usize,
    cooldown_sec: u64,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

pub fn host_of(url: &str) -> String {
    url.split("//")
        .nth(1)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or("unknown")
        .to_string()
}

impl HostBreakerRegistry {
    pub fn new(error_threshold: u32, window: usize, cooldown_sec: u64) -> Self {
        Self {
            error_threshold,
            window,
            cooldown_sec,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<R>(&self, url: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let host = host_of(url);
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(host).or_insert_with(|| {
            CircuitBreaker::new(self.error_threshold, self.window, self.cooldown_sec)
        });
        f(breaker)
    }

    /// True when delivery must go straight to the DLQ without opening an
    /// HTTP connection.
    pub fn should_dlq_now(&self, url: &str) -> bool {
        self.should_dlq_now_at(url, epoch_now())
    }

    pub fn should_dlq_now_at(&self, url: &str, now: f64) -> bool {
        self.with_breaker(url, |b| !b.before_send(now))
    }

    pub fn on_success(&self, url: &str) {
        self.with_breaker(url, |b| b.after_success(epoch_now()));
    }

    pub fn on_failure(&self, url: &str) {
        self.on_failure_at(url, epoch_now());
    }

    pub fn on_failure_at(&self, url: &str, now: f64) {
        self.with_breaker(url, |b| b.after_failure(now));
    }

    pub fn state(&self, url: &str) -> CircuitState {
        self.state_at(url, epoch_now())
    }

    pub fn state_at(&self, url: &str, now: f64) -> CircuitState {
        self.with_breaker(url, |b| b.state(now))
    }
}
