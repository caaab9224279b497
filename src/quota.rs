//! Fixed-window request quotas on UTC calendar boundaries.

use std::collections::HashMap;

use chrono::{Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy)]
struct Counter {
    window_start: i64,
    count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// "ok" | "day" | "month"
    pub reason: &'static str,
    pub retry_after_s: i64,
    pub day_remaining: u64,
    pub month_remaining: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub day_count: u64,
    pub month_count: u64,
    pub day_remaining: u64,
    pub month_remaining: u64,
    pub day_window_start: i64,
    pub month_window_start: i64,
    pub reset_day_s: i64,
    pub reset_month_s: i64,
    pub reset_earliest_s: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetWhich {
    Day,
    Month,
    Both,
}

struct Windows {
    day: HashMap<String, Counter>,
    month: HashMap<String, Counter>,
}

/// UTC-fixed day/month request counters per key. `now_fn` is injectable so
/// tests can pin the clock.
pub struct FixedWindowQuotaStore {
    per_day: u64,
    per_month: u64,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    windows: Mutex<Windows>,
}

fn utc_day_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(86_400)
}

fn utc_month_start(ts: i64) -> i64 {
    let dt = Utc
        .timestamp_opt(ts, 0)
        .single()
        .unwrap_or(chrono::DateTime::<Utc>::UNIX_EPOCH);
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(ts)
}

fn next_month_start(ts: i64) -> i64 {
    let dt = Utc
        .timestamp_opt(ts, 0)
        .single()
        .unwrap_or(chrono::DateTime::<Utc>::UNIX_EPOCH);
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(ts)
}

impl FixedWindowQuotaStore {
    pub fn new(per_day: u64, per_month: u64) -> Self {
        Self::with_clock(per_day, per_month, || Utc::now().timestamp())
    }

    pub fn with_clock(
        per_day: u64,
        per_month: u64,
        now_fn: impl Fn() -> i64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            per_day,
            per_month,
            now_fn: Box::new(now_fn),
            windows: Mutex::new(Windows {
                day: HashMap::new(),
                month: HashMap::new(),
            }),
        }
    }

    pub fn limits(&self) -> (u64, u64) {
        (self.per_day, self.per_month)
    }

    /// Atomic check-and-increment. The window with the smaller remaining
    /// decides the block reason; `retry_after_s` is the time to that
    /// window's boundary.
    pub fn check_and_inc(&self, key: &str) -> QuotaDecision {
        let now = (self.now_fn)();
        let d0 = utc_day_start(now);
        let m0 = utc_month_start(now);
        let mut windows = self.windows.lock();

        let dctr = windows.day.entry(key.to_string()).or_insert(Counter {
            window_start: d0,
            count: 0,
        });
        if dctr.window_start != d0 {
            *dctr = Counter {
                window_start: d0,
                count: 0,
            };
        }
        let day_count = dctr.count;

        let mctr = windows.month.entry(key.to_string()).or_insert(Counter {
            window_start: m0,
            count: 0,
        });
        if mctr.window_start != m0 {
            *mctr = Counter {
                window_start: m0,
                count: 0,
            };
        }
        let month_count = mctr.count;

        let day_remaining = self.per_day.saturating_sub(day_count);
        let month_remaining = self.per_month.saturating_sub(month_count);

        if day_remaining > 0 && month_remaining > 0 {
            if let Some(c) = windows.day.get_mut(key) {
                c.count += 1;
            }
            if let Some(c) = windows.month.get_mut(key) {
                c.count += 1;
            }
            return QuotaDecision {
                allowed: true,
                reason: "ok",
                retry_after_s: 0,
                day_remaining: day_remaining - 1,
                month_remaining: month_remaining - 1,
            };
        }

        let day_reset = (d0 + 86_400) - now;
        let month_reset = next_month_start(now) - now;

        let (reason, retry) = if day_remaining == 0 && month_remaining == 0 {
            if day_reset <= month_reset {
                ("day", day_reset)
            } else {
                ("month", month_reset)
            }
        } else if day_remaining == 0 {
            ("day", day_reset)
        } else {
            ("month", month_reset)
        };

        QuotaDecision {
            allowed: false,
            reason,
            retry_after_s: retry.max(1),
            day_remaining,
            month_remaining,
        }
    }

    /// Non-mutating status snapshot for admin diagnostics.
    pub fn peek(&self, key: &str) -> QuotaStatus {
        let now = (self.now_fn)();
        let d0 = utc_day_start(now);
        let m0 = utc_month_start(now);
        let windows = self.windows.lock();

        let day_count = windows
            .day
            .get(key)
            .filter(|c| c.window_start == d0)
            .map(|c| c.count)
            .unwrap_or(0);
        let month_count = windows
            .month
            .get(key)
            .filter(|c| c.window_start == m0)
            .map(|c| c.count)
            .unwrap_or(0);

        let day_reset = (d0 + 86_400) - now;
        let month_reset = next_month_start(now) - now;

        QuotaStatus {
            day_count,
            month_count,
            day_remaining: self.per_day.saturating_sub(day_count),
            month_remaining: self.per_month.saturating_sub(month_count),
            day_window_start: d0,
            month_window_start: m0,
            reset_day_s: day_reset.max(1),
            reset_month_s: month_reset.max(1),
            reset_earliest_s: day_reset.min(month_reset).max(1),
        }
    }

    pub fn reset_key(&self, key: &str, which: ResetWhich) {
        let mut windows = self.windows.lock();
        if matches!(which, ResetWhich::Day | ResetWhich::Both) {
            windows.day.remove(key);
        }
        if matches!(which, ResetWhich::Month | ResetWhich::Both) {
            windows.month.remove(key);
        }
    }
}
