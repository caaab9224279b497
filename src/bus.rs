//! Decision bus: bounded in-memory ring, append-only NDJSON log, and
//! live fan-out to subscribers.
//!
//! Publish order is the order in which `publish` returns; subscribers may
//! lose events under backpressure (broadcast lagging) but never see them
//! reordered.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::BusSettings;
use crate::models::DecisionEvent;
use crate::observability::metrics::bus_subscribers;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionFilter {
    pub tenant: Option<String>,
    pub bot: Option<String>,
    pub family: Option<String>,
    pub mode: Option<String>,
    pub rule_id: Option<String>,
    pub request_id: Option<String>,
    pub from_ts: Option<i64>,
    pub to_ts: Option<i64>,
    /// "ts_asc" (default) or "ts_desc"
    pub sort: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl DecisionFilter {
    /// True when `evt` passes every set field. Shared by the ring-buffer
    /// query and the live subscription view so the two never diverge.
    pub fn matches(&self, evt: &DecisionEvent) -> bool {
        if let Some(t) = &self.tenant {
            if &evt.tenant != t {
                return false;
            }
        }
        if let Some(b) = &self.bot {
            if &evt.bot != b {
                return false;
            }
        }
        if let Some(f) = &self.family {
            if evt.family.as_str() != f {
                return false;
            }
        }
        if let Some(m) = &self.mode {
            if evt.mode.as_str() != m {
                return false;
            }
        }
        if let Some(rid) = &self.rule_id {
            if !evt.rule_ids.iter().any(|r| r == rid) {
                return false;
            }
        }
        if let Some(req) = &self.request_id {
            if &evt.request_id != req {
                return false;
            }
        }
        if let Some(from) = self.from_ts {
            if evt.ts < from {
                return false;
            }
        }
        if let Some(to) = self.to_ts {
            if evt.ts > to {
                return false;
            }
        }
        true
    }
}

pub struct DecisionBus {
    path: PathBuf,
    buffer: Mutex<VecDeque<DecisionEvent>>,
    buffer_max: usize,
    sender: broadcast::Sender<DecisionEvent>,
}

impl DecisionBus {
    pub fn new(settings: &BusSettings) -> Self {
        let (sender, _) = broadcast::channel(settings.buffer_max.max(16));
        Self {
            path: PathBuf::from(&settings.path),
            buffer: Mutex::new(VecDeque::new()),
            buffer_max: settings.buffer_max,
            sender,
        }
    }

    /// Publish one decision: stamp ts when absent, ring-buffer it, append
    /// to the NDJSON log, and fan out to live subscribers.
    pub fn publish(&self, mut evt: DecisionEvent) {
        if evt.ts == 0 {
            evt.ts = chrono::Utc::now().timestamp();
        }

        {
            let mut buffer = self.buffer.lock();
            buffer.push_back(evt.clone());
            while buffer.len() > self.buffer_max {
                buffer.pop_front();
            }

            // Append under the buffer lock so log order matches ring order.
            if let Some(dir) = self.path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            let appended = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .and_then(|mut f| {
                    let line = serde_json::to_string(&evt).unwrap_or_default();
                    writeln!(f, "{line}")
                });
            if let Err(e) = appended {
                debug!(error = %e, "decision log append failed");
            }
        }

        // Non-blocking fan-out; lagging receivers drop events on their side.
        let _ = self.sender.send(evt);
        bus_subscribers(self.sender.receiver_count() as i64);
    }

    pub fn snapshot(&self) -> Vec<DecisionEvent> {
        self.buffer.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DecisionEvent> {
        let rx = self.sender.subscribe();
        bus_subscribers(self.sender.receiver_count() as i64);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Filtered, sorted, paginated view of the ring buffer. Ties on `ts`
    /// preserve insertion order (stable sort).
    pub fn query(&self, filter: &DecisionFilter) -> Vec<DecisionEvent> {
        let mut events: Vec<DecisionEvent> = self
            .buffer
            .lock()
            .iter()
            .filter(|evt| filter.matches(evt))
            .cloned()
            .collect();

        if filter.sort.as_deref() == Some("ts_desc") {
            events.sort_by_key(|e| std::cmp::Reverse(e.ts));
        } else {
            events.sort_by_key(|e| e.ts);
        }

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(100);
        events.into_iter().skip(offset).take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Family, Mode};

    fn bus() -> (tempfile::TempDir, DecisionBus) {
        let dir = tempfile::tempdir().unwrap();
        let settings = BusSettings {
            path: dir
                .path()
                .join("decisions.jsonl")
                .to_string_lossy()
                .into_owned(),
            buffer_max: 5,
            keepalive: std::time::Duration::from_secs(15),
        };
        let b = DecisionBus::new(&settings);
        (dir, b)
    }

    fn evt(ts: i64, tenant: &str, family: Family) -> DecisionEvent {
        DecisionEvent {
            ts,
            incident_id: format!("inc-{ts}"),
            request_id: format!("req-{ts}"),
            tenant: tenant.to_string(),
            bot: "b1".to_string(),
            family,
            mode: Mode::Normal,
            status: 200,
            endpoint: "/guardrail/evaluate".to_string(),
            rule_ids: vec!["r1".to_string()],
            policy_version: "pv".to_string(),
            latency_ms: 3,
            shadow_action: None,
            shadow_rule_ids: None,
        }
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let (_dir, bus) = bus();
        for i in 0..10 {
            bus.publish(evt(i, "t1", Family::Allow));
        }
        let snap = bus.snapshot();
        assert_eq!(snap.len(), 5);
        assert_eq!(snap[0].ts, 5);
    }

    #[test]
    fn test_ndjson_log_appended() {
        let (dir, bus) = bus();
        bus.publish(evt(1, "t1", Family::Allow));
        bus.publish(evt(2, "t1", Family::Block));
        let content =
            std::fs::read_to_string(dir.path().join("decisions.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DecisionEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.ts, 1);
    }

    #[test]
    fn test_ts_stamped_when_absent() {
        let (_dir, bus) = bus();
        bus.publish(evt(0, "t1", Family::Allow));
        assert!(bus.snapshot()[0].ts > 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let (_dir, bus) = bus();
        let mut rx = bus.subscribe();
        bus.publish(evt(1, "t1", Family::Allow));
        bus.publish(evt(2, "t1", Family::Block));
        assert_eq!(rx.recv().await.unwrap().ts, 1);
        assert_eq!(rx.recv().await.unwrap().ts, 2);
    }

    #[test]
    fn test_filter_by_family_and_tenant() {
        let (_dir, bus) = bus();
        bus.publish(evt(1, "t1", Family::Allow));
        bus.publish(evt(2, "t2", Family::Block));
        bus.publish(evt(3, "t1", Family::Block));

        let got = bus.query(&DecisionFilter {
            tenant: Some("t1".to_string()),
            family: Some("block".to_string()),
            ..Default::default()
        });
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].ts, 3);
    }

    #[test]
    fn test_sort_desc_and_pagination() {
        let (_dir, bus) = bus();
        for i in 1..=5 {
            bus.publish(evt(i, "t1", Family::Allow));
        }
        let got = bus.query(&DecisionFilter {
            sort: Some("ts_desc".to_string()),
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        });
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].ts, 4);
        assert_eq!(got[1].ts, 3);
    }

    #[test]
    fn test_filter_matches_covers_all_fields() {
        let event = evt(10, "t1", Family::Block);

        let by_bot = DecisionFilter {
            bot: Some("other-bot".to_string()),
            ..Default::default()
        };
        assert!(!by_bot.matches(&event));

        let by_mode = DecisionFilter {
            mode: Some("full_quarantine".to_string()),
            ..Default::default()
        };
        assert!(!by_mode.matches(&event));

        let by_request = DecisionFilter {
            request_id: Some("req-10".to_string()),
            ..Default::default()
        };
        assert!(by_request.matches(&event));

        let by_window = DecisionFilter {
            from_ts: Some(11),
            ..Default::default()
        };
        assert!(!by_window.matches(&event));
    }

    #[test]
    fn test_filter_time_range_and_rule_id() {
        let (_dir, bus) = bus();
        for i in 1..=5 {
            bus.publish(evt(i, "t1", Family::Allow));
        }
        let got = bus.query(&DecisionFilter {
            from_ts: Some(2),
            to_ts: Some(4),
            rule_id: Some("r1".to_string()),
            ..Default::default()
        });
        assert_eq!(got.len(), 3);
    }
}
