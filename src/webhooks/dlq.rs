//! Webhook dead-letter queue: append-only NDJSON with stats, requeue,
//! and purge. The `guardrail_webhook_dlq_length` gauge always reflects
//! the current record count and is seeded when the DLQ is configured.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::observability::metrics::webhook_dlq_length_set;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub ts: i64,
    pub ts_ms: i64,
    pub reason: String,
    pub event: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub size: usize,
    pub oldest_ts_ms: Option<i64>,
    pub newest_ts_ms: Option<i64>,
    pub last_error: Option<String>,
}

pub struct DeadLetterQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DeadLetterQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let dlq = Self {
            path: path.into(),
            lock: Mutex::new(()),
        };
        // Seed the gauge from whatever is already on disk.
        webhook_dlq_length_set(dlq.count() as u64);
        dlq
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_records(&self) -> Vec<DlqRecord> {
        let Ok(file) = std::fs::File::open(&self.path) else {
            return Vec::new();
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect()
    }

    pub fn push(&self, reason: &str, event: serde_json::Value) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let record = DlqRecord {
            ts: now_ms / 1000,
            ts_ms: now_ms,
            reason: reason.to_string(),
            event,
        };
        let _guard = self.lock.lock();
        if let Some(dir) = self.path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| {
                let line = serde_json::to_string(&record).unwrap_or_default();
                writeln!(f, "{line}")
            });
        match appended {
            Ok(()) => {
                drop(_guard);
                webhook_dlq_length_set(self.count() as u64);
            }
            Err(e) => debug!(error = %e, "dlq append failed"),
        }
    }

    pub fn count(&self) -> usize {
        self.read_records().len()
    }

    pub fn stats(&self) -> DlqStats {
        let _guard = self.lock.lock();
        let records = self.read_records();
        let mut oldest: Option<i64> = None;
        let mut newest: Option<i64> = None;
        let mut last_error: Option<String> = None;
        for rec in &records {
            oldest = Some(oldest.map_or(rec.ts_ms, |o: i64| o.min(rec.ts_ms)));
            newest = Some(newest.map_or(rec.ts_ms, |n: i64| n.max(rec.ts_ms)));
            if !rec.reason.is_empty() {
                last_error = Some(rec.reason.clone());
            }
        }
        DlqStats {
            size: records.len(),
            oldest_ts_ms: oldest,
            newest_ts_ms: newest,
            last_error,
        }
    }

    /// Drain every record for requeueing, truncating the file. Callers
    /// re-enqueue in chunks; records that fail to requeue are pushed back.
    pub fn drain_all(&self) -> Vec<DlqRecord> {
        let _guard = self.lock.lock();
        let records = self.read_records();
        if !records.is_empty() {
            let _ = std::fs::remove_file(&self.path);
        }
        drop(_guard);
        webhook_dlq_length_set(0);
        records
    }

    pub fn purge_all(&self) -> usize {
        let _guard = self.lock.lock();
        let count = self.read_records().len();
        if count > 0 {
            let _ = std::fs::remove_file(&self.path);
        }
        drop(_guard);
        webhook_dlq_length_set(0);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dlq() -> (tempfile::TempDir, DeadLetterQueue) {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::new(dir.path().join("dlq.jsonl"));
        (dir, dlq)
    }

    #[test]
    fn test_push_and_count() {
        let (_dir, dlq) = temp_dlq();
        assert_eq!(dlq.count(), 0);
        dlq.push("cb_open", json!({"incident_id": "a"}));
        dlq.push("exhausted", json!({"incident_id": "b"}));
        assert_eq!(dlq.count(), 2);
    }

    #[test]
    fn test_stats_shape() {
        let (_dir, dlq) = temp_dlq();
        dlq.push("cb_open", json!({"x": 1}));
        dlq.push("timeout", json!({"x": 2}));
        let stats = dlq.stats();
        assert_eq!(stats.size, 2);
        assert!(stats.oldest_ts_ms.is_some());
        assert!(stats.newest_ts_ms.unwrap() >= stats.oldest_ts_ms.unwrap());
        assert_eq!(stats.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_drain_empties_file() {
        let (_dir, dlq) = temp_dlq();
        dlq.push("cb_open", json!({"x": 1}));
        let drained = dlq.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].reason, "cb_open");
        assert_eq!(dlq.count(), 0);
    }

    #[test]
    fn test_purge_returns_count() {
        let (_dir, dlq) = temp_dlq();
        dlq.push("a", json!({}));
        dlq.push("b", json!({}));
        assert_eq!(dlq.purge_all(), 2);
        assert_eq!(dlq.purge_all(), 0);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.jsonl");
        {
            let dlq = DeadLetterQueue::new(&path);
            dlq.push("cb_open", json!({"persisted": true}));
        }
        let dlq = DeadLetterQueue::new(&path);
        assert_eq!(dlq.count(), 1);
    }
}
