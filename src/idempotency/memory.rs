//! In-memory idempotency store for tests and single-process deployments.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    epoch_now, new_owner_token, AcquireOutcome, IdemStore, KeyMeta, KeyState, StoredResponse,
    StoreError,
};

struct LockEntry {
    owner: String,
    payload_fingerprint: String,
    expires: f64,
}

struct Inner {
    values: HashMap<String, (StoredResponse, String, f64)>,
    locks: HashMap<String, LockEntry>,
    states: HashMap<String, (KeyState, f64)>,
    recent: VecDeque<(String, f64)>,
    recent_limit: usize,
}

impl Inner {
    fn expire(&mut self, now: f64) {
        self.locks.retain(|_, l| l.expires > now);
        self.values.retain(|_, (_, _, exp)| *exp > now);
        self.states.retain(|_, (_, exp)| *exp > now);
    }

    fn append_recent(&mut self, key: &str, ts: f64) {
        self.recent.push_back((key.to_string(), ts));
        while self.recent.len() > self.recent_limit {
            self.recent.pop_front();
        }
    }
}

pub struct InMemoryIdemStore {
    inner: Mutex<Inner>,
}

impl InMemoryIdemStore {
    pub fn new(recent_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                values: HashMap::new(),
                locks: HashMap::new(),
                states: HashMap::new(),
                recent: VecDeque::new(),
                recent_limit: recent_limit.max(1),
            }),
        }
    }
}

impl Default for InMemoryIdemStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl IdemStore for InMemoryIdemStore {
    async fn acquire_leader(
        &self,
        key: &str,
        ttl_s: u64,
        payload_fingerprint: &str,
    ) -> Result<AcquireOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let now = epoch_now();
        inner.expire(now);
        if let Some(lock) = inner.locks.get(key) {
            if lock.expires > now {
                return Ok(AcquireOutcome {
                    acquired: false,
                    owner: None,
                });
            }
        }
        let owner = new_owner_token();
        let expires = now + ttl_s as f64;
        inner.locks.insert(
            key.to_string(),
            LockEntry {
                owner: owner.clone(),
                payload_fingerprint: payload_fingerprint.to_string(),
                expires,
            },
        );
        inner
            .states
            .insert(key.to_string(), (KeyState::InProgress, expires));
        inner.append_recent(key, now);
        Ok(AcquireOutcome {
            acquired: true,
            owner: Some(owner),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<StoredResponse>, StoreError> {
        let mut inner = self.inner.lock();
        let now = epoch_now();
        inner.expire(now);
        Ok(inner.values.get(key).map(|(resp, _, _)| resp.clone()))
    }

    async fn put(
        &self,
        key: &str,
        resp: StoredResponse,
        payload_fingerprint: &str,
        ttl_s: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let now = epoch_now();
        let expires = now + ttl_s as f64;
        inner.values.insert(
            key.to_string(),
            (resp, payload_fingerprint.to_string(), expires),
        );
        inner
            .states
            .insert(key.to_string(), (KeyState::Stored, expires));
        inner.locks.remove(key);
        inner.append_recent(key, now);
        Ok(())
    }

    async fn release(&self, key: &str, owner: Option<&str>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match owner {
            Some(owner) => {
                let matches = inner
                    .locks
                    .get(key)
                    .map(|l| l.owner == owner)
                    .unwrap_or(false);
                if !matches {
                    return Ok(false);
                }
                inner.locks.remove(key);
                let expires = epoch_now() + 60.0;
                inner
                    .states
                    .insert(key.to_string(), (KeyState::Released, expires));
                Ok(true)
            }
            None => {
                // Admin path only: unconditional delete.
                let existed = inner.locks.remove(key).is_some();
                inner.states.remove(key);
                Ok(existed)
            }
        }
    }

    async fn meta(&self, key: &str) -> Result<KeyMeta, StoreError> {
        let mut inner = self.inner.lock();
        let now = epoch_now();
        inner.expire(now);
        let state = inner.states.get(key).map(|(s, _)| s.clone());
        let lock = inner.locks.get(key);
        let payload_fingerprint = lock
            .map(|l| l.payload_fingerprint.clone())
            .or_else(|| inner.values.get(key).map(|(_, fp, _)| fp.clone()));
        Ok(KeyMeta {
            state,
            lock: lock.is_some(),
            payload_fingerprint,
        })
    }

    async fn bump_replay(
        &self,
        key: &str,
        touch_ttl_s: Option<u64>,
    ) -> Result<Option<u64>, StoreError> {
        let mut inner = self.inner.lock();
        let now = epoch_now();
        inner.expire(now);
        let Some((resp, _, expires)) = inner.values.get_mut(key) else {
            return Ok(None);
        };
        resp.replay_count += 1;
        let count = resp.replay_count;
        if let Some(touch) = touch_ttl_s {
            *expires = now + touch as f64;
            if let Some((_, state_exp)) = inner.states.get_mut(key) {
                *state_exp = now + touch as f64;
            }
            inner.append_recent(key, now);
        }
        Ok(Some(count))
    }

    async fn purge(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let had_value = inner.values.remove(key).is_some();
        let had_lock = inner.locks.remove(key).is_some();
        let had_state = inner.states.remove(key).is_some();
        Ok(had_value || had_lock || had_state)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
        let inner = self.inner.lock();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        for (key, ts) in inner.recent.iter().rev() {
            if !seen.insert(key.as_str()) {
                continue;
            }
            out.push((key.clone(), *ts));
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    fn resp(body: &[u8]) -> StoredResponse {
        StoredResponse::new(200, StdHashMap::new(), body.to_vec(), None)
    }

    #[tokio::test]
    async fn test_single_flight_under_concurrency() {
        let store = Arc::new(InMemoryIdemStore::default());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.acquire_leader("k1", 30, "fp").await.unwrap().acquired
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_put_clears_lock_and_stores() {
        let store = InMemoryIdemStore::default();
        let acq = store.acquire_leader("k1", 30, "fp").await.unwrap();
        assert!(acq.acquired);
        store.put("k1", resp(b"hello"), "fp", 60).await.unwrap();

        let meta = store.meta("k1").await.unwrap();
        assert_eq!(meta.state, Some(KeyState::Stored));
        assert!(!meta.lock);

        // Lock is gone, so a new leader can be elected for a fresh run.
        let again = store.acquire_leader("k1", 30, "fp2").await.unwrap();
        assert!(again.acquired);
    }

    #[tokio::test]
    async fn test_release_is_owner_scoped() {
        let store = InMemoryIdemStore::default();
        let acq = store.acquire_leader("k1", 30, "fp").await.unwrap();
        let owner = acq.owner.unwrap();

        assert!(!store.release("k1", Some("not-the-owner")).await.unwrap());
        assert!(store.meta("k1").await.unwrap().lock);

        assert!(store.release("k1", Some(&owner)).await.unwrap());
        let meta = store.meta("k1").await.unwrap();
        assert!(!meta.lock);
        assert_eq!(meta.state, Some(KeyState::Released));
    }

    #[tokio::test]
    async fn test_replay_counts_are_strictly_increasing() {
        let store = InMemoryIdemStore::default();
        store.put("k1", resp(b"v"), "fp", 60).await.unwrap();
        let mut last = 0;
        for _ in 0..5 {
            let n = store.bump_replay("k1", None).await.unwrap().unwrap();
            assert!(n > last);
            last = n;
        }
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn test_bump_replay_missing_value() {
        let store = InMemoryIdemStore::default();
        assert!(store.bump_replay("nope", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_latest_body() {
        let store = InMemoryIdemStore::default();
        store.put("k1", resp(b"first"), "fp1", 60).await.unwrap();
        store.put("k1", resp(b"second"), "fp2", 60).await.unwrap();
        let got = store.get("k1").await.unwrap().unwrap();
        assert_eq!(got.body, b"second");
        assert_eq!(got.replay_count, 0);
    }

    #[tokio::test]
    async fn test_list_recent_dedupes_newest_first() {
        let store = InMemoryIdemStore::default();
        store.put("a", resp(b"1"), "fp", 60).await.unwrap();
        store.put("b", resp(b"2"), "fp", 60).await.unwrap();
        store.put("a", resp(b"3"), "fp", 60).await.unwrap();
        let recent = store.list_recent(10).await.unwrap();
        let keys: Vec<&str> = recent.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_purge_reports_existence() {
        let store = InMemoryIdemStore::default();
        assert!(!store.purge("missing").await.unwrap());
        store.put("k1", resp(b"x"), "fp", 60).await.unwrap();
        assert!(store.purge("k1").await.unwrap());
        assert!(store.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lock_allows_new_leader() {
        let store = InMemoryIdemStore::default();
        // ttl 0 expires immediately.
        let first = store.acquire_leader("k1", 0, "fp").await.unwrap();
        assert!(first.acquired);
        let second = store.acquire_leader("k1", 30, "fp").await.unwrap();
        assert!(second.acquired);
    }
}
