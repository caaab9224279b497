//! Redis-backed idempotency store.
//!
//! Key shape is `{ns}:{tenant}:{key}:{suffix}` with suffixes `lock`,
//! `value`, `state`, plus a per-tenant `{ns}:{tenant}:recent` sorted set
//! trimmed by rank. Lock values are JSON `{owner, payload_fingerprint}`.
//! Conditional release and replay bump run as single-key Lua scripts so
//! they stay atomic under real parallelism.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::json;

use super::{
    epoch_now, new_owner_token, AcquireOutcome, IdemStore, KeyMeta, KeyState, StoredResponse,
    StoreError,
};

// Conditional lock release by owner; marks state "released" with a short TTL.
const RELEASE_LUA: &str = r#"
local v = redis.call('GET', KEYS[1])
if not v then
  return 0
end
local decoded = cjson.decode(v)
if decoded and decoded.owner == ARGV[1] then
  redis.call('DEL', KEYS[1])
  local ttl = tonumber(ARGV[2])
  if ttl and ttl > 0 then
    redis.call('SET', KEYS[2], 'released', 'EX', ttl)
  else
    redis.call('SET', KEYS[2], 'released')
  end
  return 1
end
return 0
"#;

// Increment replay_count inside the stored JSON value; refresh TTL to EX
// when ARGV[1] >= 0, else preserve the current PTTL.
const BUMP_REPLAY_LUA: &str = r#"
local v = redis.call('GET', KEYS[1])
if not v then
  return nil
end
local obj = cjson.decode(v)
if not obj then
  return nil
end
obj.replay_count = (obj.replay_count or 0) + 1
local new_v = cjson.encode(obj)
local touch_ex = tonumber(ARGV[1])
if touch_ex and touch_ex >= 0 then
  redis.call('SET', KEYS[1], new_v, 'EX', touch_ex)
else
  local pttl = redis.call('PTTL', KEYS[1])
  if pttl and pttl > 0 then
    redis.call('SET', KEYS[1], new_v, 'PX', pttl)
  else
    redis.call('SET', KEYS[1], new_v)
  end
end
return obj.replay_count
"#;

pub struct RedisIdemStore {
    conn: ConnectionManager,
    ns: String,
    tenant: String,
    recent_limit: usize,
    release_state_ttl: u64,
    release_script: Script,
    bump_script: Script,
}

impl RedisIdemStore {
    pub fn new(conn: ConnectionManager, tenant: impl Into<String>, recent_limit: usize) -> Self {
        Self {
            conn,
            ns: "idem".to_string(),
            tenant: tenant.into(),
            recent_limit,
            release_state_ttl: 60,
            release_script: Script::new(RELEASE_LUA),
            bump_script: Script::new(BUMP_REPLAY_LUA),
        }
    }

    pub async fn connect(url: &str, tenant: impl Into<String>, recent_limit: usize) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(StoreError::from)?;
        Ok(Self::new(conn, tenant, recent_limit))
    }

    fn k(&self, key: &str, suffix: &str) -> String {
        format!("{}:{}:{}:{}", self.ns, self.tenant, key, suffix)
    }

    fn recent_key(&self) -> String {
        format!("{}:{}:recent", self.ns, self.tenant)
    }
}

#[async_trait]
impl IdemStore for RedisIdemStore {
    async fn acquire_leader(
        &self,
        key: &str,
        ttl_s: u64,
        payload_fingerprint: &str,
    ) -> Result<AcquireOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let owner = new_owner_token();
        let payload = json!({
            "owner": owner,
            "payload_fingerprint": payload_fingerprint,
        })
        .to_string();

        let set: Option<String> = redis::cmd("SET")
            .arg(self.k(key, "lock"))
            .arg(&payload)
            .arg("NX")
            .arg("EX")
            .arg(ttl_s)
            .query_async(&mut conn)
            .await?;
        if set.is_none() {
            return Ok(AcquireOutcome {
                acquired: false,
                owner: None,
            });
        }

        let now = epoch_now();
        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(self.k(key, "state"))
            .arg("in_progress")
            .arg("EX")
            .arg(ttl_s)
            .ignore()
            .cmd("ZADD")
            .arg(self.recent_key())
            .arg(now)
            .arg(key)
            .ignore();
        if self.recent_limit > 0 {
            pipe.cmd("ZREMRANGEBYRANK")
                .arg(self.recent_key())
                .arg(0)
                .arg(-(self.recent_limit as i64) - 1)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;

        Ok(AcquireOutcome {
            acquired: true,
            owner: Some(owner),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<StoredResponse>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.k(key, "value"))
            .query_async(&mut conn)
            .await?;
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Backend(format!("decode stored value: {e}"))),
        }
    }

    async fn put(
        &self,
        key: &str,
        resp: StoredResponse,
        payload_fingerprint: &str,
        ttl_s: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // The fingerprint rides inside the value JSON so it survives the
        // lock deletion; `get` ignores the extra field on decode.
        let mut value_json = serde_json::to_value(&resp)
            .map_err(|e| StoreError::Backend(format!("encode stored value: {e}")))?;
        if let serde_json::Value::Object(map) = &mut value_json {
            map.insert(
                "payload_fingerprint".to_string(),
                serde_json::Value::String(payload_fingerprint.to_string()),
            );
        }
        let value = value_json.to_string();
        redis::pipe()
            .cmd("SET")
            .arg(self.k(key, "value"))
            .arg(value)
            .arg("EX")
            .arg(ttl_s)
            .ignore()
            .cmd("SET")
            .arg(self.k(key, "state"))
            .arg("stored")
            .arg("EX")
            .arg(ttl_s)
            .ignore()
            .cmd("DEL")
            .arg(self.k(key, "lock"))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, key: &str, owner: Option<&str>) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        match owner {
            Some(owner) => {
                let released: i64 = self
                    .release_script
                    .key(self.k(key, "lock"))
                    .key(self.k(key, "state"))
                    .arg(owner)
                    .arg(self.release_state_ttl)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(released == 1)
            }
            None => {
                let deleted: i64 = redis::cmd("DEL")
                    .arg(self.k(key, "lock"))
                    .query_async(&mut conn)
                    .await?;
                if deleted > 0 {
                    redis::cmd("SET")
                        .arg(self.k(key, "state"))
                        .arg("released")
                        .arg("EX")
                        .arg(self.release_state_ttl)
                        .query_async::<()>(&mut conn)
                        .await?;
                }
                Ok(deleted > 0)
            }
        }
    }

    async fn meta(&self, key: &str) -> Result<KeyMeta, StoreError> {
        let mut conn = self.conn.clone();
        let (state, lock_raw, value_raw): (Option<String>, Option<String>, Option<String>) =
            redis::pipe()
                .cmd("GET")
                .arg(self.k(key, "state"))
                .cmd("GET")
                .arg(self.k(key, "lock"))
                .cmd("GET")
                .arg(self.k(key, "value"))
                .query_async(&mut conn)
                .await?;

        let state = state.and_then(|s| match s.as_str() {
            "in_progress" => Some(KeyState::InProgress),
            "stored" => Some(KeyState::Stored),
            "released" => Some(KeyState::Released),
            "idle" => Some(KeyState::Idle),
            _ => None,
        });
        let extract_fp = |raw: &str| {
            serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(|v| {
                    v.get("payload_fingerprint")
                        .and_then(|f| f.as_str())
                        .map(String::from)
                })
        };
        let payload_fingerprint = lock_raw
            .as_deref()
            .and_then(extract_fp)
            .or_else(|| value_raw.as_deref().and_then(extract_fp));
        Ok(KeyMeta {
            state,
            lock: lock_raw.is_some(),
            payload_fingerprint,
        })
    }

    async fn bump_replay(
        &self,
        key: &str,
        touch_ttl_s: Option<u64>,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let touch: i64 = touch_ttl_s.map(|t| t as i64).unwrap_or(-1);
        let count: Option<i64> = self
            .bump_script
            .key(self.k(key, "value"))
            .arg(touch)
            .invoke_async(&mut conn)
            .await?;
        let Some(count) = count else {
            return Ok(None);
        };

        if let Some(touch) = touch_ttl_s {
            // Refresh state TTL and the recent score alongside the value.
            let mut pipe = redis::pipe();
            pipe.cmd("EXPIRE")
                .arg(self.k(key, "state"))
                .arg(touch)
                .ignore();
            if self.recent_limit > 0 {
                pipe.cmd("ZADD")
                    .arg(self.recent_key())
                    .arg(epoch_now())
                    .arg(key)
                    .ignore();
            }
            pipe.query_async::<()>(&mut conn).await?;
        }
        Ok(Some(count.max(0) as u64))
    }

    async fn purge(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.k(key, "value"))
            .arg(self.k(key, "state"))
            .arg(self.k(key, "lock"))
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.conn.clone();
        let items: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(self.recent_key())
            .arg(0)
            .arg(limit.saturating_sub(1) as i64)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        // Key layout is part of the wire contract with operators' tooling.
        let expected = "idem:t1:abc:lock";
        let ns = "idem";
        let got = format!("{}:{}:{}:{}", ns, "t1", "abc", "lock");
        assert_eq!(got, expected);
    }

    #[test]
    fn test_release_script_shape() {
        // Guard against accidental edits to the CAS semantics: the script
        // must read the lock, compare owner, and only then delete.
        assert!(RELEASE_LUA.contains("GET"));
        assert!(RELEASE_LUA.contains("decoded.owner == ARGV[1]"));
        assert!(RELEASE_LUA.contains("DEL"));
    }

    #[test]
    fn test_bump_script_preserves_pttl_by_default() {
        assert!(BUMP_REPLAY_LUA.contains("PTTL"));
        assert!(BUMP_REPLAY_LUA.contains("replay_count"));
    }
}
