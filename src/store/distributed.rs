//! Redis-backed counter store.
//!
//! Every process pointed at the same Redis shares counters, so quotas hold
//! across replicas. Atomicity is delegated to Redis: `increment` runs as a
//! `MULTI`/`EXEC` pipeline; the sliding window and token bucket updates run as
//! server-side scripts.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::{BucketLevel, BucketSpec, CounterStore, StoreBackend, StoreError, WindowLog};

/// Trim the JSON timestamp log at KEYS[1] to entries after ARGV[1] - ARGV[2]
/// and append ARGV[1] if fewer than ARGV[3] remain. Returns
/// `{admitted, count, oldest}`.
const APPEND_WITHIN_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local horizon = now - window
local kept = {}
local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, decoded = pcall(cjson.decode, raw)
  if ok and type(decoded) == 'table' then
    for _, ts in ipairs(decoded) do
      if type(ts) == 'number' and ts > horizon then
        table.insert(kept, ts)
      end
    end
  end
end
table.sort(kept)
if #kept >= limit then
  return {0, #kept, kept[1]}
end
table.insert(kept, now)
redis.call('SET', KEYS[1], cjson.encode(kept), 'EX', window)
return {1, #kept, kept[1]}
"#;

/// Refill the JSON bucket at KEYS[1] to ARGV[1] (Unix ms) at ARGV[3] tokens
/// per second, capped at ARGV[2], and take one token if a whole one is
/// available. The bucket expires after ARGV[4] seconds. Returns
/// `{admitted, tostring(tokens)}`; floats would be truncated as integer replies.
const TAKE_TOKEN_SCRIPT: &str = r#"
local now_ms = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local tokens = capacity
local last_refill = now_ms
local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, state = pcall(cjson.decode, raw)
  if ok and type(state) == 'table' and type(state.tokens) == 'number'
      and type(state.last_refill) == 'number' and state.tokens >= 0 then
    tokens = state.tokens
    last_refill = state.last_refill
  end
end
local elapsed = math.max(now_ms - last_refill, 0) / 1000
tokens = math.min(tokens + elapsed * rate, capacity)
if tokens + 1e-9 < 1 then
  return {0, tostring(tokens)}
end
tokens = math.max(tokens - 1, 0)
redis.call('SET', KEYS[1], cjson.encode({tokens = tokens, last_refill = now_ms}), 'EX', ttl)
return {1, tostring(tokens)}
"#;

/// Counter store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    operation_timeout: Duration,
    append_within_window: Script,
    take_token: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis and verify it answers a `PING`.
    ///
    /// Both the connection and the ping must finish within `connect_timeout`.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        operation_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        info!(
            addr = %client.get_connection_info().addr,
            timeout_ms = connect_timeout.as_millis() as u64,
            "Connecting to Redis"
        );

        let mut conn = timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))??;

        let pong: String = timeout(connect_timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))??;
        debug!(reply = %pong, "Redis ping succeeded");

        Ok(Self {
            conn,
            operation_timeout,
            append_within_window: Script::new(APPEND_WITHIN_WINDOW_SCRIPT),
            take_token: Script::new(TAKE_TOKEN_SCRIPT),
        })
    }

    /// Bound a single round trip by the operation timeout.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => {
                debug!(
                    op,
                    timeout_ms = self.operation_timeout.as_millis() as u64,
                    "Redis operation timed out"
                );
                Err(StoreError::Timeout(self.operation_timeout))
            }
        }
    }
}

/// Redis expiries are whole seconds; never let a TTL round down to zero.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.run("get", conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.run("set", conn.set_ex(key, value, ttl_secs(ttl))).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self.run("delete", conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();

        // INCRBY and EXPIRE commit together so a counter never lives without a TTL.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(key, amount)
            .expire(key, ttl_secs(ttl) as i64)
            .ignore();

        let (count,): (i64,) = self.run("increment", pipe.query_async(&mut conn)).await?;
        trace!(key = %key, count, "Incremented counter");
        Ok(count)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        self.run("exists", conn.exists(key)).await
    }

    async fn append_within_window(
        &self,
        key: &str,
        now: u64,
        window: u64,
        limit: u64,
    ) -> Result<WindowLog, StoreError> {
        let mut conn = self.conn.clone();

        let mut invocation = self.append_within_window.prepare_invoke();
        invocation.key(key).arg(now).arg(window).arg(limit);

        let (admitted, count, oldest): (i64, u64, u64) = self
            .run("append_within_window", invocation.invoke_async(&mut conn))
            .await?;
        Ok(WindowLog {
            admitted: admitted == 1,
            count,
            oldest: (count > 0).then_some(oldest),
        })
    }

    async fn take_token(
        &self,
        key: &str,
        now_ms: u64,
        shape: &BucketSpec,
    ) -> Result<BucketLevel, StoreError> {
        let mut conn = self.conn.clone();

        let mut invocation = self.take_token.prepare_invoke();
        invocation
            .key(key)
            .arg(now_ms)
            .arg(shape.capacity)
            .arg(shape.refill_rate)
            .arg(ttl_secs(shape.ttl));

        let (admitted, tokens): (i64, String) = self
            .run("take_token", invocation.invoke_async(&mut conn))
            .await?;
        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| StoreError::Serialization(format!("bucket level '{}': {}", tokens, e)))?;
        Ok(BucketLevel {
            admitted: admitted == 1,
            tokens,
        })
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = self
            .run("clear", redis::cmd("FLUSHDB").query_async(&mut conn))
            .await?;
        Ok(())
    }

    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    /// Connect to the Redis named by `REDIS_URL`, if any.
    ///
    /// These tests are skipped when no Redis is available. They use unique
    /// keys and never call `clear`, so they are safe against a shared server.
    async fn test_store() -> Option<RedisStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        RedisStore::connect(&url, Duration::from_secs(5), Duration::from_secs(2))
            .await
            .ok()
    }

    fn unique_key(name: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("quotaguard-test:{}:{}", name, nanos)
    }

    #[tokio::test]
    async fn test_connect_unreachable_fails() {
        let result = RedisStore::connect(
            "redis://127.0.0.1:1/",
            Duration::from_millis(300),
            Duration::from_millis(300),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_url_is_backend_error() {
        let err = Client::open("not a url").map_err(StoreError::from).unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn test_ttl_never_rounds_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(7200)), 7200);
    }

    #[tokio::test]
    async fn test_redis_set_get_delete() {
        let Some(store) = test_store().await else { return };
        let key = unique_key("set");

        store.set(&key, "value", MINUTE).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("value"));
        assert!(store.exists(&key).await.unwrap());

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_redis_increment_sets_expiry() {
        let Some(store) = test_store().await else { return };
        let key = unique_key("incr");

        assert_eq!(store.increment(&key, 1, MINUTE).await.unwrap(), 1);
        assert_eq!(store.increment(&key, 4, MINUTE).await.unwrap(), 5);

        let mut conn = store.conn.clone();
        let ttl: i64 = conn.ttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 60, "counter must carry a TTL, got {}", ttl);

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_append_within_window() {
        let Some(store) = test_store().await else { return };
        let key = unique_key("log");

        for expected in 1..=2 {
            let log = store.append_within_window(&key, 1_000, 60, 2).await.unwrap();
            assert!(log.admitted);
            assert_eq!(log.count, expected);
            assert_eq!(log.oldest, Some(1_000));
        }
        let log = store.append_within_window(&key, 1_010, 60, 2).await.unwrap();
        assert!(!log.admitted);
        assert_eq!(log.count, 2);

        // The stored log stays readable by the in-process transition
        let raw = store.get(&key).await.unwrap();
        let (log, _) = super::super::state::append_timestamp(raw.as_deref(), 1_060, 60, 2);
        assert!(log.admitted);
        assert_eq!(log.count, 1);

        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_take_token() {
        let Some(store) = test_store().await else { return };
        let key = unique_key("bucket");
        let shape = BucketSpec {
            capacity: 2.0,
            refill_rate: 1.0,
            ttl: MINUTE,
        };

        let level = store.take_token(&key, 5_000, &shape).await.unwrap();
        assert!(level.admitted);
        assert!((level.tokens - 1.0).abs() < 1e-9);
        assert!(store.take_token(&key, 5_000, &shape).await.unwrap().admitted);
        assert!(!store.take_token(&key, 5_500, &shape).await.unwrap().admitted);
        assert!(store.take_token(&key, 6_000, &shape).await.unwrap().admitted);

        store.delete(&key).await.unwrap();
    }
}
