//! Shared counter store backed by Redis.
//!
//! Counters live in Redis so every instance sees the same limiter state.
//! Each operation is a single Lua script, which Redis runs atomically.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::CounterBackend;
use super::counter::{CountExpiry, CounterResult, DistributedCount};
use crate::error::CounterError;

const INCREMENT_SCRIPT: &str = r#"
local value = redis.call('INCRBYFLOAT', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
if ttl > 0 and (ARGV[3] == 'write' or redis.call('PTTL', KEYS[1]) < 0) then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return value
"#;

const DECREMENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return '0'
end
return redis.call('INCRBYFLOAT', KEYS[1], ARGV[1])
"#;

const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current ~= tonumber(ARGV[1]) then
    return 0
end
local ttl = tonumber(ARGV[3])
if ttl <= 0 then
    redis.call('SET', KEYS[1], ARGV[2])
elseif ARGV[4] == 'create' and redis.call('PTTL', KEYS[1]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
else
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ttl)
end
return 1
"#;

struct Scripts {
    increment: Script,
    decrement: Script,
    compare_and_set: Script,
}

/// Backend creating Redis-backed counters over one shared connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(url: &str) -> CounterResult<Self> {
        debug!(url = %url, "Connecting to Redis counter store");

        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            scripts: Arc::new(Scripts {
                increment: Script::new(INCREMENT_SCRIPT),
                decrement: Script::new(DECREMENT_SCRIPT),
                compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
            }),
        })
    }
}

impl CounterBackend for RedisBackend {
    fn counter(&self, key: &str, expiry: CountExpiry) -> Arc<dyn DistributedCount> {
        Arc::new(RedisCount {
            key: key.to_string(),
            expiry,
            conn: self.conn.clone(),
            scripts: self.scripts.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// A counter stored under one Redis key.
pub struct RedisCount {
    key: String,
    expiry: CountExpiry,
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

/// Longest TTL Redis accepts without overflowing its expire clock.
const MAX_TTL_MS: u128 = 1 << 53;

/// TTL in milliseconds (0 for none) and the expiry mode name passed to scripts.
fn ttl_args(expiry: CountExpiry) -> (u128, &'static str) {
    let millis = |ttl: std::time::Duration| ttl.as_millis().clamp(1, MAX_TTL_MS);
    match expiry {
        CountExpiry::Never => (0, "none"),
        CountExpiry::AfterCreate(ttl) => (millis(ttl), "create"),
        CountExpiry::AfterWrite(ttl) => (millis(ttl), "write"),
    }
}

fn parse_value(raw: &str) -> CounterResult<f64> {
    raw.parse::<f64>()
        .map_err(|e| CounterError::Backend(format!("non-numeric counter value {:?}: {}", raw, e)))
}

#[async_trait]
impl DistributedCount for RedisCount {
    fn key(&self) -> &str {
        &self.key
    }

    async fn get(&self) -> CounterResult<f64> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&self.key).await?;
        match raw {
            Some(raw) => parse_value(&raw),
            None => Ok(0.0),
        }
    }

    async fn set(&self, value: f64) -> CounterResult<()> {
        let mut conn = self.conn.clone();
        let (ttl, _) = ttl_args(self.expiry);
        if ttl > 0 {
            let _: () = conn.pset_ex(&self.key, value.to_string(), ttl as u64).await?;
        } else {
            let _: () = conn.set(&self.key, value.to_string()).await?;
        }
        Ok(())
    }

    async fn increment(&self, delta: f64) -> CounterResult<f64> {
        let (ttl, mode) = ttl_args(self.expiry);
        let mut conn = self.conn.clone();
        let raw: String = self
            .scripts
            .increment
            .key(&self.key)
            .arg(delta.to_string())
            .arg(ttl.to_string())
            .arg(mode)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %self.key, delta = delta, value = %raw, "Incremented shared counter");
        parse_value(&raw)
    }

    async fn decrement(&self, delta: f64) -> CounterResult<f64> {
        let mut conn = self.conn.clone();
        let raw: String = self
            .scripts
            .decrement
            .key(&self.key)
            .arg((-delta).to_string())
            .invoke_async(&mut conn)
            .await?;
        parse_value(&raw)
    }

    async fn compare_and_set(&self, expected: f64, value: f64) -> CounterResult<bool> {
        let (ttl, mode) = ttl_args(self.expiry);
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .scripts
            .compare_and_set
            .key(&self.key)
            .arg(expected.to_string())
            .arg(value.to_string())
            .arg(ttl.to_string())
            .arg(mode)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("12.5").unwrap(), 12.5);
        assert_eq!(parse_value("3").unwrap(), 3.0);
        assert!(matches!(parse_value("abc"), Err(CounterError::Backend(_))));
    }

    #[test]
    fn test_ttl_args() {
        assert_eq!(ttl_args(CountExpiry::Never), (0, "none"));
        assert_eq!(ttl_args(CountExpiry::AfterCreate(Duration::from_secs(2))), (2000, "create"));
        assert_eq!(ttl_args(CountExpiry::AfterWrite(Duration::from_micros(10))), (1, "write"));
        assert_eq!(ttl_args(CountExpiry::AfterWrite(Duration::MAX)), (MAX_TTL_MS, "write"));
    }

    #[tokio::test]
    #[ignore = "requires a live Redis server"]
    async fn test_redis_counter_operations() {
        let backend = RedisBackend::connect(&redis_url()).await.unwrap();
        let key = format!("floodgate-test:{}", std::process::id());
        let count = backend.counter(&key, CountExpiry::AfterCreate(Duration::from_secs(5)));

        count.set(0.0).await.unwrap();
        assert_eq!(count.increment(2.0).await.unwrap(), 2.0);
        assert_eq!(count.decrement(1.0).await.unwrap(), 1.0);
        assert!(!count.compare_and_set(5.0, 7.0).await.unwrap());
        assert!(count.compare_and_set(1.0, 7.0).await.unwrap());
        assert_eq!(count.get().await.unwrap(), 7.0);
    }
}
