//! Redis distributed tier.

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::{AsyncCommands, Script};
use std::sync::LazyLock;
use std::time::Duration;

use super::{DistributedTier, DistributedValue};
use crate::error::CacheError;

/// Distributed tier on a pooled Redis connection. Keys are namespaced with
/// `prefix` so several deployments can share one Redis.
#[derive(Clone)]
pub struct RedisDistributedTier {
    pool: Pool,
    prefix: String,
}

impl RedisDistributedTier {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }
}

/// Keys fetched per SCAN step when deleting by prefix.
const SCAN_BATCH: usize = 200;

/// INCRBY, then an expiry for a counter that has none (new, or left
/// without one by an earlier partial write).
static INCREMENT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
",
    )
});

/// Set-if-greater with expiry.
static RAISE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0') or 0
local target = tonumber(ARGV[1])
if target > current then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return target
end
return current
",
    )
});

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Escape glob metacharacters so a literal prefix can be used in MATCH.
fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len() + 4);
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl DistributedTier for RedisDistributedTier {
    async fn get(&self, key: &str) -> Result<Option<DistributedValue>, CacheError> {
        let key = self.key(key);
        let mut conn = self.pool.get().await?;
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .get(&key)
            .cmd("PTTL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        Ok(value.map(|value| DistributedValue {
            value,
            // -1: no expiry, -2: expired between GET and PTTL
            ttl_remaining: match pttl {
                -1 => None,
                ms if ms < 0 => Some(Duration::ZERO),
                ms => Some(Duration::from_millis(ms as u64)),
            },
        }))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        conn.pset_ex::<_, _, ()>(self.key(key), value, ttl_millis(ttl))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.pool.get().await?;
        let value: i64 = INCREMENT
            .key(self.key(key))
            .arg(delta)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn raise(&self, key: &str, value: i64, ttl: Duration) -> Result<i64, CacheError> {
        let mut conn = self.pool.get().await?;
        let current: i64 = RAISE
            .key(self.key(key))
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(current)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let pattern = format!("{}*", escape_glob(&self.key(prefix)));
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        // SCAN walks the keyspace without blocking the server.
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let removed: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                deleted += removed;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        tracing::debug!(prefix = %prefix, deleted, "deleted distributed keys by prefix");
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
