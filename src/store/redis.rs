//! Redis store backend.
//!
//! Counter updates and record writes run as server-side Lua scripts so the
//! increment-and-compare and compare-and-set operations stay atomic when
//! several proxy processes share the store.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;

use super::{SharedStore, StoreError, VersionedRecord, WindowDecision};

/// Redis-backed [`SharedStore`].
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    check_and_count: redis::Script,
    charge: redis::Script,
    swap_record: redis::Script,
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            check_and_count: redis::Script::new(
                r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local current = tonumber(redis.call("GET", KEYS[1]) or "0")

local ttl = redis.call("TTL", KEYS[1])
if ttl < 0 then ttl = window end

if current + 1 > limit then
  return { 0, current, ttl }
end

current = redis.call("INCR", KEYS[1])
if current == 1 then
  redis.call("EXPIRE", KEYS[1], window)
  ttl = window
end
return { 1, current, ttl }
"#,
            ),
            charge: redis::Script::new(
                r#"
local amount = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local total = redis.call("INCRBY", KEYS[1], amount)
if redis.call("TTL", KEYS[1]) < 0 then
  redis.call("EXPIRE", KEYS[1], window)
end
return total
"#,
            ),
            swap_record: redis::Script::new(
                r#"
local expected = tonumber(ARGV[1])
local ver = tonumber(redis.call("HGET", KEYS[1], "ver") or "0")
if ver ~= expected then
  return 0
end
redis.call("HSET", KEYS[1], "ver", ver + 1, "data", ARGV[2])
return 1
"#,
            ),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    /// Round-trip check used at startup.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get("switchyard:__ping__").await?;
        Ok(())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn check_and_count(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
    ) -> Result<WindowDecision, StoreError> {
        let mut conn = self.connection().await?;
        let result: Vec<i64> = self
            .check_and_count
            .key(key)
            .arg(limit)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;

        match result.as_slice() {
            [allowed, count, ttl] => Ok(WindowDecision {
                allowed: *allowed == 1,
                count: *count,
                retry_after: Duration::from_secs((*ttl).max(0) as u64),
            }),
            other => Err(StoreError::Protocol(format!(
                "unexpected counter script reply: {:?}",
                other
            ))),
        }
    }

    async fn charge(&self, key: &str, amount: i64, window: Duration) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let total: i64 = self
            .charge
            .key(key)
            .arg(amount)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(total)
    }

    async fn read_counter(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn load_record(&self, key: &str) -> Result<Option<VersionedRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg("ver")
            .arg("data")
            .query_async(&mut conn)
            .await?;

        match raw.as_slice() {
            [Some(ver), Some(data)] => {
                let version = ver
                    .parse::<u64>()
                    .map_err(|_| StoreError::Protocol(format!("bad record version: {}", ver)))?;
                Ok(Some(VersionedRecord {
                    value: data.clone(),
                    version,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn swap_record(
        &self,
        key: &str,
        expected_version: u64,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let swapped: i64 = self
            .swap_record
            .key(key)
            .arg(expected_version)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn delete_record(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
