//! Redis store backend, the reference deployment.
//!
//! Fenced release/refresh, bounded adjustment, and the token bucket step
//! run as Lua scripts so each is one atomic execution server-side.
//! Elapsed time for the bucket comes from the Redis `TIME` command, never
//! from client clocks. `wait_for_change` falls back to bounded polling;
//! Redis change notification requires keyspace events the deployment may
//! not have enabled.

use std::time::Duration;

use async_trait::async_trait;
use redis::FromRedisValue;
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::AdjustBounds;
use super::AdjustOutcome;
use super::AtomicStore;
use super::CollectionStore;
use super::RefillPolicy;
use super::StoreError;
use super::TakeOutcome;
use super::error::CorruptedSnafu;
use super::error::UnavailableSnafu;
use crate::constants::MAX_TRANSIENT_RETRIES;
use crate::constants::TRANSIENT_RETRY_DELAY_MS;
use crate::constants::WAIT_POLL_INTERVAL_MS;

const RELEASE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const REFRESH_TTL: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const ATOMIC_ADJUST: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local next = current + tonumber(ARGV[1])
if next < tonumber(ARGV[2]) or next > tonumber(ARGV[3]) then
    return {0, current}
end
if next == 0 then
    redis.call('DEL', KEYS[1])
else
    redis.call('SET', KEYS[1], next)
    if tonumber(ARGV[4]) > 0 then
        redis.call('PEXPIRE', KEYS[1], ARGV[4])
    end
end
return {1, next}
"#;

// Refill by server-side elapsed time, then take one token or leave the
// bucket untouched. The bucket key expires after two idle periods; an
// expired bucket reads as full, which is exactly what two idle periods
// imply.
const BUCKET_TAKE: &str = r#"
local rate = tonumber(ARGV[1])
local period_ms = tonumber(ARGV[2])
local time = redis.call('TIME')
local now_ms = time[1] * 1000 + math.floor(time[2] / 1000)
local tokens = rate
local last_ms = now_ms
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_ms')
if state[1] then
    tokens = tonumber(state[1])
    last_ms = tonumber(state[2])
end
local elapsed = now_ms - last_ms
if elapsed < 0 then
    elapsed = 0
end
local refilled = tokens + elapsed * rate / period_ms
if refilled > rate then
    refilled = rate
end
if refilled >= 1 then
    redis.call('HSET', KEYS[1], 'tokens', refilled - 1, 'last_ms', now_ms)
    redis.call('PEXPIRE', KEYS[1], period_ms * 2)
    return {1, math.floor(refilled - 1)}
end
return {0, math.ceil((1 - refilled) * period_ms / rate)}
"#;

/// Store adapter over a Redis deployment.
///
/// Connections multiplex through a [`ConnectionManager`], which reconnects
/// on failure; on top of that, each operation retries transient I/O errors
/// a bounded number of times before surfacing
/// [`StoreError::Unavailable`] - never silently forever.
pub struct RedisStore {
    manager: ConnectionManager,
    release_script: Script,
    refresh_script: Script,
    adjust_script: Script,
    bucket_script: Script,
}

impl RedisStore {
    /// Connect to the Redis deployment at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| UnavailableSnafu { reason: e.to_string() }.build())?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| UnavailableSnafu { reason: e.to_string() }.build())?;
        Ok(Self::with_manager(manager))
    }

    /// Build a store over an existing connection manager.
    pub fn with_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            release_script: Script::new(RELEASE_IF_OWNER),
            refresh_script: Script::new(REFRESH_TTL),
            adjust_script: Script::new(ATOMIC_ADJUST),
            bucket_script: Script::new(BUCKET_TAKE),
        }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, StoreError> {
        let mut attempt = 0u32;
        loop {
            let mut conn = self.manager.clone();
            match cmd.query_async(&mut conn).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    debug!(attempt, error = %e, "transient store error, retrying");
                    tokio::time::sleep(Duration::from_millis(TRANSIENT_RETRY_DELAY_MS)).await;
                }
                Err(e) => return UnavailableSnafu { reason: e.to_string() }.fail(),
            }
        }
    }

    async fn invoke<T: FromRedisValue>(&self, invocation: &redis::ScriptInvocation<'_>) -> Result<T, StoreError> {
        let mut attempt = 0u32;
        loop {
            let mut conn = self.manager.clone();
            match invocation.invoke_async(&mut conn).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < MAX_TRANSIENT_RETRIES => {
                    attempt += 1;
                    debug!(attempt, error = %e, "transient store error, retrying");
                    tokio::time::sleep(Duration::from_millis(TRANSIENT_RETRY_DELAY_MS)).await;
                }
                Err(e) => return UnavailableSnafu { reason: e.to_string() }.fail(),
            }
        }
    }
}

fn is_transient(error: &redis::RedisError) -> bool {
    error.is_io_error() || error.is_connection_dropped() || error.is_connection_refusal()
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn acquire_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(owner).arg("NX").arg("PX").arg(ttl.as_millis() as u64);
        let reply: Option<String> = self.query(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn release_if_owner(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut invocation = self.release_script.prepare_invoke();
        invocation.key(key).arg(owner);
        let deleted: i64 = self.invoke(&invocation).await?;
        Ok(deleted == 1)
    }

    async fn refresh_ttl(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut invocation = self.refresh_script.prepare_invoke();
        invocation.key(key).arg(owner).arg(ttl.as_millis() as u64);
        let refreshed: i64 = self.invoke(&invocation).await?;
        Ok(refreshed == 1)
    }

    async fn atomic_adjust(&self, key: &str, delta: i64, bounds: AdjustBounds) -> Result<AdjustOutcome, StoreError> {
        let ttl_ms = bounds.ttl.map_or(0, |ttl| ttl.as_millis() as u64);
        let mut invocation = self.adjust_script.prepare_invoke();
        invocation.key(key).arg(delta).arg(bounds.min).arg(bounds.max).arg(ttl_ms);
        let (applied, value): (i64, i64) = self.invoke(&invocation).await?;
        if applied == 1 {
            Ok(AdjustOutcome::Applied(value))
        } else {
            Ok(AdjustOutcome::Rejected { current: value })
        }
    }

    async fn read_counter(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<String> = self.query(&cmd).await?;
        match value {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .map_err(|_| CorruptedSnafu { key, reason: format!("non-numeric counter '{raw}'") }.build()),
        }
    }

    async fn bucket_take(&self, key: &str, refill: &RefillPolicy) -> Result<TakeOutcome, StoreError> {
        if refill.rate == 0 {
            return Ok(TakeOutcome::Throttled { retry_after: refill.period });
        }
        let mut invocation = self.bucket_script.prepare_invoke();
        invocation.key(key).arg(refill.rate).arg(refill.period.as_millis() as u64);
        let (admitted, value): (i64, i64) = self.invoke(&invocation).await?;
        if admitted == 1 {
            Ok(TakeOutcome::Admitted { remaining: value as u32 })
        } else {
            Ok(TakeOutcome::Throttled { retry_after: Duration::from_millis(value as u64) })
        }
    }

    async fn wait_for_change(&self, key: &str, timeout: Duration) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let snapshot: Option<String> = self.query(&cmd).await?;

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            tokio::time::sleep(remaining.min(Duration::from_millis(WAIT_POLL_INTERVAL_MS))).await;
            let current: Option<String> = self.query(&cmd).await?;
            if current != snapshot {
                return Ok(true);
            }
        }
    }
}

#[async_trait]
impl CollectionStore for RedisStore {
    async fn remove_key(&self, key: &str) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.query(&cmd).await?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        let _: i64 = self.query(&cmd).await?;
        Ok(())
    }

    async fn hash_set_if_absent(&self, key: &str, field: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("HSETNX");
        cmd.arg(key).arg(field).arg(value);
        let written: i64 = self.query(&cmd).await?;
        Ok(written == 1)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.query(&cmd).await
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(field);
        let removed: i64 = self.query(&cmd).await?;
        Ok(removed == 1)
    }

    async fn hash_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("HLEN");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut cmd = redis::cmd("HKEYS");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn list_push_back(&self, key: &str, value: Vec<u8>) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(value);
        self.query(&cmd).await
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("LPOP");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn list_pop_back(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("RPOP");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn list_get(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("LINDEX");
        cmd.arg(key).arg(index);
        self.query(&cmd).await
    }

    async fn list_set(&self, key: &str, index: i64, value: Vec<u8>) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("LSET");
        cmd.arg(key).arg(index).arg(value);
        let result: Result<(), StoreError> = self.query(&cmd).await;
        match result {
            Ok(()) => Ok(true),
            // LSET answers with an error reply for a missing key or an
            // index out of range; both mean "nothing to overwrite" here.
            Err(StoreError::Unavailable { reason }) if reason.contains("index out of range") || reason.contains("no such key") => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.query(&cmd).await
    }

    async fn list_remove(&self, key: &str, value: &[u8], count: u64) -> Result<u64, StoreError> {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(key).arg(count).arg(value);
        self.query(&cmd).await
    }

    async fn list_pop_front_timeout(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(key).arg(timeout.as_secs_f64());
        let reply: Option<(String, Vec<u8>)> = self.query(&cmd).await?;
        Ok(reply.map(|(_, value)| value))
    }
}
