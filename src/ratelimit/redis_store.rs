//! Redis-backed counting store.
//!
//! Every consumption runs as a single Lua script, so the read, the capacity
//! check, the increment and the expiry are one atomic step on the server.
//! Redis key expiry resets windows; nothing is ever deleted explicitly.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use std::time::Duration;
use tracing::trace;

use super::store::{CountingStore, StoreError, WindowSnapshot};

/// KEYS[1] window key; ARGV[1] capacity; ARGV[2] window length in ms.
/// Returns {admitted, points, pttl}.
const CONSUME_SCRIPT: &str = r#"
local window_ms = tonumber(ARGV[2])
local points = tonumber(redis.call('GET', KEYS[1]) or '0')
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  points = 0
  ttl = window_ms
  redis.call('SET', KEYS[1], 0, 'PX', window_ms)
end
if points + 1 > tonumber(ARGV[1]) then
  return {0, points, ttl}
end
points = redis.call('INCR', KEYS[1])
return {1, points, ttl}
"#;

/// A counting store shared through Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (`redis://` or `rediss://` for TLS)
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(connection))
    }

    /// Build a store on an existing connection, e.g. one shared with the queue.
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(CONSUME_SCRIPT),
        }
    }
}

#[async_trait]
impl CountingStore for RedisStore {
    async fn consume(
        &self,
        key: &str,
        capacity: u64,
        window: Duration,
    ) -> Result<WindowSnapshot, StoreError> {
        // ConnectionManager is a cheap multiplexed handle; no lock is held across the call.
        let mut conn = self.connection.clone();
        let window_ms = window.as_millis() as u64;

        let (admitted, points, ttl): (i64, i64, i64) = self
            .script
            .key(key)
            .arg(capacity)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, admitted, points, ttl, "Consumption script returned");

        if points < 0 || ttl < 0 {
            return Err(StoreError::Protocol(format!(
                "negative window state for {}: points={}, ttl={}",
                key, points, ttl
            )));
        }

        Ok(WindowSnapshot {
            admitted: admitted == 1,
            points_consumed: points as u64,
            expires_in: Duration::from_millis(ttl as u64),
        })
    }

    async fn points(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection.clone();
        let points: Option<u64> = conn.get(key).await?;
        Ok(points)
    }
}
