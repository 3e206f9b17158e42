//! Redis-backed overflow queue.
//!
//! ## Layout
//!
//! - `{name}:pending`: list; producers `LPUSH`, consumers take from the right
//! - `{name}:processing`: list of reserved payloads, one entry per in-flight task
//! - `{name}:reserved`: sorted set of in-flight payloads, scored by reserved-at epoch millis
//! - `{name}:delayed`: sorted set of retries, scored by visible-at epoch millis
//! - `{name}:dead`: list of dead-letter records
//! - `{name}:corrupt`: payloads that failed to decode, kept for inspection
//!
//! A reservation moves the payload from `pending` to `processing` and records
//! its reserved-at time in one script, so a crash between reserve and ack
//! leaves the task recoverable. A receipt is `{reserved_at}:{payload}`; it
//! settles only while that exact reservation is still live.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, trace};

use super::backend::{OverflowQueue, QueueError};
use super::task::{DeadLetter, DeferredTask, Delivery};

/// KEYS[1] delayed; KEYS[2] pending; ARGV[1] now in ms. Returns promoted count.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, payload in ipairs(due) do
  redis.call('ZREM', KEYS[1], payload)
  redis.call('RPUSH', KEYS[2], payload)
end
return #due
"#;

/// KEYS[1] pending; KEYS[2] processing; KEYS[3] reserved; ARGV[1] now in ms.
/// Returns the reserved payload, or nil.
const RESERVE_SCRIPT: &str = r#"
local payload = redis.call('LMOVE', KEYS[1], KEYS[2], 'RIGHT', 'LEFT')
if payload then
  redis.call('ZADD', KEYS[3], ARGV[1], payload)
end
return payload
"#;

/// KEYS[1] processing; KEYS[2] reserved; KEYS[3] destination.
/// ARGV[1] payload; ARGV[2] reserved-at; ARGV[3] 'ack' | 'delay' | 'push';
/// ARGV[4] destination payload; ARGV[5] delayed score.
/// Returns 1 if the receipt still owned the reservation, else 0 with nothing written.
const SETTLE_SCRIPT: &str = r#"
local score = redis.call('ZSCORE', KEYS[2], ARGV[1])
if (not score) or tonumber(score) ~= tonumber(ARGV[2]) then
  return 0
end
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
if ARGV[3] == 'delay' then
  redis.call('ZADD', KEYS[3], ARGV[5], ARGV[4])
elseif ARGV[3] == 'push' then
  redis.call('LPUSH', KEYS[3], ARGV[4])
end
return 1
"#;

/// KEYS[1] processing; KEYS[2] pending; KEYS[3] reserved. Returns recovered count.
const RECOVER_SCRIPT: &str = r#"
local count = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT') do
  count = count + 1
end
redis.call('DEL', KEYS[3])
return count
"#;

/// KEYS[1] reserved; KEYS[2] processing; KEYS[3] pending; ARGV[1] cutoff in ms.
/// Returns requeued count.
const REQUEUE_STALLED_SCRIPT: &str = r#"
local stalled = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local count = 0
for _, payload in ipairs(stalled) do
  redis.call('ZREM', KEYS[1], payload)
  if redis.call('LREM', KEYS[2], 1, payload) == 1 then
    redis.call('RPUSH', KEYS[3], payload)
    count = count + 1
  end
end
return count
"#;

/// How a settled delivery leaves the processing list.
enum Settle<'a> {
    Ack,
    Delay { payload: &'a str, visible_at: i64 },
    Push { payload: &'a str },
}

/// Split a receipt into its reserved-at score and payload.
fn parse_receipt(receipt: &str) -> Option<(i64, &str)> {
    let (reserved_at, payload) = receipt.split_once(':')?;
    Some((reserved_at.parse().ok()?, payload))
}

/// Configuration for the Redis queue.
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Key namespace for the queue's lists
    pub name: String,
    /// Upper bound on a single Redis round trip
    pub timeout: Duration,
    /// Sleep between polls while the queue is empty
    pub poll_interval: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            name: "task-queue".to_string(),
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// A durable overflow queue stored in Redis lists.
#[derive(Clone)]
pub struct RedisQueue {
    connection: ConnectionManager,
    config: RedisQueueConfig,
    pending_key: String,
    processing_key: String,
    reserved_key: String,
    delayed_key: String,
    dead_key: String,
    corrupt_key: String,
    promote: Script,
    reserve: Script,
    settle: Script,
    recover: Script,
    requeue_stalled: Script,
}

impl fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Connect to Redis with the given configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str, config: RedisQueueConfig) -> Result<Self, QueueError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(connection, config))
    }

    /// Build a queue on an existing connection, e.g. one shared with the store.
    pub fn with_connection(connection: ConnectionManager, config: RedisQueueConfig) -> Self {
        let key = |suffix: &str| format!("{}:{}", config.name, suffix);
        Self {
            pending_key: key("pending"),
            processing_key: key("processing"),
            reserved_key: key("reserved"),
            delayed_key: key("delayed"),
            dead_key: key("dead"),
            corrupt_key: key("corrupt"),
            promote: Script::new(PROMOTE_SCRIPT),
            reserve: Script::new(RESERVE_SCRIPT),
            settle: Script::new(SETTLE_SCRIPT),
            recover: Script::new(RECOVER_SCRIPT),
            requeue_stalled: Script::new(REQUEUE_STALLED_SCRIPT),
            connection,
            config,
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, QueueError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.config.timeout, op)
            .await
            .map_err(|_| QueueError::Timeout(self.config.timeout))?
            .map_err(QueueError::from)
    }

    async fn promote_due(&self) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let now = Utc::now().timestamp_millis();
        let promoted: i64 = self
            .bounded(
                self.promote
                    .key(&self.delayed_key)
                    .key(&self.pending_key)
                    .arg(now)
                    .invoke_async(&mut conn),
            )
            .await?;
        if promoted > 0 {
            trace!(promoted, "Promoted delayed tasks");
        }
        Ok(())
    }

    async fn try_reserve(&self) -> Result<Option<Delivery>, QueueError> {
        self.promote_due().await?;

        let mut conn = self.connection.clone();
        let reserved_at = Utc::now().timestamp_millis();
        let payload: Option<String> = self
            .bounded(
                self.reserve
                    .key(&self.pending_key)
                    .key(&self.processing_key)
                    .key(&self.reserved_key)
                    .arg(reserved_at)
                    .invoke_async(&mut conn),
            )
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<DeferredTask>(&payload) {
            Ok(task) => Ok(Some(Delivery::new(
                task,
                format!("{}:{}", reserved_at, payload),
            ))),
            Err(e) => {
                error!(error = %e, "Quarantining undecodable task payload");
                let _: () = self
                    .bounded(
                        redis::pipe()
                            .atomic()
                            .lrem(&self.processing_key, 1, &payload)
                            .ignore()
                            .zrem(&self.reserved_key, &payload)
                            .ignore()
                            .lpush(&self.corrupt_key, &payload)
                            .ignore()
                            .query_async(&mut conn),
                    )
                    .await?;
                Err(QueueError::Serialization(e.to_string()))
            }
        }
    }

    /// Remove a delivery from the processing list and apply `settle`, but
    /// only if its reservation is still live.
    async fn settle_delivery(&self, delivery: &Delivery, settle: Settle<'_>) -> Result<(), QueueError> {
        let unknown = || QueueError::UnknownDelivery(delivery.task().id.to_string());
        let (reserved_at, payload) = parse_receipt(delivery.receipt()).ok_or_else(unknown)?;

        let (mode, destination, new_payload, score) = match settle {
            Settle::Ack => ("ack", &self.dead_key, "", 0),
            Settle::Delay {
                payload: next,
                visible_at,
            } => ("delay", &self.delayed_key, next, visible_at),
            Settle::Push { payload: next } => ("push", &self.dead_key, next, 0),
        };

        let mut conn = self.connection.clone();
        let settled: i64 = self
            .bounded(
                self.settle
                    .key(&self.processing_key)
                    .key(&self.reserved_key)
                    .key(destination)
                    .arg(payload)
                    .arg(reserved_at)
                    .arg(mode)
                    .arg(new_payload)
                    .arg(score)
                    .invoke_async(&mut conn),
            )
            .await?;

        if settled == 0 {
            debug!(task_id = %delivery.task().id, mode, "Delivery is no longer reserved");
            return Err(unknown());
        }
        Ok(())
    }
}

#[async_trait]
impl OverflowQueue for RedisQueue {
    async fn enqueue(&self, task: &DeferredTask) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.connection.clone();
        let _: i64 = self.bounded(conn.lpush(&self.pending_key, payload)).await?;
        Ok(())
    }

    async fn reserve(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_reserve().await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle_delivery(delivery, Settle::Ack).await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut task = delivery.task().clone();
        task.attempts += 1;
        let payload = serde_json::to_string(&task)?;
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        self.settle_delivery(
            delivery,
            Settle::Delay {
                payload: &payload,
                visible_at,
            },
        )
        .await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let record = DeadLetter::new(delivery.task().clone(), reason);
        let payload = serde_json::to_string(&record)?;
        self.settle_delivery(delivery, Settle::Push { payload: &payload }).await
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        let recovered: i64 = self
            .bounded(
                self.recover
                    .key(&self.processing_key)
                    .key(&self.pending_key)
                    .key(&self.reserved_key)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(recovered.max(0) as usize)
    }

    async fn requeue_stalled(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let mut conn = self.connection.clone();
        let requeued: i64 = self
            .bounded(
                self.requeue_stalled
                    .key(&self.reserved_key)
                    .key(&self.processing_key)
                    .key(&self.pending_key)
                    .arg(cutoff)
                    .invoke_async(&mut conn),
            )
            .await?;
        if requeued > 0 {
            debug!(requeued, "Requeued stalled tasks");
        }
        Ok(requeued.max(0) as usize)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let mut conn = self.connection.clone();
        let payloads: Vec<String> = self.bounded(conn.lrange(&self.dead_key, 0, -1)).await?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(QueueError::from))
            .collect()
    }

    async fn pending(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        let len: usize = self.bounded(conn.llen(&self.pending_key)).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_splits_at_first_colon() {
        let payload = r#"{"client":"a:b"}"#;
        let receipt = format!("{}:{}", 1_700_000_000_123i64, payload);
        assert_eq!(parse_receipt(&receipt), Some((1_700_000_000_123, payload)));
    }

    #[test]
    fn test_malformed_receipt_is_rejected() {
        assert_eq!(parse_receipt("no-score"), None);
        assert_eq!(parse_receipt("abc:{}"), None);
    }
}
