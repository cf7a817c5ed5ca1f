//! Redis-backed store shared across gateway instances.
//!
//! Each record is a hash at `<key_prefix><key>` with two fields:
//! - `count`: requests counted in the current window
//! - `window_start`: window start as unix milliseconds
//!
//! Records carry no TTL. A stale record is reset the next time its key is seen.
//!
//! The connection is opened on first use, so the gateway starts and fails
//! open while Redis is unreachable.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::OnceCell;
use tracing::{info, trace, warn};

use super::ThrottleStore;
use crate::error::{Result, ThrottleError};
use crate::throttle::{CategoryRule, Decision, ThrottleRecord};

const FIELD_COUNT: &str = "count";
const FIELD_WINDOW_START: &str = "window_start";

/// Fixed-window check executed server-side; mirrors `throttle::decide`.
const ATOMIC_CHECK_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local fields = redis.call('HMGET', KEYS[1], 'count', 'window_start')
local count = tonumber(fields[1])
local start = tonumber(fields[2])
if count == nil or start == nil or (now - start) > window_ms then
  redis.call('HSET', KEYS[1], 'count', 1, 'window_start', now)
  return {1, math.max(limit - 1, 0), 0}
end
local elapsed = math.max(now - start, 0)
if count + 1 > limit then
  return {0, 0, math.max(math.ceil((window_ms - elapsed) / 1000), 1)}
end
redis.call('HSET', KEYS[1], 'count', count + 1)
return {1, limit - count - 1, 0}
"#;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1/`
    pub url: String,
    /// Prefix prepended to every record key
    pub key_prefix: String,
    /// Upper bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Time to wait after a failed attempt before trying again
    pub reconnect_cooldown: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            key_prefix: "ruralguru:throttle:".to_string(),
            connect_timeout: Duration::from_millis(1000),
            reconnect_cooldown: Duration::from_secs(5),
        }
    }
}

pub struct RedisStore {
    client: Client,
    manager: OnceCell<ConnectionManager>,
    last_failed_connect: Mutex<Option<Instant>>,
    key_prefix: String,
    connect_timeout: Duration,
    reconnect_cooldown: Duration,
    atomic_check: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .field("connected", &self.manager.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Build a store without touching the network.
    ///
    /// Only the URL is validated here. The first store call connects; until a
    /// connection succeeds every call returns an error, which the throttle
    /// turns into a fail-open decision.
    pub fn new(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;

        Ok(Self {
            client,
            manager: OnceCell::new(),
            last_failed_connect: Mutex::new(None),
            key_prefix: config.key_prefix,
            connect_timeout: config.connect_timeout,
            reconnect_cooldown: config.reconnect_cooldown,
            atomic_check: Script::new(ATOMIC_CHECK_SCRIPT),
        })
    }

    /// Return a handle to the shared connection, connecting if needed.
    ///
    /// Each attempt is bounded by `connect_timeout`. After a failure, calls
    /// inside `reconnect_cooldown` fail immediately instead of retrying.
    pub async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(manager) = self.manager.get() {
            return Ok(manager.clone());
        }

        let last_failed = *self.last_failed_connect.lock();
        if let Some(failed_at) = last_failed {
            if failed_at.elapsed() < self.reconnect_cooldown {
                return Err(ThrottleError::Store(
                    "redis unavailable, waiting before reconnecting".to_string(),
                ));
            }
        }

        let result = self
            .manager
            .get_or_try_init(|| async {
                match tokio::time::timeout(
                    self.connect_timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                {
                    Ok(connected) => Ok(connected?),
                    Err(_) => Err(ThrottleError::Store(format!(
                        "redis connect timed out after {:?}",
                        self.connect_timeout
                    ))),
                }
            })
            .await;

        match result {
            Ok(manager) => {
                info!(prefix = %self.key_prefix, "Connected to Redis throttle store");
                *self.last_failed_connect.lock() = None;
                Ok(manager.clone())
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to Redis throttle store");
                *self.last_failed_connect.lock() = Some(Instant::now());
                Err(e)
            }
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn write(&self, record: &ThrottleRecord) -> Result<()> {
        let mut conn = self.connection().await?;
        let fields = encode_fields(record);
        let _: () = conn
            .hset_multiple(self.redis_key(&record.key), &fields)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ThrottleStore for RedisStore {
    async fn fetch(&self, key: &str) -> Result<Option<ThrottleRecord>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.redis_key(key)).await?;
        Ok(decode_record(key, &fields))
    }

    async fn insert(&self, record: &ThrottleRecord) -> Result<()> {
        self.write(record).await
    }

    async fn update(&self, record: &ThrottleRecord) -> Result<()> {
        self.write(record).await
    }

    async fn check_atomic(
        &self,
        key: &str,
        rule: &CategoryRule,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let mut conn = self.connection().await?;
        let reply: Vec<i64> = self
            .atomic_check
            .key(self.redis_key(key))
            .arg(now.timestamp_millis())
            .arg(rule.window_secs.saturating_mul(1000))
            .arg(rule.limit)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, reply = ?reply, "Atomic throttle script reply");
        decode_script_reply(&reply)
    }
}

fn encode_fields(record: &ThrottleRecord) -> [(&'static str, String); 2] {
    [
        (FIELD_COUNT, record.count.to_string()),
        (
            FIELD_WINDOW_START,
            record.window_start.timestamp_millis().to_string(),
        ),
    ]
}

/// Rebuild a record from its hash fields.
///
/// An empty hash means no record. A hash missing either field, or holding a
/// value that does not parse, is also treated as no record so the next write
/// replaces it. The atomic script resets such hashes the same way.
fn decode_record(key: &str, fields: &HashMap<String, String>) -> Option<ThrottleRecord> {
    if fields.is_empty() {
        return None;
    }

    let count = fields.get(FIELD_COUNT).and_then(|v| v.parse::<u64>().ok());
    let window_start = fields
        .get(FIELD_WINDOW_START)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_millis);

    match (count, window_start) {
        (Some(count), Some(window_start)) => Some(ThrottleRecord {
            key: key.to_string(),
            count,
            window_start,
        }),
        _ => {
            warn!(key = %key, fields = ?fields, "Discarding undecodable throttle record");
            None
        }
    }
}

fn decode_script_reply(reply: &[i64]) -> Result<Decision> {
    match reply {
        [1, remaining, _] => Ok(Decision::Allowed {
            remaining: (*remaining).max(0) as u64,
        }),
        [0, _, retry_after] => Ok(Decision::Denied {
            retry_after_secs: (*retry_after).max(1) as u64,
        }),
        other => Err(ThrottleError::Store(format!(
            "unexpected throttle script reply: {:?}",
            other
        ))),
    }
}
