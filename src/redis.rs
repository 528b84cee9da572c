use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, RedisResult, Script};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::{RateLimitError, Result},
    store::{AdmitRequest, Admission, RateLimitStore, WindowSnapshot},
};

/// Purge, count, and conditionally record one event in a single round trip.
/// Returns `{admitted, count_before}`.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local purge_before = tonumber(ARGV[2])
local max_requests = tonumber(ARGV[3])
local member = ARGV[4]
local ttl_ms = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', purge_before)
local count = redis.call('ZCARD', key)
if redis.call('ZSCORE', key, member) then
    return {1, count - 1}
end
if count >= max_requests then
    return {0, count}
end

redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, ttl_ms)
return {1, count}
"#;

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    /// How long a failed connect is remembered before trying again
    pub reconnect_cooldown: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            reconnect_cooldown: Duration::from_secs(1),
        }
    }
}

impl RedisConfig {
    /// Build a config pointing at `host:port`
    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self {
            url: format!("redis://{}:{}", host, port),
            ..Default::default()
        }
    }
}

/// Sliding-window store backed by Redis sorted sets
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisConfig,
    admit_script: Arc<Script>,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with PING
    pub async fn connect(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let connection_result =
            tokio::time::timeout(config.connection_timeout, client.get_connection_manager()).await;

        let connection = match connection_result {
            Ok(Ok(conn)) => {
                debug!("Connection manager established");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(RateLimitError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}ms)",
                    config.connection_timeout.as_millis()
                );
                return Err(RateLimitError::Timeout(
                    "creating Redis connection manager".to_string(),
                ));
            }
        };

        let store = Self {
            connection,
            config,
            admit_script: Arc::new(Script::new(ADMIT_SCRIPT)),
        };
        store.health_check().await?;

        info!("Redis store initialized successfully");
        Ok(store)
    }

    /// Run a Redis future under the configured command timeout
    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::Timeout(operation.to_string())),
        }
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn try_admit(&self, request: &AdmitRequest<'_>) -> Result<Admission> {
        let mut conn = self.connection.clone();
        let mut invocation = self.admit_script.prepare_invoke();
        invocation
            .key(request.key)
            .arg(request.now_millis)
            .arg(request.purge_before())
            .arg(request.max_requests)
            .arg(request.member)
            .arg(request.ttl_ms.max(1));

        let (admitted, count): (i64, i64) = self
            .timed("admit", invocation.invoke_async(&mut conn))
            .await?;

        Ok(Admission {
            admitted: admitted == 1,
            count: count.max(0) as u64,
        })
    }

    async fn snapshot(&self, key: &str, purge_before: u64) -> Result<WindowSnapshot> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrembyscore(key, "-inf", purge_before)
            .ignore()
            .zcard(key)
            .zrange_withscores(key, 0, 0);

        let (count, oldest): (u64, Vec<(String, f64)>) =
            self.timed("snapshot", pipe.query_async(&mut conn)).await?;

        Ok(WindowSnapshot {
            count,
            oldest: oldest.first().map(|(_, score)| *score as u64),
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = self.timed("delete", conn.del(key)).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = self
            .timed("scan", conn.scan_match(pattern))
            .await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.timed("ping", redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }
}

/// Process-wide Redis handle created on first use.
///
/// Concurrent first callers share one connect attempt. A failed attempt is
/// remembered for `reconnect_cooldown`, and callers during that time fail
/// immediately instead of queueing for their own connect. `close` drops the
/// connection so the next call reconnects.
pub struct SharedStore {
    config: RedisConfig,
    state: RwLock<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    store: Option<Arc<RedisStore>>,
    failed_at: Option<Instant>,
}

impl ConnectionState {
    fn ready(&self, cooldown: Duration) -> Option<Result<Arc<RedisStore>>> {
        if let Some(store) = &self.store {
            return Some(Ok(store.clone()));
        }
        match self.failed_at {
            Some(at) if at.elapsed() < cooldown => Some(Err(RateLimitError::Store(
                "Redis unreachable, waiting before reconnecting".to_string(),
            ))),
            _ => None,
        }
    }
}

impl SharedStore {
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ConnectionState::default()),
        }
    }

    /// Current store, connecting if no connection exists yet
    pub async fn get(&self) -> Result<Arc<RedisStore>> {
        let cooldown = self.config.reconnect_cooldown;
        if let Some(ready) = self.state.read().await.ready(cooldown) {
            return ready;
        }

        let mut state = self.state.write().await;
        // Another caller may have connected or failed while we waited
        if let Some(ready) = state.ready(cooldown) {
            return ready;
        }

        // Counts as failed until it succeeds, so a caller cancelled mid-connect
        // still starts the cooldown
        state.failed_at = Some(Instant::now());
        let store = Arc::new(RedisStore::connect(self.config.clone()).await?);
        state.store = Some(store.clone());
        state.failed_at = None;
        Ok(store)
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.store.is_some()
    }

    /// Drop the shared connection
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        state.failed_at = None;
        if state.store.take().is_some() {
            info!("Closed shared Redis connection");
        }
    }
}

#[async_trait]
impl RateLimitStore for SharedStore {
    async fn try_admit(&self, request: &AdmitRequest<'_>) -> Result<Admission> {
        self.get().await?.try_admit(request).await
    }

    async fn snapshot(&self, key: &str, purge_before: u64) -> Result<WindowSnapshot> {
        self.get().await?.snapshot(key, purge_before).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.get().await?.delete(key).await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.get().await?.scan_keys(pattern).await
    }

    async fn health_check(&self) -> Result<()> {
        self.get().await?.health_check().await
    }
}
