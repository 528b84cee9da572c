use serde::Serialize;
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    config::{RateLimitPolicy, Settings},
    error::{RateLimitError, Result},
    metrics::Metrics,
    store::{AdmitRequest, RateLimitStore},
    utils::{
        event_member, generate_cache_key, key_pattern, KeyHasher, RouteName, SystemTimeSource,
        TimeSource,
    },
};

/// Error reported on a rejected check
pub const LIMIT_EXCEEDED: &str = "Ratelimit exceeded";

/// Error reported when a check was admitted because the store failed
pub const STORE_UNAVAILABLE: &str = "Rate limiting service unavailable";

/// Outcome of one admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub success: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the window stops being full
    pub reset_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RateLimitResult {
    /// Admitted only because the store could not be consulted
    pub fn is_fail_open(&self) -> bool {
        self.success && self.error.is_some()
    }
}

/// Read-only view of a client's window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStatus {
    pub count: u64,
    pub reset_time: u64,
}

/// Bounded retries against the store before giving up
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    /// Cap on one store interaction, every attempt and backoff included
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(25),
            deadline: Duration::from_millis(1_500),
        }
    }
}

/// Sliding-window rate limiter over a shared store.
///
/// The store is the only source of truth, so any number of processes sharing
/// one store enforce one limit.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    hasher: KeyHasher,
    key_prefix: String,
    time_source: Arc<dyn TimeSource>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
}

impl RateLimiter {
    /// Create a limiter with default prefix, wall-clock time and retries
    pub fn new(store: Arc<dyn RateLimitStore>, salt: &str) -> Result<Self> {
        Ok(Self {
            store,
            hasher: KeyHasher::new(salt)?,
            key_prefix: "ratelimit".to_string(),
            time_source: Arc::new(SystemTimeSource),
            metrics: Arc::new(Metrics::default()),
            retry: RetryPolicy::default(),
        })
    }

    /// Create a limiter from loaded settings
    pub fn from_settings(
        store: Arc<dyn RateLimitStore>,
        settings: &Settings,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        Ok(Self::new(store, settings.salt())?
            .with_key_prefix(settings.limiter.key_prefix.clone())
            .with_metrics(metrics)
            .with_retry(RetryPolicy {
                max_retries: settings.limiter.max_retries,
                backoff: Duration::from_millis(settings.limiter.retry_backoff_ms),
                deadline: Duration::from_millis(settings.limiter.store_deadline_ms),
            }))
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn now_millis(&self) -> u64 {
        self.time_source.now_millis()
    }

    /// Store key for a (client, route) pair
    pub fn key_for(&self, client_address: &str, route: &RouteName) -> String {
        let digest = self.hasher.digest(client_address, route);
        generate_cache_key(&self.key_prefix, route, &digest)
    }

    /// Decide whether one more request from `client_address` on `route` fits.
    ///
    /// Store faults never surface here: the request is admitted and the
    /// result carries a diagnostic `error`. Only an invalid policy is an `Err`.
    pub async fn check(
        &self,
        client_address: &str,
        route: &RouteName,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitResult> {
        policy.validate()?;
        let _timer = self.metrics.start_check_timer();

        let key = self.key_for(client_address, route);
        let now = self.now_millis();
        // Retries reuse the member so a replayed admission cannot count twice.
        let member = event_member(now);
        let request = AdmitRequest {
            key: &key,
            now_millis: now,
            window_ms: policy.window_ms,
            max_requests: policy.max_requests,
            member: &member,
            ttl_ms: policy.window_ms,
        };
        let reset_time = now.saturating_add(policy.window_ms);

        let admission = match self
            .with_retries("admit", || self.store.try_admit(&request))
            .await
        {
            Ok(admission) => admission,
            Err(e) => {
                warn!("Rate limit store failed on route {}, admitting: {}", route, e);
                self.metrics.record_fail_open(route.as_str());
                return Ok(RateLimitResult {
                    success: true,
                    limit: 0,
                    remaining: 0,
                    reset_time: now,
                    error: Some(STORE_UNAVAILABLE.to_string()),
                });
            }
        };

        if !admission.admitted {
            debug!(
                "Rejected request on route {} ({} of {} used)",
                route, admission.count, policy.max_requests
            );
            self.metrics.record_rejected(route.as_str());
            return Ok(RateLimitResult {
                success: false,
                limit: policy.max_requests,
                remaining: 0,
                reset_time,
                error: Some(LIMIT_EXCEEDED.to_string()),
            });
        }

        let used = u32::try_from(admission.count.saturating_add(1)).unwrap_or(u32::MAX);
        let remaining = policy.max_requests.saturating_sub(used);
        debug!("Admitted request on route {} ({} remaining)", route, remaining);
        self.metrics.record_admitted(route.as_str());

        Ok(RateLimitResult {
            success: true,
            limit: policy.max_requests,
            remaining,
            reset_time,
            error: None,
        })
    }

    /// Forget every recorded event for a (client, route) pair
    pub async fn reset(&self, client_address: &str, route: &RouteName) -> bool {
        let key = self.key_for(client_address, route);
        match self
            .with_retries("delete", || self.store.delete(&key))
            .await
        {
            Ok(()) => {
                info!("Reset rate limit window on route {}", route);
                self.metrics.record_reset();
                true
            }
            Err(e) => {
                warn!("Failed to reset rate limit window on route {}: {}", route, e);
                false
            }
        }
    }

    /// Current window for a (client, route) pair without recording an event
    pub async fn status(
        &self,
        client_address: &str,
        route: &RouteName,
        window_ms: u64,
    ) -> Option<WindowStatus> {
        if window_ms == 0 {
            warn!("Status requested with an empty window on route {}", route);
            return None;
        }

        let key = self.key_for(client_address, route);
        let now = self.now_millis();
        let purge_before = now.saturating_sub(window_ms);

        match self
            .with_retries("snapshot", || self.store.snapshot(&key, purge_before))
            .await
        {
            Ok(snapshot) => Some(WindowStatus {
                count: snapshot.count,
                reset_time: snapshot
                    .oldest
                    .map_or(now, |oldest| oldest.saturating_add(window_ms)),
            }),
            Err(e) => {
                warn!("Failed to read rate limit window on route {}: {}", route, e);
                None
            }
        }
    }

    /// Purge events older than `max_window_ms` from every window.
    ///
    /// Returns how many windows were left empty and therefore dropped.
    pub async fn sweep_stale(&self, max_window_ms: u64) -> Result<usize> {
        let pattern = key_pattern(&self.key_prefix);
        let keys = self
            .with_retries("scan", || self.store.scan_keys(&pattern))
            .await?;

        let purge_before = self.now_millis().saturating_sub(max_window_ms);
        let mut emptied = 0;
        for key in &keys {
            let snapshot = self
                .with_retries("snapshot", || self.store.snapshot(key, purge_before))
                .await?;
            if snapshot.count == 0 {
                emptied += 1;
            }
        }

        if emptied > 0 {
            info!("Swept {} stale rate limit windows of {}", emptied, keys.len());
        }
        self.metrics.record_swept_keys(emptied);
        Ok(emptied)
    }

    /// Run [`sweep_stale`](Self::sweep_stale) every `interval` until the task is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, max_window_ms: u64) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = limiter.sweep_stale(max_window_ms).await {
                    warn!("Rate limit sweep failed: {}", e);
                }
            }
        })
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }

    async fn with_retries<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.retry.deadline, self.attempt(operation, op)).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record_store_operation(
                    operation,
                    false,
                    self.retry.deadline.as_secs_f64(),
                );
                Err(RateLimitError::Timeout(format!(
                    "{} exceeded {}ms",
                    operation,
                    self.retry.deadline.as_millis()
                )))
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = op().await;
            self.metrics.record_store_operation(
                operation,
                result.is_ok(),
                started.elapsed().as_secs_f64(),
            );

            match result {
                Err(e) if e.is_store_fault() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    debug!("Store {} failed (attempt {}): {}", operation, attempt, e);
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                other => return other,
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("key_prefix", &self.key_prefix)
            .field("retry", &self.retry)
            .finish()
    }
}
