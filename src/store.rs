use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

use crate::{
    error::Result,
    utils::{SystemTimeSource, TimeSource},
};

/// One admission attempt against a sliding window
#[derive(Debug, Clone)]
pub struct AdmitRequest<'a> {
    pub key: &'a str,
    pub now_millis: u64,
    pub window_ms: u64,
    pub max_requests: u32,
    /// Sorted-set member recorded if the attempt is admitted
    pub member: &'a str,
    pub ttl_ms: u64,
}

impl AdmitRequest<'_> {
    /// Events scored at or below this value have left the window
    pub fn purge_before(&self) -> u64 {
        self.now_millis.saturating_sub(self.window_ms)
    }
}

/// Outcome of [`RateLimitStore::try_admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Events in the window before this attempt was considered
    pub count: u64,
}

/// Read-only view of a window after purging stale events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub count: u64,
    /// Score of the oldest surviving event
    pub oldest: Option<u64>,
}

/// Backing store for sliding windows.
///
/// Every implementation must run `try_admit` as one atomic unit: purge, count,
/// decide, then append. Two callers racing for the last slot must never both
/// be admitted.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn try_admit(&self, request: &AdmitRequest<'_>) -> Result<Admission>;

    /// Purge events scored at or below `purge_before` and report what is left
    async fn snapshot(&self, key: &str, purge_before: u64) -> Result<WindowSnapshot>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys matching a glob pattern
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct Window {
    /// (score, member), ascending by score
    events: Vec<(u64, String)>,
    expires_at: Option<u64>,
}

impl Window {
    fn purge(&mut self, purge_before: u64) {
        let cut = self.events.partition_point(|(score, _)| *score <= purge_before);
        self.events.drain(..cut);
    }

    fn insert(&mut self, score: u64, member: String) {
        let at = self.events.partition_point(|(s, _)| *s <= score);
        self.events.insert(at, (score, member));
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store for tests and single-node deployments.
///
/// A single lock guards every window, so each operation is atomic with
/// respect to every other caller in the process.
pub struct MemoryStore {
    windows: Mutex<HashMap<String, Window>>,
    time_source: Arc<dyn TimeSource>,
}

impl MemoryStore {
    pub fn new(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            time_source,
        }
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = self.time_source.now_millis();
        let windows = self.windows.lock().await;
        windows.values().filter(|w| !w.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn drop_expired(windows: &mut HashMap<String, Window>, key: &str, now: u64) {
        if windows.get(key).is_some_and(|w| w.is_expired(now)) {
            windows.remove(key);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemTimeSource))
    }
}

/// Redis-style glob matching restricted to `*`
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn try_admit(&self, request: &AdmitRequest<'_>) -> Result<Admission> {
        let mut windows = self.windows.lock().await;
        let now = self.time_source.now_millis();
        Self::drop_expired(&mut windows, request.key, now);

        let window = windows.entry(request.key.to_string()).or_default();
        window.purge(request.purge_before());
        let count = window.events.len() as u64;

        // Replay of an admission that already landed
        if window.events.iter().any(|(_, m)| m == request.member) {
            return Ok(Admission {
                admitted: true,
                count: count.saturating_sub(1),
            });
        }

        if count >= u64::from(request.max_requests) {
            if window.events.is_empty() {
                windows.remove(request.key);
            }
            return Ok(Admission {
                admitted: false,
                count,
            });
        }

        window.insert(request.now_millis, request.member.to_string());
        window.expires_at = Some(now.saturating_add(request.ttl_ms));
        Ok(Admission {
            admitted: true,
            count,
        })
    }

    async fn snapshot(&self, key: &str, purge_before: u64) -> Result<WindowSnapshot> {
        let mut windows = self.windows.lock().await;
        let now = self.time_source.now_millis();
        Self::drop_expired(&mut windows, key, now);

        let Some(window) = windows.get_mut(key) else {
            return Ok(WindowSnapshot {
                count: 0,
                oldest: None,
            });
        };
        window.purge(purge_before);
        let snapshot = WindowSnapshot {
            count: window.events.len() as u64,
            oldest: window.events.first().map(|(score, _)| *score),
        };
        if window.events.is_empty() {
            windows.remove(key);
        }
        Ok(snapshot)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.windows.lock().await.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = self.time_source.now_millis();
        let windows = self.windows.lock().await;
        let mut keys: Vec<String> = windows
            .iter()
            .filter(|(key, window)| !window.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualTimeSource;

    fn admit<'a>(key: &'a str, now: u64, member: &'a str) -> AdmitRequest<'a> {
        AdmitRequest {
            key,
            now_millis: now,
            window_ms: 1_000,
            max_requests: 2,
            member,
            ttl_ms: 1_000,
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("ratelimit:*", "ratelimit:login:abc"));
        assert!(!glob_match("ratelimit:*", "other:login:abc"));
        assert!(glob_match("*:login:*", "ratelimit:login:abc"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("*", "anything"));
    }

    #[tokio::test]
    async fn test_try_admit_stops_at_limit() {
        let clock = Arc::new(ManualTimeSource::new(10_000));
        let store = MemoryStore::new(clock.clone());

        let first = store.try_admit(&admit("k", 10_000, "a")).await.unwrap();
        let second = store.try_admit(&admit("k", 10_000, "b")).await.unwrap();
        let third = store.try_admit(&admit("k", 10_000, "c")).await.unwrap();

        assert_eq!(first, Admission { admitted: true, count: 0 });
        assert_eq!(second, Admission { admitted: true, count: 1 });
        assert_eq!(third, Admission { admitted: false, count: 2 });

        let snapshot = store.snapshot("k", 9_000).await.unwrap();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.oldest, Some(10_000));
    }

    #[tokio::test]
    async fn test_replayed_member_is_not_counted_twice() {
        let store = MemoryStore::new(Arc::new(ManualTimeSource::new(10_000)));

        store.try_admit(&admit("k", 10_000, "a")).await.unwrap();
        store.try_admit(&admit("k", 10_000, "b")).await.unwrap();
        let replay = store.try_admit(&admit("k", 10_000, "b")).await.unwrap();

        assert_eq!(replay, Admission { admitted: true, count: 1 });
        assert_eq!(store.snapshot("k", 9_000).await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_snapshot_purges_stale_events() {
        let clock = Arc::new(ManualTimeSource::new(10_000));
        let store = MemoryStore::new(clock.clone());

        store.try_admit(&admit("k", 10_000, "a")).await.unwrap();
        store.try_admit(&admit("k", 10_500, "b")).await.unwrap();

        let snapshot = store.snapshot("k", 10_000).await.unwrap();
        assert_eq!(snapshot, WindowSnapshot { count: 1, oldest: Some(10_500) });

        let snapshot = store.snapshot("k", 10_500).await.unwrap();
        assert_eq!(snapshot, WindowSnapshot { count: 0, oldest: None });
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_keys_expire_after_ttl() {
        let clock = Arc::new(ManualTimeSource::new(10_000));
        let store = MemoryStore::new(clock.clone());

        store.try_admit(&admit("k", 10_000, "a")).await.unwrap();
        assert_eq!(store.len().await, 1);

        clock.advance(1_000);
        assert_eq!(store.len().await, 0);
        assert!(store.scan_keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_scan() {
        let store = MemoryStore::new(Arc::new(ManualTimeSource::new(10_000)));
        store.try_admit(&admit("ratelimit:a:1", 10_000, "x")).await.unwrap();
        store.try_admit(&admit("ratelimit:b:1", 10_000, "y")).await.unwrap();
        store.try_admit(&admit("other:a:1", 10_000, "z")).await.unwrap();

        let keys = store.scan_keys("ratelimit:*").await.unwrap();
        assert_eq!(keys, vec!["ratelimit:a:1".to_string(), "ratelimit:b:1".to_string()]);

        store.delete("ratelimit:a:1").await.unwrap();
        let keys = store.scan_keys("ratelimit:*").await.unwrap();
        assert_eq!(keys, vec!["ratelimit:b:1".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_admission_never_overshoots() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualTimeSource::new(10_000))));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let member = format!("m{}", i);
                store
                    .try_admit(&admit("k", 10_000, &member))
                    .await
                    .unwrap()
                    .admitted
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }
}
