//! Store tests against a real Redis server. They need Docker:
//! `cargo test --test redis_store_tests -- --ignored`

use sliding_ratelimit::{
    config::RateLimitPolicy,
    limiter::RateLimiter,
    redis::{RedisConfig, RedisStore, SharedStore},
    store::{AdmitRequest, Admission, RateLimitStore},
    utils::{ManualTimeSource, RouteName, TimeSource},
};
use std::{sync::Arc, time::Duration};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

const START: u64 = 1_700_000_000_000;

fn start_redis(docker: &Cli) -> (Container<'_, GenericImage>, RedisConfig) {
    let image = GenericImage::new("redis", "7.2-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    let container = docker.run(image);
    let config = RedisConfig {
        url: format!("redis://127.0.0.1:{}", container.get_host_port_ipv4(6379)),
        ..Default::default()
    };
    (container, config)
}

fn create_limiter(store: Arc<dyn RateLimitStore>, clock: Arc<ManualTimeSource>) -> Arc<RateLimiter> {
    Arc::new(
        RateLimiter::new(store, "redis-test-salt")
            .unwrap()
            .with_time_source(clock),
    )
}

fn admit<'a>(key: &'a str, now: u64, member: &'a str, max_requests: u32) -> AdmitRequest<'a> {
    AdmitRequest {
        key,
        now_millis: now,
        window_ms: 60_000,
        max_requests,
        member,
        ttl_ms: 60_000,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_admission_boundary_and_sliding_expiry() {
    let docker = Cli::default();
    let (_container, config) = start_redis(&docker);
    let store = Arc::new(SharedStore::new(config));
    let clock = Arc::new(ManualTimeSource::new(START));
    let limiter = create_limiter(store.clone(), clock.clone());

    let route = RouteName::new("login").unwrap();
    let policy = RateLimitPolicy::new(3, 60_000).unwrap();

    for expected in [2, 1, 0] {
        let result = limiter.check("10.0.0.1", &route, &policy).await.unwrap();
        assert!(result.success);
        assert!(result.error.is_none());
        assert_eq!(result.remaining, expected);
        assert_eq!(result.reset_time, START + 60_000);
    }
    assert!(store.is_connected().await);

    let rejected = limiter.check("10.0.0.1", &route, &policy).await.unwrap();
    assert!(!rejected.success);
    assert_eq!(rejected.error.as_deref(), Some("Ratelimit exceeded"));

    // Just inside the window the earlier events still count
    clock.set(START + 59_999);
    assert!(!limiter.check("10.0.0.1", &route, &policy).await.unwrap().success);

    // Events scored exactly one window ago fall out
    clock.set(START + 60_000);
    let result = limiter.check("10.0.0.1", &route, &policy).await.unwrap();
    assert!(result.success);
    assert_eq!(result.remaining, 2);

    store.close().await;
    assert!(!store.is_connected().await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_replayed_member_counts_once() {
    let docker = Cli::default();
    let (_container, config) = start_redis(&docker);
    let store = RedisStore::connect(config).await.unwrap();

    let first = store.try_admit(&admit("replay", START, "a", 1)).await.unwrap();
    assert_eq!(first, Admission { admitted: true, count: 0 });

    let other = store.try_admit(&admit("replay", START, "b", 1)).await.unwrap();
    assert_eq!(other, Admission { admitted: false, count: 1 });

    let replay = store.try_admit(&admit("replay", START, "a", 1)).await.unwrap();
    assert_eq!(replay, Admission { admitted: true, count: 0 });

    let snapshot = store.snapshot("replay", START - 60_000).await.unwrap();
    assert_eq!(snapshot.count, 1);
    assert_eq!(snapshot.oldest, Some(START));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_keys_expire_after_ttl() {
    let docker = Cli::default();
    let (_container, config) = start_redis(&docker);
    let store = RedisStore::connect(config).await.unwrap();

    let request = AdmitRequest {
        ttl_ms: 200,
        ..admit("ratelimit:ttl:key", START, "a", 5)
    };
    assert!(store.try_admit(&request).await.unwrap().admitted);
    assert_eq!(store.scan_keys("ratelimit:*").await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(store.scan_keys("ratelimit:*").await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_redis_status_reset_and_sweep() {
    let docker = Cli::default();
    let (_container, config) = start_redis(&docker);
    let store = Arc::new(RedisStore::connect(config).await.unwrap());
    let clock = Arc::new(ManualTimeSource::new(START));
    let limiter = create_limiter(store.clone(), clock.clone());

    let route = RouteName::new("monitoring").unwrap();
    let policy = RateLimitPolicy::new(5, 60_000).unwrap();

    limiter.check("10.0.0.1", &route, &policy).await.unwrap();
    clock.advance(1_000);
    limiter.check("10.0.0.1", &route, &policy).await.unwrap();
    limiter.check("10.0.0.2", &route, &policy).await.unwrap();

    let status = limiter.status("10.0.0.1", &route, 60_000).await.unwrap();
    assert_eq!(status.count, 2);
    assert_eq!(status.reset_time, START + 60_000);

    assert!(limiter.reset("10.0.0.1", &route).await);
    let status = limiter.status("10.0.0.1", &route, 60_000).await.unwrap();
    assert_eq!(status.count, 0);
    assert_eq!(status.reset_time, clock.now_millis());

    // Only 10.0.0.2 still has a window, and it goes stale after one more window
    assert_eq!(limiter.sweep_stale(60_000).await.unwrap(), 0);
    clock.advance(60_000);
    assert_eq!(limiter.sweep_stale(60_000).await.unwrap(), 1);
    assert!(store.scan_keys("ratelimit:*").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Docker"]
async fn test_redis_concurrent_checks_take_last_slot_once() {
    let docker = Cli::default();
    let (_container, config) = start_redis(&docker);
    let store = Arc::new(RedisStore::connect(config).await.unwrap());
    let clock = Arc::new(ManualTimeSource::new(START));
    let limiter = create_limiter(store, clock);

    let route = RouteName::new("commands").unwrap();
    let policy = RateLimitPolicy::new(5, 60_000).unwrap();
    for _ in 0..4 {
        assert!(limiter.check("10.0.0.1", &route, &policy).await.unwrap().success);
    }

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        let route = route.clone();
        handles.push(tokio::spawn(async move {
            limiter.check("10.0.0.1", &route, &policy).await.unwrap()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.error.is_none() || !result.success);
        if result.success {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);
}
