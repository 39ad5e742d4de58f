//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! Redis 协调存储的集成测试。本地没有 Redis 时直接跳过。

#[path = "../common/mod.rs"]
mod common;

use common::{generate_unique_name, is_redis_available, redis_store_config, setup_logging};
use oxtier::backend::store::{LogPosition, ReleaseOutcome, TryAcquireOutcome};
use oxtier::backend::{CoordinationStore, RemoteTier};
use oxtier::config::Config;
use oxtier::{Coordinator, RedisStore};
use std::time::Duration;

macro_rules! require_redis {
    () => {
        if !is_redis_available().await {
            println!("Redis not available, skipping test");
            return;
        }
    };
}

async fn store() -> RedisStore {
    RedisStore::connect(&redis_store_config()).await.unwrap()
}

#[tokio::test]
async fn test_lock_scripts_follow_hash_protocol() {
    setup_logging();
    require_redis!();
    let store = store().await;
    let name = generate_unique_name("lock:it");

    assert_eq!(
        store.try_acquire(&name, "a", 5000).await.unwrap(),
        TryAcquireOutcome::Acquired
    );
    assert_eq!(
        store.try_acquire(&name, "a", 5000).await.unwrap(),
        TryAcquireOutcome::Acquired
    );
    match store.try_acquire(&name, "b", 5000).await.unwrap() {
        TryAcquireOutcome::Contended { wait_millis } => {
            assert!(wait_millis > 0 && wait_millis <= 5000)
        }
        other => panic!("expected contention, got {:?}", other),
    }

    assert!(store.renew(&name, "a", 5000).await.unwrap());
    assert!(!store.renew(&name, "b", 5000).await.unwrap());

    assert_eq!(
        store.release(&name, "a", 5000).await.unwrap(),
        ReleaseOutcome::StillHeld
    );
    assert_eq!(
        store.release(&name, "a", 5000).await.unwrap(),
        ReleaseOutcome::FullyReleased
    );
    assert_eq!(
        store.release(&name, "a", 5000).await.unwrap(),
        ReleaseOutcome::AlreadyReleased
    );
    assert_eq!(
        store.try_acquire(&name, "b", 5000).await.unwrap(),
        TryAcquireOutcome::Acquired
    );
    store.release(&name, "b", 5000).await.unwrap();
}

#[tokio::test]
async fn test_lease_expires_without_renewal() {
    setup_logging();
    require_redis!();
    let store = store().await;
    let name = generate_unique_name("lock:it");

    store.try_acquire(&name, "a", 150).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        store.try_acquire(&name, "b", 5000).await.unwrap(),
        TryAcquireOutcome::Acquired
    );
    store.release(&name, "b", 5000).await.unwrap();
}

#[tokio::test]
async fn test_append_and_read_after_server_time() {
    setup_logging();
    require_redis!();
    let store = store().await;
    let topic = generate_unique_name("oxtier:it:sync");

    let now = store.server_time_millis().await.unwrap();
    let start = LogPosition::just_before(now);
    let first = store
        .append(&topic, vec![("n".to_string(), b"1".to_vec())], 100)
        .await
        .unwrap();
    let second = store
        .append(&topic, vec![("n".to_string(), b"2".to_vec())], 100)
        .await
        .unwrap();
    assert!(first < second);

    let records = store
        .read(&topic, start, 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].position, first);
    assert_eq!(records[1].fields, vec![("n".to_string(), b"2".to_vec())]);

    let rest = store
        .read(&topic, second, 10, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_remote_tier_prefix_clear() {
    setup_logging();
    require_redis!();
    let store = store().await;
    let prefix = generate_unique_name("cache");

    store
        .set(&format!("{}:a", prefix), b"1".to_vec(), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    store
        .set(&format!("{}:b", prefix), b"2".to_vec(), None)
        .await
        .unwrap();
    assert_eq!(
        store.get(&format!("{}:a", prefix)).await.unwrap(),
        Some(b"1".to_vec())
    );

    store.clear_prefix(&format!("{}:", prefix)).await.unwrap();
    assert_eq!(store.get(&format!("{}:a", prefix)).await.unwrap(), None);
    assert_eq!(store.get(&format!("{}:b", prefix)).await.unwrap(), None);
}

#[tokio::test]
async fn test_coordinators_share_lock_over_redis() {
    setup_logging();
    require_redis!();
    let mut config = Config::default();
    config.store = redis_store_config();
    config.lock.lease_millis = 2000;
    config.sync.channel = generate_unique_name("oxtier:it:sync");

    let a = Coordinator::connect(config.clone()).await.unwrap();
    let b = Coordinator::connect(config).await.unwrap();
    let cache = generate_unique_name("users");

    let lock_a = a.lock_provider(&cache).acquire("k");
    let lock_b = b.lock_provider(&cache).acquire("k");
    assert!(lock_a.try_lock().await.unwrap());
    assert!(!lock_b.try_lock().await.unwrap());
    lock_a.unlock().await.unwrap();
    assert!(lock_b.try_lock_for(Duration::from_millis(500)).await.unwrap());
    lock_b.unlock().await.unwrap();

    a.shutdown().await;
    b.shutdown().await;
}
