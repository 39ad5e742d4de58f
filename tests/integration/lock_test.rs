//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 分布式锁的多实例集成测试，多个协调器共享一个进程内存储。

#[path = "../common/mod.rs"]
mod common;

use common::{instances, memory_config, setup_logging};
use oxtier::backend::CoordinationStore;
use oxtier::{CacheError, MemoryStore};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 多个实例随机交错加解锁，任意时刻至多一个持有者
#[tokio::test]
async fn test_mutual_exclusion_across_instances() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 4);
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();

    for coordinator in &coordinators {
        for _ in 0..3 {
            let provider = coordinator.lock_provider("orders");
            let store = store.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let lock = provider.acquire("hot");
                    lock.lock().await.unwrap();

                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    assert_eq!(store.lock_holders("lock:orders:hot").len(), 1);
                    let hold = rand::thread_rng().gen_range(0..3);
                    tokio::time::sleep(Duration::from_millis(hold)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);

                    lock.unlock().await.unwrap();
                    provider.release("hot");
                }
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(store.lock_holders("lock:orders:hot").is_empty());
    for coordinator in &coordinators {
        assert_eq!(coordinator.lock_provider("orders").active_handles(), 0);
    }
}

/// A 在 200ms 释放，B 应在释放后很快拿到锁，而不是等满整个租约
#[tokio::test]
async fn test_waiter_acquires_soon_after_release() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 2);
    let a = coordinators[0].lock_provider("users");
    let b = coordinators[1].lock_provider("users");

    let lock_a = a.acquire("k");
    lock_a.lock().await.unwrap();
    let start = Instant::now();

    let waiter = tokio::spawn({
        let b = b.clone();
        async move {
            let lock_b = b.acquire("k");
            lock_b.lock().await.unwrap();
            let elapsed = start.elapsed();
            lock_b.unlock().await.unwrap();
            b.release("k");
            elapsed
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    lock_a.unlock().await.unwrap();
    a.release("k");

    let elapsed = waiter.await.unwrap();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(600), "waited {:?}", elapsed);
}

/// 持有者崩溃（不续期也不解锁）后，其他实例最多等待一个租约
#[tokio::test]
async fn test_crashed_holder_expires_after_lease() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    store
        .try_acquire("lock:users:k", "crashed-instance", 300)
        .await
        .unwrap();

    let coordinators = instances(&store, &memory_config(), 1);
    let provider = coordinators[0].lock_provider("users");
    let lock = provider.acquire("k");

    let start = Instant::now();
    lock.lock().await.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "acquired after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(700), "acquired after {:?}", elapsed);

    lock.unlock().await.unwrap();
    provider.release("k");
}

/// 续期让锁在超过租约的持有时间内保持有效
#[tokio::test]
async fn test_renewal_outlives_lease() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let mut config = memory_config();
    config.lock.lease_millis = 300;
    let coordinators = instances(&store, &config, 2);
    let a = coordinators[0].lock_provider("users");
    let b = coordinators[1].lock_provider("users");

    let lock_a = a.acquire("k");
    lock_a.lock().await.unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;

    let lock_b = b.acquire("k");
    assert!(!lock_b.try_lock().await.unwrap());
    assert!(coordinators[0].metrics().lease_renewed >= 2);

    lock_a.unlock().await.unwrap();
    assert!(lock_b.try_lock().await.unwrap());
    lock_b.unlock().await.unwrap();
    a.release("k");
    b.release("k");
}

/// 存储在一个租约内持续不可达时续期放弃，之后的 unlock 是无操作
#[tokio::test]
async fn test_lease_lost_makes_unlock_a_no_op() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let mut config = memory_config();
    config.lock.lease_millis = 200;
    let coordinators = instances(&store, &config, 2);
    let a = coordinators[0].lock_provider("users");

    let lock = a.acquire("k");
    lock.lock().await.unwrap();
    store.set_available(false);
    tokio::time::sleep(Duration::from_millis(450)).await;
    store.set_available(true);

    assert!(lock.lease_lost());
    assert!(matches!(lock.check_lease(), Err(CacheError::LeaseLost(_))));
    assert_eq!(coordinators[0].metrics().lease_lost, 1);
    lock.unlock().await.unwrap();
    assert!(!lock.is_held_locally());

    let other = coordinators[1].lock_provider("users").acquire("k");
    assert!(other.try_lock().await.unwrap());
    other.unlock().await.unwrap();
    a.release("k");
}

/// 重入的 acquire 共享句柄；多余的 release 不影响其他键
#[tokio::test]
async fn test_registry_reference_counting() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 1);
    let provider = coordinators[0].lock_provider("users");

    let first = provider.acquire("a");
    let second = provider.acquire("a");
    let other = provider.acquire("b");
    assert_eq!(first.name(), "lock:users:a");
    assert_eq!(provider.ref_count("a"), 2);
    assert_eq!(provider.active_handles(), 2);

    provider.release("a");
    assert_eq!(provider.ref_count("a"), 1);
    provider.release("a");
    provider.release("a");
    assert_eq!(provider.ref_count("a"), 0);
    assert_eq!(provider.ref_count("b"), 1);

    other.lock().await.unwrap();
    assert!(matches!(second.unlock().await, Err(CacheError::NotHeld(_))));
    other.unlock().await.unwrap();
    provider.release("b");
    assert_eq!(provider.active_handles(), 0);
}

/// try_lock_for 在截止时间到达时放弃，并释放本地门闩
#[tokio::test]
async fn test_try_lock_for_gives_up_at_deadline() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 2);
    let holder = coordinators[0].lock_provider("users").acquire("k");
    holder.lock().await.unwrap();

    let provider = coordinators[1].lock_provider("users");
    let waiter = provider.acquire("k");
    let start = Instant::now();
    assert!(!waiter.try_lock_for(Duration::from_millis(150)).await.unwrap());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(140) && elapsed < Duration::from_millis(400));
    assert!(!waiter.is_held_locally());

    holder.unlock().await.unwrap();
    assert!(waiter.try_lock_for(Duration::from_millis(150)).await.unwrap());
    waiter.unlock().await.unwrap();
    provider.release("k");
}
