//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 多实例协调缓存的端到端测试：加载互斥与变更传播。

#[path = "../common/mod.rs"]
mod common;

use common::{eventually, instances, memory_config, setup_logging};
use oxtier::backend::l1::L1Backend;
use oxtier::backend::RemoteTier;
use oxtier::{CacheError, CoordinatedCache, Coordinator, MemoryStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

async fn caches(coordinators: &[Coordinator], name: &str) -> Vec<Arc<CoordinatedCache>> {
    let mut caches = Vec::new();
    for coordinator in coordinators {
        let local = Arc::new(L1Backend::new(1000, None));
        caches.push(Arc::new(coordinator.cache(name, local).await.unwrap()));
    }
    caches
}

/// 三个实例并发读取同一个缺失键，回源只发生一次
#[tokio::test]
async fn test_concurrent_misses_load_once() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 3);
    let caches = caches(&coordinators, "products").await;
    let loads = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for cache in &caches {
        for _ in 0..4 {
            let cache = cache.clone();
            let loads = loads.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_load("sku-1", move || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Some(b"widget".to_vec()))
                    })
                    .await
            }));
        }
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Some(b"widget".to_vec()));
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(store.lock_holders("lock:products:sku-1").is_empty());
    for cache in &caches {
        assert_eq!(cache.local().get("sku-1").await, Some(b"widget".to_vec()));
    }
}

#[tokio::test]
async fn test_loader_error_propagates_and_releases_lock() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 1);
    let cache = caches(&coordinators, "products").await.remove(0);

    let result = cache
        .get_or_load("k", || async {
            Err(CacheError::Application("database down".to_string()))
        })
        .await;
    assert!(matches!(result, Err(CacheError::Application(_))));
    assert!(store.lock_holders("lock:products:k").is_empty());
    assert_eq!(coordinators[0].lock_provider("products").active_handles(), 0);

    let value = cache
        .get_or_load("k", || async { Ok(Some(b"v".to_vec())) })
        .await
        .unwrap();
    assert_eq!(value, Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_put_and_remove_propagate_to_other_instance() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 2);
    let caches = caches(&coordinators, "users").await;
    let (a, b) = (&caches[0], &caches[1]);

    b.local().set("k", b"stale".to_vec()).await;
    a.put("k", b"fresh".to_vec()).await.unwrap();

    let peer = b.local();
    assert!(eventually(WAIT, || async move { peer.get("k").await.is_none() }).await);
    assert_eq!(b.get("k").await.unwrap(), Some(b"fresh".to_vec()));

    a.remove("k").await.unwrap();
    assert!(eventually(WAIT, || async move { peer.get("k").await.is_none() }).await);
    assert_eq!(b.get("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_clear_only_touches_own_cache() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 2);
    let users = caches(&coordinators, "users").await;
    let orders = caches(&coordinators, "orders").await;

    users[0].put("k", b"u".to_vec()).await.unwrap();
    orders[0].put("k", b"o".to_vec()).await.unwrap();
    users[1].local().set("k", b"u".to_vec()).await;

    users[0].clear().await.unwrap();
    let peer = users[1].local();
    assert!(eventually(WAIT, || async move { peer.get("k").await.is_none() }).await);
    assert_eq!(store.get("users:k").await.unwrap(), None);
    assert_eq!(store.get("orders:k").await.unwrap(), Some(b"o".to_vec()));
    assert_eq!(orders[1].get("k").await.unwrap(), Some(b"o".to_vec()));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: u64,
    name: String,
}

#[tokio::test]
async fn test_typed_values_round_trip_between_instances() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 2);
    let caches = caches(&coordinators, "profiles").await;

    let profile = Profile {
        id: 7,
        name: "ada".to_string(),
    };
    caches[0].put_typed("7", &profile).await.unwrap();
    let read: Option<Profile> = caches[1].get_typed("7").await.unwrap();
    assert_eq!(read, Some(profile));
}
