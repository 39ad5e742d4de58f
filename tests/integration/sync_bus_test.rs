//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 同步总线的多实例集成测试。

#[path = "../common/mod.rs"]
mod common;

use common::{eventually, instances, memory_config, setup_logging};
use oxtier::backend::l1::L1Backend;
use oxtier::config::SyncPolicy;
use oxtier::{CacheError, Coordinator, MemoryStore, SyncEventType, SyncMessage};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

async fn tiers(coordinators: &[Coordinator], cache_name: &str) -> Vec<Arc<L1Backend>> {
    let mut tiers = Vec::new();
    for coordinator in coordinators {
        let tier = Arc::new(L1Backend::new(1000, None));
        coordinator
            .register_local(cache_name, tier.clone())
            .await
            .unwrap();
        tiers.push(tier);
    }
    tiers
}

#[tokio::test]
async fn test_remove_reaches_other_instances_but_not_self() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 3);
    let tiers = tiers(&coordinators, "users").await;
    for tier in &tiers {
        tier.set("k", b"v".to_vec()).await;
    }

    coordinators[0]
        .sync_bus()
        .publish_remove("users", "k")
        .await
        .unwrap();

    for tier in &tiers[1..] {
        assert!(eventually(WAIT, || async move { tier.get("k").await.is_none() }).await);
    }
    let origin = &coordinators[0];
    assert!(eventually(WAIT, || async move { origin.metrics().sync_skipped_self >= 1 }).await);
    assert_eq!(tiers[0].get("k").await, Some(b"v".to_vec()));

    for coordinator in &coordinators {
        coordinator.shutdown().await;
    }
}

#[tokio::test]
async fn test_replicate_policy_copies_payload() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let mut config = memory_config();
    config.sync.policy = SyncPolicy::Replicate;
    let coordinators = instances(&store, &config, 2);
    let tiers = tiers(&coordinators, "users").await;

    let bus = coordinators[0].sync_bus();
    bus.publish_put("users", "k", b"first").await.unwrap();
    bus.publish_put("users", "k", b"second").await.unwrap();
    bus.publish_put_all(
        "users",
        &[
            ("a".to_string(), b"1".to_vec()),
            ("b".to_string(), b"2".to_vec()),
        ],
    )
    .await
    .unwrap();

    let remote = &tiers[1];
    assert!(
        eventually(WAIT, || async move {
            remote.get("k").await == Some(b"second".to_vec())
                && remote.get("b").await == Some(b"2".to_vec())
        })
        .await
    );
    assert_eq!(remote.get("a").await, Some(b"1".to_vec()));
    assert_eq!(tiers[0].get("k").await, None);
}

#[tokio::test]
async fn test_invalidate_policy_never_copies_payload() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 2);
    let tiers = tiers(&coordinators, "users").await;
    tiers[1].set("k", b"stale".to_vec()).await;

    coordinators[0]
        .sync_bus()
        .publish_put("users", "k", b"fresh")
        .await
        .unwrap();

    let peer = &coordinators[1];
    assert!(eventually(WAIT, || async move { peer.metrics().sync_applied >= 1 }).await);
    assert_eq!(tiers[1].get("k").await, None);
}

#[tokio::test]
async fn test_repeated_remove_is_idempotent() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 2);
    let tiers = tiers(&coordinators, "users").await;
    tiers[1].set("k", b"v".to_vec()).await;
    tiers[1].set("other", b"keep".to_vec()).await;

    let bus = coordinators[0].sync_bus();
    bus.publish_remove("users", "k").await.unwrap();
    bus.publish_remove("users", "k").await.unwrap();
    bus.publish_remove_all("users", &["k".to_string()])
        .await
        .unwrap();

    let peer = &coordinators[1];
    assert!(eventually(WAIT, || async move { peer.metrics().sync_applied >= 3 }).await);
    assert_eq!(tiers[1].get("k").await, None);
    assert_eq!(tiers[1].get("other").await, Some(b"keep".to_vec()));
    assert_eq!(coordinators[1].metrics().sync_apply_failed, 0);
}

#[tokio::test]
async fn test_message_without_cache_name_reaches_every_tier() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 2);
    let users = tiers(&coordinators, "users").await;
    let orders = tiers(&coordinators, "orders").await;
    users[1].set("u", b"1".to_vec()).await;
    orders[1].set("o", b"2".to_vec()).await;

    let bus = coordinators[0].sync_bus();
    let message = SyncMessage::new(bus.instance_id(), SyncEventType::Clear);
    bus.publish(&message).await.unwrap();

    let (u, o) = (&users[1], &orders[1]);
    assert!(
        eventually(WAIT, || async move {
            u.get("u").await.is_none() && o.get("o").await.is_none()
        })
        .await
    );
}

/// 存储短暂不可达时发布失败，订阅者暂停后恢复，之后的消息照常送达
#[tokio::test]
async fn test_subscriber_survives_store_outage() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let coordinators = instances(&store, &memory_config(), 2);
    let tiers = tiers(&coordinators, "users").await;
    tiers[1].set("k", b"v".to_vec()).await;
    let bus = coordinators[0].sync_bus();

    store.set_available(false);
    let result = bus.publish_remove("users", "k").await;
    assert!(matches!(result, Err(CacheError::Transport(_))));
    let peer = &coordinators[1];
    assert!(eventually(WAIT, || async move { peer.metrics().sync_transport_pauses >= 1 }).await);
    store.set_available(true);

    bus.publish_remove("users", "k").await.unwrap();
    let remote = &tiers[1];
    assert!(eventually(WAIT, || async move { remote.get("k").await.is_none() }).await);
    assert_eq!(coordinators[0].metrics().sync_publish_failed, 1);
}

#[tokio::test]
async fn test_disabled_sync_publishes_nothing() {
    setup_logging();
    let store = Arc::new(MemoryStore::new());
    let mut config = memory_config();
    config.sync.enabled = false;
    let coordinators = instances(&store, &config, 1);
    let bus = coordinators[0].sync_bus();

    bus.publish_put("users", "k", b"v").await.unwrap();
    bus.publish_clear("users").await.unwrap();
    assert_eq!(store.topic_len(bus.topic()), 0);
    assert!(coordinators[0].sync_cursor().await.is_none());
}
