//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 将远端同步消息应用到本地缓存层。

use super::message::{SyncEventType, SyncMessage};
use super::{LocalTier, SyncListener};
use crate::config::SyncPolicy;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::debug;

/// 按策略把一条消息应用到单个本地缓存层
///
/// 复制策略下写入载荷；仅失效策略或消息没有载荷时只失效对应的键
pub async fn apply_to_tier(
    tier: &dyn LocalTier,
    message: &SyncMessage,
    policy: SyncPolicy,
) -> Result<()> {
    let replicate = policy == SyncPolicy::Replicate && message.payload.is_some();
    match message.event_type {
        SyncEventType::Put | SyncEventType::Load if replicate => {
            if let (Some(key), Some(payload)) = (message.keys.first(), &message.payload) {
                tier.put_local(key, payload.clone()).await?;
            }
            Ok(())
        }
        SyncEventType::PutAll | SyncEventType::LoadAll if replicate => {
            if let Some(values) = message.values()? {
                for (key, value) in message.keys.iter().zip(values) {
                    tier.put_local(key, value).await?;
                }
            }
            Ok(())
        }
        SyncEventType::Put
        | SyncEventType::Load
        | SyncEventType::PutAll
        | SyncEventType::LoadAll
        | SyncEventType::Remove
        | SyncEventType::RemoveAll => tier.invalidate(&message.keys).await,
        SyncEventType::Clear => tier.invalidate_all().await,
    }
}

/// 按缓存名路由到已注册的本地缓存层
///
/// 消息没有缓存名时作用于所有缓存层
pub struct TierRouter {
    tiers: DashMap<String, Arc<dyn LocalTier>>,
    policy: SyncPolicy,
}

impl TierRouter {
    pub fn new(policy: SyncPolicy) -> Self {
        Self {
            tiers: DashMap::new(),
            policy,
        }
    }

    pub fn register(&self, cache_name: impl Into<String>, tier: Arc<dyn LocalTier>) {
        self.tiers.insert(cache_name.into(), tier);
    }

    pub fn unregister(&self, cache_name: &str) -> bool {
        self.tiers.remove(cache_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }
}

#[async_trait]
impl SyncListener for TierRouter {
    async fn on_message(&self, message: &SyncMessage) -> Result<()> {
        match &message.cache_name {
            Some(name) => {
                // 克隆出来再 await，避免持有分片锁
                let tier = self.tiers.get(name).map(|t| t.value().clone());
                match tier {
                    Some(tier) => apply_to_tier(tier.as_ref(), message, self.policy).await,
                    None => {
                        debug!("No local tier registered for cache: {}", name);
                        Ok(())
                    }
                }
            }
            None => {
                let tiers: Vec<Arc<dyn LocalTier>> =
                    self.tiers.iter().map(|t| t.value().clone()).collect();
                try_join_all(
                    tiers
                        .iter()
                        .map(|tier| apply_to_tier(tier.as_ref(), message, self.policy)),
                )
                .await?;
                Ok(())
            }
        }
    }
}
