//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了本地缓存层的实现，基于 Moka 的进程内缓存。

use crate::error::Result;
use crate::sync::LocalTier;
use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;
use tracing::{debug, instrument};

/// 本地缓存层
///
/// 容量和 TTL 淘汰交给 Moka，这里只负责读写和失效
#[derive(Clone)]
pub struct L1Backend {
    cache: Cache<String, Vec<u8>>,
}

impl L1Backend {
    /// 创建新的本地缓存层
    ///
    /// # 参数
    ///
    /// * `capacity` - 最大条目数
    /// * `ttl` - 条目存活时间，None 表示不过期
    pub fn new(capacity: u64, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(capacity);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self {
            cache: builder.build(),
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let value = self.cache.get(key).await;
        debug!("L1 get: key={}, found={}", key, value.is_some());
        value
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    pub async fn set(&self, key: &str, value: Vec<u8>) {
        self.cache.insert(key.to_string(), value).await;
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// 清空本地缓存
    pub fn clear(&self) {
        debug!("L1 clear: 清空所有缓存项");
        self.cache.invalidate_all();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }
}

#[async_trait]
impl LocalTier for L1Backend {
    async fn put_local(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.set(key, value).await;
        Ok(())
    }

    async fn invalidate(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.cache.invalidate(key.as_str()).await;
        }
        Ok(())
    }

    async fn invalidate_all(&self) -> Result<()> {
        self.clear();
        Ok(())
    }
}
