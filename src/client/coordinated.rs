//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调缓存：本地层 + 共享远端层，加载受分布式锁保护，变更通过同步总线广播。

use crate::backend::l1::L1Backend;
use crate::backend::store::RemoteTier;
use crate::error::Result;
use crate::lock::LockProvider;
use crate::serialization::{CodecEnum, ValueCodec};
use crate::sync::SyncBus;
use crate::write::WriteStrategy;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// 协调缓存
///
/// 缺失时：加锁 -> 二次检查 -> 回源 -> 写本地和远端 -> 解锁 -> 广播 LOAD。
/// put/remove/clear 成功后广播对应消息，广播失败只记录日志。
pub struct CoordinatedCache {
    name: String,
    local: Arc<L1Backend>,
    remote: Option<Arc<dyn RemoteTier>>,
    remote_ttl: Option<Duration>,
    locks: Arc<dyn LockProvider>,
    bus: Arc<SyncBus>,
    write_strategy: Option<Arc<WriteStrategy>>,
    codec: CodecEnum,
}

impl CoordinatedCache {
    pub fn new(
        name: impl Into<String>,
        local: Arc<L1Backend>,
        remote: Option<Arc<dyn RemoteTier>>,
        locks: Arc<dyn LockProvider>,
        bus: Arc<SyncBus>,
    ) -> Self {
        Self {
            name: name.into(),
            local,
            remote,
            remote_ttl: None,
            locks,
            bus,
            write_strategy: None,
            codec: CodecEnum::default(),
        }
    }

    /// 远端层条目的存活时间
    pub fn with_remote_ttl(mut self, ttl: Duration) -> Self {
        self.remote_ttl = Some(ttl);
        self
    }

    /// 写入外部记录系统的策略
    pub fn with_write_strategy(mut self, strategy: Arc<WriteStrategy>) -> Self {
        self.write_strategy = Some(strategy);
        self
    }

    pub fn with_codec(mut self, codec: CodecEnum) -> Self {
        self.codec = codec;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local(&self) -> &Arc<L1Backend> {
        &self.local
    }

    /// 远端层中的键带缓存名前缀，便于按缓存清空
    fn remote_key(&self, key: &str) -> String {
        format!("{}:{}", self.name, key)
    }

    /// 读取：本地命中直接返回，远端命中时回填本地；远端故障视为未命中
    #[instrument(skip(self), level = "debug", fields(cache = %self.name))]
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.local.get(key).await {
            return Ok(Some(value));
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        match remote.get(&self.remote_key(key)).await {
            Ok(Some(value)) => {
                debug!("Remote hit, promoting to local: {}", key);
                self.local.set(key, value.clone()).await;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("Remote tier read failed, treating as miss: {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// 读取或回源加载
    ///
    /// 同一个键在所有实例中同一时刻只有一个调用方执行 `loader`；
    /// 加锁失败时退化为不加锁加载
    #[instrument(skip(self, loader), level = "debug", fields(cache = %self.name))]
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<Vec<u8>>>> + Send,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(Some(value));
        }

        let lock = self.locks.acquire(key);
        let locked = match lock.lock().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Lock unavailable, loading without exclusivity: {}: {}", key, e);
                false
            }
        };

        let outcome = self.load_once(key, loader).await;

        if locked {
            // 加载期间租约丢失，其他实例可能也在加载
            if let Err(e) = lock.check_lease() {
                warn!("Loaded without exclusivity: {}", e);
            }
            if let Err(e) = lock.unlock().await {
                warn!("Unlock failed: {}: {}", key, e);
            }
        }
        self.locks.release(key);

        let (value, loaded) = outcome?;
        if let (true, Some(value)) = (loaded, &value) {
            if let Err(e) = self.bus.publish_load(&self.name, key, value).await {
                warn!("Failed to publish LOAD for {}: {}", key, e);
            }
        }
        Ok(value)
    }

    /// 二次检查后回源，返回 (值, 是否由本次调用加载)
    async fn load_once<F, Fut>(&self, key: &str, loader: F) -> Result<(Option<Vec<u8>>, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>>>,
    {
        if let Some(value) = self.get(key).await? {
            debug!("Loaded by another caller while waiting: {}", key);
            return Ok((Some(value), false));
        }
        let loaded = loader().await?;
        if let Some(value) = &loaded {
            self.store(key, value.clone()).await?;
        }
        Ok((loaded, true))
    }

    async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        if let Some(remote) = &self.remote {
            remote
                .set(&self.remote_key(key), value.clone(), self.remote_ttl)
                .await?;
        }
        self.local.set(key, value).await;
        Ok(())
    }

    #[instrument(skip(self, value), level = "debug", fields(cache = %self.name))]
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store(key, value.clone()).await?;
        if let Some(strategy) = &self.write_strategy {
            strategy.write(key, &value).await?;
        }
        if let Err(e) = self.bus.publish_put(&self.name, key, &value).await {
            warn!("Failed to publish PUT for {}: {}", key, e);
        }
        Ok(())
    }

    pub async fn put_all(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for (key, value) in &entries {
            self.store(key, value.clone()).await?;
        }
        if let Some(strategy) = &self.write_strategy {
            let batch: HashMap<String, Vec<u8>> = entries.iter().cloned().collect();
            strategy.write_all(batch).await?;
        }
        if let Err(e) = self.bus.publish_put_all(&self.name, &entries).await {
            warn!("Failed to publish PUT_ALL ({} keys): {}", entries.len(), e);
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(cache = %self.name))]
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.local.delete(key).await;
        if let Some(remote) = &self.remote {
            remote.delete(&[self.remote_key(key)]).await?;
        }
        if let Some(strategy) = &self.write_strategy {
            strategy.delete(key).await?;
        }
        if let Err(e) = self.bus.publish_remove(&self.name, key).await {
            warn!("Failed to publish REMOVE for {}: {}", key, e);
        }
        Ok(())
    }

    pub async fn remove_all(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for key in keys {
            self.local.delete(key).await;
        }
        if let Some(remote) = &self.remote {
            let remote_keys: Vec<String> = keys.iter().map(|k| self.remote_key(k)).collect();
            remote.delete(&remote_keys).await?;
        }
        if let Some(strategy) = &self.write_strategy {
            let batch: HashSet<String> = keys.iter().cloned().collect();
            strategy.delete_all(batch).await?;
        }
        if let Err(e) = self.bus.publish_remove_all(&self.name, keys).await {
            warn!("Failed to publish REMOVE_ALL ({} keys): {}", keys.len(), e);
        }
        Ok(())
    }

    /// 清空本缓存的本地层和远端层，不触及外部记录系统
    pub async fn clear(&self) -> Result<()> {
        self.local.clear();
        if let Some(remote) = &self.remote {
            remote.clear_prefix(&format!("{}:", self.name)).await?;
        }
        if let Err(e) = self.bus.publish_clear(&self.name).await {
            warn!("Failed to publish CLEAR: {}", e);
        }
        Ok(())
    }

    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = self.codec.encode(value)?;
        self.put(key, bytes).await
    }

    pub async fn get_or_load_typed<T, F, Fut>(&self, key: &str, loader: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>>> + Send,
    {
        let codec = self.codec.clone();
        let bytes = self
            .get_or_load(key, move || async move {
                match loader().await? {
                    Some(value) => Ok(Some(codec.encode(&value)?)),
                    None => Ok(None),
                }
            })
            .await?;
        match bytes {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
