//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调器：启动时构建一次并显式传给使用方，持有存储、实例标识、
//! 各缓存的锁提供者、同步总线和指标。同一进程内可以同时存在多个互不影响的协调器。

use crate::backend::l1::L1Backend;
use crate::backend::memory_store::MemoryStore;
use crate::backend::redis_store::RedisStore;
use crate::backend::store::{CoordinationStore, RemoteTier};
use crate::client::CoordinatedCache;
use crate::config::{Config, StoreMode};
use crate::error::{CacheError, Result};
use crate::lock::{DistributedLockProvider, EmbeddedLockProvider, LockProvider};
use crate::metrics::{CoordinatorMetrics, MetricsSnapshot};
use crate::sync::{LocalTier, SyncBus, SyncSubscription, TierRouter};
use crate::write::{CacheWriter, WriteStrategy};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, instrument, warn};

/// 协调器
pub struct Coordinator {
    config: Config,
    instance_id: String,
    store: Arc<dyn CoordinationStore>,
    remote: Arc<dyn RemoteTier>,
    metrics: Arc<CoordinatorMetrics>,
    bus: Arc<SyncBus>,
    router: Arc<TierRouter>,
    lock_providers: DashMap<String, Arc<dyn LockProvider>>,
    subscription: tokio::sync::Mutex<Option<SyncSubscription>>,
    strategies: Mutex<Vec<Arc<WriteStrategy>>>,
}

impl Coordinator {
    /// 使用已有的存储创建协调器，配置先经过验证
    pub fn new<S>(config: Config, store: Arc<S>) -> Result<Self>
    where
        S: CoordinationStore + RemoteTier,
    {
        config.validate().map_err(CacheError::Configuration)?;

        let instance_id = uuid::Uuid::new_v4().to_string();
        let metrics = Arc::new(CoordinatorMetrics::default());
        let coordination: Arc<dyn CoordinationStore> = store.clone();
        let bus = Arc::new(SyncBus::new(
            coordination.clone(),
            instance_id.clone(),
            config.sync.clone(),
            metrics.clone(),
        ));
        let router = Arc::new(TierRouter::new(config.sync.policy));

        info!(
            "Coordinator created: instance={}, topic={}",
            instance_id,
            bus.topic()
        );
        Ok(Self {
            config,
            instance_id,
            store: coordination,
            remote: store,
            metrics,
            bus,
            router,
            lock_providers: DashMap::new(),
            subscription: tokio::sync::Mutex::new(None),
            strategies: Mutex::new(Vec::new()),
        })
    }

    /// 按 `store.mode` 连接 Redis 或创建进程内存储
    #[instrument(skip(config), level = "info", fields(mode = ?config.store.mode))]
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate().map_err(CacheError::Configuration)?;
        match config.store.mode {
            StoreMode::Memory => Self::new(config, Arc::new(MemoryStore::new())),
            StoreMode::Standalone | StoreMode::Cluster => {
                let store = RedisStore::connect(&config.store).await?;
                store.ping().await?;
                Self::new(config, Arc::new(store))
            }
        }
    }

    /// 本实例的标识，同时用作锁的持有者标识和同步消息的来源标识
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        self.store.clone()
    }

    /// 缓存名对应的锁提供者，每个缓存名只创建一次
    pub fn lock_provider(&self, cache_name: &str) -> Arc<dyn LockProvider> {
        self.lock_providers
            .entry(cache_name.to_string())
            .or_insert_with(|| {
                let lock = self.config.lock.clone();
                let provider: Arc<dyn LockProvider> = if lock.distributed {
                    Arc::new(DistributedLockProvider::new(
                        cache_name,
                        self.instance_id.clone(),
                        lock,
                        self.store.clone(),
                        self.metrics.clone(),
                    ))
                } else {
                    Arc::new(EmbeddedLockProvider::new(
                        cache_name,
                        &lock,
                        self.metrics.clone(),
                    ))
                };
                provider
            })
            .clone()
    }

    pub fn sync_bus(&self) -> Arc<SyncBus> {
        self.bus.clone()
    }

    /// 注册本地缓存层，并在首次注册时启动订阅
    pub async fn register_local(&self, cache_name: &str, tier: Arc<dyn LocalTier>) -> Result<()> {
        self.router.register(cache_name, tier);
        self.start_sync().await
    }

    /// 启动对同步主题的订阅；同步关闭或已启动时无操作
    pub async fn start_sync(&self) -> Result<()> {
        if !self.config.sync.enabled {
            return Ok(());
        }
        let mut subscription = self.subscription.lock().await;
        if subscription.is_none() {
            *subscription = Some(self.bus.subscribe(self.router.clone()).await?);
        }
        Ok(())
    }

    /// 当前订阅的消费位置
    pub async fn sync_cursor(&self) -> Option<crate::backend::store::LogPosition> {
        self.subscription.lock().await.as_ref().map(|s| s.cursor())
    }

    /// 按配置为外部写入器构建写策略，关闭时统一刷新
    pub fn write_strategy(&self, writer: Arc<dyn CacheWriter>) -> Arc<WriteStrategy> {
        let strategy = Arc::new(WriteStrategy::from_config(writer, &self.config.write));
        self.strategies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(strategy.clone());
        strategy
    }

    /// 构建一个协调缓存并把它的本地层接入同步总线
    pub async fn cache(&self, cache_name: &str, local: Arc<L1Backend>) -> Result<CoordinatedCache> {
        self.register_local(cache_name, local.clone()).await?;
        Ok(CoordinatedCache::new(
            cache_name,
            local,
            Some(self.remote.clone()),
            self.lock_provider(cache_name),
            self.bus.clone(),
        ))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 文本格式的指标
    pub fn render_metrics(&self) -> String {
        self.metrics.snapshot().render(&self.instance_id)
    }

    /// 取消订阅并刷新所有写回缓冲区
    pub async fn shutdown(&self) {
        info!("Coordinator shutting down: instance={}", self.instance_id);
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.shutdown().await;
        }

        let strategies: Vec<Arc<WriteStrategy>> = self
            .strategies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for strategy in strategies {
            strategy.shutdown().await;
        }

        for entry in self.lock_providers.iter() {
            let active = entry.value().active_handles();
            if active > 0 {
                warn!(
                    "Cache {} still has {} lock handles at shutdown",
                    entry.key(),
                    active
                );
            }
        }
    }
}
