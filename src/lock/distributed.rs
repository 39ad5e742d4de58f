//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于协调存储脚本的分布式可重入锁。

use super::gate::{pause, GateGuard, LocalGate};
use super::registry::{LockRegistry, Released};
use super::renewal::{RenewalJob, RenewalTarget};
use super::{lock_name, CacheLock, LockProvider};
use crate::backend::store::{CoordinationStore, ReleaseOutcome, TryAcquireOutcome};
use crate::config::LockConfig;
use crate::error::{CacheError, Result};
use crate::metrics::CoordinatorMetrics;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// 分布式锁句柄
///
/// 同一进程内同一键的所有调用方共享一个句柄，先经过本地门闩，再执行服务端脚本
pub struct DistributedLock {
    name: String,
    owner_id: String,
    lease: Duration,
    renewal_period: Duration,
    min_wait: Duration,
    max_wait: Duration,
    store: Arc<dyn CoordinationStore>,
    metrics: Arc<CoordinatorMetrics>,
    gate: LocalGate,
    /// 当前持有对应的续期任务；租约丢失后保留已结束的任务直到 unlock
    renewal: Mutex<Option<RenewalJob>>,
}

impl DistributedLock {
    pub fn new(
        name: String,
        owner_id: String,
        config: &LockConfig,
        store: Arc<dyn CoordinationStore>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            name,
            owner_id,
            lease: config.lease(),
            renewal_period: config.renewal_period(),
            min_wait: Duration::from_millis(config.min_retry_wait_millis),
            max_wait: Duration::from_millis(config.max_retry_wait_millis),
            store,
            metrics,
            gate: LocalGate::default(),
            renewal: Mutex::new(None),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn lease_millis(&self) -> u64 {
        self.lease.as_millis() as u64
    }

    /// 根据剩余租约计算等待时间，有截止时间时不超过剩余时间
    fn retry_wait(&self, wait_millis: u64, deadline: Option<Instant>) -> Duration {
        let wait = Duration::from_millis(wait_millis)
            .min(self.max_wait)
            .max(self.min_wait);
        match deadline {
            Some(deadline) => wait.min(deadline.saturating_duration_since(Instant::now())),
            None => wait,
        }
    }

    /// 加锁成功后的登记：没有运行中的续期任务时换用新任务
    fn on_acquired(&self, guard: GateGuard) {
        CoordinatorMetrics::incr(&self.metrics.lock_acquired);

        let mut renewal = self.renewal.lock().unwrap_or_else(PoisonError::into_inner);
        let running = renewal.as_ref().map(RenewalJob::is_running).unwrap_or(false);
        if !running {
            *renewal = Some(RenewalJob::start(RenewalTarget {
                store: self.store.clone(),
                lock_name: self.name.clone(),
                owner_id: self.owner_id.clone(),
                lease: self.lease,
                period: self.renewal_period,
                metrics: self.metrics.clone(),
            }));
        }
        drop(renewal);

        self.gate.park(guard);
    }

    fn renewal_lost_lease(&self) -> bool {
        self.renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(RenewalJob::lease_lost)
    }

    fn stop_renewal(&self) {
        let job = self
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(job) = job {
            job.stop();
        }
    }

    /// 加锁主循环
    ///
    /// 返回 `Ok(false)` 表示截止时间已到；`guard` 在失败路径上被丢弃即释放门闩
    async fn acquire_until(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        let guard = match self.gate.enter(&self.name, deadline, cancel).await? {
            Some(guard) => guard,
            None => return Ok(false),
        };

        loop {
            match self
                .store
                .try_acquire(&self.name, &self.owner_id, self.lease_millis())
                .await?
            {
                TryAcquireOutcome::Acquired => {
                    debug!("Lock acquired: {}", self.name);
                    self.on_acquired(guard);
                    return Ok(true);
                }
                TryAcquireOutcome::Contended { wait_millis } => {
                    CoordinatorMetrics::incr(&self.metrics.lock_contended);
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        debug!("Lock wait deadline elapsed: {}", self.name);
                        return Ok(false);
                    }
                    let wait = self.retry_wait(wait_millis, deadline);
                    debug!("Lock contended: {}, retry in {:?}", self.name, wait);
                    pause(&self.name, wait, cancel).await?;
                }
            }
        }
    }
}

#[async_trait]
impl CacheLock for DistributedLock {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(lock = %self.name), level = "debug")]
    async fn lock(&self) -> Result<()> {
        self.acquire_until(None, None).await.map(|_| ())
    }

    #[instrument(skip(self, cancel), fields(lock = %self.name), level = "debug")]
    async fn lock_interruptibly(&self, cancel: &CancellationToken) -> Result<()> {
        self.acquire_until(None, Some(cancel)).await.map(|_| ())
    }

    #[instrument(skip(self), fields(lock = %self.name), level = "debug")]
    async fn try_lock(&self) -> Result<bool> {
        let guard = match self.gate.try_enter() {
            Some(guard) => guard,
            None => return Ok(false),
        };
        match self
            .store
            .try_acquire(&self.name, &self.owner_id, self.lease_millis())
            .await?
        {
            TryAcquireOutcome::Acquired => {
                self.on_acquired(guard);
                Ok(true)
            }
            TryAcquireOutcome::Contended { .. } => {
                CoordinatorMetrics::incr(&self.metrics.lock_contended);
                Ok(false)
            }
        }
    }

    #[instrument(skip(self), fields(lock = %self.name), level = "debug")]
    async fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.acquire_until(Some(Instant::now() + timeout), None)
            .await
    }

    #[instrument(skip(self), fields(lock = %self.name), level = "debug")]
    async fn unlock(&self) -> Result<()> {
        if !self.gate.is_held() {
            return Err(CacheError::NotHeld(self.name.clone()));
        }

        if self.renewal_lost_lease() {
            debug!("Unlock after lease loss is a no-op: {}", self.name);
            self.stop_renewal();
            self.gate.leave();
            return Ok(());
        }

        let result = self
            .store
            .release(&self.name, &self.owner_id, self.lease_millis())
            .await;
        match &result {
            Ok(ReleaseOutcome::FullyReleased) | Ok(ReleaseOutcome::AlreadyReleased) => {
                self.stop_renewal()
            }
            Ok(ReleaseOutcome::StillHeld) => {
                debug!("Lock still held after release: {}", self.name);
            }
            Err(e) => {
                warn!("Release failed, stopping renewal: {}: {}", self.name, e);
                self.stop_renewal();
            }
        }
        self.gate.leave();
        result.map(|_| ())
    }

    fn is_held_locally(&self) -> bool {
        self.gate.is_held()
    }

    fn lease_lost(&self) -> bool {
        self.renewal_lost_lease()
    }
}

/// 分布式锁提供者，每个缓存名一个
pub struct DistributedLockProvider {
    cache_name: String,
    owner_id: String,
    config: LockConfig,
    store: Arc<dyn CoordinationStore>,
    metrics: Arc<CoordinatorMetrics>,
    registry: LockRegistry<DistributedLock>,
}

impl DistributedLockProvider {
    pub fn new(
        cache_name: impl Into<String>,
        owner_id: impl Into<String>,
        config: LockConfig,
        store: Arc<dyn CoordinationStore>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        let registry = LockRegistry::with_capacity(config.registry_initial_capacity);
        Self {
            cache_name: cache_name.into(),
            owner_id: owner_id.into(),
            config,
            store,
            metrics,
            registry,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn name_for(&self, key: &str) -> String {
        lock_name(&self.config.scope, &self.cache_name, key)
    }
}

impl LockProvider for DistributedLockProvider {
    fn acquire(&self, key: &str) -> Arc<dyn CacheLock> {
        let name = self.name_for(key);
        self.registry.acquire_with(&name, || {
            DistributedLock::new(
                name.clone(),
                self.owner_id.clone(),
                &self.config,
                self.store.clone(),
                self.metrics.clone(),
            )
        })
    }

    fn release(&self, key: &str) {
        let name = self.name_for(key);
        if let Released::Removed(handle) = self.registry.release(&name) {
            if handle.is_held_locally() {
                warn!("Lock handle released while still locked: {}", name);
            }
        }
    }

    fn ref_count(&self, key: &str) -> usize {
        self.registry.ref_count(&self.name_for(key))
    }

    fn active_handles(&self) -> usize {
        self.registry.len()
    }
}
