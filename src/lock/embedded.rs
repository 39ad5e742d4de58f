//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 单进程部署使用的锁：注册表和生命周期与分布式锁相同，只是不访问协调存储。

use super::gate::LocalGate;
use super::registry::{LockRegistry, Released};
use super::{lock_name, CacheLock, LockProvider};
use crate::config::LockConfig;
use crate::error::{CacheError, Result};
use crate::metrics::CoordinatorMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 进程内锁句柄
pub struct EmbeddedLock {
    name: String,
    gate: LocalGate,
    metrics: Arc<CoordinatorMetrics>,
}

impl EmbeddedLock {
    pub fn new(name: String, metrics: Arc<CoordinatorMetrics>) -> Self {
        Self {
            name,
            gate: LocalGate::default(),
            metrics,
        }
    }

    async fn enter(&self, deadline: Option<Instant>, cancel: Option<&CancellationToken>) -> Result<bool> {
        match self.gate.enter(&self.name, deadline, cancel).await? {
            Some(guard) => {
                self.gate.park(guard);
                CoordinatorMetrics::incr(&self.metrics.lock_acquired);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl CacheLock for EmbeddedLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lock(&self) -> Result<()> {
        self.enter(None, None).await.map(|_| ())
    }

    async fn lock_interruptibly(&self, cancel: &CancellationToken) -> Result<()> {
        self.enter(None, Some(cancel)).await.map(|_| ())
    }

    async fn try_lock(&self) -> Result<bool> {
        match self.gate.try_enter() {
            Some(guard) => {
                self.gate.park(guard);
                CoordinatorMetrics::incr(&self.metrics.lock_acquired);
                Ok(true)
            }
            None => {
                CoordinatorMetrics::incr(&self.metrics.lock_contended);
                Ok(false)
            }
        }
    }

    async fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        self.enter(Some(Instant::now() + timeout), None).await
    }

    async fn unlock(&self) -> Result<()> {
        if self.gate.leave() {
            Ok(())
        } else {
            Err(CacheError::NotHeld(self.name.clone()))
        }
    }

    fn is_held_locally(&self) -> bool {
        self.gate.is_held()
    }

    fn lease_lost(&self) -> bool {
        false
    }
}

/// 进程内锁提供者
pub struct EmbeddedLockProvider {
    cache_name: String,
    scope: String,
    metrics: Arc<CoordinatorMetrics>,
    registry: LockRegistry<EmbeddedLock>,
}

impl EmbeddedLockProvider {
    pub fn new(cache_name: impl Into<String>, config: &LockConfig, metrics: Arc<CoordinatorMetrics>) -> Self {
        Self {
            cache_name: cache_name.into(),
            scope: config.scope.clone(),
            metrics,
            registry: LockRegistry::with_capacity(config.registry_initial_capacity),
        }
    }

    fn name_for(&self, key: &str) -> String {
        lock_name(&self.scope, &self.cache_name, key)
    }
}

impl LockProvider for EmbeddedLockProvider {
    fn acquire(&self, key: &str) -> Arc<dyn CacheLock> {
        let name = self.name_for(key);
        self.registry
            .acquire_with(&name, || EmbeddedLock::new(name.clone(), self.metrics.clone()))
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
