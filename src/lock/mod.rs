//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了按键互斥锁，用于保证同一个缺失的键在所有实例中只有一个调用方回源加载。
//!
//! 使用方式：`acquire(key)` 取得句柄，然后 `lock()` / `unlock()`，最后 `release(key)` 归还句柄。
//! `acquire` 与 `release` 必须成对调用。

pub mod distributed;
pub mod embedded;
mod gate;
pub mod registry;
pub mod renewal;

use crate::config::SCOPE_NONE;
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use distributed::{DistributedLock, DistributedLockProvider};
pub use embedded::{EmbeddedLock, EmbeddedLockProvider};
pub use registry::LockRegistry;
pub use renewal::RenewalJob;

/// 生成锁键：`lock:` + [scope `:`] + cacheName `:` + key，scope 为 "none" 时省略
pub fn lock_name(scope: &str, cache_name: &str, key: &str) -> String {
    if scope.is_empty() || scope.eq_ignore_ascii_case(SCOPE_NONE) {
        format!("lock:{}:{}", cache_name, key)
    } else {
        format!("lock:{}:{}:{}", scope, cache_name, key)
    }
}

/// 单个键上的锁句柄
#[async_trait]
pub trait CacheLock: Send + Sync {
    /// 完整的锁键
    fn name(&self) -> &str;

    /// 阻塞直到获取锁
    async fn lock(&self) -> Result<()>;

    /// 阻塞直到获取锁，`cancel` 触发时返回 `CacheError::Interrupted`
    async fn lock_interruptibly(&self, cancel: &CancellationToken) -> Result<()>;

    /// 仅尝试一次
    async fn try_lock(&self) -> Result<bool>;

    /// 在 `timeout` 内尝试获取锁
    async fn try_lock_for(&self, timeout: Duration) -> Result<bool>;

    async fn unlock(&self) -> Result<()>;

    /// 本进程当前是否持有该锁
    fn is_held_locally(&self) -> bool;

    /// 续期是否已发现租约丢失；重新加锁后复位
    fn lease_lost(&self) -> bool;

    /// 租约已丢失时返回 `CacheError::LeaseLost`
    fn check_lease(&self) -> Result<()> {
        if self.lease_lost() {
            return Err(CacheError::LeaseLost(self.name().to_string()));
        }
        Ok(())
    }
}

/// 锁句柄的提供者，负责同键句柄的复用和引用计数
pub trait LockProvider: Send + Sync {
    /// 取得（或复用）键对应的句柄，本地引用计数加一
    fn acquire(&self, key: &str) -> Arc<dyn CacheLock>;

    /// 归还句柄，计数归零时从注册表移除
    fn release(&self, key: &str);

    /// 键当前的本地引用计数
    fn ref_count(&self, key: &str) -> usize;

    /// 注册表中的句柄数
    fn active_handles(&self) -> usize;
}
