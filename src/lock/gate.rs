//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 每个锁句柄内部的本地门闩：同一进程内同一键同时只有一个调用方与协调存储交互。

use crate::error::{CacheError, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) type GateGuard = OwnedMutexGuard<()>;

/// 本地门闩
///
/// 加锁成功后门闩的 guard 被寄存在 `held` 中，直到 unlock 取出并丢弃
#[derive(Default)]
pub(crate) struct LocalGate {
    mutex: Arc<AsyncMutex<()>>,
    held: Mutex<Option<GateGuard>>,
}

impl LocalGate {
    fn slot(&self) -> MutexGuard<'_, Option<GateGuard>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 等待进入门闩
    ///
    /// 超过 `deadline` 返回 `Ok(None)`，`cancel` 触发返回 `Interrupted`
    pub(crate) async fn enter(
        &self,
        name: &str,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<GateGuard>> {
        let wait = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, self.mutex.clone().lock_owned())
                    .await
                    .ok(),
                None => Some(self.mutex.clone().lock_owned().await),
            }
        };

        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(CacheError::Interrupted(name.to_string())),
                guard = wait => Ok(guard),
            },
            None => Ok(wait.await),
        }
    }

    pub(crate) fn try_enter(&self) -> Option<GateGuard> {
        self.mutex.clone().try_lock_owned().ok()
    }

    /// 寄存 guard，标记为本地持有
    pub(crate) fn park(&self, guard: GateGuard) {
        *self.slot() = Some(guard);
    }

    /// 取出并释放 guard，返回之前是否持有
    pub(crate) fn leave(&self) -> bool {
        let guard = self.slot().take();
        guard.is_some()
    }

    pub(crate) fn is_held(&self) -> bool {
        self.slot().is_some()
    }
}

/// 等待 `wait`，期间可被 `cancel` 打断
pub(crate) async fn pause(
    name: &str,
    wait: std::time::Duration,
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(CacheError::Interrupted(name.to_string())),
            _ = tokio::time::sleep(wait) => Ok(()),
        },
        None => {
            tokio::time::sleep(wait).await;
            Ok(())
        }
    }
}
