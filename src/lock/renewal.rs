//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了分布式锁的租约续期任务。

use crate::backend::store::CoordinationStore;
use crate::metrics::CoordinatorMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 租约续期任务
///
/// 首次加锁成功时启动，按固定周期调用续期脚本。完全释放、租约丢失或句柄被丢弃时停止。
/// 停止只会生效一次，已停止后再次停止是无操作。
///
/// 租约丢失标记归属于单个任务，新的一次持有总是换用新任务，旧任务的迟到结果不会影响它。
pub struct RenewalJob {
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    lease_lost: Arc<AtomicBool>,
}

/// 续期任务所需的上下文
pub struct RenewalTarget {
    pub store: Arc<dyn CoordinationStore>,
    pub lock_name: String,
    pub owner_id: String,
    pub lease: Duration,
    pub period: Duration,
    pub metrics: Arc<CoordinatorMetrics>,
}

impl RenewalJob {
    /// 启动续期任务，第一次续期发生在一个周期之后
    pub fn start(target: RenewalTarget) -> Self {
        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let lease_lost = Arc::new(AtomicBool::new(false));
        let job = Self {
            token: token.clone(),
            finished: finished.clone(),
            lease_lost: lease_lost.clone(),
        };
        tokio::spawn(run(target, token, finished, lease_lost));
        job
    }

    /// 停止续期，仅第一次调用返回 true
    pub fn stop(&self) -> bool {
        let first = !self.finished.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    pub fn is_running(&self) -> bool {
        !self.finished.load(Ordering::Acquire)
    }

    /// 本任务是否判定租约已丢失
    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::Acquire)
    }
}

impl Drop for RenewalJob {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    target: RenewalTarget,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
    lease_lost: Arc<AtomicBool>,
) {
    let lease_millis = target.lease.as_millis() as u64;
    let mut ticker = tokio::time::interval_at(Instant::now() + target.period, target.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_success = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let renewed = target
            .store
            .renew(&target.lock_name, &target.owner_id, lease_millis)
            .await;
        // 应答到达前已被停止：结果属于上一次持有，直接丢弃
        if token.is_cancelled() {
            debug!("Renewal stopped while in flight: {}", target.lock_name);
            break;
        }

        match renewed {
            Ok(true) => {
                last_success = Instant::now();
                CoordinatorMetrics::incr(&target.metrics.lease_renewed);
                debug!("Lease renewed: {}", target.lock_name);
            }
            Ok(false) => {
                warn!("Lease lost, stopping renewal: {}", target.lock_name);
                mark_lost(&target, &finished, &lease_lost);
                break;
            }
            Err(e) => {
                if last_success.elapsed() >= target.lease {
                    warn!(
                        "No successful renewal within one lease, giving up: {}: {}",
                        target.lock_name, e
                    );
                    mark_lost(&target, &finished, &lease_lost);
                    break;
                }
                warn!("Lease renewal failed, retrying next tick: {}: {}", target.lock_name, e);
            }
        }
    }
}

fn mark_lost(target: &RenewalTarget, finished: &AtomicBool, lease_lost: &AtomicBool) {
    lease_lost.store(true, Ordering::Release);
    finished.store(true, Ordering::Release);
    CoordinatorMetrics::incr(&target.metrics.lease_lost);
}
