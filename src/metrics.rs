//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调层的运行时指标。每个 Coordinator 持有自己的实例，不使用全局状态。

use std::sync::atomic::{AtomicU64, Ordering};

/// 协调层指标
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    /// 成功获取分布式锁次数
    pub lock_acquired: AtomicU64,
    /// 加锁时遇到竞争的次数
    pub lock_contended: AtomicU64,
    /// 成功续期次数
    pub lease_renewed: AtomicU64,
    /// 租约丢失次数
    pub lease_lost: AtomicU64,
    /// 已发布的同步消息
    pub sync_published: AtomicU64,
    /// 发布失败的同步消息
    pub sync_publish_failed: AtomicU64,
    /// 已应用的远端消息
    pub sync_applied: AtomicU64,
    /// 跳过的本实例消息
    pub sync_skipped_self: AtomicU64,
    /// 单条消息的重试次数
    pub sync_apply_retries: AtomicU64,
    /// 退避次数用尽仍未应用的消息，之后按退避上限继续重试
    pub sync_apply_failed: AtomicU64,
    /// 被同键更新消息取代而停止重试的消息
    pub sync_apply_superseded: AtomicU64,
    /// 传输错误导致的拉取暂停
    pub sync_transport_pauses: AtomicU64,
}

/// 指标快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub lock_acquired: u64,
    pub lock_contended: u64,
    pub lease_renewed: u64,
    pub lease_lost: u64,
    pub sync_published: u64,
    pub sync_publish_failed: u64,
    pub sync_applied: u64,
    pub sync_skipped_self: u64,
    pub sync_apply_retries: u64,
    pub sync_apply_failed: u64,
    pub sync_apply_superseded: u64,
    pub sync_transport_pauses: u64,
}

impl CoordinatorMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            lock_acquired: load(&self.lock_acquired),
            lock_contended: load(&self.lock_contended),
            lease_renewed: load(&self.lease_renewed),
            lease_lost: load(&self.lease_lost),
            sync_published: load(&self.sync_published),
            sync_publish_failed: load(&self.sync_publish_failed),
            sync_applied: load(&self.sync_applied),
            sync_skipped_self: load(&self.sync_skipped_self),
            sync_apply_retries: load(&self.sync_apply_retries),
            sync_apply_failed: load(&self.sync_apply_failed),
            sync_apply_superseded: load(&self.sync_apply_superseded),
            sync_transport_pauses: load(&self.sync_transport_pauses),
        }
    }
}

impl MetricsSnapshot {
    /// 将指标格式化为文本，每行一个计数器，带实例标签
    pub fn render(&self, instance_id: &str) -> String {
        let rows = [
            ("oxtier_lock_acquired_total", self.lock_acquired),
            ("oxtier_lock_contended_total", self.lock_contended),
            ("oxtier_lease_renewed_total", self.lease_renewed),
            ("oxtier_lease_lost_total", self.lease_lost),
            ("oxtier_sync_published_total", self.sync_published),
            ("oxtier_sync_publish_failed_total", self.sync_publish_failed),
            ("oxtier_sync_applied_total", self.sync_applied),
            ("oxtier_sync_skipped_self_total", self.sync_skipped_self),
            ("oxtier_sync_apply_retries_total", self.sync_apply_retries),
            ("oxtier_sync_apply_failed_total", self.sync_apply_failed),
            ("oxtier_sync_apply_superseded_total", self.sync_apply_superseded),
            ("oxtier_sync_transport_pauses_total", self.sync_transport_pauses),
        ];
        let mut output = String::new();
        for (name, value) in rows {
            output.push_str(&format!("{}{{instance=\"{}\"}} {}\n", name, instance_id, value));
        }
        output
    }
}
