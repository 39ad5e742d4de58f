//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调存储的接口：锁脚本、服务端时间以及按主题追加的日志。

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 尝试加锁的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquireOutcome {
    /// 加锁成功（新建或重入）
    Acquired,
    /// 锁被其他持有者占用，返回剩余租约作为等待提示
    Contended { wait_millis: u64 },
}

/// 释放锁的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// 该持有者已不在锁中（租约可能已过期），视为成功
    AlreadyReleased,
    /// 重入深度尚未归零
    StillHeld,
    /// 计数归零，整个锁条目已删除
    FullyReleased,
}

/// 日志中的位置，格式与 Redis Stream ID 相同：`<millis>-<seq>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LogPosition {
    pub millis: u64,
    pub seq: u64,
}

impl LogPosition {
    pub const ZERO: LogPosition = LogPosition { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// 位于 `millis` 毫秒内所有记录之前的位置，用于“从该时刻起”读取
    pub fn just_before(millis: u64) -> Self {
        match millis.checked_sub(1) {
            Some(prev) => Self::new(prev, u64::MAX),
            None => Self::ZERO,
        }
    }

    /// 紧随其后的位置
    pub fn next(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self::new(self.millis, seq),
            None => Self::new(self.millis + 1, 0),
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for LogPosition {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CacheError::Serialization(format!("invalid log position: {}", s));
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// 日志中的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub position: LogPosition,
    pub fields: Vec<(String, Vec<u8>)>,
}

/// 协调存储
///
/// 多个实例共享的键值服务，提供原子脚本、键过期和可续读的追加日志。
/// 同一个锁名上的 try_acquire / renew / release 在服务端全序执行。
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// 尝试获取锁：不存在则以 `{owner: 1}` 新建，同一持有者则计数加一；两者都刷新 TTL
    async fn try_acquire(
        &self,
        lock_name: &str,
        owner_id: &str,
        lease_millis: u64,
    ) -> Result<TryAcquireOutcome>;

    /// 释放锁：计数减一，归零时删除整个条目
    async fn release(
        &self,
        lock_name: &str,
        owner_id: &str,
        lease_millis: u64,
    ) -> Result<ReleaseOutcome>;

    /// 续期：持有者仍在锁中则刷新 TTL 并返回 true
    async fn renew(&self, lock_name: &str, owner_id: &str, lease_millis: u64) -> Result<bool>;

    /// 服务端当前时间（毫秒）
    async fn server_time_millis(&self) -> Result<u64>;

    /// 向主题追加一条记录，保留最近约 `max_len` 条
    async fn append(
        &self,
        topic: &str,
        fields: Vec<(String, Vec<u8>)>,
        max_len: usize,
    ) -> Result<LogPosition>;

    /// 读取 `after` 之后的记录，没有新记录时最多阻塞 `block`
    async fn read(
        &self,
        topic: &str,
        after: LogPosition,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>>;

    /// 检查连接是否正常
    async fn ping(&self) -> Result<()>;
}

/// 共享的远端缓存层
#[async_trait]
pub trait RemoteTier: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// 删除所有以 `prefix` 开头的键
    async fn clear_prefix(&self, prefix: &str) -> Result<()>;
}
