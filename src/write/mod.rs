//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存写入外部记录系统的策略：同步写穿或异步批量写回。

pub mod behind;
pub mod through;

use crate::config::{WriteConfig, WriteStrategyKind};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use behind::{PendingWrite, WriteBehind, WriteBehindStats};
pub use through::WriteThrough;

/// 外部记录系统的写入器
///
/// 重试策略由写入器自己负责，协调层不会重试失败的批次
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheWriter: Send + Sync {
    async fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn write_all(&self, entries: HashMap<String, Vec<u8>>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_all(&self, keys: HashSet<String>) -> Result<()>;
}

/// 每个缓存选定的写策略
pub enum WriteStrategy {
    Through(WriteThrough),
    Behind(WriteBehind),
}

impl WriteStrategy {
    /// 按配置构建写策略，写回模式会启动刷新定时器
    pub fn from_config(writer: Arc<dyn CacheWriter>, config: &WriteConfig) -> Self {
        match config.strategy {
            WriteStrategyKind::Through => WriteStrategy::Through(WriteThrough::new(writer)),
            WriteStrategyKind::Behind => {
                WriteStrategy::Behind(WriteBehind::start(writer, config.clone()))
            }
        }
    }

    pub fn kind(&self) -> WriteStrategyKind {
        match self {
            WriteStrategy::Through(_) => WriteStrategyKind::Through,
            WriteStrategy::Behind(_) => WriteStrategyKind::Behind,
        }
    }

    pub async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        match self {
            WriteStrategy::Through(w) => w.write(key, value).await,
            WriteStrategy::Behind(w) => w.write(key, value.to_vec()).await,
        }
    }

    pub async fn write_all(&self, entries: HashMap<String, Vec<u8>>) -> Result<()> {
        match self {
            WriteStrategy::Through(w) => w.write_all(entries).await,
            WriteStrategy::Behind(w) => {
                for (key, value) in entries {
                    w.write(&key, value).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match self {
            WriteStrategy::Through(w) => w.delete(key).await,
            WriteStrategy::Behind(w) => w.delete(key).await,
        }
    }

    pub async fn delete_all(&self, keys: HashSet<String>) -> Result<()> {
        match self {
            WriteStrategy::Through(w) => w.delete_all(keys).await,
            WriteStrategy::Behind(w) => {
                for key in keys {
                    w.delete(&key).await?;
                }
                Ok(())
            }
        }
    }

    /// 写回模式下立即刷新并等待所有批次完成；写穿模式无操作
    pub async fn flush(&self) {
        if let WriteStrategy::Behind(w) = self {
            w.flush().await;
        }
    }

    pub async fn shutdown(&self) {
        if let WriteStrategy::Behind(w) = self {
            w.shutdown().await;
        }
    }
}
