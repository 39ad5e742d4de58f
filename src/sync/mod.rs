//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了跨实例的变更广播：每次本地变更后发布一条消息，
//! 其他实例订阅同一主题并将变更应用到各自的本地缓存层。投递语义为至少一次。

pub mod apply;
pub mod bus;
pub mod cursor;
pub mod message;

use crate::error::Result;
use async_trait::async_trait;

pub use apply::{apply_to_tier, TierRouter};
pub use bus::{SyncBus, SyncSubscription};
pub use cursor::SyncCursor;
pub use message::{SyncEventType, SyncMessage};

/// 远端变更的应用目标：进程内缓存层
#[async_trait]
pub trait LocalTier: Send + Sync {
    /// 用远端值替换本地值
    async fn put_local(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// 失效给定的键，重复失效结果不变
    async fn invalidate(&self, keys: &[String]) -> Result<()>;

    /// 失效整个本地层
    async fn invalidate_all(&self) -> Result<()>;
}

/// 订阅回调，返回错误时该消息会按退避重试
#[async_trait]
pub trait SyncListener: Send + Sync {
    async fn on_message(&self, message: &SyncMessage) -> Result<()>;
}
