//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调层的错误类型和处理机制。

use thiserror::Error;

/// 协调层错误类型枚举
///
/// 锁竞争不属于错误，它以 `TryAcquireOutcome::Contended` 的形式返回并驱动退避。
#[derive(Error, Debug)]
pub enum CacheError {
    /// 协调存储不可达或网络错误
    #[error("Transport error: {0}")]
    Transport(String),

    /// 租约已丢失（续期返回 false），可以重新获取
    #[error("Lease lost for lock: {0}")]
    LeaseLost(String),

    /// 当前持有者并未持有该锁
    #[error("Lock not held: {0}")]
    NotHeld(String),

    /// 可中断的加锁被取消
    #[error("Lock acquisition interrupted: {0}")]
    Interrupted(String),

    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// 订阅者应用同步消息失败
    #[error("Application error: {0}")]
    Application(String),

    /// 外部写入器拒绝了批量写入
    #[error("Writer error: {0}")]
    Writer(String),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 操作不支持
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// 关闭错误
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// IO错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Transport(e.to_string())
    }
}

impl CacheError {
    /// 是否为传输层错误（存储不可达、超时）
    pub fn is_transport(&self) -> bool {
        matches!(self, CacheError::Transport(_) | CacheError::Timeout(_))
    }
}

/// 协调层操作结果类型别名
pub type Result<T> = std::result::Result<T, CacheError>;
