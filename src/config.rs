//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调层的配置结构和解析逻辑。

use crate::error::{CacheError, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// 不使用作用域时的占位值
pub const SCOPE_NONE: &str = "none";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// 协调存储配置
    pub store: StoreConfig,
    /// 分布式锁配置
    pub lock: LockConfig,
    /// 变更广播配置
    pub sync: SyncConfig,
    /// 写策略配置
    pub write: WriteConfig,
}

/// 协调存储模式
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// 单机 Redis
    #[default]
    Standalone,
    /// Redis 集群
    Cluster,
    /// 进程内存储（单进程部署）
    Memory,
}

/// 协调存储配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StoreConfig {
    pub mode: StoreMode,
    /// 连接字符串
    pub connection_string: SecretString,
    /// 集群初始节点
    pub cluster_nodes: Vec<String>,
    /// 连接超时时间（毫秒）
    pub connection_timeout_ms: u64,
    /// 命令执行超时时间（毫秒）
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::Standalone,
            connection_string: SecretString::new("redis://localhost:6379".to_string().into()),
            cluster_nodes: Vec::new(),
            connection_timeout_ms: 5000,
            command_timeout_ms: 3000,
        }
    }
}

/// 分布式锁配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LockConfig {
    /// 租约时长（毫秒），超过该时长未续期则锁自动过期
    pub lease_millis: u64,
    /// 续期周期（毫秒），None 表示 lease / 3
    pub renewal_period_millis: Option<u64>,
    /// 本地锁注册表初始容量
    pub registry_initial_capacity: usize,
    /// 锁键作用域，"none" 表示省略
    pub scope: String,
    /// 竞争时最短等待（毫秒）
    pub min_retry_wait_millis: u64,
    /// 竞争时最长等待（毫秒）
    pub max_retry_wait_millis: u64,
    /// false 时使用进程内锁
    pub distributed: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_millis: 30_000,
            renewal_period_millis: None,
            registry_initial_capacity: 64,
            scope: SCOPE_NONE.to_string(),
            min_retry_wait_millis: 10,
            max_retry_wait_millis: 100,
            distributed: true,
        }
    }
}

impl LockConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_millis)
    }

    pub fn renewal_period(&self) -> Duration {
        let millis = self
            .renewal_period_millis
            .unwrap_or(self.lease_millis / 3)
            .max(1);
        Duration::from_millis(millis)
    }
}

/// 远端变更在本地层的应用方式
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// 仅失效本地键
    #[default]
    Invalidate,
    /// 用消息中的值替换本地值
    Replicate,
}

/// 变更广播配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// 日志主题名称
    pub channel: String,
    /// 主题保留的最大条目数
    pub max_log_length: usize,
    /// 是否在主题名前加分组前缀
    pub group_prefix_enabled: bool,
    /// 分组名称
    pub group: Option<String>,
    pub policy: SyncPolicy,
    /// 单次拉取的最大条目数
    pub read_batch_size: usize,
    /// 单次拉取的阻塞时长（毫秒）
    pub block_millis: u64,
    /// 传输错误后暂停拉取的时长（毫秒）
    pub pull_pause_millis: u64,
    /// 单条消息按指数退避尝试的次数，用尽后按退避上限继续重试
    pub apply_max_attempts: u32,
    pub apply_base_backoff_millis: u64,
    pub apply_max_backoff_millis: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "oxtier:sync".to_string(),
            max_log_length: 10_000,
            group_prefix_enabled: false,
            group: None,
            policy: SyncPolicy::Invalidate,
            read_batch_size: 100,
            block_millis: 1000,
            pull_pause_millis: 500,
            apply_max_attempts: 5,
            apply_base_backoff_millis: 50,
            apply_max_backoff_millis: 1000,
        }
    }
}

impl SyncConfig {
    /// 解析最终使用的主题名称
    pub fn topic(&self) -> String {
        match (&self.group, self.group_prefix_enabled) {
            (Some(group), true) if !group.is_empty() => format!("{}:{}", group, self.channel),
            _ => self.channel.clone(),
        }
    }
}

/// 写策略
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategyKind {
    /// 同步写穿
    #[default]
    Through,
    /// 异步批量写回
    Behind,
}

/// 写策略配置
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct WriteConfig {
    pub strategy: WriteStrategyKind,
    /// 单批最大条目数
    pub batch_size: usize,
    /// 定时刷新周期（毫秒）
    pub drain_period_millis: u64,
    /// 待写缓冲区最多容纳的不同键数
    pub queue_capacity: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            strategy: WriteStrategyKind::Through,
            batch_size: 100,
            drain_period_millis: 1000,
            queue_capacity: 10_000,
        }
    }
}

impl Config {
    /// 从 TOML 字符串解析配置并验证
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| CacheError::Configuration(e.to_string()))?;
        config.validate().map_err(CacheError::Configuration)?;
        Ok(config)
    }

    /// 从 TOML 文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 验证配置
    ///
    /// 检查配置的有效性，确保所有值在合理范围内
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.store.mode == StoreMode::Cluster && self.store.cluster_nodes.is_empty() {
            return Err("Cluster mode requires at least one cluster node".to_string());
        }

        if !(100..=60000).contains(&self.store.command_timeout_ms) {
            return Err("store command_timeout_ms must be between 100 and 60000 ms".to_string());
        }

        let lock = &self.lock;
        if lock.lease_millis == 0 {
            return Err("lock lease_millis cannot be zero".to_string());
        }
        if let Some(period) = lock.renewal_period_millis {
            if period == 0 || period >= lock.lease_millis {
                return Err(format!(
                    "lock renewal_period_millis ({}) must be between 1 and lease_millis ({})",
                    period, lock.lease_millis
                ));
            }
        }
        if lock.min_retry_wait_millis == 0 {
            return Err("lock min_retry_wait_millis cannot be zero".to_string());
        }
        if lock.min_retry_wait_millis > lock.max_retry_wait_millis {
            return Err(format!(
                "lock min_retry_wait_millis ({}) must be <= max_retry_wait_millis ({})",
                lock.min_retry_wait_millis, lock.max_retry_wait_millis
            ));
        }
        if lock.scope.is_empty() {
            return Err(format!(
                "lock scope cannot be empty, use \"{}\" to omit it",
                SCOPE_NONE
            ));
        }

        let sync = &self.sync;
        if sync.channel.is_empty() {
            return Err("sync channel cannot be empty".to_string());
        }
        if sync.max_log_length == 0 {
            return Err("sync max_log_length cannot be zero".to_string());
        }
        if sync.read_batch_size == 0 {
            return Err("sync read_batch_size cannot be zero".to_string());
        }
        if sync.apply_max_attempts == 0 {
            return Err("sync apply_max_attempts cannot be zero".to_string());
        }
        if sync.apply_base_backoff_millis > sync.apply_max_backoff_millis {
            return Err("sync apply_base_backoff_millis must be <= apply_max_backoff_millis".to_string());
        }

        let write = &self.write;
        if write.batch_size == 0 {
            return Err("write batch_size cannot be zero".to_string());
        }
        if write.drain_period_millis == 0 {
            return Err("write drain_period_millis cannot be zero".to_string());
        }
        if write.queue_capacity < write.batch_size {
            return Err(format!(
                "write queue_capacity ({}) must be >= batch_size ({})",
                write.queue_capacity, write.batch_size
            ));
        }

        Ok(())
    }
}
