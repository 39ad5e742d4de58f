//! oxtier - 多层缓存的协调层
//!
//! 多个进程各自持有本地缓存层，共享一个远端层。本库负责让它们协同工作：
//! 分布式锁避免同一个缺失键被重复回源，同步总线把一个实例的变更广播给其他实例，
//! 写回调度器把缓存写入批量异步地刷新到外部记录系统。

#![doc(html_root_url = "https://docs.rs/oxtier/0.1.0")]

pub use serde;
pub use tokio;

pub mod backend;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod serialization;
pub mod sync;
pub mod write;

pub use backend::{CoordinationStore, MemoryStore, RedisStore, RemoteTier};
pub use client::CoordinatedCache;
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{CacheError, Result};
pub use lock::{CacheLock, LockProvider};
pub use sync::{LocalTier, SyncBus, SyncEventType, SyncListener, SyncMessage, SyncSubscription};
pub use write::{CacheWriter, WriteBehind, WriteStrategy, WriteThrough};

/// oxtier 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
