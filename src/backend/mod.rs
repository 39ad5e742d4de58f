//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调存储的接口与实现，以及进程内的本地缓存层。

pub mod l1;
pub mod memory_store;
pub mod redis_provider;
pub mod redis_store;
pub mod store;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{
    CoordinationStore, LogPosition, LogRecord, ReleaseOutcome, RemoteTier, TryAcquireOutcome,
};
