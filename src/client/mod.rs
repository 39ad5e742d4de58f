//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了面向调用方的缓存客户端。

pub mod coordinated;

pub use coordinated::CoordinatedCache;
