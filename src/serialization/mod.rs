//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了类型化缓存值与字节之间的编解码。协调层本身只处理不透明的字节。

pub mod json;

use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};

pub use json::JsonCodec;

/// 值编解码器
pub trait ValueCodec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// 编解码器枚举
///
/// `ValueCodec` 带泛型方法，不能做成 trait object，需要动态选择时用这个枚举
#[derive(Clone, Debug)]
pub enum CodecEnum {
    Json(JsonCodec),
}

impl Default for CodecEnum {
    fn default() -> Self {
        CodecEnum::Json(JsonCodec::new())
    }
}

impl ValueCodec for CodecEnum {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecEnum::Json(c) => c.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            CodecEnum::Json(c) => c.decode(data),
        }
    }
}
