//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! JSON 编解码器，启用 `flate2` 特性时可选 gzip 压缩。

use super::ValueCodec;
use crate::error::{CacheError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// JSON 编解码器
#[derive(Clone, Debug, Default)]
pub struct JsonCodec {
    compress: bool,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self { compress: false }
    }

    /// 编码后再做 gzip 压缩
    #[cfg(feature = "flate2")]
    pub fn with_compression() -> Self {
        Self { compress: true }
    }

    pub fn is_compressed(&self) -> bool {
        self.compress
    }
}

#[cfg(feature = "flate2")]
fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(data)
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CacheError::Serialization(e.to_string()))
}

#[cfg(feature = "flate2")]
fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| CacheError::Serialization(e.to_string()))?;
    Ok(decoded)
}

impl ValueCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        #[cfg(feature = "flate2")]
        {
            if self.compress {
                return gzip(&bytes);
            }
        }
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        #[cfg(feature = "flate2")]
        {
            if self.compress {
                let bytes = gunzip(data)?;
                return serde_json::from_slice(&bytes)
                    .map_err(|e| CacheError::Serialization(e.to_string()));
            }
        }
        serde_json::from_slice(data).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}
