//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 写穿策略：与缓存调用同步地写入外部记录系统。

use super::CacheWriter;
use crate::error::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct WriteThrough {
    writer: Arc<dyn CacheWriter>,
}

impl WriteThrough {
    pub fn new(writer: Arc<dyn CacheWriter>) -> Self {
        Self { writer }
    }

    #[instrument(skip(self, value), level = "debug")]
    pub async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.writer.write(key, value).await
    }

    pub async fn write_all(&self, entries: HashMap<String, Vec<u8>>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        debug!("Write-through batch: {} entries", entries.len());
        self.writer.write_all(entries).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.writer.delete(key).await
    }

    pub async fn delete_all(&self, keys: HashSet<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.writer.delete_all(keys).await
    }
}
