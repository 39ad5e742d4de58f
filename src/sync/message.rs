//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 同步消息及其线上编码。
//!
//! 一条消息对应日志中的一条记录，字段为扁平的 字段名 -> 值 映射，便于用通用工具直接查看：
//! `originId`、`type`（小整数）、`keys`（JSON 数组，可选）、`payload`（可选）、`timestamp`（毫秒），
//! 以及用于路由的 `cacheName`（可选）。

use crate::error::{CacheError, Result};
use std::fmt;

pub const FIELD_ORIGIN_ID: &str = "originId";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_KEYS: &str = "keys";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_CACHE_NAME: &str = "cacheName";

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventType {
    Put,
    PutAll,
    Remove,
    RemoveAll,
    Clear,
    Load,
    LoadAll,
}

impl SyncEventType {
    pub fn code(&self) -> u8 {
        match self {
            SyncEventType::Put => 1,
            SyncEventType::PutAll => 2,
            SyncEventType::Remove => 3,
            SyncEventType::RemoveAll => 4,
            SyncEventType::Clear => 5,
            SyncEventType::Load => 6,
            SyncEventType::LoadAll => 7,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(SyncEventType::Put),
            2 => Ok(SyncEventType::PutAll),
            3 => Ok(SyncEventType::Remove),
            4 => Ok(SyncEventType::RemoveAll),
            5 => Ok(SyncEventType::Clear),
            6 => Ok(SyncEventType::Load),
            7 => Ok(SyncEventType::LoadAll),
            other => Err(CacheError::Serialization(format!(
                "unknown sync event type: {}",
                other
            ))),
        }
    }

    /// 是否携带多个键
    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            SyncEventType::PutAll | SyncEventType::RemoveAll | SyncEventType::LoadAll
        )
    }
}

impl fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncEventType::Put => "PUT",
            SyncEventType::PutAll => "PUT_ALL",
            SyncEventType::Remove => "REMOVE",
            SyncEventType::RemoveAll => "REMOVE_ALL",
            SyncEventType::Clear => "CLEAR",
            SyncEventType::Load => "LOAD",
            SyncEventType::LoadAll => "LOAD_ALL",
        };
        f.write_str(name)
    }
}

/// 同步消息，发布后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    pub origin_id: String,
    pub event_type: SyncEventType,
    pub cache_name: Option<String>,
    pub keys: Vec<String>,
    /// 单键事件为原始值；批量事件为与 `keys` 对齐的值数组（JSON）
    pub payload: Option<Vec<u8>>,
    pub timestamp: i64,
}

impl SyncMessage {
    pub fn new(origin_id: impl Into<String>, event_type: SyncEventType) -> Self {
        Self {
            origin_id: origin_id.into(),
            event_type,
            cache_name: None,
            keys: Vec::new(),
            payload: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_cache_name(mut self, cache_name: impl Into<String>) -> Self {
        self.cache_name = Some(cache_name.into());
        self
    }

    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// 批量事件的值载荷：与键一一对应
    pub fn with_values(self, values: &[Vec<u8>]) -> Result<Self> {
        let payload = serde_json::to_vec(values)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(self.with_payload(payload))
    }

    /// 解出批量事件的值数组，长度必须与键数一致
    pub fn values(&self) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(payload) = &self.payload else {
            return Ok(None);
        };
        let values: Vec<Vec<u8>> = serde_json::from_slice(payload)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        if values.len() != self.keys.len() {
            return Err(CacheError::Serialization(format!(
                "payload has {} values for {} keys",
                values.len(),
                self.keys.len()
            )));
        }
        Ok(Some(values))
    }

    /// 编码为日志记录字段
    pub fn encode(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut fields = vec![
            (FIELD_ORIGIN_ID.to_string(), self.origin_id.clone().into_bytes()),
            (
                FIELD_TYPE.to_string(),
                self.event_type.code().to_string().into_bytes(),
            ),
            (
                FIELD_TIMESTAMP.to_string(),
                self.timestamp.to_string().into_bytes(),
            ),
        ];
        if let Some(cache_name) = &self.cache_name {
            fields.push((FIELD_CACHE_NAME.to_string(), cache_name.clone().into_bytes()));
        }
        if !self.keys.is_empty() {
            let keys = serde_json::to_vec(&self.keys)
                .map_err(|e| CacheError::Serialization(e.to_string()))?;
            fields.push((FIELD_KEYS.to_string(), keys));
        }
        if let Some(payload) = &self.payload {
            fields.push((FIELD_PAYLOAD.to_string(), payload.clone()));
        }
        Ok(fields)
    }

    /// 从日志记录字段解码，未知字段忽略
    pub fn decode(fields: &[(String, Vec<u8>)]) -> Result<Self> {
        let field = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_slice())
        };
        let text = |name: &str| -> Result<Option<String>> {
            field(name)
                .map(|v| {
                    String::from_utf8(v.to_vec()).map_err(|e| {
                        CacheError::Serialization(format!("field {} is not utf-8: {}", name, e))
                    })
                })
                .transpose()
        };
        let missing = |name: &str| CacheError::Serialization(format!("missing field: {}", name));

        let origin_id = text(FIELD_ORIGIN_ID)?.ok_or_else(|| missing(FIELD_ORIGIN_ID))?;
        let code: u8 = text(FIELD_TYPE)?
            .ok_or_else(|| missing(FIELD_TYPE))?
            .trim()
            .parse()
            .map_err(|_| CacheError::Serialization("invalid type field".to_string()))?;
        let timestamp = match text(FIELD_TIMESTAMP)? {
            Some(ts) => ts
                .trim()
                .parse()
                .map_err(|_| CacheError::Serialization("invalid timestamp field".to_string()))?,
            None => 0,
        };
        let keys = match field(FIELD_KEYS) {
            Some(raw) => serde_json::from_slice(raw)
                .map_err(|e| CacheError::Serialization(e.to_string()))?,
            None => Vec::new(),
        };

        Ok(Self {
            origin_id,
            event_type: SyncEventType::from_code(code)?,
            cache_name: text(FIELD_CACHE_NAME)?,
            keys,
            payload: field(FIELD_PAYLOAD).map(|v| v.to_vec()),
            timestamp,
        })
    }
}
