//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 本地锁句柄注册表：键 -> {句柄, 引用计数}，与服务端的 {owner: holdCount} 对称。

use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

struct RegistryEntry<H> {
    handle: Arc<H>,
    refs: usize,
}

/// 一次 release 的结果
pub enum Released<H> {
    /// 仍有其他本地引用
    Retained(usize),
    /// 最后一个引用，句柄已从注册表移除
    Removed(Arc<H>),
    /// 注册表中没有该键（release 多于 acquire）
    Unknown,
}

/// 锁句柄注册表
///
/// 所有更新都在 DashMap 的分片锁内原子完成
pub struct LockRegistry<H> {
    entries: DashMap<String, RegistryEntry<H>>,
}

impl<H> LockRegistry<H> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
        }
    }

    /// 取得或创建句柄并递增计数
    pub fn acquire_with(&self, name: &str, create: impl FnOnce() -> H) -> Arc<H> {
        let mut entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| RegistryEntry {
                handle: Arc::new(create()),
                refs: 0,
            });
        entry.refs += 1;
        entry.handle.clone()
    }

    /// 递减计数，归零时删除
    pub fn release(&self, name: &str) -> Released<H> {
        let mut remaining = None;
        let removed = self.entries.remove_if_mut(name, |_, entry| {
            entry.refs = entry.refs.saturating_sub(1);
            remaining = Some(entry.refs);
            entry.refs == 0
        });

        match (removed, remaining) {
            (Some((_, entry)), _) => Released::Removed(entry.handle),
            (None, Some(refs)) => Released::Retained(refs),
            (None, None) => {
                warn!("LockRegistry: release without matching acquire: {}", name);
                Released::Unknown
            }
        }
    }

    pub fn ref_count(&self, name: &str) -> usize {
        self.entries.get(name).map(|e| e.refs).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
