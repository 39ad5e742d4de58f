//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 进程内协调存储，脚本语义与 Redis 实现一致，用于单进程部署以及同进程内模拟多实例。

use super::store::{
    CoordinationStore, LogPosition, LogRecord, ReleaseOutcome, RemoteTier, TryAcquireOutcome,
};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// 锁条目：持有者 -> 重入计数，整体共享一个过期时间
struct LockEntry {
    holders: HashMap<String, u64>,
    expires_at: Instant,
}

#[derive(Default)]
struct Topic {
    records: VecDeque<LogRecord>,
    last: LogPosition,
}

/// 进程内协调存储
pub struct MemoryStore {
    locks: Mutex<HashMap<String, LockEntry>>,
    topics: Mutex<HashMap<String, Topic>>,
    values: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
    appended: Notify,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// 模拟存储不可达：关闭后所有操作返回传输错误
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.appended.notify_waiters();
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Transport("memory store unavailable".to_string()))
        }
    }

    /// 某个锁当前各持有者的计数（过期条目视为不存在）
    pub fn lock_holders(&self, lock_name: &str) -> HashMap<String, u64> {
        let mut locks = guard(&self.locks);
        Self::evict_expired(&mut locks, lock_name);
        locks
            .get(lock_name)
            .map(|entry| entry.holders.clone())
            .unwrap_or_default()
    }

    /// 主题中保留的记录数
    pub fn topic_len(&self, topic: &str) -> usize {
        guard(&self.topics)
            .get(topic)
            .map(|t| t.records.len())
            .unwrap_or(0)
    }

    fn evict_expired(locks: &mut HashMap<String, LockEntry>, lock_name: &str) {
        if let Some(entry) = locks.get(lock_name) {
            if entry.expires_at <= Instant::now() {
                debug!("MemoryStore: lock {} expired", lock_name);
                locks.remove(lock_name);
            }
        }
    }

    fn collect_after(&self, topic: &str, after: LogPosition, count: usize) -> Vec<LogRecord> {
        guard(&self.topics)
            .get(topic)
            .map(|t| {
                t.records
                    .iter()
                    .filter(|r| r.position > after)
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    #[instrument(skip(self), level = "debug")]
    async fn try_acquire(
        &self,
        lock_name: &str,
        owner_id: &str,
        lease_millis: u64,
    ) -> Result<TryAcquireOutcome> {
        self.check_available()?;
        let mut locks = guard(&self.locks);
        Self::evict_expired(&mut locks, lock_name);
        let expires_at = Instant::now() + Duration::from_millis(lease_millis);

        match locks.get_mut(lock_name) {
            None => {
                locks.insert(
                    lock_name.to_string(),
                    LockEntry {
                        holders: HashMap::from([(owner_id.to_string(), 1)]),
                        expires_at,
                    },
                );
                Ok(TryAcquireOutcome::Acquired)
            }
            Some(entry) => match entry.holders.get_mut(owner_id) {
                Some(count) => {
                    *count += 1;
                    entry.expires_at = expires_at;
                    Ok(TryAcquireOutcome::Acquired)
                }
                None => {
                    let remaining = entry.expires_at.saturating_duration_since(Instant::now());
                    Ok(TryAcquireOutcome::Contended {
                        wait_millis: remaining.as_millis() as u64,
                    })
                }
            },
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(
        &self,
        lock_name: &str,
        owner_id: &str,
        lease_millis: u64,
    ) -> Result<ReleaseOutcome> {
        self.check_available()?;
        let mut locks = guard(&self.locks);
        Self::evict_expired(&mut locks, lock_name);

        let Some(entry) = locks.get_mut(lock_name) else {
            return Ok(ReleaseOutcome::AlreadyReleased);
        };
        let Some(count) = entry.holders.get_mut(owner_id) else {
            return Ok(ReleaseOutcome::AlreadyReleased);
        };

        *count -= 1;
        if *count > 0 {
            entry.expires_at = Instant::now() + Duration::from_millis(lease_millis);
            return Ok(ReleaseOutcome::StillHeld);
        }

        entry.holders.remove(owner_id);
        // 持有者为空时删除整个条目，永远不保留空表
        if entry.holders.is_empty() {
            locks.remove(lock_name);
            Ok(ReleaseOutcome::FullyReleased)
        } else {
            Ok(ReleaseOutcome::StillHeld)
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn renew(&self, lock_name: &str, owner_id: &str, lease_millis: u64) -> Result<bool> {
        self.check_available()?;
        let mut locks = guard(&self.locks);
        Self::evict_expired(&mut locks, lock_name);
        match locks.get_mut(lock_name) {
            Some(entry) if entry.holders.contains_key(owner_id) => {
                entry.expires_at = Instant::now() + Duration::from_millis(lease_millis);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn server_time_millis(&self) -> Result<u64> {
        self.check_available()?;
        Ok(now_millis())
    }

    #[instrument(skip(self, fields), level = "debug", fields(field_count = fields.len()))]
    async fn append(
        &self,
        topic: &str,
        fields: Vec<(String, Vec<u8>)>,
        max_len: usize,
    ) -> Result<LogPosition> {
        self.check_available()?;
        let position = {
            let mut topics = guard(&self.topics);
            let topic = topics.entry(topic.to_string()).or_default();
            let now = now_millis();
            let position = if now > topic.last.millis {
                LogPosition::new(now, 0)
            } else {
                topic.last.next()
            };
            topic.last = position;
            topic.records.push_back(LogRecord { position, fields });
            while topic.records.len() > max_len.max(1) {
                topic.records.pop_front();
            }
            position
        };
        self.appended.notify_waiters();
        Ok(position)
    }

    async fn read(
        &self,
        topic: &str,
        after: LogPosition,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            let records = self.collect_after(topic, after, count);
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[async_trait]
impl RemoteTier for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let mut values = guard(&self.values);
        match values.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= Instant::now() => {
                values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        guard(&self.values).insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.check_available()?;
        let mut values = guard(&self.values);
        for key in keys {
            values.remove(key);
        }
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<()> {
        self.check_available()?;
        guard(&self.values).retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}
