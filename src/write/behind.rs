//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 写回策略：写入先记录在按键合并的缓冲区中，由定时器批量刷新到外部记录系统。

use super::CacheWriter;
use crate::config::WriteConfig;
use crate::error::{CacheError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// 某个键最新的待写操作，后写覆盖先写
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Write(Vec<u8>),
    Delete,
}

#[derive(Debug, Default)]
struct StatsCounters {
    enqueued: AtomicU64,
    coalesced: AtomicU64,
    overflow_writes: AtomicU64,
    batches_dispatched: AtomicU64,
    batches_failed: AtomicU64,
    keys_written: AtomicU64,
    keys_deleted: AtomicU64,
}

/// 写回统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBehindStats {
    pub enqueued: u64,
    /// 覆盖了尚未刷新的旧操作的次数
    pub coalesced: u64,
    /// 缓冲区满时改为同步写入的次数
    pub overflow_writes: u64,
    pub batches_dispatched: u64,
    pub batches_failed: u64,
    pub keys_written: u64,
    pub keys_deleted: u64,
}

enum Batch {
    Writes(HashMap<String, Vec<u8>>),
    Deletes(HashSet<String>),
}

struct Shared {
    writer: Arc<dyn CacheWriter>,
    pending: DashMap<String, PendingWrite>,
    /// 缓冲区占用的槽位，先预留再插入，保证条目数不超过容量
    occupied: AtomicUsize,
    config: WriteConfig,
    tracker: TaskTracker,
    trigger: Notify,
    stats: Arc<StatsCounters>,
}

impl Shared {
    /// 取出缓冲区中的全部条目并分批派发
    ///
    /// 每个条目在派发前从缓冲区原子移除，因此每次入队只会被刷新一次
    fn drain(&self) -> usize {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        if keys.is_empty() {
            return 0;
        }

        let batch_size = self.config.batch_size.max(1);
        let mut writes = HashMap::new();
        let mut deletes = HashSet::new();
        let mut drained = 0;

        for key in keys {
            let Some((key, operation)) = self.pending.remove(&key) else {
                continue;
            };
            self.occupied.fetch_sub(1, Ordering::AcqRel);
            drained += 1;
            match operation {
                PendingWrite::Write(value) => {
                    writes.insert(key, value);
                    if writes.len() >= batch_size {
                        self.dispatch(Batch::Writes(std::mem::take(&mut writes)));
                    }
                }
                PendingWrite::Delete => {
                    deletes.insert(key);
                    if deletes.len() >= batch_size {
                        self.dispatch(Batch::Deletes(std::mem::take(&mut deletes)));
                    }
                }
            }
        }

        if !writes.is_empty() {
            self.dispatch(Batch::Writes(writes));
        }
        if !deletes.is_empty() {
            self.dispatch(Batch::Deletes(deletes));
        }
        debug!("Write-behind drained {} keys", drained);
        drained
    }

    /// 每个批次作为独立任务执行，慢写不会阻塞定时器和后续合并
    fn dispatch(&self, batch: Batch) {
        let writer = self.writer.clone();
        let stats = self.stats.clone();
        stats.batches_dispatched.fetch_add(1, Ordering::Relaxed);

        self.tracker.spawn(async move {
            let (kind, size, counter, result) = match batch {
                Batch::Writes(entries) => {
                    let size = entries.len();
                    let result = writer.write_all(entries).await;
                    ("write", size, &stats.keys_written, result)
                }
                Batch::Deletes(keys) => {
                    let size = keys.len();
                    let result = writer.delete_all(keys).await;
                    ("delete", size, &stats.keys_deleted, result)
                }
            };
            match result {
                Ok(()) => {
                    counter.fetch_add(size as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                    error!("Write-behind {} batch of {} keys failed: {}", kind, size, e);
                }
            }
        });
    }
}

/// 写回调度器
///
/// 创建时启动刷新定时器；`flush` 立即刷新并等待所有批次；`shutdown` 停止定时器后做最后一次刷新
pub struct WriteBehind {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBehind {
    pub fn start(writer: Arc<dyn CacheWriter>, config: WriteConfig) -> Self {
        let period = Duration::from_millis(config.drain_period_millis.max(1));
        let shared = Arc::new(Shared {
            writer,
            pending: DashMap::with_capacity(config.batch_size),
            occupied: AtomicUsize::new(0),
            config,
            tracker: TaskTracker::new(),
            trigger: Notify::new(),
            stats: Arc::new(StatsCounters::default()),
        });
        let shutdown = CancellationToken::new();

        let timer = tokio::spawn(run_timer(shared.clone(), shutdown.clone(), period));
        info!("Write-behind started: drain period {:?}", period);

        Self {
            shared,
            shutdown,
            timer: Mutex::new(Some(timer)),
        }
    }

    pub async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.enqueue(key, PendingWrite::Write(value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.enqueue(key, PendingWrite::Delete).await
    }

    #[instrument(skip(self, operation), level = "debug")]
    async fn enqueue(&self, key: &str, operation: PendingWrite) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(CacheError::Shutdown("write-behind is shut down".to_string()));
        }

        let shared = &self.shared;
        // 判定和插入在同一个分片锁内完成
        let operation = match shared.pending.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(operation);
                shared.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                shared.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Entry::Vacant(entry) => {
                if shared.occupied.fetch_add(1, Ordering::AcqRel) < shared.config.queue_capacity {
                    entry.insert(operation);
                    shared.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                shared.occupied.fetch_sub(1, Ordering::AcqRel);
                operation
            }
        };

        // 缓冲区已满：触发刷新，本次调用同步写入
        shared.stats.overflow_writes.fetch_add(1, Ordering::Relaxed);
        shared.trigger.notify_one();
        warn!("Write-behind queue full, writing {} inline", key);
        match operation {
            PendingWrite::Write(value) => shared.writer.write(key, &value).await,
            PendingWrite::Delete => shared.writer.delete(key).await,
        }
    }

    /// 尚未刷新的键数
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn pending(&self, key: &str) -> Option<PendingWrite> {
        self.shared.pending.get(key).map(|e| e.value().clone())
    }

    /// 立即刷新并等待所有在途批次完成
    pub async fn flush(&self) {
        self.shared.drain();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared.tracker.reopen();
    }

    /// 停止定时器并做最后一次刷新，可重复调用
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!("Write-behind timer ended abnormally: {}", e);
            }
            info!("Write-behind shutting down, {} keys pending", self.pending_len());
        }
        self.flush().await;
    }

    pub fn stats(&self) -> WriteBehindStats {
        let s = &self.shared.stats;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WriteBehindStats {
            enqueued: load(&s.enqueued),
            coalesced: load(&s.coalesced),
            overflow_writes: load(&s.overflow_writes),
            batches_dispatched: load(&s.batches_dispatched),
            batches_failed: load(&s.batches_failed),
            keys_written: load(&s.keys_written),
            keys_deleted: load(&s.keys_deleted),
        }
    }
}

impl Drop for WriteBehind {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if !self.shared.pending.is_empty() {
            warn!(
                "Write-behind dropped with {} unflushed keys",
                self.shared.pending.len()
            );
        }
    }
}

async fn run_timer(shared: Arc<Shared>, shutdown: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            _ = shared.trigger.notified() => {}
        }
        shared.drain();
    }
    debug!("Write-behind timer stopped");
}
