//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 写回调度器的集成测试，使用记录每次调用的写入器。

#[path = "../common/mod.rs"]
mod common;

use async_trait::async_trait;
use common::setup_logging;
use oxtier::config::{WriteConfig, WriteStrategyKind};
use oxtier::{CacheError, CacheWriter, Result, WriteBehind, WriteStrategy};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Write(String, Vec<u8>),
    WriteAll(HashMap<String, Vec<u8>>),
    Delete(String),
    DeleteAll(HashSet<String>),
}

/// 记录调用顺序的写入器，可切换为失败模式
#[derive(Default)]
struct RecordingWriter {
    calls: Mutex<Vec<Call>>,
    failing: AtomicBool,
}

impl RecordingWriter {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Writer("record system unavailable".to_string()));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    /// 所有批量写入中每个键最后一次写入的值
    fn written(&self) -> HashMap<String, Vec<u8>> {
        let mut written = HashMap::new();
        for call in self.calls() {
            match call {
                Call::Write(key, value) => {
                    written.insert(key, value);
                }
                Call::WriteAll(entries) => written.extend(entries),
                _ => {}
            }
        }
        written
    }
}

#[async_trait]
impl CacheWriter for RecordingWriter {
    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.record(Call::Write(key.to_string(), value.to_vec()))
    }

    async fn write_all(&self, entries: HashMap<String, Vec<u8>>) -> Result<()> {
        self.record(Call::WriteAll(entries))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.record(Call::Delete(key.to_string()))
    }

    async fn delete_all(&self, keys: HashSet<String>) -> Result<()> {
        self.record(Call::DeleteAll(keys))
    }
}

fn config(batch_size: usize, drain_period_millis: u64, queue_capacity: usize) -> WriteConfig {
    WriteConfig {
        strategy: WriteStrategyKind::Behind,
        batch_size,
        drain_period_millis,
        queue_capacity,
    }
}

#[tokio::test]
async fn test_repeated_writes_coalesce_to_latest_value() {
    setup_logging();
    let writer = Arc::new(RecordingWriter::default());
    let behind = WriteBehind::start(writer.clone(), config(10, 60_000, 100));

    for i in 0..50u8 {
        behind.write("k", vec![i]).await.unwrap();
    }
    assert_eq!(behind.pending_len(), 1);
    behind.flush().await;

    let calls = writer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        Call::WriteAll(HashMap::from([("k".to_string(), vec![49])]))
    );
    let stats = behind.stats();
    assert_eq!(stats.enqueued, 50);
    assert_eq!(stats.coalesced, 49);
    assert_eq!(stats.keys_written, 1);
    behind.shutdown().await;
}

/// 批大小为 2，连续写入 3 个不同的键，应分成 2 + 1 两个批次
#[tokio::test]
async fn test_three_keys_split_into_two_batches() {
    setup_logging();
    let writer = Arc::new(RecordingWriter::default());
    let behind = WriteBehind::start(writer.clone(), config(2, 60_000, 100));

    for key in ["a", "b", "c"] {
        behind.write(key, key.as_bytes().to_vec()).await.unwrap();
    }
    behind.flush().await;

    let mut sizes: Vec<usize> = writer
        .calls()
        .into_iter()
        .map(|call| match call {
            Call::WriteAll(entries) => entries.len(),
            other => panic!("unexpected call {:?}", other),
        })
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec![1, 2]);
    assert_eq!(writer.written().len(), 3);
    behind.shutdown().await;
}

#[tokio::test]
async fn test_delete_overrides_pending_write() {
    setup_logging();
    let writer = Arc::new(RecordingWriter::default());
    let behind = WriteBehind::start(writer.clone(), config(10, 60_000, 100));

    behind.write("k", b"v".to_vec()).await.unwrap();
    behind.delete("k").await.unwrap();
    behind.flush().await;

    assert_eq!(
        writer.calls(),
        vec![Call::DeleteAll(HashSet::from(["k".to_string()]))]
    );
    assert_eq!(behind.stats().keys_deleted, 1);
    behind.shutdown().await;
}

#[tokio::test]
async fn test_timer_drains_without_flush() {
    setup_logging();
    let writer = Arc::new(RecordingWriter::default());
    let behind = WriteBehind::start(writer.clone(), config(10, 50, 100));

    behind.write("k", b"v".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(behind.pending_len(), 0);
    assert_eq!(writer.written().get("k"), Some(&b"v".to_vec()));
    behind.shutdown().await;
}

#[tokio::test]
async fn test_full_queue_writes_inline() {
    setup_logging();
    let writer = Arc::new(RecordingWriter::default());
    let behind = WriteBehind::start(writer.clone(), config(10, 60_000, 2));

    behind.write("a", b"1".to_vec()).await.unwrap();
    behind.write("b", b"2".to_vec()).await.unwrap();
    behind.write("c", b"3".to_vec()).await.unwrap();
    // 已在缓冲区中的键仍可合并
    behind.write("a", b"4".to_vec()).await.unwrap();

    assert!(writer
        .calls()
        .contains(&Call::Write("c".to_string(), b"3".to_vec())));
    assert_eq!(behind.stats().overflow_writes, 1);

    behind.flush().await;
    let written = writer.written();
    assert_eq!(written.get("a"), Some(&b"4".to_vec()));
    assert_eq!(written.get("b"), Some(&b"2".to_vec()));
    behind.shutdown().await;
}

#[tokio::test]
async fn test_failed_batch_is_counted_and_not_retried() {
    setup_logging();
    let writer = Arc::new(RecordingWriter::default());
    let behind = WriteBehind::start(writer.clone(), config(10, 60_000, 100));

    writer.failing.store(true, Ordering::SeqCst);
    behind.write("k", b"v".to_vec()).await.unwrap();
    behind.flush().await;
    writer.failing.store(false, Ordering::SeqCst);
    behind.flush().await;

    assert!(writer.calls().is_empty());
    assert_eq!(behind.pending_len(), 0);
    assert_eq!(behind.stats().batches_failed, 1);
    behind.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_and_rejects_new_writes() {
    setup_logging();
    let writer = Arc::new(RecordingWriter::default());
    let behind = WriteBehind::start(writer.clone(), config(10, 60_000, 100));

    behind.write("a", b"1".to_vec()).await.unwrap();
    behind.delete("b").await.unwrap();
    behind.shutdown().await;
    behind.shutdown().await;

    assert_eq!(writer.written().get("a"), Some(&b"1".to_vec()));
    assert!(writer
        .calls()
        .contains(&Call::DeleteAll(HashSet::from(["b".to_string()]))));
    assert!(matches!(
        behind.write("c", b"3".to_vec()).await,
        Err(CacheError::Shutdown(_))
    ));
}

#[tokio::test]
async fn test_strategy_from_config_selects_behind() {
    setup_logging();
    let writer = Arc::new(RecordingWriter::default());
    let strategy = WriteStrategy::from_config(writer.clone(), &config(10, 60_000, 100));
    assert_eq!(strategy.kind(), WriteStrategyKind::Behind);

    strategy.write("k", b"v").await.unwrap();
    assert!(writer.calls().is_empty());
    strategy.flush().await;
    assert_eq!(writer.written().get("k"), Some(&b"v".to_vec()));
    strategy.shutdown().await;

    let through = WriteStrategy::from_config(
        writer.clone(),
        &WriteConfig {
            strategy: WriteStrategyKind::Through,
            ..WriteConfig::default()
        },
    );
    through.delete("k").await.unwrap();
    assert_eq!(writer.calls().last(), Some(&Call::Delete("k".to_string())));
}
