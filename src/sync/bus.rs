//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了变更广播总线：发布写入追加日志，订阅从游标处持续拉取。

use super::cursor::SyncCursor;
use super::message::{SyncEventType, SyncMessage};
use super::SyncListener;
use crate::backend::store::{CoordinationStore, LogPosition, LogRecord};
use crate::config::{SyncConfig, SyncPolicy};
use crate::error::{CacheError, Result};
use crate::metrics::CoordinatorMetrics;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// 变更广播总线
pub struct SyncBus {
    store: Arc<dyn CoordinationStore>,
    instance_id: String,
    config: SyncConfig,
    topic: String,
    metrics: Arc<CoordinatorMetrics>,
}

impl SyncBus {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        instance_id: impl Into<String>,
        config: SyncConfig,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        let topic = config.topic();
        Self {
            store,
            instance_id: instance_id.into(),
            config,
            topic,
            metrics,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// 默认主题
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn policy(&self) -> SyncPolicy {
        self.config.policy
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// 发布到默认主题
    pub async fn publish(&self, message: &SyncMessage) -> Result<LogPosition> {
        self.publish_to(&self.topic, message).await
    }

    /// 追加到指定主题，不等待任何订阅者
    #[instrument(skip(self, message), fields(event = %message.event_type), level = "debug")]
    pub async fn publish_to(&self, topic: &str, message: &SyncMessage) -> Result<LogPosition> {
        let fields = message.encode()?;
        match self
            .store
            .append(topic, fields, self.config.max_log_length)
            .await
        {
            Ok(position) => {
                CoordinatorMetrics::incr(&self.metrics.sync_published);
                debug!("Sync message published: topic={}, position={}", topic, position);
                Ok(position)
            }
            Err(e) => {
                CoordinatorMetrics::incr(&self.metrics.sync_publish_failed);
                Err(e)
            }
        }
    }

    fn message(&self, cache_name: &str, event_type: SyncEventType) -> SyncMessage {
        SyncMessage::new(self.instance_id.clone(), event_type).with_cache_name(cache_name)
    }

    fn replicate(&self) -> bool {
        self.config.policy == SyncPolicy::Replicate
    }

    /// 发布单键事件，复制策略下附带值
    async fn publish_single(
        &self,
        cache_name: &str,
        event_type: SyncEventType,
        key: &str,
        value: Option<&[u8]>,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut message = self
            .message(cache_name, event_type)
            .with_keys(vec![key.to_string()]);
        if let (true, Some(value)) = (self.replicate(), value) {
            message = message.with_payload(value.to_vec());
        }
        self.publish(&message).await.map(|_| ())
    }

    async fn publish_bulk(
        &self,
        cache_name: &str,
        event_type: SyncEventType,
        entries: &[(String, Vec<u8>)],
    ) -> Result<()> {
        if !self.config.enabled || entries.is_empty() {
            return Ok(());
        }
        let keys = entries.iter().map(|(k, _)| k.clone()).collect();
        let mut message = self.message(cache_name, event_type).with_keys(keys);
        if self.replicate() {
            let values: Vec<Vec<u8>> = entries.iter().map(|(_, v)| v.clone()).collect();
            message = message.with_values(&values)?;
        }
        self.publish(&message).await.map(|_| ())
    }

    pub async fn publish_put(&self, cache_name: &str, key: &str, value: &[u8]) -> Result<()> {
        self.publish_single(cache_name, SyncEventType::Put, key, Some(value))
            .await
    }

    pub async fn publish_load(&self, cache_name: &str, key: &str, value: &[u8]) -> Result<()> {
        self.publish_single(cache_name, SyncEventType::Load, key, Some(value))
            .await
    }

    pub async fn publish_put_all(
        &self,
        cache_name: &str,
        entries: &[(String, Vec<u8>)],
    ) -> Result<()> {
        self.publish_bulk(cache_name, SyncEventType::PutAll, entries)
            .await
    }

    pub async fn publish_load_all(
        &self,
        cache_name: &str,
        entries: &[(String, Vec<u8>)],
    ) -> Result<()> {
        self.publish_bulk(cache_name, SyncEventType::LoadAll, entries)
            .await
    }

    pub async fn publish_remove(&self, cache_name: &str, key: &str) -> Result<()> {
        self.publish_single(cache_name, SyncEventType::Remove, key, None)
            .await
    }

    pub async fn publish_remove_all(&self, cache_name: &str, keys: &[String]) -> Result<()> {
        if !self.config.enabled || keys.is_empty() {
            return Ok(());
        }
        let message = self
            .message(cache_name, SyncEventType::RemoveAll)
            .with_keys(keys.to_vec());
        self.publish(&message).await.map(|_| ())
    }

    pub async fn publish_clear(&self, cache_name: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let message = self.message(cache_name, SyncEventType::Clear);
        self.publish(&message).await.map(|_| ())
    }

    /// 订阅默认主题
    pub async fn subscribe(&self, listener: Arc<dyn SyncListener>) -> Result<SyncSubscription> {
        let topic = self.topic.clone();
        self.subscribe_to(&topic, listener).await
    }

    /// 订阅指定主题
    ///
    /// 起始位置为存储服务端的当前时间：订阅之前发布的消息不会重放
    pub async fn subscribe_to(
        &self,
        topic: &str,
        listener: Arc<dyn SyncListener>,
    ) -> Result<SyncSubscription> {
        let now = self.store.server_time_millis().await?;
        let cursor = Arc::new(SyncCursor::new(LogPosition::just_before(now)));
        let token = CancellationToken::new();
        let retries = TaskTracker::new();

        let applier = Arc::new(Applier {
            instance_id: self.instance_id.clone(),
            listener,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            token: token.clone(),
            retries: retries.clone(),
            retrying: DashMap::new(),
        });
        let tail = TailLoop {
            store: self.store.clone(),
            topic: topic.to_string(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            cursor: cursor.clone(),
            token: token.clone(),
            applier,
        };
        info!(
            "Sync subscription started: topic={}, from={}",
            topic,
            cursor.position()
        );
        let handle = tokio::spawn(tail.run());

        Ok(SyncSubscription {
            topic: topic.to_string(),
            token,
            cursor,
            handle: Some(handle),
            retries,
        })
    }
}

/// 订阅句柄
///
/// 取消后拉取循环和所有重试任务退出，尚未成功的重试被放弃；丢弃句柄等同于取消
pub struct SyncSubscription {
    topic: String,
    token: CancellationToken,
    cursor: Arc<SyncCursor>,
    handle: Option<JoinHandle<()>>,
    retries: TaskTracker,
}

impl SyncSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 最后消费的位置
    pub fn cursor(&self) -> LogPosition {
        self.cursor.position()
    }

    /// 仍在后台重试的消息数
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// 取消订阅，可重复调用
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!("Sync subscription cancelled: topic={}", self.topic);
            self.token.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 取消并等待拉取循环和重试任务退出
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Sync tail task ended abnormally: {}", e);
            }
        }
        self.retries.close();
        self.retries.wait().await;
    }
}

impl Drop for SyncSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 拉取循环的状态
struct TailLoop {
    store: Arc<dyn CoordinationStore>,
    topic: String,
    config: SyncConfig,
    metrics: Arc<CoordinatorMetrics>,
    cursor: Arc<SyncCursor>,
    token: CancellationToken,
    applier: Arc<Applier>,
}

impl TailLoop {
    async fn run(self) {
        let block = Duration::from_millis(self.config.block_millis);
        let pause = Duration::from_millis(self.config.pull_pause_millis);

        'tail: loop {
            let read = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                read = self.store.read(
                    &self.topic,
                    self.cursor.position(),
                    self.config.read_batch_size,
                    block,
                ) => read,
            };

            match read {
                Ok(records) => {
                    for record in records {
                        self.applier.handle(&record).await;
                        self.cursor.advance(record.position);
                        if self.token.is_cancelled() {
                            debug!("Sync tail stopped mid-batch: topic={}", self.topic);
                            break 'tail;
                        }
                    }
                }
                Err(e) => {
                    CoordinatorMetrics::incr(&self.metrics.sync_transport_pauses);
                    warn!(
                        "Sync tail read failed, pausing {:?}: topic={}: {}",
                        pause, self.topic, e
                    );
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
        debug!("Sync tail loop exited: topic={}", self.topic);
    }
}

/// 有重试在途的键
struct RetrySlot {
    /// 该键最新一条消息的位置，无论成功或失败
    newest: LogPosition,
    in_flight: usize,
}

/// 消息应用器
///
/// 首次应用在拉取循环内完成。失败的消息交给独立的重试任务，拉取循环继续推进游标，
/// 一条反复失败的消息不会拖慢其后无关键的消息。
struct Applier {
    instance_id: String,
    listener: Arc<dyn SyncListener>,
    config: SyncConfig,
    metrics: Arc<CoordinatorMetrics>,
    token: CancellationToken,
    retries: TaskTracker,
    retrying: DashMap<String, RetrySlot>,
}

fn slot_key(message: &SyncMessage, key: &str) -> String {
    format!("{}:{}", message.cache_name.as_deref().unwrap_or_default(), key)
}

impl Applier {
    async fn handle(self: &Arc<Self>, record: &LogRecord) {
        let message = match SyncMessage::decode(&record.fields) {
            Ok(message) => message,
            Err(e) => {
                warn!("Skipping undecodable sync record {}: {}", record.position, e);
                return;
            }
        };

        if message.origin_id == self.instance_id {
            CoordinatorMetrics::incr(&self.metrics.sync_skipped_self);
            return;
        }

        match self.listener.on_message(&message).await {
            Ok(()) => {
                CoordinatorMetrics::incr(&self.metrics.sync_applied);
                self.supersede(&message, record.position);
            }
            Err(e) => {
                self.record_failure(1, record.position, &message, &e);
                self.schedule_retry(message, record.position);
            }
        }
    }

    /// 已应用的消息取代同键上更早的在途重试；清空事件取代该缓存下的全部重试
    fn supersede(&self, message: &SyncMessage, position: LogPosition) {
        if self.retrying.is_empty() {
            return;
        }
        if message.event_type == SyncEventType::Clear {
            let prefix = slot_key(message, "");
            for mut slot in self.retrying.iter_mut() {
                if slot.key().starts_with(&prefix) && slot.newest < position {
                    slot.newest = position;
                }
            }
            return;
        }
        for key in &message.keys {
            if let Some(mut slot) = self.retrying.get_mut(&slot_key(message, key)) {
                if slot.newest < position {
                    slot.newest = position;
                }
            }
        }
    }

    /// 所有键都已有更新的消息时，本条消息不再需要重试
    fn is_superseded(&self, message: &SyncMessage, position: LogPosition) -> bool {
        !message.keys.is_empty()
            && message.keys.iter().all(|key| {
                self.retrying
                    .get(&slot_key(message, key))
                    .is_some_and(|slot| slot.newest > position)
            })
    }

    fn schedule_retry(self: &Arc<Self>, message: SyncMessage, position: LogPosition) {
        for key in &message.keys {
            let mut slot = self
                .retrying
                .entry(slot_key(&message, key))
                .or_insert(RetrySlot {
                    newest: position,
                    in_flight: 0,
                });
            slot.newest = slot.newest.max(position);
            slot.in_flight += 1;
        }
        let applier = self.clone();
        self.retries.spawn(async move {
            applier.retry(&message, position).await;
            applier.finish_retry(&message);
        });
    }

    fn finish_retry(&self, message: &SyncMessage) {
        for key in &message.keys {
            let key = slot_key(message, key);
            if let Some(mut slot) = self.retrying.get_mut(&key) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
            self.retrying.remove_if(&key, |_, slot| slot.in_flight == 0);
        }
    }

    /// 按指数退避重试，次数用尽后按上限间隔继续，直到成功、被取代或订阅取消
    async fn retry(&self, message: &SyncMessage, position: LogPosition) {
        let mut attempt: u32 = 1;
        loop {
            let delay = if attempt >= self.config.apply_max_attempts {
                Duration::from_millis(self.config.apply_max_backoff_millis)
            } else {
                self.backoff(attempt)
            };
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!("Sync retry abandoned on cancel: {}", position);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if self.is_superseded(message, position) {
                CoordinatorMetrics::incr(&self.metrics.sync_apply_superseded);
                debug!("Sync retry superseded by a newer message: {}", position);
                return;
            }

            match self.listener.on_message(message).await {
                Ok(()) => {
                    CoordinatorMetrics::incr(&self.metrics.sync_applied);
                    debug!("Sync message {} applied after {} attempts", position, attempt + 1);
                    return;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    self.record_failure(attempt, position, message, &e);
                }
            }
        }
    }

    fn record_failure(
        &self,
        attempt: u32,
        position: LogPosition,
        message: &SyncMessage,
        e: &CacheError,
    ) {
        CoordinatorMetrics::incr(&self.metrics.sync_apply_retries);
        if attempt == self.config.apply_max_attempts {
            CoordinatorMetrics::incr(&self.metrics.sync_apply_failed);
            error!(
                "Sync message {} ({}) still failing after {} attempts, retrying every {}ms: {}",
                position, message.event_type, attempt, self.config.apply_max_backoff_millis, e
            );
        } else {
            debug!(
                "Sync apply failed, attempt {}: {}: {}",
                attempt, position, e
            );
        }
    }

    /// base * 2^(attempt-1)，不超过上限
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self
            .config
            .apply_base_backoff_millis
            .saturating_mul(factor)
            .min(self.config.apply_max_backoff_millis);
        Duration::from_millis(millis)
    }
}
