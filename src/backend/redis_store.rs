//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了基于Redis的协调存储：锁脚本、TIME 以及基于 Stream 的追加日志。

use super::redis_provider::{DefaultRedisProvider, RedisProvider};
use super::store::{
    CoordinationStore, LogPosition, LogRecord, ReleaseOutcome, RemoteTier, TryAcquireOutcome,
};
use crate::config::{StoreConfig, StoreMode};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager, MultiplexedConnection};
use redis::cluster_async::ClusterConnection;
use redis::streams::StreamReadReply;
use redis::{Client, Cmd, Pipeline, RedisFuture, Script, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// 获取锁：不存在则新建 `{owner: 1}`，同一持有者重入计数加一；成功返回 nil，否则返回剩余 PTTL
const TRY_ACQUIRE_SCRIPT: &str = r#"
if (redis.call('exists', KEYS[1]) == 0) then
    redis.call('hset', KEYS[1], ARGV[2], 1);
    redis.call('pexpire', KEYS[1], ARGV[1]);
    return nil;
end;
if (redis.call('hexists', KEYS[1], ARGV[2]) == 1) then
    redis.call('hincrby', KEYS[1], ARGV[2], 1);
    redis.call('pexpire', KEYS[1], ARGV[1]);
    return nil;
end;
return redis.call('pttl', KEYS[1]);
"#;

/// 释放锁：-1 已释放，0 仍被持有，1 完全释放
const RELEASE_SCRIPT: &str = r#"
if (redis.call('hexists', KEYS[1], ARGV[2]) == 0) then
    return -1;
end;
local counter = redis.call('hincrby', KEYS[1], ARGV[2], -1);
if (counter > 0) then
    redis.call('pexpire', KEYS[1], ARGV[1]);
    return 0;
end;
redis.call('del', KEYS[1]);
return 1;
"#;

const RENEW_SCRIPT: &str = r#"
if (redis.call('hexists', KEYS[1], ARGV[2]) == 1) then
    redis.call('pexpire', KEYS[1], ARGV[1]);
    return 1;
end;
return 0;
"#;

struct LockScripts {
    try_acquire: Script,
    release: Script,
    renew: Script,
}

impl LockScripts {
    fn new() -> Self {
        Self {
            try_acquire: Script::new(TRY_ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
        }
    }
}

/// 单机和集群连接的统一封装
enum StoreConnection {
    Standalone(ConnectionManager),
    Tail(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for StoreConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            StoreConnection::Standalone(conn) => conn.req_packed_command(cmd),
            StoreConnection::Tail(conn) => conn.req_packed_command(cmd),
            StoreConnection::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            StoreConnection::Standalone(conn) => conn.req_packed_commands(cmd, offset, count),
            StoreConnection::Tail(conn) => conn.req_packed_commands(cmd, offset, count),
            StoreConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            StoreConnection::Standalone(conn) => conn.get_db(),
            StoreConnection::Tail(conn) => conn.get_db(),
            StoreConnection::Cluster(conn) => conn.get_db(),
        }
    }
}

enum Topology {
    Standalone {
        client: Client,
        manager: ConnectionManager,
        /// XREAD BLOCK 独占一条连接，避免阻塞共享的多路复用连接
        tail: Mutex<Option<MultiplexedConnection>>,
    },
    Cluster {
        conn: ClusterConnection,
    },
}

/// 基于Redis的协调存储
#[derive(Clone)]
pub struct RedisStore {
    topology: Arc<Topology>,
    scripts: Arc<LockScripts>,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.topology.as_ref() {
            Topology::Standalone { .. } => write!(f, "RedisStore::Standalone"),
            Topology::Cluster { .. } => write!(f, "RedisStore::Cluster"),
        }
    }
}

impl RedisStore {
    /// 按配置连接Redis
    #[instrument(skip(config), level = "info", name = "init_redis_store", fields(mode = ?config.mode))]
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        Self::connect_with_provider(config, Arc::new(DefaultRedisProvider)).await
    }

    /// 使用指定的Redis提供者连接
    pub async fn connect_with_provider(
        config: &StoreConfig,
        provider: Arc<dyn RedisProvider>,
    ) -> Result<Self> {
        let topology = match config.mode {
            StoreMode::Standalone => {
                let (client, manager) = provider.open_standalone(config).await?;
                Topology::Standalone {
                    client,
                    manager,
                    tail: Mutex::new(None),
                }
            }
            StoreMode::Cluster => Topology::Cluster {
                conn: provider.open_cluster(config).await?,
            },
            StoreMode::Memory => {
                return Err(CacheError::Configuration(
                    "RedisStore cannot be built for memory mode".to_string(),
                ))
            }
        };
        Ok(Self {
            topology: Arc::new(topology),
            scripts: Arc::new(LockScripts::new()),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
        })
    }

    async fn connection(&self) -> Result<StoreConnection> {
        match self.topology.as_ref() {
            Topology::Standalone { manager, .. } => Ok(StoreConnection::Standalone(manager.clone())),
            Topology::Cluster { conn } => Ok(StoreConnection::Cluster(conn.clone())),
        }
    }

    async fn tail_connection(&self) -> Result<StoreConnection> {
        match self.topology.as_ref() {
            Topology::Standalone { client, tail, .. } => {
                let mut tail = tail.lock().await;
                if let Some(conn) = tail.as_ref() {
                    return Ok(StoreConnection::Tail(conn.clone()));
                }
                let conn = client.get_multiplexed_async_connection().await?;
                *tail = Some(conn.clone());
                Ok(StoreConnection::Tail(conn))
            }
            Topology::Cluster { .. } => self.connection().await,
        }
    }

    async fn reset_tail_connection(&self) {
        if let Topology::Standalone { tail, .. } = self.topology.as_ref() {
            tail.lock().await.take();
        }
    }

    async fn with_timeout<T>(
        &self,
        limit: Duration,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CacheError::Timeout(format!(
                "Redis command timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }

    fn decode_record(id: &str, map: &std::collections::HashMap<String, Value>) -> Result<LogRecord> {
        let position: LogPosition = id.parse()?;
        let mut fields = Vec::with_capacity(map.len());
        for (name, value) in map {
            let bytes: Vec<u8> = redis::from_redis_value(value)?;
            fields.push((name.clone(), bytes));
        }
        Ok(LogRecord { position, fields })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    #[instrument(skip(self), level = "debug")]
    async fn try_acquire(
        &self,
        lock_name: &str,
        owner_id: &str,
        lease_millis: u64,
    ) -> Result<TryAcquireOutcome> {
        let mut conn = self.connection().await?;
        let mut invocation = self.scripts.try_acquire.key(lock_name);
        invocation.arg(lease_millis).arg(owner_id);
        let ttl: Option<i64> = self
            .with_timeout(self.command_timeout, invocation.invoke_async(&mut conn))
            .await?;
        Ok(match ttl {
            None => TryAcquireOutcome::Acquired,
            // 没有 TTL 的异常条目按整段租约等待
            Some(ttl) if ttl < 0 => TryAcquireOutcome::Contended {
                wait_millis: lease_millis,
            },
            Some(ttl) => TryAcquireOutcome::Contended {
                wait_millis: ttl as u64,
            },
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(
        &self,
        lock_name: &str,
        owner_id: &str,
        lease_millis: u64,
    ) -> Result<ReleaseOutcome> {
        let mut conn = self.connection().await?;
        let mut invocation = self.scripts.release.key(lock_name);
        invocation.arg(lease_millis).arg(owner_id);
        let code: i64 = self
            .with_timeout(self.command_timeout, invocation.invoke_async(&mut conn))
            .await?;
        match code {
            -1 => Ok(ReleaseOutcome::AlreadyReleased),
            0 => Ok(ReleaseOutcome::StillHeld),
            1 => Ok(ReleaseOutcome::FullyReleased),
            other => Err(CacheError::Transport(format!(
                "unexpected release script result: {}",
                other
            ))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn renew(&self, lock_name: &str, owner_id: &str, lease_millis: u64) -> Result<bool> {
        let mut conn = self.connection().await?;
        let mut invocation = self.scripts.renew.key(lock_name);
        invocation.arg(lease_millis).arg(owner_id);
        let renewed: i64 = self
            .with_timeout(self.command_timeout, invocation.invoke_async(&mut conn))
            .await?;
        Ok(renewed == 1)
    }

    async fn server_time_millis(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let (secs, micros): (u64, u64) = self
            .with_timeout(
                self.command_timeout,
                redis::cmd("TIME").query_async(&mut conn),
            )
            .await?;
        Ok(secs * 1000 + micros / 1000)
    }

    #[instrument(skip(self, fields), level = "debug", fields(field_count = fields.len()))]
    async fn append(
        &self,
        topic: &str,
        fields: Vec<(String, Vec<u8>)>,
        max_len: usize,
    ) -> Result<LogPosition> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(topic).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (name, value) in &fields {
            cmd.arg(name).arg(value.as_slice());
        }
        let mut conn = self.connection().await?;
        let id: String = self
            .with_timeout(self.command_timeout, cmd.query_async(&mut conn))
            .await?;
        debug!("RedisStore append: topic={}, id={}", topic, id);
        id.parse()
    }

    async fn read(
        &self,
        topic: &str,
        after: LogPosition,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>> {
        let mut conn = self.tail_connection().await?;
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(topic)
            .arg(after.to_string());

        let reply: Option<StreamReadReply> = match self
            .with_timeout(block + self.command_timeout, cmd.query_async(&mut conn))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                self.reset_tail_connection().await;
                return Err(e);
            }
        };

        let mut records = Vec::new();
        if let Some(reply) = reply {
            for key in reply.keys {
                for entry in key.ids {
                    records.push(Self::decode_record(&entry.id, &entry.map)?);
                }
            }
        }
        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = self
            .with_timeout(
                self.command_timeout,
                redis::cmd("PING").query_async(&mut conn),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteTier for RedisStore {
    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        self.with_timeout(
            self.command_timeout,
            redis::cmd("GET").arg(key).query_async(&mut conn),
        )
        .await
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let mut conn = self.connection().await?;
        let _: () = self
            .with_timeout(self.command_timeout, cmd.query_async(&mut conn))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(key_count = keys.len()))]
    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.del(key).ignore();
        }
        let mut conn = self.connection().await?;
        let _: () = self
            .with_timeout(self.command_timeout, pipe.query_async(&mut conn))
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn clear_prefix(&self, prefix: &str) -> Result<()> {
        if matches!(self.topology.as_ref(), Topology::Cluster { .. }) {
            return Err(CacheError::NotSupported(
                "clear_prefix is not supported in Cluster mode".to_string(),
            ));
        }
        let pattern = format!("{}*", prefix);
        let mut conn = self.connection().await?;
        let mut cursor = 0u64;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = self
                .with_timeout(
                    self.command_timeout,
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(1000)
                        .query_async(&mut conn),
                )
                .await?;

            if !keys.is_empty() {
                let mut pipe = redis::pipe();
                for key in &keys {
                    pipe.del(key).ignore();
                }
                let _: () = self
                    .with_timeout(self.command_timeout, pipe.query_async(&mut conn))
                    .await?;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        debug!("RedisStore clear_prefix: prefix={} cleared", prefix);
        Ok(())
    }
}
