//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了协调存储的连接提供者：按存储配置打开单机或集群连接。

use crate::{
    config::StoreConfig,
    error::{CacheError, Result},
};
use async_trait::async_trait;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{aio::ConnectionManager, Client};
use secrecy::ExposeSecret;
use std::future::Future;
use tokio::time::{timeout, Duration};

/// 协调存储的连接提供者
///
/// 负责建立连接，测试中可替换
#[async_trait]
pub trait RedisProvider: Send + Sync {
    /// 单机模式：返回客户端（用于另开阻塞读连接）和共享的连接管理器
    async fn open_standalone(&self, config: &StoreConfig) -> Result<(Client, ConnectionManager)>;

    /// 集群模式：返回可克隆共享的集群连接
    async fn open_cluster(&self, config: &StoreConfig) -> Result<ClusterConnection>;
}

pub struct DefaultRedisProvider;

/// 在连接超时内完成连接
async fn connect_within<T>(
    config: &StoreConfig,
    what: &str,
    connect: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T> {
    let limit = Duration::from_millis(config.connection_timeout_ms);
    match timeout(limit, connect).await {
        Ok(conn) => Ok(conn?),
        Err(_) => Err(CacheError::Transport(format!(
            "{} connection timed out after {}ms",
            what, config.connection_timeout_ms
        ))),
    }
}

#[async_trait]
impl RedisProvider for DefaultRedisProvider {
    async fn open_standalone(&self, config: &StoreConfig) -> Result<(Client, ConnectionManager)> {
        let client = Client::open(config.connection_string.expose_secret())?;
        let manager = connect_within(config, "Standalone", client.get_connection_manager()).await?;
        Ok((client, manager))
    }

    async fn open_cluster(&self, config: &StoreConfig) -> Result<ClusterConnection> {
        if config.cluster_nodes.is_empty() {
            return Err(CacheError::Configuration(
                "Cluster mode requires at least one cluster node".to_string(),
            ));
        }
        let client = ClusterClient::builder(config.cluster_nodes.clone()).build()?;
        connect_within(config, "Cluster", client.get_async_connection()).await
    }
}
