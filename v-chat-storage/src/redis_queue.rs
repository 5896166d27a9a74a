use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, StorageError};
use crate::offline::{offline_key, OfflineQueue};

/// Redis 离线队列：`offline:<uid>` 列表 / Redis offline queue backed by `offline:<uid>` lists
#[derive(Clone)]
pub struct RedisOfflineQueue {
    conn: MultiplexedConnection,
}

impl RedisOfflineQueue {
    /// 连接 Redis / Connect to Redis
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_timeout(url, Duration::from_secs(5)).await
    }

    /// 带超时连接 / Connect with an explicit timeout
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StorageError::Unavailable(format!("redis connect timeout: {}", url)))??;
        info!("🧰 Redis offline queue connected: {}", url);
        Ok(Self { conn })
    }

    /// 连通性检查 / Connectivity check
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl OfflineQueue for RedisOfflineQueue {
    async fn push(&self, user_id: u32, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let len: i64 = redis::cmd("RPUSH")
            .arg(offline_key(user_id))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        debug!("📥 queued offline message for uid={} (len={})", user_id, len);
        Ok(())
    }

    async fn drain_all(&self, user_id: u32) -> Result<Vec<String>> {
        let key = offline_key(user_id);
        let mut conn = self.conn.clone();
        // MULTI/EXEC：读取与删除之间不会插入新条目 / No entry can slip in between read and delete
        let (entries,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn len(&self, user_id: u32) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN").arg(offline_key(user_id)).query_async(&mut conn).await?;
        Ok(len)
    }
}
