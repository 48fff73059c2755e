/// Redis 键值存储
///
/// 多副本部署时所有 SBC 共用同一个 Redis；`ConnectionManager` 断线自动重连，
/// 每次调用克隆一个句柄，不持有任何本地锁
use super::{KeyValueStore, StoreResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        info!("connected to redis at {}", url);
        Ok(Self { conn })
    }

    /// 共享同一连接的句柄，供 registrar 读取注册记录
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// PX 参数，至少 1 毫秒（0 会被 Redis 拒绝）
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.pset_ex(key, value, ttl_millis(ttl)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        // SET NX 成功返回 OK，key 已存在返回 nil
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn add_to_set(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let added: usize = conn.sadd(set, member).await?;
        Ok(added > 0)
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.srem(set, member).await?;
        Ok(removed > 0)
    }

    async fn is_member(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let member: bool = conn.sismember(set, member).await?;
        Ok(member)
    }

    async fn list_members(&self, set: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(set).await?;
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn ttl_is_sent_in_whole_milliseconds() {
        assert_eq!(ttl_millis(Duration::from_secs(70)), 70_000);
        assert_eq!(ttl_millis(Duration::from_micros(300)), 1);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn invalid_url_is_a_store_error() {
        let err = RedisStore::connect("not-a-url").await.err();
        assert!(matches!(err, Some(StoreError::Protocol(_))));
    }
}
