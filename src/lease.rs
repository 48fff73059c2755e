/// 分布式租约
///
/// 基于键值存储的互斥原语：acquire-if-absent、持有期间续约、检测丢失、释放。
/// 不做任何客户端加锁，正确性完全依赖存储对条件写入的原子性保证。
/// 存储错误一律视为"未获得"，歧义失败绝不假设成功。
use crate::store::{KeyValueStore, StoreResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// 租约协调器
#[derive(Clone)]
pub struct LeaseCoordinator {
    store: Arc<dyn KeyValueStore>,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// key 不存在时写入 token，返回是否获得
    pub async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> bool {
        match self.store.set_if_absent(key, token, ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("lease acquire on {} failed: {}", key, e);
                false
            }
        }
    }

    /// 仅当存储的值仍等于 token 时刷新 TTL
    pub async fn renew(&self, key: &str, token: &str, ttl: Duration) -> bool {
        match self.read(key).await {
            Some(current) if current == token => match self.store.set(key, token, Some(ttl)).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("lease renew on {} failed: {}", key, e);
                    false
                }
            },
            other => {
                debug!("lease {} not renewed, holder is {:?}", key, other);
                false
            }
        }
    }

    /// 当前持有者 token；读失败按空处理
    pub async fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                warn!("lease read on {} failed: {}", key, e);
                None
            }
        }
    }

    /// 与 `read` 相同，但保留存储错误，供检查周期区分"空缺"与"读失败"
    pub async fn observe(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.store.get(key).await?.filter(|t| !t.is_empty()))
    }

    /// 仅当自己仍是持有者时删除
    pub async fn release(&self, key: &str, token: &str) -> bool {
        if self.read(key).await.as_deref() != Some(token) {
            return false;
        }
        match self.store.delete(key).await {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("lease release on {} failed: {}", key, e);
                false
            }
        }
    }
}

/// 每个检查周期的选主决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDecision {
    /// 自己持有：续约并触发对账
    Renew,
    /// 被其他副本接管：立即停止本地全部任务
    StandDown,
    /// 租约空缺：尝试抢占
    Acquire,
    /// 他人持有且自己未激活：什么也不做
    Idle,
}

impl LeaseDecision {
    pub fn decide(active: bool, own_token: &str, observed: Option<&str>) -> Self {
        match (active, observed) {
            (true, Some(token)) if token == own_token => LeaseDecision::Renew,
            (true, Some(_)) => LeaseDecision::StandDown,
            (_, None) => LeaseDecision::Acquire,
            // 本地未激活但存储中是自己的 token（例如进程内重建），按续约处理
            (false, Some(token)) if token == own_token => LeaseDecision::Renew,
            (false, Some(_)) => LeaseDecision::Idle,
        }
    }
}
