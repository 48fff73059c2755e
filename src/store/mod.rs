/// 共享键值存储模块
///
/// 所有副本之间唯一共享的可变状态：租约 token、健康集合、网关黑名单标记。
/// 写操作要么幂等（集合成员、TTL 刷新），要么依赖 `set_if_absent` 的原子性。
mod memory;
mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

pub type StoreResult<T> = Result<T, StoreError>;

/// 键值存储 trait
///
/// 后端必须保证 `set_if_absent` 的原子性，租约正确性完全依赖于此
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// 写入（覆盖），`ttl` 为 None 时永不过期
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// 仅当 key 不存在时写入，返回是否写入成功
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// 删除 key，返回 key 之前是否存在
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// 加入集合，返回成员是否为新增
    async fn add_to_set(&self, set: &str, member: &str) -> StoreResult<bool>;

    /// 移出集合，返回成员之前是否存在
    async fn remove_from_set(&self, set: &str, member: &str) -> StoreResult<bool>;

    async fn is_member(&self, set: &str, member: &str) -> StoreResult<bool>;

    async fn list_members(&self, set: &str) -> StoreResult<Vec<String>>;
}
