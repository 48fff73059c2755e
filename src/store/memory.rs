/// 进程内键值存储
///
/// 单副本部署和测试使用；TTL 基于 tokio 时钟，暂停时间的测试可以直接推进过期
use super::{KeyValueStore, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    keys: HashMap<String, Entry>,
    sets: HashMap<String, BTreeSet<String>>,
}

impl Inner {
    /// 写入时顺带清理已过期但从未再读取的 key
    fn purge_expired(&mut self, now: Instant) {
        self.keys.retain(|_, e| e.is_live(now));
    }
}

/// 基于 `parking_lot::Mutex` 的内存实现
///
/// 锁只在同步代码中持有，不会跨越 await 点
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回 key 的剩余存活时间（无 TTL 或不存在时返回 None）
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .keys
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// 当前保存的 key 数（含尚未清理的过期 key）
    pub fn key_count(&self) -> usize {
        self.inner.lock().keys.len()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.keys.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.keys.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.purge_expired(now);
        inner.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.purge_expired(now);
        if inner.keys.contains_key(key) {
            return Ok(false);
        }
        inner.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .inner
            .lock()
            .keys
            .remove(key)
            .is_some_and(|e| e.is_live(now)))
    }

    async fn add_to_set(&self, set: &str, member: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let removed = match inner.sets.get_mut(set) {
            Some(members) => members.remove(member),
            None => false,
        };
        if inner.sets.get(set).is_some_and(|m| m.is_empty()) {
            inner.sets.remove(set);
        }
        Ok(removed)
    }

    async fn is_member(&self, set: &str, member: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(set)
            .is_some_and(|m| m.contains(member)))
    }

    async fn list_members(&self, set: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(set)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = InMemoryStore::new();
        store.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_live_entries_only() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("lease", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_if_absent("lease", "b", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_if_absent("lease", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("lease").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_are_dropped_on_write() {
        let store = InMemoryStore::new();
        for sid in ["g1", "g2", "g3"] {
            let key = format!("blacklist-sip-gateway:{}", sid);
            store.set(&key, "1", Some(Duration::from_secs(300))).await.unwrap();
        }
        store.set("lease", "a", None).await.unwrap();
        assert_eq!(store.key_count(), 4);

        // 黑名单标记过期后从未被读取
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(store.key_count(), 4);
        assert!(store.set_if_absent("other", "x", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.key_count(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        store.set("lease", "b", None).await.unwrap();
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.get("lease").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn concurrent_set_if_absent_has_one_winner() {
        let store = Arc::new(InMemoryStore::new());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .set_if_absent("race", &format!("token-{}", i), Duration::from_secs(30))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn set_membership() {
        let store = InMemoryStore::new();
        assert!(store.add_to_set("s", "10.0.0.1").await.unwrap());
        assert!(!store.add_to_set("s", "10.0.0.1").await.unwrap());
        assert!(store.add_to_set("s", "10.0.0.2").await.unwrap());
        assert!(store.is_member("s", "10.0.0.2").await.unwrap());
        assert_eq!(store.list_members("s").await.unwrap(), vec!["10.0.0.1", "10.0.0.2"]);

        assert!(store.remove_from_set("s", "10.0.0.1").await.unwrap());
        assert!(!store.remove_from_set("s", "10.0.0.1").await.unwrap());
        assert_eq!(store.list_members("s").await.unwrap(), vec!["10.0.0.2"]);
        assert!(store.list_members("missing").await.unwrap().is_empty());
    }
}
