/// 内部服务器心跳跟踪
///
/// feature server 以 `ip:port` 为 key，RTP server 以 `ip` 为 key。
/// 本地 map 记录最后一次心跳时间，同时镜像到共享集合，其他副本看到一致的成员视图。
use crate::alerts::StatsSink;
use crate::config::Config;
use crate::error::SidecarError;
use crate::store::{KeyValueStore, StoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const FS_STATUS_HEADER: &str = "X-FS-Status";
pub const RTP_STATUS_HEADER: &str = "X-RTP-Status";
pub const MEMBERS_HEADER: &str = "X-Members";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerKind {
    FeatureServer,
    RtpServer,
}

impl ServerKind {
    pub fn gauge_name(&self) -> &'static str {
        match self {
            ServerKind::FeatureServer => "featureservers",
            ServerKind::RtpServer => "rtpservers",
        }
    }
}

/// 一次入站心跳
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub source_address: IpAddr,
    pub source_port: u16,
    pub fs_status: Option<String>,
    pub rtp_status: Option<String>,
}

impl Heartbeat {
    /// 带状态头的是内部服务器，否则只是外部的存活探测
    pub fn kind(&self) -> Option<ServerKind> {
        if self.rtp_status.is_some() {
            Some(ServerKind::RtpServer)
        } else if self.fs_status.is_some() {
            Some(ServerKind::FeatureServer)
        } else {
            None
        }
    }

    pub fn key(&self, kind: ServerKind) -> String {
        match kind {
            ServerKind::RtpServer => self.source_address.to_string(),
            ServerKind::FeatureServer => format!("{}:{}", self.source_address, self.source_port),
        }
    }

    fn is_open(&self, kind: ServerKind) -> bool {
        let status = match kind {
            ServerKind::RtpServer => self.rtp_status.as_deref(),
            ServerKind::FeatureServer => self.fs_status.as_deref(),
        };
        status == Some("open")
    }
}

/// 对心跳的应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReply {
    pub status: u16,
    /// 共享集合当前成员数
    pub members: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub fs_set: String,
    pub rtp_set: String,
    pub expiry: Duration,
    pub sweep_interval: Duration,
}

impl HealthSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fs_set: config.active_fs_set(),
            rtp_set: config.active_rtp_set(),
            expiry: config.heartbeat_expiry(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

pub struct HealthMonitor {
    settings: HealthSettings,
    store: Arc<dyn KeyValueStore>,
    stats: Arc<dyn StatsSink>,
    fs_servers: Mutex<HashMap<String, Instant>>,
    rtp_servers: Mutex<HashMap<String, Instant>>,
}

impl HealthMonitor {
    pub fn new(
        settings: HealthSettings,
        store: Arc<dyn KeyValueStore>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            settings,
            store,
            stats,
            fs_servers: Mutex::new(HashMap::new()),
            rtp_servers: Mutex::new(HashMap::new()),
        }
    }

    fn servers(&self, kind: ServerKind) -> &Mutex<HashMap<String, Instant>> {
        match kind {
            ServerKind::FeatureServer => &self.fs_servers,
            ServerKind::RtpServer => &self.rtp_servers,
        }
    }

    fn set_name(&self, kind: ServerKind) -> &str {
        match kind {
            ServerKind::FeatureServer => &self.settings.fs_set,
            ServerKind::RtpServer => &self.settings.rtp_set,
        }
    }

    /// 本地跟踪的服务器数
    pub fn tracked(&self, kind: ServerKind) -> usize {
        self.servers(kind).lock().len()
    }

    pub fn is_tracked(&self, kind: ServerKind, key: &str) -> bool {
        self.servers(kind).lock().contains_key(key)
    }

    /// 启动时从共享集合载入成员，时间戳取当前时刻
    pub async fn seed(&self) -> StoreResult<()> {
        let now = Instant::now();
        for kind in [ServerKind::FeatureServer, ServerKind::RtpServer] {
            let members = self.store.list_members(self.set_name(kind)).await?;
            if !members.is_empty() {
                info!(?members, "start watching these {} servers", kind.gauge_name());
                let mut servers = self.servers(kind).lock();
                for member in members {
                    servers.insert(member, now);
                }
            }
        }
        Ok(())
    }

    /// 处理一次心跳；存储失败时应答 503
    pub async fn handle(&self, heartbeat: &Heartbeat) -> HeartbeatReply {
        let Some(kind) = heartbeat.kind() else {
            debug!("got external OPTIONS ping");
            return HeartbeatReply {
                status: 200,
                members: None,
            };
        };
        match self.apply(kind, heartbeat).await {
            Ok(members) => HeartbeatReply {
                status: 200,
                members: Some(members),
            },
            Err(e) => {
                error!("error handling OPTIONS from {}: {}", heartbeat.source_address, e);
                HeartbeatReply {
                    status: 503,
                    members: None,
                }
            }
        }
    }

    async fn apply(&self, kind: ServerKind, heartbeat: &Heartbeat) -> StoreResult<usize> {
        let key = heartbeat.key(kind);
        let set_name = self.set_name(kind);

        let count = if heartbeat.is_open(kind) {
            self.servers(kind).lock().insert(key.clone(), Instant::now());
            if self.store.is_member(set_name, &key).await? {
                let members = self.store.list_members(set_name).await?;
                debug!("checkin from existing member {} to {}", key, set_name);
                members.len()
            } else {
                self.store.add_to_set(set_name, &key).await?;
                let members = self.store.list_members(set_name).await?;
                info!(
                    ?members,
                    "added new member {} to {} we now have {}",
                    key,
                    set_name,
                    members.len()
                );
                members.len()
            }
        } else {
            self.servers(kind).lock().remove(&key);
            self.store.remove_from_set(set_name, &key).await?;
            let members = self.store.list_members(set_name).await?;
            info!(
                ?members,
                "removed member {} from {} we now have {}",
                key,
                set_name,
                members.len()
            );
            members.len()
        };

        self.stats.gauge(kind.gauge_name(), self.tracked(kind) as f64, &[]);
        Ok(count)
    }

    /// 淘汰超过过期窗口未心跳的服务器，返回淘汰数
    ///
    /// 共享集合移除成功后才删除本地记录；失败的成员留待下一次清扫重试
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for kind in [ServerKind::FeatureServer, ServerKind::RtpServer] {
            let expired: Vec<(String, Instant)> = self
                .servers(kind)
                .lock()
                .iter()
                .filter(|(_, last_seen)| now.duration_since(**last_seen) > self.settings.expiry)
                .map(|(key, last_seen)| (key.clone(), *last_seen))
                .collect();

            let set_name = self.set_name(kind);
            for (key, last_seen) in expired {
                if let Err(e) = self.store.remove_from_set(set_name, &key).await {
                    let context = format!("removing expired member {} from {}", key, set_name);
                    SidecarError::from(e).report(&context);
                    continue;
                }
                {
                    // 等待存储期间可能又收到了心跳
                    let mut servers = self.servers(kind).lock();
                    if servers.get(&key) == Some(&last_seen) {
                        servers.remove(&key);
                    }
                }
                evicted += 1;
                match self.store.list_members(set_name).await {
                    Ok(members) => info!(
                        ?members,
                        "expired member {} from {} we now have {}",
                        key,
                        set_name,
                        members.len()
                    ),
                    Err(e) => SidecarError::from(e).report(&format!("listing {}", set_name)),
                }
            }
        }
        evicted
    }

    /// 载入初始成员后按固定间隔清扫，直到取消
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.seed().await {
            SidecarError::from(e).report("initializing health monitor from store");
        }
        let interval = self.settings.sweep_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::InMemoryStore;
    use crate::testing::{FailingStore, RecordingStats};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn settings() -> HealthSettings {
        HealthSettings {
            fs_set: "test:active-fs".into(),
            rtp_set: "test:active-rtp".into(),
            expiry: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(20),
        }
    }

    fn fs(status: &str) -> Heartbeat {
        Heartbeat {
            source_address: "10.0.1.5".parse().unwrap(),
            source_port: 5070,
            fs_status: Some(status.into()),
            rtp_status: None,
        }
    }

    fn rtp(status: &str) -> Heartbeat {
        Heartbeat {
            source_address: "10.0.2.9".parse().unwrap(),
            source_port: 22222,
            fs_status: None,
            rtp_status: Some(status.into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_heartbeat_joins_shared_set() {
        let store = Arc::new(InMemoryStore::new());
        let stats = RecordingStats::new();
        let monitor = HealthMonitor::new(settings(), store.clone(), stats.clone());

        let reply = monitor.handle(&fs("open")).await;
        assert_eq!(reply, HeartbeatReply { status: 200, members: Some(1) });
        assert!(store.is_member("test:active-fs", "10.0.1.5:5070").await.unwrap());
        assert_eq!(stats.last("featureservers"), Some(1.0));

        let reply = monitor.handle(&rtp("open")).await;
        assert_eq!(reply.members, Some(1));
        assert!(store.is_member("test:active-rtp", "10.0.2.9").await.unwrap());
        assert!(monitor.is_tracked(ServerKind::RtpServer, "10.0.2.9"));

        // 重复心跳不改变成员数
        assert_eq!(monitor.handle(&fs("open")).await.members, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_removes_immediately() {
        let store = Arc::new(InMemoryStore::new());
        let monitor = HealthMonitor::new(settings(), store.clone(), RecordingStats::new());
        monitor.handle(&fs("open")).await;

        let reply = monitor.handle(&fs("closed")).await;
        assert_eq!(reply, HeartbeatReply { status: 200, members: Some(0) });
        assert!(!store.is_member("test:active-fs", "10.0.1.5:5070").await.unwrap());
        assert_eq!(monitor.tracked(ServerKind::FeatureServer), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn external_ping_does_not_touch_state() {
        let store = Arc::new(InMemoryStore::new());
        let monitor = HealthMonitor::new(settings(), store.clone(), RecordingStats::new());
        let reply = monitor
            .handle(&Heartbeat {
                source_address: "198.51.100.1".parse().unwrap(),
                source_port: 5060,
                fs_status: None,
                rtp_status: None,
            })
            .await;
        assert_eq!(reply, HeartbeatReply { status: 200, members: None });
        assert!(store.list_members("test:active-fs").await.unwrap().is_empty());
        assert_eq!(monitor.tracked(ServerKind::FeatureServer), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_expires_after_window_plus_sweep() {
        let store = Arc::new(InMemoryStore::new());
        let stats = RecordingStats::new();
        let monitor = Arc::new(HealthMonitor::new(settings(), store.clone(), stats));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.clone().run(cancel.clone()));

        monitor.handle(&fs("open")).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(monitor.is_tracked(ServerKind::FeatureServer, "10.0.1.5:5070"));
        assert!(store.is_member("test:active-fs", "10.0.1.5:5070").await.unwrap());

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(!monitor.is_tracked(ServerKind::FeatureServer, "10.0.1.5:5070"));
        assert!(!store.is_member("test:active-fs", "10.0.1.5:5070").await.unwrap());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn seeds_from_shared_sets() {
        let store = Arc::new(InMemoryStore::new());
        store.add_to_set("test:active-fs", "10.0.1.7:5070").await.unwrap();
        store.add_to_set("test:active-rtp", "10.0.2.1").await.unwrap();
        let monitor = HealthMonitor::new(settings(), store.clone(), RecordingStats::new());

        monitor.seed().await.unwrap();
        assert!(monitor.is_tracked(ServerKind::FeatureServer, "10.0.1.7:5070"));
        assert!(monitor.is_tracked(ServerKind::RtpServer, "10.0.2.1"));

        // 刚载入的成员不会被立即淘汰
        assert_eq!(monitor.sweep().await, 0);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(monitor.sweep().await, 2);
        assert!(store.list_members("test:active-rtp").await.unwrap().is_empty());
    }

    /// 包装内存存储，第一次 `remove_from_set` 返回错误
    struct FlakyRemoveStore {
        inner: InMemoryStore,
        fail_next_remove: AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyRemoveStore {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> StoreResult<bool> {
            self.inner.delete(key).await
        }
        async fn add_to_set(&self, set: &str, member: &str) -> StoreResult<bool> {
            self.inner.add_to_set(set, member).await
        }
        async fn remove_from_set(&self, set: &str, member: &str) -> StoreResult<bool> {
            if self.fail_next_remove.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.remove_from_set(set, member).await
        }
        async fn is_member(&self, set: &str, member: &str) -> StoreResult<bool> {
            self.inner.is_member(set, member).await
        }
        async fn list_members(&self, set: &str) -> StoreResult<Vec<String>> {
            self.inner.list_members(set).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_shared_removal_is_retried_next_sweep() {
        let store = Arc::new(FlakyRemoveStore {
            inner: InMemoryStore::new(),
            fail_next_remove: AtomicBool::new(false),
        });
        let monitor = HealthMonitor::new(settings(), store.clone(), RecordingStats::new());
        monitor.handle(&fs("open")).await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        store.fail_next_remove.store(true, Ordering::SeqCst);
        assert_eq!(monitor.sweep().await, 0);
        assert!(monitor.is_tracked(ServerKind::FeatureServer, "10.0.1.5:5070"));
        assert!(store.is_member("test:active-fs", "10.0.1.5:5070").await.unwrap());

        assert_eq!(monitor.sweep().await, 1);
        assert!(!monitor.is_tracked(ServerKind::FeatureServer, "10.0.1.5:5070"));
        assert!(!store.is_member("test:active-fs", "10.0.1.5:5070").await.unwrap());
    }

    #[tokio::test]
    async fn store_failure_answers_503() {
        let stats = RecordingStats::new();
        let monitor = HealthMonitor::new(settings(), Arc::new(FailingStore), stats);
        let reply = monitor.handle(&fs("open")).await;
        assert_eq!(reply, HeartbeatReply { status: 503, members: None });
        assert!(monitor.seed().await.is_err());
    }
}
