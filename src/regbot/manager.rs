/// Regbot 管理器
///
/// 只有持有租约的副本运行 Regbot。每个检查周期读取租约并按 `LeaseDecision` 行动；
/// 持有期间对账 catalog，快照有任何变化就整体重启全部 Regbot。
/// `state` 的锁只在同步代码段内持有，从不跨越 await。
use super::bot::{Regbot, RegbotHandle, RegbotSettings, RegbotState, RegbotStatus, RegbotTarget};
use super::snapshot::RegistrationSnapshot;
use crate::alerts::AlertSink;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::SidecarResult;
use crate::lease::{LeaseCoordinator, LeaseDecision};
use crate::sip::{PublicAddresses, SipRequester};
use crate::store::KeyValueStore;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub lease_key: String,
    pub lease_ttl: Duration,
    pub check_interval: Duration,
    pub max_initial_delay: Duration,
    pub regbot: RegbotSettings,
}

impl ManagerSettings {
    pub fn from_config(config: &Config, public_addresses: PublicAddresses) -> Self {
        Self {
            lease_key: config.regbot_key(),
            lease_ttl: config.lease_ttl(),
            check_interval: config.lease_check_interval(),
            max_initial_delay: config.max_initial_delay(),
            regbot: RegbotSettings {
                default_expires: config.regbot_default_expires,
                min_expires: config.regbot_min_expires,
                contact_use_ip: config.regbot_contact_use_ip,
                public_addresses,
            },
        }
    }
}

/// 用于指标上报的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegbotSummary {
    pub active: bool,
    pub total: usize,
    pub registered: usize,
}

#[derive(Default)]
struct ManagerState {
    active: bool,
    snapshot: RegistrationSnapshot,
    /// sip_gateway_sid -> 运行中的 Regbot
    bots: HashMap<String, RegbotHandle>,
}

impl ManagerState {
    fn stop_all(&mut self) -> usize {
        let count = self.bots.len();
        for handle in self.bots.values() {
            handle.stop();
        }
        self.bots.clear();
        count
    }
}

pub struct RegbotManager {
    token: String,
    settings: ManagerSettings,
    regbot_settings: Arc<RegbotSettings>,
    lease: LeaseCoordinator,
    catalog: Arc<dyn Catalog>,
    requester: Arc<dyn SipRequester>,
    alerts: Arc<dyn AlertSink>,
    state: Mutex<ManagerState>,
}

impl RegbotManager {
    pub fn new(
        settings: ManagerSettings,
        store: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn Catalog>,
        requester: Arc<dyn SipRequester>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
            regbot_settings: Arc::new(settings.regbot.clone()),
            settings,
            lease: LeaseCoordinator::new(store),
            catalog,
            requester,
            alerts,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn summary(&self) -> RegbotSummary {
        let state = self.state.lock();
        RegbotSummary {
            active: state.active,
            total: state.bots.len(),
            registered: state
                .bots
                .values()
                .filter(|h| h.status().state == RegbotState::Registered)
                .count(),
        }
    }

    /// 每个 Regbot 的状态，按网关排序
    pub fn statuses(&self) -> Vec<RegbotStatus> {
        let mut statuses: Vec<RegbotStatus> =
            self.state.lock().bots.values().map(|h| h.status()).collect();
        statuses.sort_by(|a, b| a.sip_gateway_sid.cmp(&b.sip_gateway_sid));
        statuses
    }

    /// 随机延迟后首次尝试获取租约
    pub async fn startup(&self) -> bool {
        let max = self.settings.max_initial_delay.as_secs();
        let delay = if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(rand::thread_rng().gen_range(0..max))
        };
        info!(
            "waiting {}ms before attempting to claim regbot responsibility with token {}",
            delay.as_millis(),
            self.token
        );
        tokio::time::sleep(delay).await;

        if self
            .lease
            .try_acquire(&self.settings.lease_key, &self.token, self.settings.lease_ttl)
            .await
        {
            info!("successfully claimed regbot responsibility with token {}", self.token);
            self.state.lock().active = true;
            self.reconcile_logged().await;
            true
        } else {
            info!("failed to claim regbot responsibility with token {}", self.token);
            false
        }
    }

    /// 单次检查周期
    pub async fn check_status(&self) -> LeaseDecision {
        let active = self.is_active();
        let key = &self.settings.lease_key;
        let observed = match self.lease.observe(key).await {
            Ok(token) => token,
            Err(e) => {
                // 读失败不改变本地状态，下个周期重试
                error!("error reading regbot lease: {}", e);
                return LeaseDecision::Idle;
            }
        };

        let decision = LeaseDecision::decide(active, &self.token, observed.as_deref());
        debug!(active, token = %self.token, ?decision, "checking in on regbot status");

        match decision {
            LeaseDecision::Renew => {
                if self.lease.renew(key, &self.token, self.settings.lease_ttl).await {
                    if !active {
                        info!("resuming regbot role with token {}", self.token);
                        self.state.lock().active = true;
                    }
                    self.reconcile_logged().await;
                } else {
                    warn!("failed to renew regbot lease, will re-evaluate next cycle");
                }
            }
            LeaseDecision::StandDown => {
                info!("someone else grabbed the regbot role, standing down");
                self.stand_down();
            }
            LeaseDecision::Acquire => {
                info!("regbot role is vacated, trying to grab it");
                if self
                    .lease
                    .try_acquire(key, &self.token, self.settings.lease_ttl)
                    .await
                {
                    info!("successfully claimed regbot responsibility with token {}", self.token);
                    self.state.lock().active = true;
                    self.reconcile_logged().await;
                } else {
                    info!("failed to claim regbot responsibility");
                    if active {
                        self.stand_down();
                    }
                }
            }
            LeaseDecision::Idle => {
                debug!("inactive and someone else is performing the regbot role");
            }
        }
        decision
    }

    /// 停止所有 Regbot 并清空快照，下次成为持有者时从头对账
    pub fn stand_down(&self) {
        let mut state = self.state.lock();
        let stopped = state.stop_all();
        state.snapshot = RegistrationSnapshot::default();
        state.active = false;
        info!("stood down, stopped {} regbots", stopped);
    }

    /// 与 catalog 对账；返回是否重启了 Regbot
    pub async fn reconcile(&self) -> SidecarResult<bool> {
        let carriers: Vec<_> = self
            .catalog
            .lookup_carriers_requiring_register()
            .await?
            .into_iter()
            .filter(|c| c.requires_register && c.is_active)
            .collect();
        let mut gateways = Vec::new();
        for carrier in &carriers {
            let found = self
                .catalog
                .lookup_gateways_by_carrier(&carrier.voip_carrier_sid)
                .await?;
            gateways.extend(found.into_iter().filter(|g| g.outbound && g.is_active));
        }
        let snapshot = RegistrationSnapshot::new(carriers, gateways);

        let mut state = self.state.lock();
        if !state.active {
            debug!("lease lost while reconciling, discarding snapshot");
            return Ok(false);
        }
        if state.snapshot == snapshot {
            return Ok(false);
        }

        info!("carrier or gateway configuration changed, restarting regbots");
        state.stop_all();
        for (carrier, gateway) in snapshot.pairs() {
            let target = RegbotTarget::new(carrier, gateway);
            info!(gateway = %target.sip_gateway_sid, aor = %target.aor(), "starting regbot");
            let handle = Regbot::new(
                target,
                self.regbot_settings.clone(),
                self.requester.clone(),
                self.catalog.clone(),
                self.alerts.clone(),
            )
            .start();
            state.bots.insert(gateway.sip_gateway_sid.clone(), handle);
        }
        state.snapshot = snapshot;
        debug!("now running {} regbots", state.bots.len());
        Ok(true)
    }

    async fn reconcile_logged(&self) {
        if let Err(e) = self.reconcile().await {
            e.report("regbot reconciliation");
        }
    }

    /// 启动后按固定间隔检查租约，直到取消
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {
                self.shutdown().await;
                return;
            }
            _ = self.startup() => {}
        }

        let interval = self.settings.check_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_status().await;
                }
            }
        }
        self.shutdown().await;
    }

    /// 停止全部 Regbot，若仍持有租约则主动释放，让其他副本尽快接管
    pub async fn shutdown(&self) {
        let was_active = self.is_active();
        self.stand_down();
        if was_active && self.lease.release(&self.settings.lease_key, &self.token).await {
            info!("released regbot lease {}", self.settings.lease_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Carrier, Gateway, InMemoryCatalog};
    use crate::store::InMemoryStore;
    use crate::testing::{RecordingAlerts, RecordingRequester};

    fn settings() -> ManagerSettings {
        ManagerSettings {
            lease_key: "test:regbot-token".into(),
            lease_ttl: Duration::from_secs(70),
            check_interval: Duration::from_secs(60),
            max_initial_delay: Duration::ZERO,
            regbot: RegbotSettings::default(),
        }
    }

    fn seeded_catalog() -> Arc<InMemoryCatalog> {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.upsert_carrier(Carrier {
            voip_carrier_sid: "c1".into(),
            account_sid: None,
            service_provider_sid: None,
            name: "carrier".into(),
            is_active: true,
            requires_register: true,
            register_username: Some("trunk".into()),
            register_password: Some("pw".into()),
            register_sip_realm: Some("sip.carrier.net".into()),
            register_from_user: None,
            register_from_domain: None,
            register_public_ip_in_contact: false,
        });
        for (sid, outbound) in [("g1", true), ("g2", true), ("g3", false)] {
            catalog.upsert_gateway(gateway(sid, outbound));
        }
        catalog
    }

    fn gateway(sid: &str, outbound: bool) -> Gateway {
        Gateway {
            sip_gateway_sid: sid.into(),
            voip_carrier_sid: "c1".into(),
            ipv4: "203.0.113.20".into(),
            port: Some(5060),
            protocol: "udp".into(),
            use_sips_scheme: false,
            inbound: false,
            outbound,
            is_active: true,
            send_options_ping: false,
        }
    }

    fn manager(
        store: Arc<InMemoryStore>,
        catalog: Arc<InMemoryCatalog>,
        requester: Arc<RecordingRequester>,
    ) -> RegbotManager {
        RegbotManager::new(settings(), store, catalog, requester, RecordingAlerts::new())
    }

    #[tokio::test(start_paused = true)]
    async fn holder_starts_one_regbot_per_outbound_gateway() {
        let requester = RecordingRequester::status(200);
        let m = manager(Arc::new(InMemoryStore::new()), seeded_catalog(), requester.clone());

        assert!(m.startup().await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let summary = m.summary();
        assert!(summary.active);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.registered, 2);
        assert_eq!(requester.count(), 2);
        let gateways: Vec<_> = m.statuses().into_iter().map(|s| s.sip_gateway_sid).collect();
        assert_eq!(gateways, vec!["g1", "g2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_catalog_does_not_restart_regbots() {
        let requester = RecordingRequester::status(200);
        let m = manager(Arc::new(InMemoryStore::new()), seeded_catalog(), requester.clone());
        assert!(m.startup().await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!m.reconcile().await.unwrap());
        assert_eq!(m.check_status().await, LeaseDecision::Renew);
        assert!(!m.reconcile().await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(requester.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_gateway_restarts_regbots() {
        let requester = RecordingRequester::status(200);
        let catalog = seeded_catalog();
        let m = manager(Arc::new(InMemoryStore::new()), catalog.clone(), requester.clone());
        assert!(m.startup().await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut moved = gateway("g2", true);
        moved.port = Some(5080);
        catalog.upsert_gateway(moved);
        catalog.remove_gateway("g1");

        assert!(m.reconcile().await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(m.summary().total, 1);
        assert_eq!(requester.count(), 3);
        assert_eq!(
            requester.requests().last().map(|r| r.proxy.clone()),
            Some("sip:203.0.113.20:5080;transport=udp".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lease_failover_stops_previous_holder() {
        let store = Arc::new(InMemoryStore::new());
        let catalog = seeded_catalog();
        let first_requester = RecordingRequester::status(200);
        let second_requester = RecordingRequester::status(200);
        let first = manager(store.clone(), catalog.clone(), first_requester.clone());
        let second = manager(store.clone(), catalog, second_requester.clone());

        assert!(first.startup().await);
        assert!(!second.startup().await);
        assert_eq!(second.check_status().await, LeaseDecision::Idle);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(first_requester.count(), 2);
        assert_eq!(second_requester.count(), 0);

        // first 停止续约；TTL 过期后的下一个检查周期内 second 接管
        tokio::time::sleep(Duration::from_secs(71)).await;
        assert_eq!(second.check_status().await, LeaseDecision::Acquire);
        assert!(second.is_active());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(second_requester.count(), 2);

        assert_eq!(first.check_status().await, LeaseDecision::StandDown);
        assert!(!first.is_active());
        assert_eq!(first.summary().total, 0);

        // second 每个检查周期续约，两小时内 first 不再发出 REGISTER
        for _ in 0..120 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            assert_eq!(second.check_status().await, LeaseDecision::Renew);
            assert_eq!(first.check_status().await, LeaseDecision::Idle);
            assert_eq!(first_requester.count(), 2);
        }
        let holder = store.get("test:regbot-token").await.unwrap();
        assert_eq!(holder.as_deref(), Some(second.token()));
        assert!(!first.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn vacated_lease_is_reclaimed_without_restart() {
        let store = Arc::new(InMemoryStore::new());
        let requester = RecordingRequester::status(200);
        let m = manager(store.clone(), seeded_catalog(), requester.clone());
        assert!(m.startup().await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.delete("test:regbot-token").await.unwrap();
        assert_eq!(m.check_status().await, LeaseDecision::Acquire);
        assert!(m.is_active());
        assert_eq!(m.summary().total, 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(requester.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_the_lease() {
        let store = Arc::new(InMemoryStore::new());
        let m = Arc::new(manager(store.clone(), seeded_catalog(), RecordingRequester::status(200)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(m.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(m.is_active());
        cancel.cancel();
        task.await.unwrap();

        assert!(!m.is_active());
        assert_eq!(m.summary().total, 0);
        assert_eq!(store.get("test:regbot-token").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_jitter_is_bounded() {
        let mut s = settings();
        s.max_initial_delay = Duration::from_secs(3);
        let m = RegbotManager::new(
            s,
            Arc::new(InMemoryStore::new()),
            seeded_catalog(),
            RecordingRequester::status(200),
            RecordingAlerts::new(),
        );
        let started = tokio::time::Instant::now();
        assert!(m.startup().await);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
