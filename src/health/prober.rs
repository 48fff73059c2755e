/// 出站 OPTIONS 探测
///
/// 每个周期重新拉取需要探测的网关并全部探测一遍；失败的网关写入带 TTL 的黑名单标记并告警
use crate::alerts::{emit_alert, Alert, AlertSink, AlertType};
use crate::catalog::{Catalog, Gateway, GatewayFilter};
use crate::config::{blacklist_key, Config};
use crate::error::SidecarResult;
use crate::sip::{OutboundRequest, SipRequester};
use crate::store::KeyValueStore;
use crate::utils::is_valid_ipv4;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// 探测 URI 与发送目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub uri: String,
    pub proxy: String,
}

impl ProbeTarget {
    pub fn new(gateway: &Gateway) -> Self {
        let use_sips = gateway.is_tls() && gateway.use_sips_scheme;
        let proxy = match gateway.port {
            Some(port) if is_valid_ipv4(&gateway.ipv4) => {
                format!("sip:{}:{};transport={}", gateway.ipv4, port, gateway.transport())
            }
            _ => format!("sip:{};transport={}", gateway.ipv4, gateway.transport()),
        };
        let scheme = if use_sips { "sips" } else { "sip" };
        let uri = match gateway.port {
            Some(port) if !use_sips => format!("{}:{}:{}", scheme, gateway.ipv4, port),
            _ => format!("{}:{}", scheme, gateway.ipv4),
        };
        Self { uri, proxy }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Alive,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ProberSettings {
    pub cluster_id: String,
    /// 探测间隔，同时是黑名单标记的 TTL
    pub interval: Duration,
}

impl ProberSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cluster_id: config.cluster_id.clone(),
            interval: config.options_ping_interval(),
        }
    }
}

pub struct OptionsProber {
    settings: ProberSettings,
    store: Arc<dyn KeyValueStore>,
    catalog: Arc<dyn Catalog>,
    requester: Arc<dyn SipRequester>,
    alerts: Arc<dyn AlertSink>,
    /// 当前周期正在探测的网关
    probed: Mutex<Vec<Gateway>>,
}

impl OptionsProber {
    pub fn new(
        settings: ProberSettings,
        store: Arc<dyn KeyValueStore>,
        catalog: Arc<dyn Catalog>,
        requester: Arc<dyn SipRequester>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            settings,
            store,
            catalog,
            requester,
            alerts,
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn probed(&self) -> Vec<Gateway> {
        self.probed.lock().clone()
    }

    /// 一个探测周期，返回失败的网关数
    pub async fn probe_cycle(&self) -> SidecarResult<usize> {
        let gateways = self
            .catalog
            .lookup_gateways_by_filter(GatewayFilter::options_ping())
            .await?;
        *self.probed.lock() = gateways.clone();
        if gateways.is_empty() {
            return Ok(0);
        }

        debug!("sending OPTIONS ping to {} gateways", gateways.len());
        let outcomes = join_all(gateways.iter().map(|gw| self.probe(gw))).await;
        Ok(outcomes.into_iter().filter(|o| *o == ProbeOutcome::Failed).count())
    }

    async fn probe(&self, gateway: &Gateway) -> ProbeOutcome {
        let target = ProbeTarget::new(gateway);
        let request = OutboundRequest::options(target.uri.clone(), target.proxy.clone());
        let (status, detail) = match self.requester.request(request).await {
            Ok(response) if response.status_code == rsip::StatusCode::OK => {
                return ProbeOutcome::Alive;
            }
            Ok(response) => {
                let code = response.status_code.code();
                info!("received OPTIONS response {} for {}", code, target.uri);
                (Some(code), format!("received: {}", code))
            }
            Err(e) => {
                error!("error sending OPTIONS ping to {}: {}", target.uri, e);
                (None, format!("error: {}", e))
            }
        };
        self.mark_failed(gateway, status, &detail).await;
        ProbeOutcome::Failed
    }

    async fn mark_failed(&self, gateway: &Gateway, status: Option<u16>, detail: &str) {
        let key = blacklist_key(&self.settings.cluster_id, &gateway.sip_gateway_sid);
        if let Err(e) = self
            .store
            .set(&key, &gateway.sip_gateway_sid, Some(self.settings.interval))
            .await
        {
            error!("failed to blacklist gateway {}: {}", gateway.sip_gateway_sid, e);
        }

        let carrier = match self.catalog.lookup_carrier_by_sid(&gateway.voip_carrier_sid).await {
            Ok(Some(carrier)) => carrier,
            Ok(None) => return,
            Err(e) => {
                error!("failed to look up carrier {}: {}", gateway.voip_carrier_sid, e);
                return;
            }
        };
        let port = gateway.port.map(|p| format!(":{}", p)).unwrap_or_default();
        let alert = Alert {
            account_sid: carrier.account_sid,
            service_provider_sid: carrier.service_provider_sid,
            url: Some(ProbeTarget::new(gateway).uri),
            status,
            ..Alert::new(AlertType::GatewayOptionsPing)
        }
        .with_message(format!(
            "Options ping {}{};transport={} unsuccessfully, {}",
            gateway.ipv4, port, gateway.protocol, detail
        ));
        emit_alert(self.alerts.as_ref(), alert).await;
    }

    /// 按固定间隔探测，直到取消
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.settings.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.probe_cycle().await {
                        e.report("options ping cycle");
                    }
                }
            }
        }
    }
}
