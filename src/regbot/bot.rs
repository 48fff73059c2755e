/// 单个网关的出站注册会话
///
/// 每个 Regbot 是一个独立的 tokio 任务：发送 REGISTER，等待结果，按结果调度下一次。
/// 同一网关的 REGISTER 严格串行；`stop` 之后迟到的响应直接丢弃。
use crate::alerts::{emit_alert, Alert, AlertSink, AlertType};
use crate::catalog::{Carrier, Catalog, Gateway, RegisterState, RegisterStatus};
use crate::sip::{
    headers_call_id, headers_cseq, response_expires, AuthCredential, OutboundRequest,
    PublicAddresses, SipRequester,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// 非 200 响应后的重试间隔
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(30);
/// 没有任何响应（传输错误/超时）后的重试间隔
pub const TRANSPORT_ERROR_BACKOFF: Duration = Duration::from_secs(60);
/// 在到期前提前多少秒续约
pub const RENEWAL_MARGIN_SECS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegbotState {
    None,
    Registering,
    Registered,
    Failed,
}

/// 所有 Regbot 共用的设置
#[derive(Debug, Clone)]
pub struct RegbotSettings {
    pub default_expires: u32,
    pub min_expires: u32,
    /// 部署级开关：Contact 使用本机公网地址
    pub contact_use_ip: bool,
    pub public_addresses: PublicAddresses,
}

impl Default for RegbotSettings {
    fn default() -> Self {
        Self {
            default_expires: 3600,
            min_expires: 30,
            contact_use_ip: false,
            public_addresses: PublicAddresses::new(),
        }
    }
}

impl RegbotSettings {
    /// 根据注册响应计算下一次 REGISTER 的延迟
    ///
    /// Contact expires 优先，其次 Expires 头，都没有则用默认值；低于最小值时取最小值
    pub fn renewal_delay(&self, response: &rsip::Response) -> Duration {
        let expires = response_expires(response)
            .unwrap_or(self.default_expires)
            .max(self.min_expires);
        Duration::from_secs(u64::from(expires.saturating_sub(RENEWAL_MARGIN_SECS).max(1)))
    }
}

/// 从 carrier + gateway 派生的注册参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegbotTarget {
    pub sip_gateway_sid: String,
    pub voip_carrier_sid: String,
    pub account_sid: Option<String>,
    pub service_provider_sid: Option<String>,
    pub username: String,
    pub password: String,
    pub sip_realm: String,
    pub from: String,
    pub ipv4: String,
    pub port: Option<u16>,
    pub transport: String,
    pub use_public_ip_in_contact: bool,
}

impl RegbotTarget {
    pub fn new(carrier: &Carrier, gateway: &Gateway) -> Self {
        let username = carrier.register_username.clone().unwrap_or_default();
        let sip_realm = carrier
            .register_sip_realm
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| gateway.ipv4.clone());
        let from_user = carrier
            .register_from_user
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| username.clone());
        let from_domain = carrier
            .register_from_domain
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| sip_realm.clone());
        Self {
            sip_gateway_sid: gateway.sip_gateway_sid.clone(),
            voip_carrier_sid: carrier.voip_carrier_sid.clone(),
            account_sid: carrier.account_sid.clone(),
            service_provider_sid: carrier.service_provider_sid.clone(),
            password: carrier.register_password.clone().unwrap_or_default(),
            from: format!("sip:{}@{}", from_user, from_domain),
            username,
            sip_realm,
            ipv4: gateway.ipv4.clone(),
            port: gateway.port,
            transport: gateway.transport().to_ascii_lowercase(),
            use_public_ip_in_contact: carrier.register_public_ip_in_contact,
        }
    }

    pub fn aor(&self) -> String {
        format!("{}@{}", self.username, self.sip_realm)
    }

    /// 物理发送目标
    pub fn proxy(&self) -> String {
        match self.port {
            Some(port) => format!("sip:{}:{};transport={}", self.ipv4, port, self.transport),
            None => format!("sip:{};transport={}", self.ipv4, self.transport),
        }
    }
}

/// 对外暴露的只读状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegbotStatus {
    pub sip_gateway_sid: String,
    pub voip_carrier_sid: String,
    pub aor: String,
    pub ipv4: String,
    pub port: Option<u16>,
    pub state: RegbotState,
    pub last_status: Option<u16>,
}

/// 出站注册会话
pub struct Regbot {
    target: RegbotTarget,
    settings: Arc<RegbotSettings>,
    requester: Arc<dyn SipRequester>,
    catalog: Arc<dyn Catalog>,
    alerts: Arc<dyn AlertSink>,
}

impl Regbot {
    pub fn new(
        target: RegbotTarget,
        settings: Arc<RegbotSettings>,
        requester: Arc<dyn SipRequester>,
        catalog: Arc<dyn Catalog>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            target,
            settings,
            requester,
            catalog,
            alerts,
        }
    }

    /// 启动任务；返回的句柄是停止它的唯一途径
    pub fn start(self) -> RegbotHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RegbotStatus {
            sip_gateway_sid: self.target.sip_gateway_sid.clone(),
            voip_carrier_sid: self.target.voip_carrier_sid.clone(),
            aor: self.target.aor(),
            ipv4: self.target.ipv4.clone(),
            port: self.target.port,
            state: RegbotState::None,
            last_status: None,
        });
        let span = tracing::info_span!(
            "regbot",
            gateway = %self.target.sip_gateway_sid,
            aor = %self.target.aor()
        );
        let task = tokio::spawn(self.run(cancel.clone(), status_tx).instrument(span));
        RegbotHandle {
            cancel,
            status: status_rx,
            task: Some(task),
        }
    }

    async fn run(self, cancel: CancellationToken, status: watch::Sender<RegbotStatus>) {
        let contact_domain = self.resolve_contact_domain().await;
        let mut failing = false;

        loop {
            status.send_modify(|s| s.state = RegbotState::Registering);
            let request = self.build_request(contact_domain.as_deref());
            debug!("sending REGISTER via {}", request.proxy);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = self.requester.request(request) => outcome,
            };
            // stop 与响应同时就绪时以 stop 为准
            if cancel.is_cancelled() {
                return;
            }

            let (delay, register_status) = match outcome {
                Ok(response) if response.status_code == rsip::StatusCode::OK => {
                    let delay = self.settings.renewal_delay(&response);
                    status.send_modify(|s| {
                        s.state = RegbotState::Registered;
                        s.last_status = Some(200);
                    });
                    info!(
                        "registered to {} at {}, next REGISTER in {}s",
                        self.target.sip_realm,
                        self.target.proxy(),
                        delay.as_secs()
                    );
                    failing = false;
                    (
                        delay,
                        RegisterStatus {
                            status: RegisterState::Ok,
                            reason: response.status_code.to_string(),
                            call_id: headers_call_id(&response.headers),
                            cseq: headers_cseq(&response.headers),
                        },
                    )
                }
                Ok(response) => {
                    let code = response.status_code.code();
                    status.send_modify(|s| {
                        s.state = RegbotState::Failed;
                        s.last_status = Some(code);
                    });
                    info!(
                        "got {} registering to {} at {}",
                        code,
                        self.target.sip_realm,
                        self.target.proxy()
                    );
                    if !failing {
                        let message = format!("REGISTER rejected with {}", response.status_code);
                        self.alert(Some(code), message).await;
                    }
                    failing = true;
                    (
                        FAILURE_BACKOFF,
                        RegisterStatus {
                            status: RegisterState::Fail,
                            reason: response.status_code.to_string(),
                            call_id: headers_call_id(&response.headers),
                            cseq: headers_cseq(&response.headers),
                        },
                    )
                }
                Err(e) => {
                    status.send_modify(|s| {
                        s.state = RegbotState::Failed;
                        s.last_status = None;
                    });
                    error!("error registering to {}: {}", self.target.proxy(), e);
                    if !failing {
                        self.alert(None, format!("REGISTER failed: {}", e)).await;
                    }
                    failing = true;
                    (
                        TRANSPORT_ERROR_BACKOFF,
                        RegisterStatus {
                            status: RegisterState::Fail,
                            reason: e.to_string(),
                            call_id: None,
                            cseq: None,
                        },
                    )
                }
            };

            if let Err(e) = self
                .catalog
                .update_carrier_register_status(&self.target.voip_carrier_sid, register_status)
                .await
            {
                warn!("failed to persist register status: {}", e);
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 不使用公网地址时，Contact 优先使用系统配置的 SIP 域名
    async fn resolve_contact_domain(&self) -> Option<String> {
        if self.use_public_ip() {
            return None;
        }
        match self.catalog.lookup_system_information().await {
            Ok(info) => info.and_then(|i| i.sip_domain_name).filter(|d| !d.is_empty()),
            Err(e) => {
                warn!("could not resolve sip domain name: {}", e);
                None
            }
        }
    }

    fn use_public_ip(&self) -> bool {
        self.target.use_public_ip_in_contact || self.settings.contact_use_ip
    }

    fn contact_address(&self, contact_domain: Option<&str>) -> String {
        if self.use_public_ip() {
            let transport = &self.target.transport;
            if let Some(addr) = self.settings.public_addresses.for_transport(transport) {
                return format!("{}@{}", self.target.username, addr);
            }
            warn!("no public address known for transport {}", self.target.transport);
        }
        match contact_domain {
            Some(domain) => format!("{}@{}", self.target.username, domain),
            None => self.target.aor(),
        }
    }

    pub(crate) fn build_request(&self, contact_domain: Option<&str>) -> OutboundRequest {
        let aor = self.target.aor();
        let expires = self.settings.default_expires;
        OutboundRequest {
            method: rsip::Method::Register,
            uri: format!("sip:{}", aor),
            proxy: self.target.proxy(),
            from: Some(self.target.from.clone()),
            to: Some(format!("sip:{}", aor)),
            contact: Some(format!(
                "<sip:{}>;expires={}",
                self.contact_address(contact_domain),
                expires
            )),
            expires: Some(expires),
            credential: (!self.target.username.is_empty()).then(|| AuthCredential {
                username: self.target.username.clone(),
                password: self.target.password.clone(),
            }),
        }
    }

    async fn alert(&self, status: Option<u16>, message: String) {
        let alert = Alert {
            account_sid: self.target.account_sid.clone(),
            service_provider_sid: self.target.service_provider_sid.clone(),
            url: Some(self.target.proxy()),
            status,
            ..Alert::new(AlertType::RegbotFailure)
        }
        .with_message(message);
        emit_alert(self.alerts.as_ref(), alert).await;
    }
}

/// 运行中 Regbot 的句柄
///
/// `stop` 幂等；句柄被丢弃时同样会停止任务
pub struct RegbotHandle {
    cancel: CancellationToken,
    status: watch::Receiver<RegbotStatus>,
    task: Option<JoinHandle<()>>,
}

impl RegbotHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> RegbotStatus {
        self.status.borrow().clone()
    }

    /// 停止并等待任务退出
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RegbotHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
