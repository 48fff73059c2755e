/// REGISTER 准入流水线
///
/// 固定顺序：上下文初始化 -> 拒绝 IPv4 realm -> 缓存检查 -> 账户与设备上限。
/// 任何一步给出响应即终止；全部通过后交给外部鉴权（digest challenge / webhook）。
mod registrar;

pub use registrar::{InMemoryRegistrar, RedisRegistrar, RegistrationRecord, RegistrationStore};

use crate::alerts::{emit_alert, Alert, AlertSink, StatsSink};
use crate::catalog::{
    Catalog, RegistrationHook, CAPACITY_DEVICE, CAPACITY_VOICE_CALL_SESSION,
};
use crate::error::SidecarResult;
use crate::utils::is_ipv4_literal;
use async_trait::async_trait;
use chrono::Utc;
use rsip::StatusCode;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const MAX_DEVICES_REASON: &str = "Max Devices Registered";
pub const DEACTIVATED_REASON: &str = "Account has been deactivated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    Register,
    Unregister,
}

/// 入站 REGISTER 请求中准入需要的部分
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// Request-URI，如 `sip:acme.example.com`
    pub request_uri: String,
    /// To 头中的 AOR，如 `sip:alice@acme.example.com`
    pub aor: String,
    pub kind: RegistrationKind,
    pub source_address: IpAddr,
    pub source_port: u16,
    pub contact: Option<String>,
    pub protocol: String,
    pub call_id: Option<String>,
}

impl RegisterRequest {
    /// 与注册记录中 proxy 字段同格式的来源地址
    pub fn source_uri(&self) -> String {
        format!("sip:{}:{}", self.source_address, self.source_port)
    }
}

/// 请求级上下文
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    pub request_id: String,
    pub started: Instant,
    pub user: String,
    pub realm: String,
    pub account_sid: Option<String>,
    pub webhook_secret: Option<String>,
    pub registration_hook: Option<RegistrationHook>,
}

impl AdmissionContext {
    pub fn aor(&self) -> String {
        format!("{}@{}", self.user, self.realm)
    }
}

/// 准入给出的直接响应
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: Vec<rsip::Header>,
    /// 是否由缓存直接应答
    pub cached: bool,
}

impl Reply {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: vec![],
            cached: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_header(mut self, header: rsip::Header) -> Self {
        self.headers.push(header);
        self
    }

    fn max_devices() -> Self {
        Self::status(StatusCode::ServiceUnavailable).with_reason(MAX_DEVICES_REASON)
    }
}

#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    /// 直接应答，流水线终止
    Respond(Reply),
    /// 交给鉴权继续处理
    Continue(AdmissionContext),
}

/// 外部鉴权（digest challenge 或 webhook）
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn challenge(&self, ctx: &AdmissionContext, request: &RegisterRequest) -> Reply;
}

/// 未接入外部鉴权时的占位实现：一律 503，设备按协议稍后重试
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableAuthenticator;

#[async_trait]
impl Authenticator for UnavailableAuthenticator {
    async fn challenge(&self, ctx: &AdmissionContext, request: &RegisterRequest) -> Reply {
        warn!(
            "no authenticator configured, refusing REGISTER for {} from {}",
            ctx.aor(),
            request.source_uri()
        );
        Reply::status(StatusCode::ServiceUnavailable)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    /// 多租户托管模式：未知 realm 拒绝，并检查设备上限
    pub hosting: bool,
    /// 缓存命中时授予的 expires
    pub nat_expires: u32,
}

/// 准入流水线
pub struct AdmissionPipeline {
    config: AdmissionConfig,
    registrar: Arc<dyn RegistrationStore>,
    catalog: Arc<dyn Catalog>,
    alerts: Arc<dyn AlertSink>,
    stats: Arc<dyn StatsSink>,
}

impl AdmissionPipeline {
    pub fn new(
        config: AdmissionConfig,
        registrar: Arc<dyn RegistrationStore>,
        catalog: Arc<dyn Catalog>,
        alerts: Arc<dyn AlertSink>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            config,
            registrar,
            catalog,
            alerts,
            stats,
        }
    }

    /// 处理一个 REGISTER
    pub async fn process(&self, request: &RegisterRequest) -> AdmissionOutcome {
        let span = info_span!(
            "register",
            aor = %request.aor,
            source = %request.source_uri(),
        );
        async {
            let outcome = self.run(request).await;
            if let AdmissionOutcome::Respond(reply) = &outcome {
                debug!("answered {} without challenge", reply.status);
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// 记录整条处理路径的耗时，区分缓存命中与完整路径
    pub fn record_response_time(&self, started: Instant, cached: bool) {
        self.stats.timing(
            "sbc.registration.total.response_time",
            started.elapsed(),
            &[("cached", if cached { "true" } else { "false" })],
        );
    }

    async fn run(&self, request: &RegisterRequest) -> AdmissionOutcome {
        let mut ctx = Self::init_context();

        if let Some(reply) = Self::reject_ipv4(request) {
            return AdmissionOutcome::Respond(reply);
        }

        match parse_aor(&request.aor) {
            Some((user, realm)) => {
                ctx.user = user;
                ctx.realm = realm;
            }
            None => {
                info!("rejecting REGISTER with unparseable AOR {}", request.aor);
                return AdmissionOutcome::Respond(Reply::status(StatusCode::BadRequest));
            }
        }

        match self.check_cache(request, &ctx).await {
            Ok(Some(reply)) => {
                self.record_response_time(ctx.started, true);
                return AdmissionOutcome::Respond(reply);
            }
            Ok(None) => {}
            Err(e) => {
                error!("error querying cached registration for {}: {}", ctx.aor(), e);
                return AdmissionOutcome::Respond(Reply::status(StatusCode::ServerInternalError));
            }
        }

        match self.check_account_limits(request, &mut ctx).await {
            Ok(Some(reply)) => AdmissionOutcome::Respond(reply),
            Ok(None) => AdmissionOutcome::Continue(ctx),
            Err(e) => {
                error!("error checking account limits for {}: {}", ctx.realm, e);
                AdmissionOutcome::Respond(Reply::status(StatusCode::ServerInternalError))
            }
        }
    }

    fn init_context() -> AdmissionContext {
        AdmissionContext {
            request_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            user: String::new(),
            realm: String::new(),
            account_sid: None,
            webhook_secret: None,
            registration_hook: None,
        }
    }

    /// realm 必须是域名；点分 IPv4 直接 403
    fn reject_ipv4(request: &RegisterRequest) -> Option<Reply> {
        let host = rsip::Uri::try_from(request.request_uri.as_str())
            .ok()
            .map(|uri| uri.host_with_port.host.to_string());
        match host {
            Some(host) if !host.is_empty() && !is_ipv4_literal(&host) => None,
            _ => {
                info!(
                    "rejecting REGISTER from {}: ipv4 address where a sip realm is required",
                    request.request_uri
                );
                Some(Reply::status(StatusCode::Forbidden))
            }
        }
    }

    /// 同一来源的有效缓存注册直接 200，授予 NAT 宽限期作为 expires
    async fn check_cache(
        &self,
        request: &RegisterRequest,
        ctx: &AdmissionContext,
    ) -> SidecarResult<Option<Reply>> {
        if request.kind == RegistrationKind::Unregister {
            return Ok(None);
        }
        let aor = ctx.aor();
        let Some(record) = self.registrar.query(&aor).await? else {
            return Ok(None);
        };
        if record.proxy != request.source_uri() {
            debug!("cached registration for {} came from {}, re-authenticating", aor, record.proxy);
            return Ok(None);
        }

        let nat_expires = self.config.nat_expires;
        let check = Utc::now() + chrono::Duration::seconds(i64::from(nat_expires));
        if check >= record.expiry_time {
            debug!("cached registration for {} is about to expire, need to re-authenticate", aor);
            return Ok(None);
        }

        debug!(
            "responding to cached register for {} (expiry {}, check {})",
            aor,
            record.expiry_time.to_rfc3339(),
            check.to_rfc3339()
        );
        let mut reply = Reply::status(StatusCode::OK);
        reply.cached = true;
        if let Some(contact) = &request.contact {
            let rewritten = crate::sip::rewrite_contact_expires(contact, nat_expires);
            reply.headers.push(rsip::Header::Contact(rewritten.into()));
        }
        reply
            .headers
            .push(rsip::Header::Expires(rsip::headers::Expires::from(nat_expires)));
        Ok(Some(reply))
    }

    /// 账户状态与设备上限
    async fn check_account_limits(
        &self,
        request: &RegisterRequest,
        ctx: &mut AdmissionContext,
    ) -> SidecarResult<Option<Reply>> {
        let realm = ctx.realm.clone();
        let account = self.catalog.lookup_account_by_realm(&realm).await?;

        let account = match account {
            Some(account) if !account.is_active => {
                debug!("account is deactivated, rejecting registration");
                return Ok(Some(Reply::status(StatusCode::Forbidden).with_header(
                    rsip::Header::Other("X-Reason".into(), DEACTIVATED_REASON.into()),
                )));
            }
            Some(account) => {
                debug!("retrieved account {} for realm {}", account.account_sid, realm);
                ctx.account_sid = Some(account.account_sid.clone());
                ctx.webhook_secret = account.webhook_secret.clone();
                ctx.registration_hook = account.registration_hook.clone();
                Some(account)
            }
            None if self.config.hosting => {
                info!("rejecting REGISTER for unknown sip realm: {}", realm);
                return Ok(Some(Reply::status(StatusCode::Forbidden)));
            }
            None => None,
        };

        if request.kind == RegistrationKind::Unregister || !self.config.hosting {
            return Ok(None);
        }
        let Some(account) = account else {
            return Ok(None);
        };

        let capacities = self
            .catalog
            .lookup_account_capacities(&account.account_sid)
            .await?;
        let quantity = |category: &str| {
            capacities
                .iter()
                .find(|c| c.category == category)
                .map(|c| c.quantity)
                .unwrap_or(0)
        };
        let calls = quantity(CAPACITY_VOICE_CALL_SESSION);
        let limit = device_ceiling(calls, account.device_to_call_ratio, quantity(CAPACITY_DEVICE));
        debug!("call capacity: {}, device capacity: {}", calls, limit);

        if limit == 0 {
            info!(
                "device registration not allowed for account {}",
                account.account_sid
            );
            emit_alert(self.alerts.as_ref(), Alert::device_limit(&account.account_sid, 0)).await;
            return Ok(Some(Reply::max_devices()));
        }

        let device_count = self.registrar.count_of_users(&realm).await?;
        // +1 容忍正在注册的设备自己残留的旧注册
        if device_count as u64 > u64::from(limit) + 1 {
            info!(
                "registration rejected due to device limit for account {}",
                account.account_sid
            );
            let alert = Alert::device_limit(&account.account_sid, limit);
            emit_alert(self.alerts.as_ref(), alert).await;
            return Ok(Some(Reply::max_devices()));
        }
        debug!(
            "account limits passed: devices registered {}, limit is {}",
            device_count, limit
        );
        Ok(None)
    }
}

/// 设备注册上限 = 通话容量 × 设备通话比 + 额外设备容量
pub fn device_ceiling(
    voice_call_capacity: u32,
    device_to_call_ratio: u32,
    extra_devices: u32,
) -> u32 {
    voice_call_capacity
        .saturating_mul(device_to_call_ratio)
        .saturating_add(extra_devices)
}

/// 解析 AOR 得到 (user, realm)
fn parse_aor(aor: &str) -> Option<(String, String)> {
    let uri = rsip::Uri::try_from(aor).ok()?;
    let user = uri.auth.map(|a| a.user)?;
    let realm = uri.host_with_port.host.to_string();
    if user.is_empty() || realm.is_empty() {
        return None;
    }
    Some((user, realm))
}
