/// 关系型目录模块
///
/// carrier / gateway / account 等实体的只读查询，以及唯一的写操作：
/// 持久化 carrier 的最新注册状态
mod memory;

pub use memory::{CatalogData, InMemoryCatalog};

use crate::error::CatalogError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type CatalogResult<T> = Result<T, CatalogError>;

/// VoIP carrier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Carrier {
    pub voip_carrier_sid: String,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub service_provider_sid: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub requires_register: bool,
    #[serde(default)]
    pub register_username: Option<String>,
    #[serde(default)]
    pub register_password: Option<String>,
    #[serde(default)]
    pub register_sip_realm: Option<String>,
    #[serde(default)]
    pub register_from_user: Option<String>,
    #[serde(default)]
    pub register_from_domain: Option<String>,
    #[serde(default)]
    pub register_public_ip_in_contact: bool,
}

/// carrier 下的 SIP 网关
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gateway {
    pub sip_gateway_sid: String,
    pub voip_carrier_sid: String,
    /// IPv4 地址或主机名
    pub ipv4: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// `udp` / `tcp` / `tls` / `tls/srtp` ...
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub use_sips_scheme: bool,
    #[serde(default)]
    pub inbound: bool,
    #[serde(default)]
    pub outbound: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub send_options_ping: bool,
}

impl Gateway {
    /// 协议中 `/` 之前的传输部分（`tls/srtp` -> `tls`）
    pub fn transport(&self) -> &str {
        self.protocol
            .split_once('/')
            .map(|(t, _)| t)
            .unwrap_or(self.protocol.as_str())
    }

    pub fn is_tls(&self) -> bool {
        self.protocol.contains("tls")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationHook {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_sid: String,
    pub sip_realm: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_ratio")]
    pub device_to_call_ratio: u32,
    #[serde(default)]
    pub registration_hook: Option<RegistrationHook>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// 账户容量类别
pub const CAPACITY_VOICE_CALL_SESSION: &str = "voice_call_session";
pub const CAPACITY_DEVICE: &str = "device";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCapacity {
    pub category: String,
    pub quantity: u32,
}

/// 系统级配置（全局 SIP 域名等）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInformation {
    #[serde(default)]
    pub sip_domain_name: Option<String>,
}

/// 设备客户端凭证（供外部鉴权中间件使用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCredential {
    pub client_sid: String,
    pub account_sid: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterState {
    Ok,
    Fail,
}

/// 持久化到 carrier 的注册状态，便于运维观察
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterStatus {
    pub status: RegisterState,
    pub reason: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub cseq: Option<u32>,
}

/// 网关过滤条件，None 表示不限
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayFilter {
    pub send_options_ping: Option<bool>,
    pub outbound: Option<bool>,
    pub is_active: Option<bool>,
}

impl GatewayFilter {
    /// 出站 OPTIONS 探测使用的过滤条件
    pub fn options_ping() -> Self {
        Self {
            send_options_ping: Some(true),
            outbound: Some(true),
            is_active: Some(true),
        }
    }

    pub fn matches(&self, gw: &Gateway) -> bool {
        self.send_options_ping.map_or(true, |v| gw.send_options_ping == v)
            && self.outbound.map_or(true, |v| gw.outbound == v)
            && self.is_active.map_or(true, |v| gw.is_active == v)
    }
}

fn default_true() -> bool {
    true
}

fn default_ratio() -> u32 {
    1
}

fn default_protocol() -> String {
    "udp".to_string()
}

/// 目录 trait
#[async_trait]
pub trait Catalog: Send + Sync {
    /// 需要注册且处于激活状态的 carrier
    async fn lookup_carriers_requiring_register(&self) -> CatalogResult<Vec<Carrier>>;

    async fn lookup_gateways_by_carrier(
        &self,
        voip_carrier_sid: &str,
    ) -> CatalogResult<Vec<Gateway>>;

    async fn lookup_account_by_realm(&self, realm: &str) -> CatalogResult<Option<Account>>;

    async fn lookup_account_capacities(
        &self,
        account_sid: &str,
    ) -> CatalogResult<Vec<AccountCapacity>>;

    async fn lookup_carrier_by_sid(&self, voip_carrier_sid: &str) -> CatalogResult<Option<Carrier>>;

    async fn lookup_gateways_by_filter(&self, filter: GatewayFilter) -> CatalogResult<Vec<Gateway>>;

    async fn lookup_system_information(&self) -> CatalogResult<Option<SystemInformation>>;

    async fn lookup_client(
        &self,
        account_sid: &str,
        username: &str,
    ) -> CatalogResult<Option<ClientCredential>>;

    async fn update_carrier_register_status(
        &self,
        voip_carrier_sid: &str,
        status: RegisterStatus,
    ) -> CatalogResult<()>;
}
