/// 进程内目录
///
/// 可从 JSON 种子文件加载；测试中通过 upsert/remove 模拟数据库变更
use super::*;
use crate::error::ConfigError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// 目录种子数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogData {
    #[serde(default)]
    pub carriers: Vec<Carrier>,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    /// account_sid -> 容量
    #[serde(default)]
    pub capacities: HashMap<String, Vec<AccountCapacity>>,
    #[serde(default)]
    pub system: Option<SystemInformation>,
    #[serde(default)]
    pub clients: Vec<ClientCredential>,
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    data: RwLock<CatalogData>,
    register_status: RwLock<HashMap<String, RegisterStatus>>,
    unavailable: AtomicBool,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: CatalogData) -> Self {
        Self {
            data: RwLock::new(data),
            ..Default::default()
        }
    }

    /// 从 JSON 文件加载
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))?;
        let data: CatalogData = serde_json::from_str(&raw)?;
        info!(
            "loaded catalog from {}: {} carriers, {} gateways, {} accounts",
            path.display(),
            data.carriers.len(),
            data.gateways.len(),
            data.accounts.len()
        );
        Ok(Self::from_data(data))
    }

    /// 模拟数据库不可达
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn upsert_carrier(&self, carrier: Carrier) {
        let mut data = self.data.write();
        data.carriers
            .retain(|c| c.voip_carrier_sid != carrier.voip_carrier_sid);
        data.carriers.push(carrier);
    }

    pub fn upsert_gateway(&self, gateway: Gateway) {
        let mut data = self.data.write();
        data.gateways
            .retain(|g| g.sip_gateway_sid != gateway.sip_gateway_sid);
        data.gateways.push(gateway);
    }

    pub fn remove_gateway(&self, sip_gateway_sid: &str) {
        self.data
            .write()
            .gateways
            .retain(|g| g.sip_gateway_sid != sip_gateway_sid);
    }

    pub fn upsert_account(&self, account: Account) {
        let mut data = self.data.write();
        data.accounts.retain(|a| a.account_sid != account.account_sid);
        data.accounts.push(account);
    }

    pub fn set_capacities(&self, account_sid: &str, capacities: Vec<AccountCapacity>) {
        self.data
            .write()
            .capacities
            .insert(account_sid.to_string(), capacities);
    }

    pub fn set_system_information(&self, system: SystemInformation) {
        self.data.write().system = Some(system);
    }

    /// 最近一次持久化的注册状态
    pub fn register_status(&self, voip_carrier_sid: &str) -> Option<RegisterStatus> {
        self.register_status.read().get(voip_carrier_sid).cloned()
    }

    fn check_available(&self) -> CatalogResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("catalog connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn lookup_carriers_requiring_register(&self) -> CatalogResult<Vec<Carrier>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .carriers
            .iter()
            .filter(|c| c.requires_register && c.is_active)
            .cloned()
            .collect())
    }

    async fn lookup_gateways_by_carrier(
        &self,
        voip_carrier_sid: &str,
    ) -> CatalogResult<Vec<Gateway>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .gateways
            .iter()
            .filter(|g| g.voip_carrier_sid == voip_carrier_sid)
            .cloned()
            .collect())
    }

    async fn lookup_account_by_realm(&self, realm: &str) -> CatalogResult<Option<Account>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .accounts
            .iter()
            .find(|a| a.sip_realm.eq_ignore_ascii_case(realm))
            .cloned())
    }

    async fn lookup_account_capacities(
        &self,
        account_sid: &str,
    ) -> CatalogResult<Vec<AccountCapacity>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .capacities
            .get(account_sid)
            .cloned()
            .unwrap_or_default())
    }

    async fn lookup_carrier_by_sid(
        &self,
        voip_carrier_sid: &str,
    ) -> CatalogResult<Option<Carrier>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .carriers
            .iter()
            .find(|c| c.voip_carrier_sid == voip_carrier_sid)
            .cloned())
    }

    async fn lookup_gateways_by_filter(
        &self,
        filter: GatewayFilter,
    ) -> CatalogResult<Vec<Gateway>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .gateways
            .iter()
            .filter(|g| filter.matches(g))
            .cloned()
            .collect())
    }

    async fn lookup_system_information(&self) -> CatalogResult<Option<SystemInformation>> {
        self.check_available()?;
        Ok(self.data.read().system.clone())
    }

    async fn lookup_client(
        &self,
        account_sid: &str,
        username: &str,
    ) -> CatalogResult<Option<ClientCredential>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .clients
            .iter()
            .find(|c| c.account_sid == account_sid && c.username == username)
            .cloned())
    }

    async fn update_carrier_register_status(
        &self,
        voip_carrier_sid: &str,
        status: RegisterStatus,
    ) -> CatalogResult<()> {
        self.check_available()?;
        self.register_status
            .write()
            .insert(voip_carrier_sid.to_string(), status);
        Ok(())
    }
}
