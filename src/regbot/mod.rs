/// 中继出站注册
///
/// `RegbotManager` 通过分布式租约保证集群内只有一个副本在注册，
/// 每个 (carrier, gateway) 对应一个 `Regbot` 任务
mod bot;
mod manager;
mod snapshot;

pub use bot::{
    Regbot, RegbotHandle, RegbotSettings, RegbotState, RegbotStatus, RegbotTarget, FAILURE_BACKOFF,
    RENEWAL_MARGIN_SECS, TRANSPORT_ERROR_BACKOFF,
};
pub use manager::{ManagerSettings, RegbotManager, RegbotSummary};
pub use snapshot::RegistrationSnapshot;
