// 声明所有模块
pub mod admission;
pub mod alerts;
pub mod catalog;
pub mod config;
pub mod error;
pub mod health;
pub mod lease;
pub mod regbot;
pub mod sip;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;

/// 重新导出thiserror错误类型
pub use crate::error::{
    CatalogError, ConfigError, SidecarError, SidecarResult, SipError, StoreError,
};

/// 主要API重新导出，简化使用
pub use crate::admission::{AdmissionOutcome, AdmissionPipeline, Authenticator, RegisterRequest};
pub use crate::config::Config as SidecarConfig;
pub use crate::health::{HealthMonitor, OptionsProber};
pub use crate::lease::{LeaseCoordinator, LeaseDecision};
pub use crate::regbot::{RegbotManager, RegbotSummary};
pub use crate::sip::{SipEndpoint, SipRequester};
pub use crate::store::KeyValueStore;

/// sidecar 版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent 头
pub fn user_agent() -> String {
    format!("sbc-sip-sidecar/{}", VERSION)
}
