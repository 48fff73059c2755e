/// 告警与指标
///
/// 两者都是 fire-and-forget：失败只记录日志，不阻塞请求处理
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertType {
    /// 账户设备注册数超限
    AccountDeviceLimit,
    /// 出站 OPTIONS 探测失败
    GatewayOptionsPing,
    /// 中继注册失败
    RegbotFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub service_provider_sid: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Alert {
    pub fn new(alert_type: AlertType) -> Self {
        Self {
            alert_type,
            account_sid: None,
            service_provider_sid: None,
            count: None,
            url: None,
            status: None,
            message: None,
        }
    }

    pub fn device_limit(account_sid: impl Into<String>, count: u32) -> Self {
        Self {
            account_sid: Some(account_sid.into()),
            count: Some(count),
            ..Self::new(AlertType::AccountDeviceLimit)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub type AlertResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn write_alert(&self, alert: Alert) -> AlertResult;
}

/// 写告警并吞掉错误
pub async fn emit_alert(sink: &dyn AlertSink, alert: Alert) {
    let alert_type = alert.alert_type;
    if let Err(e) = sink.write_alert(alert).await {
        warn!("error writing {:?} alert: {}", alert_type, e);
    }
}

/// 指标输出
pub trait StatsSink: Send + Sync {
    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]);

    fn histogram(&self, name: &str, value: f64, tags: &[(&str, &str)]);

    fn timing(&self, name: &str, elapsed: Duration, tags: &[(&str, &str)]) {
        self.histogram(name, elapsed.as_secs_f64() * 1000.0, tags);
    }
}

/// 只写日志的告警输出
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn write_alert(&self, alert: Alert) -> AlertResult {
        let rendered = serde_json::to_string(&alert)?;
        warn!("alert: {}", rendered);
        Ok(())
    }
}

/// 只写日志的指标输出
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStats;

impl StatsSink for TracingStats {
    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        debug!("gauge {}={} {:?}", name, value, tags);
    }

    fn histogram(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        debug!("histogram {}={} {:?}", name, value, tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        async fn write_alert(&self, _alert: Alert) -> AlertResult {
            Err("alert service down".into())
        }
    }

    #[tokio::test]
    async fn emit_alert_swallows_failures() {
        emit_alert(&FailingSink, Alert::device_limit("a1", 0)).await;
        emit_alert(&TracingAlertSink, Alert::device_limit("a1", 3)).await;
    }

    #[test]
    fn alert_type_serializes_kebab_case() {
        let json = serde_json::to_value(Alert::device_limit("a1", 2)).unwrap();
        assert_eq!(json["alert_type"], "account-device-limit");
        assert_eq!(json["count"], 2);
    }
}
