//! 单元测试共用的记录型替身
use crate::alerts::{Alert, AlertResult, AlertSink, StatsSink};
use crate::error::{SipError, StoreError};
use crate::sip::{OutboundRequest, SipRequester};
use crate::store::{KeyValueStore, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub fn response(code: u16, headers: Vec<rsip::Header>) -> rsip::Response {
    let mut response = rsip::Response {
        status_code: rsip::StatusCode::from(code),
        version: rsip::Version::V2,
        headers: Default::default(),
        body: vec![],
    };
    for header in headers {
        response.headers.push(header);
    }
    response
}

type ResponseResult = Result<rsip::Response, SipError>;
type Responder = Box<dyn Fn(&OutboundRequest) -> ResponseResult + Send + Sync>;

/// 记录所有出站请求，按闭包生成响应
pub struct RecordingRequester {
    responder: Responder,
    delay: Option<Duration>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl RecordingRequester {
    pub fn new(
        responder: impl Fn(&OutboundRequest) -> ResponseResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            delay: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn with_delay(
        delay: Duration,
        responder: impl Fn(&OutboundRequest) -> ResponseResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            responder: Box::new(responder),
            delay: Some(delay),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// 固定返回某个状态码
    pub fn status(code: u16) -> Arc<Self> {
        Self::new(move |_| Ok(response(code, vec![])))
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl SipRequester for RecordingRequester {
    async fn request(&self, request: OutboundRequest) -> Result<rsip::Response, SipError> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(&request)
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn write_alert(&self, alert: Alert) -> AlertResult {
        self.alerts.lock().push(alert);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingStats {
    samples: Mutex<Vec<(String, f64, Vec<(String, String)>)>>,
}

impl RecordingStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.samples
            .lock()
            .iter()
            .rev()
            .find(|(n, _, _)| n == name)
            .map(|(_, v, _)| *v)
    }

    pub fn tagged(&self, name: &str, tag: (&str, &str)) -> usize {
        self.samples
            .lock()
            .iter()
            .filter(|(n, _, tags)| n == name && tags.iter().any(|(k, v)| k == tag.0 && v == tag.1))
            .count()
    }

    fn record(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.samples.lock().push((
            name.to_string(),
            value,
            tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        ));
    }
}

impl StatsSink for RecordingStats {
    fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(name, value, tags);
    }

    fn histogram(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(name, value, tags);
    }
}

/// 所有操作都返回 `Unavailable` 的存储
pub struct FailingStore;

fn down<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("down".into()))
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        down()
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
        down()
    }
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
        down()
    }
    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        down()
    }
    async fn add_to_set(&self, _set: &str, _member: &str) -> StoreResult<bool> {
        down()
    }
    async fn remove_from_set(&self, _set: &str, _member: &str) -> StoreResult<bool> {
        down()
    }
    async fn is_member(&self, _set: &str, _member: &str) -> StoreResult<bool> {
        down()
    }
    async fn list_members(&self, _set: &str) -> StoreResult<Vec<String>> {
        down()
    }
}
