/// 基于 rsipstack 的 SIP 端点
///
/// 出站：实现 `SipRequester`，按 proxy 发送请求并在 401/407 时用凭证重发一次。
/// 入站：把 REGISTER 交给准入流水线，把 OPTIONS 交给心跳监测，其余方法回 405。
use super::{
    first_contact, header_value, headers_contact_expires, headers_expires, other_header,
    OutboundRequest, SipRequester,
};
use crate::admission::{
    AdmissionOutcome, AdmissionPipeline, Authenticator, RegisterRequest, RegistrationKind, Reply,
};
use crate::error::SipError;
use crate::health::{
    HealthMonitor, Heartbeat, FS_STATUS_HEADER, MEMBERS_HEADER, RTP_STATUS_HEADER,
};
use crate::utils::{extract_protocol_from_uri, make_call_id, sip_protocol_from_via};
use async_trait::async_trait;
use rsip::{headers::ToTypedHeader, prelude::HeadersExt, SipMessage, StatusCode};
use rsipstack::{
    dialog::authenticate::{handle_client_authenticate, Credential},
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        make_tag,
        transaction::Transaction,
        Endpoint, TransactionReceiver,
    },
    transport::{udp::UdpConnection, SipAddr, TransportLayer},
    EndpointBuilder,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 单个出站事务的整体超时（与 Timer B / Timer F 一致）
const REQUEST_TIMEOUT: Duration = Duration::from_secs(32);

/// SIP 端点
pub struct SipEndpoint {
    endpoint: Endpoint,
    cancel_token: CancellationToken,
}

impl SipEndpoint {
    /// 在 `listen` 上创建 UDP 传输并构建端点
    pub async fn bind(
        listen: SocketAddr,
        user_agent: &str,
        cancel_token: CancellationToken,
    ) -> Result<Self, SipError> {
        let transport_layer = TransportLayer::new(cancel_token.child_token());
        let connection =
            UdpConnection::create_connection(listen, None, Some(cancel_token.child_token())).await?;
        transport_layer.add_transport(connection.into());

        let mut endpoint_builder = EndpointBuilder::new();
        endpoint_builder
            .with_cancel_token(cancel_token.child_token())
            .with_transport_layer(transport_layer)
            .with_user_agent(user_agent);
        let endpoint = endpoint_builder.build();

        info!("SIP endpoint listening on {}", listen);
        Ok(Self {
            endpoint,
            cancel_token,
        })
    }

    /// 启动端点服务任务
    pub fn serve(&self) {
        let inner = self.endpoint.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.serve().await {
                warn!("SIP endpoint stopped: {}", e);
            }
        });
    }

    /// 入站事务接收端，只能取一次
    pub fn incoming(&self) -> Result<TransactionReceiver, SipError> {
        Ok(self.endpoint.incoming_transactions()?)
    }

    /// 实际绑定的本地地址（`host:port`）
    pub fn local_addresses(&self) -> Vec<String> {
        self.endpoint
            .get_addrs()
            .iter()
            .map(|addr| addr.addr.to_string())
            .collect()
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    fn inner(&self) -> EndpointInnerRef {
        self.endpoint.inner.clone()
    }

    async fn send(&self, outbound: OutboundRequest) -> Result<rsip::Response, SipError> {
        let inner = self.inner();
        let request_uri = rsip::Uri::try_from(outbound.uri.as_str())?;
        let proxy_uri = rsip::Uri::try_from(outbound.proxy.as_str())?;
        let destination = SipAddr {
            r#type: Some(extract_protocol_from_uri(&proxy_uri)),
            addr: proxy_uri.host_with_port.clone(),
        };

        let to_uri = match &outbound.to {
            Some(to) => rsip::Uri::try_from(to.as_str())?,
            None => request_uri.clone(),
        };
        let from_uri = match &outbound.from {
            Some(from) => rsip::Uri::try_from(from.as_str())?,
            None => to_uri.clone(),
        };
        let to = rsip::typed::To {
            display_name: None,
            uri: to_uri,
            params: vec![],
        };
        let from = rsip::typed::From {
            display_name: None,
            uri: from_uri,
            params: vec![],
        }
        .with_tag(make_tag());

        let mut seq = 1;
        let via = inner.get_via(None, None)?;
        let mut request =
            inner.make_request(outbound.method, request_uri, via, from, to, seq, None);
        request
            .headers
            .unique_push(make_call_id(inner.option.callid_suffix.as_deref()).into());
        if let Some(contact) = &outbound.contact {
            request.headers.unique_push(rsip::Header::Contact(contact.clone().into()));
        }
        if let Some(expires) = outbound.expires {
            request
                .headers
                .unique_push(rsip::headers::Expires::from(expires).into());
        }

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, inner.clone(), None);
        tx.destination = Some(destination.clone());
        tx.send().await?;

        let credential = outbound.credential.map(|c| Credential {
            username: c.username,
            password: c.password,
            realm: None,
        });
        let mut auth_sent = false;

        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                break;
            };
            if resp.status_code.code() < 200 {
                continue;
            }
            let challenged = matches!(
                resp.status_code,
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
            );
            match credential.as_ref() {
                Some(cred) if challenged && !auth_sent => {
                    debug!(
                        "received {} challenge from {}, retrying with credentials",
                        resp.status_code, destination.addr
                    );
                    seq += 1;
                    tx = handle_client_authenticate(seq, &tx, resp, cred).await?;
                    tx.destination = Some(destination.clone());
                    tx.send().await?;
                    auth_sent = true;
                }
                _ => return Ok(resp),
            }
        }

        Err(SipError::Transport(format!(
            "{} transaction to {} terminated without a final response",
            outbound.method, destination.addr
        )))
    }
}

#[async_trait]
impl SipRequester for SipEndpoint {
    async fn request(&self, request: OutboundRequest) -> Result<rsip::Response, SipError> {
        Ok(tokio::time::timeout(REQUEST_TIMEOUT, self.send(request)).await??)
    }
}

/// 顶层 Via 给出的传输协议与来源地址；优先使用 received/rport
struct ViaSource {
    protocol: String,
    address: IpAddr,
    port: u16,
}

fn via_source(request: &rsip::Request) -> Result<ViaSource, SipError> {
    let via = header_value(&request.via_header()?.to_string(), "Via");
    let (protocol, rest) = via
        .split_once(char::is_whitespace)
        .ok_or_else(|| SipError::Protocol(format!("malformed Via: {}", via)))?;
    let mut parts = rest.trim().split(';');
    let sent_by = parts.next().unwrap_or_default().trim();

    let (mut host, mut port) = match sent_by.rsplit_once(':') {
        Some((h, p)) if !h.ends_with(']') || sent_by.starts_with('[') => {
            (h.trim_matches(|c| c == '[' || c == ']').to_string(), p.parse().ok())
        }
        _ => (sent_by.to_string(), None),
    };
    for param in parts {
        match param.trim().split_once('=') {
            Some(("received", value)) => host = value.to_string(),
            Some(("rport", value)) => port = value.parse().ok().or(port),
            _ => {}
        }
    }

    let address: IpAddr = host
        .parse()
        .map_err(|_| SipError::Protocol(format!("Via source {} is not an IP address", host)))?;
    Ok(ViaSource {
        protocol: sip_protocol_from_via(protocol).unwrap_or("udp").to_string(),
        address,
        port: port.unwrap_or(5060),
    })
}

/// 从入站 REGISTER 提取准入所需字段
pub fn register_request_from(request: &rsip::Request) -> Result<RegisterRequest, SipError> {
    let source = via_source(request)?;
    let to = request.to_header()?.typed()?;
    let user = to
        .uri
        .auth
        .as_ref()
        .map(|a| a.user.clone())
        .ok_or_else(|| SipError::Protocol("To header has no user part".into()))?;
    let aor = format!("sip:{}@{}", user, to.uri.host_with_port.host);

    let contact = first_contact(&request.headers);
    let expires =
        headers_contact_expires(&request.headers).or_else(|| headers_expires(&request.headers));
    let unregister = expires == Some(0) || contact.as_deref() == Some("*");

    Ok(RegisterRequest {
        request_uri: request.uri.to_string(),
        aor,
        kind: if unregister {
            RegistrationKind::Unregister
        } else {
            RegistrationKind::Register
        },
        source_address: source.address,
        source_port: source.port,
        contact,
        protocol: source.protocol,
        call_id: request
            .call_id_header()
            .ok()
            .map(|c| header_value(&c.to_string(), "Call-ID")),
    })
}

/// 从入站 OPTIONS 提取心跳字段
pub fn heartbeat_from_request(request: &rsip::Request) -> Result<Heartbeat, SipError> {
    let source = via_source(request)?;
    Ok(Heartbeat {
        source_address: source.address,
        source_port: source.port,
        fs_status: other_header(&request.headers, FS_STATUS_HEADER).map(str::to_string),
        rtp_status: other_header(&request.headers, RTP_STATUS_HEADER).map(str::to_string),
    })
}

/// 带自定义原因短语的状态码
fn status_line(reply: &Reply) -> StatusCode {
    match &reply.reason {
        Some(reason) => StatusCode::Other(reply.status.code(), reason.clone()),
        None => reply.status.clone(),
    }
}

/// 入站请求分发
pub struct InboundHandlers {
    admission: Arc<AdmissionPipeline>,
    authenticator: Arc<dyn Authenticator>,
    health: Arc<HealthMonitor>,
}

impl InboundHandlers {
    pub fn new(
        admission: Arc<AdmissionPipeline>,
        authenticator: Arc<dyn Authenticator>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            admission,
            authenticator,
            health,
        }
    }

    /// 消费入站事务直到取消，每个事务独立处理
    pub async fn serve(
        self: Arc<Self>,
        mut incoming: TransactionReceiver,
        cancel: CancellationToken,
    ) {
        while let Some(mut transaction) = tokio::select! {
            tx = incoming.recv() => tx,
            _ = cancel.cancelled() => None,
        } {
            let handlers = self.clone();
            tokio::spawn(async move {
                let method = transaction.original.method;
                if let Err(e) = handlers.dispatch(&mut transaction).await {
                    warn!("failed handling {} request: {}", method, e);
                }
            });
        }
    }

    async fn dispatch(&self, tx: &mut Transaction) -> Result<(), SipError> {
        match tx.original.method {
            rsip::Method::Register => {
                let reply = self.on_register(&tx.original).await;
                tx.reply_with(status_line(&reply), reply.headers, None).await?;
            }
            rsip::Method::Options => {
                let (status, headers) = self.on_options(&tx.original).await;
                tx.reply_with(status, headers, None).await?;
            }
            rsip::Method::Ack => {}
            _ => tx.reply(StatusCode::MethodNotAllowed).await?,
        }
        Ok(())
    }

    async fn on_register(&self, request: &rsip::Request) -> Reply {
        let register = match register_request_from(request) {
            Ok(register) => register,
            Err(e) => {
                info!("rejecting malformed REGISTER: {}", e);
                return Reply::status(StatusCode::BadRequest);
            }
        };
        match self.admission.process(&register).await {
            AdmissionOutcome::Respond(reply) => reply,
            AdmissionOutcome::Continue(ctx) => {
                let reply = self.authenticator.challenge(&ctx, &register).await;
                self.admission.record_response_time(ctx.started, false);
                reply
            }
        }
    }

    async fn on_options(&self, request: &rsip::Request) -> (StatusCode, Vec<rsip::Header>) {
        let heartbeat = match heartbeat_from_request(request) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                debug!("answering OPTIONS with unparseable source: {}", e);
                return (StatusCode::OK, vec![]);
            }
        };
        let reply = self.health.handle(&heartbeat).await;
        let headers = reply
            .members
            .map(|count| vec![rsip::Header::Other(MEMBERS_HEADER.into(), count.to_string())])
            .unwrap_or_default();
        (StatusCode::from(reply.status), headers)
    }
}
