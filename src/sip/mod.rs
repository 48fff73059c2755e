/// SIP 事务层边界
///
/// regbot 与 OPTIONS 探测只通过 `SipRequester` 发送请求；
/// `SipEndpoint` 是基于 rsipstack 的实现，同时负责分发入站 REGISTER/OPTIONS
mod endpoint;

pub use endpoint::{heartbeat_from_request, register_request_from, InboundHandlers, SipEndpoint};

use crate::error::SipError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// TLS 传输没有公布端口时使用的默认端口
pub const DEFAULT_TLS_PORT: u16 = 5061;

/// 出站请求认证凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCredential {
    pub username: String,
    pub password: String,
}

/// 出站请求描述
///
/// `uri` 为 Request-URI，`proxy` 为物理发送目标（含 transport 参数）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: rsip::Method,
    pub uri: String,
    pub proxy: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub contact: Option<String>,
    pub expires: Option<u32>,
    pub credential: Option<AuthCredential>,
}

impl OutboundRequest {
    pub fn options(uri: impl Into<String>, proxy: impl Into<String>) -> Self {
        Self {
            method: rsip::Method::Options,
            uri: uri.into(),
            proxy: proxy.into(),
            from: None,
            to: None,
            contact: None,
            expires: None,
            credential: None,
        }
    }
}

/// 发送请求并等待最终响应
///
/// 返回 `Err` 表示根本没有收到响应（网络/传输错误或超时）
#[async_trait]
pub trait SipRequester: Send + Sync {
    async fn request(&self, request: OutboundRequest) -> Result<rsip::Response, SipError>;
}

fn expires_param() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)expires=(\d+)").expect("static regex is valid"))
}

/// 去掉可能存在的 `Name:` 前缀，只保留头部值
pub(crate) fn header_value(rendered: &str, name: &str) -> String {
    let trimmed = rendered.trim();
    match trimmed.split_once(':') {
        Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case(name) => rest.trim().to_string(),
        _ => trimmed.to_string(),
    }
}

/// 按名称查找自定义头（大小写不敏感）
pub fn other_header<'a>(headers: &'a rsip::Headers, name: &str) -> Option<&'a str> {
    headers.iter().find_map(|h| match h {
        rsip::Header::Other(n, value) if n.eq_ignore_ascii_case(name) => Some(value.as_str()),
        _ => None,
    })
}

/// 第一个 Contact 头的值
pub fn first_contact(headers: &rsip::Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        rsip::Header::Contact(contact) => Some(header_value(&contact.to_string(), "Contact")),
        _ => None,
    })
}

/// 第一个 Contact 头的 `expires` 参数
pub fn headers_contact_expires(headers: &rsip::Headers) -> Option<u32> {
    let contact = first_contact(headers)?;
    expires_param()
        .captures(&contact)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Expires 头的值
pub fn headers_expires(headers: &rsip::Headers) -> Option<u32> {
    headers.iter().find_map(|h| match h {
        rsip::Header::Expires(expires) => {
            header_value(&expires.to_string(), "Expires").parse().ok()
        }
        _ => None,
    })
}

pub fn headers_call_id(headers: &rsip::Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        rsip::Header::CallId(call_id) => Some(header_value(&call_id.to_string(), "Call-ID")),
        _ => None,
    })
}

/// CSeq 头中的序号
pub fn headers_cseq(headers: &rsip::Headers) -> Option<u32> {
    headers.iter().find_map(|h| match h {
        rsip::Header::CSeq(cseq) => header_value(&cseq.to_string(), "CSeq")
            .split_whitespace()
            .next()
            .and_then(|seq| seq.parse().ok()),
        _ => None,
    })
}

/// 响应中第一个 Contact 头的 `expires` 参数
pub fn contact_expires(response: &rsip::Response) -> Option<u32> {
    headers_contact_expires(&response.headers)
}

/// 响应中 Expires 头的值
pub fn header_expires(response: &rsip::Response) -> Option<u32> {
    headers_expires(&response.headers)
}

/// 注册有效期：Contact 的 expires 参数优先，其次 Expires 头
pub fn response_expires(response: &rsip::Response) -> Option<u32> {
    contact_expires(response).or_else(|| header_expires(response))
}

/// 把 Contact 中的 `expires=N` 改写为指定值
pub fn rewrite_contact_expires(contact: &str, expires: u32) -> String {
    expires_param()
        .replace_all(contact, format!("expires={}", expires).as_str())
        .into_owned()
}

/// 按传输协议记录的本机对外地址（`host:port`）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicAddresses {
    by_transport: HashMap<String, String>,
}

impl PublicAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transport: &str, address: impl Into<String>) -> Self {
        self.insert(transport, address);
        self
    }

    pub fn insert(&mut self, transport: &str, address: impl Into<String>) {
        self.by_transport
            .insert(transport.to_ascii_lowercase(), address.into());
    }

    pub fn is_empty(&self) -> bool {
        self.by_transport.is_empty()
    }

    /// 选择对外公布的地址
    ///
    /// 匹配传输协议的地址优先；否则退回 UDP 地址。TLS 退回时端口改为 5061
    pub fn for_transport(&self, transport: &str) -> Option<String> {
        let transport = transport.to_ascii_lowercase();
        if let Some(addr) = self.by_transport.get(&transport) {
            return Some(addr.clone());
        }
        let udp = self.by_transport.get("udp")?;
        if transport == "tls" {
            let host = udp.rsplit_once(':').map(|(h, _)| h).unwrap_or(udp);
            return Some(format!("{}:{}", host, DEFAULT_TLS_PORT));
        }
        Some(udp.clone())
    }
}
