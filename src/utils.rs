/// SIP 工具函数模块
///
/// 提供日志初始化、地址分类以及 Call-ID 生成等辅助函数
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// 初始化 tracing 日志
///
/// `RUST_LOG` 存在时优先使用，否则使用传入的级别
pub fn initialize_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn dotted_quad() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[0-9]{1,3}\.){3}[0-9]{1,3}$").expect("static regex is valid")
    })
}

/// 判断 host 是否为点分十进制 IPv4 字面量
///
/// 只看形状不看取值范围（`999.1.1.1` 也算），REGISTER 的 realm 检查用这个
pub fn is_ipv4_literal(host: &str) -> bool {
    dotted_quad().is_match(host)
}

/// 严格校验 IPv4 地址（每段 0-255，不允许空格、端口或掩码）
pub fn is_valid_ipv4(input: &str) -> bool {
    input.parse::<Ipv4Addr>().is_ok()
}

/// RFC1918 私有地址段（10/8, 172.16/12, 192.168/16）
pub fn is_private_ipv4(addr: &Ipv4Addr) -> bool {
    addr.is_private()
}

/// 获取第一个非回环的网络接口 IPv4 地址
///
/// `exclude_private` 为 true 时跳过 RFC1918 地址
pub fn get_first_non_loopback_interface(
    exclude_private: bool,
) -> Result<IpAddr, Box<dyn std::error::Error>> {
    for interface in get_if_addrs::get_if_addrs()? {
        if interface.is_loopback() {
            continue;
        }
        match interface.addr {
            get_if_addrs::IfAddr::V4(ref addr) => {
                if exclude_private && is_private_ipv4(&addr.ip) {
                    continue;
                }
                return Ok(IpAddr::V4(addr.ip));
            }
            _ => continue,
        }
    }
    Err("no usable IPv4 interface found".into())
}

/// 生成基于 UUID 的 Call-ID
///
/// # 示例
/// ```rust
/// use sbc_sip_sidecar::utils::make_call_id;
///
/// let call_id = make_call_id(Some("example.com"));
/// assert!(call_id.to_string().ends_with("@example.com"));
/// ```
pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    let uuid = Uuid::new_v4();

    match domain {
        Some(d) => format!("{}@{}", uuid, d).into(),
        None => uuid.to_string().into(),
    }
}

/// 从 URI 的 transport 参数中提取传输协议，缺省为 UDP
pub fn extract_protocol_from_uri(uri: &rsip::Uri) -> rsip::transport::Transport {
    uri.params
        .iter()
        .find_map(|p| match p {
            rsip::Param::Transport(t) => Some(t.clone()),
            _ => None,
        })
        .unwrap_or(rsip::transport::Transport::Udp)
}

/// 根据 Via 中的传输协议（如 `SIP/2.0/WSS`）归类
pub fn sip_protocol_from_via(via_protocol: &str) -> Option<&'static str> {
    let lower = via_protocol.to_ascii_lowercase();
    let transport = lower.rsplit('/').next().unwrap_or(lower.as_str());
    if transport.starts_with("wss") {
        Some("wss")
    } else if transport.starts_with("ws") {
        Some("ws")
    } else if transport.starts_with("tcp") {
        Some("tcp")
    } else if transport.starts_with("udp") {
        Some("udp")
    } else {
        None
    }
}
