/// sidecar 配置
///
/// 所有参数都可以通过命令行或环境变量提供，环境变量名沿用部署约定
use crate::error::ConfigError;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// SBC registrar sidecar
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Cluster identifier, prefixes every shared-store key
    #[arg(long, env = "JAMBONES_CLUSTER_ID", default_value = "default")]
    pub cluster_id: String,

    /// Hosted multi-tenant platform: unknown realms are rejected and device limits enforced
    #[arg(long, env = "JAMBONES_HOSTING")]
    pub hosting: bool,

    /// Log level
    #[arg(short, long, env = "JAMBONES_LOGLEVEL", default_value = "info")]
    pub log_level: String,

    /// SIP bind address
    #[arg(long, env = "SIP_LISTEN", default_value = "0.0.0.0:5060")]
    pub sip_listen: SocketAddr,

    /// Expires (seconds) granted to cached re-registrations
    #[arg(long, env = "JAMBONES_NAT_EXPIRES", default_value_t = 30)]
    pub nat_expires: u32,

    /// Expires (seconds) requested by trunk registrations
    #[arg(long, env = "JAMBONES_REGBOT_DEFAULT_EXPIRES", default_value_t = 3600)]
    pub regbot_default_expires: u32,

    /// Minimum trunk re-registration interval (seconds)
    #[arg(long, env = "JAMBONES_REGBOT_MIN_EXPIRES", default_value_t = 30)]
    pub regbot_min_expires: u32,

    /// Advertise the SBC public address in trunk REGISTER Contact headers
    #[arg(long, env = "JAMBONES_REGBOT_CONTACT_USE_IP")]
    pub regbot_contact_use_ip: bool,

    /// Lease check interval (seconds)
    #[arg(long, env = "REGBOT_STATUS_CHECK_INTERVAL", default_value_t = 60)]
    pub regbot_check_interval: u64,

    /// Upper bound of the random startup delay before the first lease claim (seconds)
    #[arg(long, env = "REGBOT_MAX_INITIAL_DELAY", default_value_t = 15)]
    pub regbot_max_initial_delay: u64,

    /// Heartbeat expiry window (milliseconds)
    #[arg(long, env = "EXPIRES_INTERVAL", default_value_t = 60_000)]
    pub expires_interval_ms: u64,

    /// Heartbeat sweep interval (milliseconds)
    #[arg(long, env = "CHECK_EXPIRES_INTERVAL", default_value_t = 20_000)]
    pub check_expires_interval_ms: u64,

    /// Outbound OPTIONS ping interval and blacklist TTL (seconds)
    #[arg(long, env = "SEND_OPTIONS_PING_INTERVAL", default_value_t = 60)]
    pub options_ping_interval: u64,

    /// Public UDP address (host:port) advertised to trunks
    #[arg(long, env = "SBC_PUBLIC_ADDRESS_UDP")]
    pub public_address_udp: Option<String>,

    /// Public TCP address (host:port) advertised to trunks
    #[arg(long, env = "SBC_PUBLIC_ADDRESS_TCP")]
    pub public_address_tcp: Option<String>,

    /// Public TLS address (host:port) advertised to trunks
    #[arg(long, env = "SBC_PUBLIC_ADDRESS_TLS")]
    pub public_address_tls: Option<String>,

    /// Skip RFC1918 addresses when discovering the public address from interfaces
    #[arg(
        long,
        env = "JAMBONES_EXCLUDE_PRIVATE_ADDRESSES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub exclude_private_addresses: bool,

    /// Redis host shared by every SBC in the cluster; in-process store when unset
    #[arg(long, env = "JAMBONES_REDIS_HOST")]
    pub redis_host: Option<String>,

    /// Redis port
    #[arg(long, env = "JAMBONES_REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// JSON file seeding the catalog (carriers, gateways, accounts)
    #[arg(long, env = "SBC_CATALOG_FILE")]
    pub catalog_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_id: "default".to_string(),
            hosting: false,
            log_level: "info".to_string(),
            sip_listen: SocketAddr::from(([0, 0, 0, 0], 5060)),
            nat_expires: 30,
            regbot_default_expires: 3600,
            regbot_min_expires: 30,
            regbot_contact_use_ip: false,
            regbot_check_interval: 60,
            regbot_max_initial_delay: 15,
            expires_interval_ms: 60_000,
            check_expires_interval_ms: 20_000,
            options_ping_interval: 60,
            public_address_udp: None,
            public_address_tcp: None,
            public_address_tls: None,
            exclude_private_addresses: true,
            redis_host: None,
            redis_port: 6379,
            catalog_file: None,
        }
    }
}

impl Config {
    /// 启动前校验，失败即终止进程
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_id.trim().is_empty() {
            return Err(ConfigError::Missing("cluster_id".into()));
        }
        if self.redis_host.as_deref().is_some_and(|h| h.trim().is_empty()) {
            return Err(ConfigError::Invalid("redis_host must not be blank".into()));
        }
        if self.nat_expires == 0 {
            return Err(ConfigError::Invalid("nat_expires must be positive".into()));
        }
        if self.regbot_min_expires <= 5 {
            return Err(ConfigError::Invalid(
                "regbot_min_expires must exceed the 5 second renewal margin".into(),
            ));
        }
        if self.regbot_min_expires > self.regbot_default_expires {
            return Err(ConfigError::Invalid(format!(
                "regbot_min_expires ({}) exceeds regbot_default_expires ({})",
                self.regbot_min_expires, self.regbot_default_expires
            )));
        }
        for (name, value) in [
            ("regbot_check_interval", self.regbot_check_interval),
            ("expires_interval_ms", self.expires_interval_ms),
            ("check_expires_interval_ms", self.check_expires_interval_ms),
            ("options_ping_interval", self.options_ping_interval),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// 共享存储连接地址；未配置 Redis 时为 None
    pub fn redis_url(&self) -> Option<String> {
        self.redis_host
            .as_ref()
            .map(|host| format!("redis://{}:{}/", host.trim(), self.redis_port))
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.cluster_id, suffix)
    }

    /// 租约 key
    pub fn regbot_key(&self) -> String {
        self.key("regbot-token")
    }

    pub fn active_fs_set(&self) -> String {
        self.key("active-fs")
    }

    pub fn active_rtp_set(&self) -> String {
        self.key("active-rtp")
    }

    pub fn blacklist_key(&self, sip_gateway_sid: &str) -> String {
        blacklist_key(&self.cluster_id, sip_gateway_sid)
    }

    pub fn lease_check_interval(&self) -> Duration {
        Duration::from_secs(self.regbot_check_interval)
    }

    /// 租约 TTL 比检查间隔多 10 秒，保证持有者在过期前有机会续约
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.regbot_check_interval + 10)
    }

    pub fn max_initial_delay(&self) -> Duration {
        Duration::from_secs(self.regbot_max_initial_delay)
    }

    pub fn heartbeat_expiry(&self) -> Duration {
        Duration::from_millis(self.expires_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.check_expires_interval_ms)
    }

    pub fn options_ping_interval(&self) -> Duration {
        Duration::from_secs(self.options_ping_interval)
    }
}

/// 网关探测失败后的黑名单标记 key
pub fn blacklist_key(cluster_id: &str, sip_gateway_sid: &str) -> String {
    format!("{}:blacklist-sip-gateway:{}", cluster_id, sip_gateway_sid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease_ttl(), Duration::from_secs(70));
        assert_eq!(config.regbot_key(), "default:regbot-token");
        assert_eq!(config.active_fs_set(), "default:active-fs");
        assert_eq!(config.blacklist_key("gw1"), "default:blacklist-sip-gateway:gw1");
        assert_eq!(config.redis_url(), None);
    }

    #[test]
    fn redis_url_from_host_and_port() {
        let config = Config::try_parse_from([
            "sbc-sip-sidecar",
            "--redis-host",
            "redis.internal",
            "--redis-port",
            "6380",
        ])
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.redis_url().as_deref(), Some("redis://redis.internal:6380/"));

        let mut config = Config::default();
        config.redis_host = Some("  ".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn parses_flags() {
        let config = Config::try_parse_from([
            "sbc-sip-sidecar",
            "--cluster-id",
            "east",
            "--hosting",
            "--nat-expires",
            "45",
            "--exclude-private-addresses",
            "false",
        ])
        .unwrap();
        assert_eq!(config.cluster_id, "east");
        assert!(config.hosting);
        assert_eq!(config.nat_expires, 45);
        assert!(!config.exclude_private_addresses);
        assert_eq!(config.active_rtp_set(), "east:active-rtp");
    }

    #[test]
    fn rejects_misconfiguration() {
        let mut config = Config::default();
        config.cluster_id = " ".into();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));

        let mut config = Config::default();
        config.regbot_min_expires = 7200;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.check_expires_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
