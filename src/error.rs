use thiserror::Error;

/// 共享键值存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store protocol error: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_timeout()
            || err.is_connection_dropped()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// 关系型目录（carrier/gateway/account）访问错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("SIP protocol error: {0}")]
    Protocol(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stack error: {0}")]
    Stack(#[from] rsipstack::Error),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::InvalidUri(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SipError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        // 与事务层默认超时保持一致
        SipError::Timeout(32_000)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    Missing(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<&str> for ConfigError {
    fn from(s: &str) -> Self {
        ConfigError::Parse(s.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// sidecar 操作的 Result 类型别名
pub type SidecarResult<T> = Result<T, SidecarError>;

/// sidecar 顶层错误类型
#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("SIP error: {0}")]
    Sip(#[from] SipError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("System error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl SidecarError {
    /// 判断错误是否可恢复（可恢复的错误只需等待下一周期重试）
    pub fn is_recoverable(&self) -> bool {
        match self {
            SidecarError::Store(_) => true,
            SidecarError::Catalog(CatalogError::Unavailable(_)) => true,
            SidecarError::Catalog(_) => false,
            SidecarError::Sip(SipError::InvalidUri(_)) => false,
            SidecarError::Sip(_) => true,
            SidecarError::Config(_) => false,
            SidecarError::Io(_) => true,
            SidecarError::Other(_) => false,
        }
    }

    /// 获取标准错误代码，用于日志分析和监控
    pub fn error_code(&self) -> &'static str {
        match self {
            SidecarError::Store(StoreError::Unavailable(_)) => "STORE_UNAVAILABLE",
            SidecarError::Store(StoreError::Protocol(_)) => "STORE_PROTOCOL_ERROR",
            SidecarError::Catalog(CatalogError::Unavailable(_)) => "CATALOG_UNAVAILABLE",
            SidecarError::Catalog(CatalogError::NotFound(_)) => "CATALOG_NOT_FOUND",
            SidecarError::Catalog(CatalogError::Decode(_)) => "CATALOG_DECODE_ERROR",
            SidecarError::Sip(SipError::Timeout(_)) => "SIP_TIMEOUT",
            SidecarError::Sip(SipError::InvalidUri(_)) => "SIP_INVALID_URI",
            SidecarError::Sip(_) => "SIP_PROTOCOL_ERROR",
            SidecarError::Config(_) => "INVALID_CONFIG",
            SidecarError::Io(_) => "SYSTEM_ERROR",
            SidecarError::Other(_) => "UNKNOWN_ERROR",
        }
    }
}

impl SidecarError {
    /// 后台循环记录失败时使用的日志级别
    pub fn severity(&self) -> tracing::Level {
        if self.is_recoverable() {
            tracing::Level::WARN
        } else {
            tracing::Level::ERROR
        }
    }

    /// 记录一次后台周期失败，附带错误代码
    pub fn report(&self, context: &str) {
        let code = self.error_code();
        if self.severity() == tracing::Level::WARN {
            tracing::warn!(code, "{} failed, retrying next cycle: {}", context, self);
        } else {
            tracing::error!(code, "{} failed: {}", context, self);
        }
    }
}

impl From<Box<dyn std::error::Error>> for SidecarError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        SidecarError::Other(err.to_string())
    }
}
