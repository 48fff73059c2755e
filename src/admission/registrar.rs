/// 设备注册记录存储
///
/// 由外部 registrar 维护，这里只读：按 AOR 查询、按 realm 计数
use crate::store::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::warn;

const SCAN_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    /// `user@realm`
    pub aor: String,
    /// 注册来源，形如 `sip:10.0.0.1:5060`
    pub proxy: String,
    pub expiry_time: DateTime<Utc>,
    pub contact: String,
}

impl RegistrationRecord {
    pub fn realm(&self) -> &str {
        self.aor.rsplit_once('@').map(|(_, r)| r).unwrap_or("")
    }
}

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn query(&self, aor: &str) -> StoreResult<Option<RegistrationRecord>>;

    /// realm 下当前有效的注册设备数
    async fn count_of_users(&self, realm: &str) -> StoreResult<usize>;
}

/// 进程内注册记录
#[derive(Debug, Default)]
pub struct InMemoryRegistrar {
    records: RwLock<HashMap<String, RegistrationRecord>>,
}

impl InMemoryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: RegistrationRecord) {
        self.records.write().insert(record.aor.clone(), record);
    }

    pub fn remove(&self, aor: &str) -> Option<RegistrationRecord> {
        self.records.write().remove(aor)
    }
}

#[async_trait]
impl RegistrationStore for InMemoryRegistrar {
    async fn query(&self, aor: &str) -> StoreResult<Option<RegistrationRecord>> {
        let now = Utc::now();
        Ok(self
            .records
            .read()
            .get(aor)
            .filter(|r| r.expiry_time > now)
            .cloned())
    }

    async fn count_of_users(&self, realm: &str) -> StoreResult<usize> {
        let now = Utc::now();
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.expiry_time > now && r.realm().eq_ignore_ascii_case(realm))
            .count())
    }
}

/// 外部 registrar 写入 Redis 的注册记录
///
/// 每个 AOR 一个 hash `user:<aor>`，字段 `proxy`、`contact`、`expiryTime`（毫秒时间戳）
pub struct RedisRegistrar {
    conn: ConnectionManager,
}

impl RedisRegistrar {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

pub(crate) fn registration_key(aor: &str) -> String {
    format!("user:{}", aor)
}

pub(crate) fn realm_pattern(realm: &str) -> String {
    format!("user:*@{}", realm)
}

/// 从 hash 字段还原记录；缺字段或时间戳非法时返回 None
pub(crate) fn record_from_hash(
    aor: &str,
    fields: &HashMap<String, String>,
) -> Option<RegistrationRecord> {
    let millis: i64 = fields.get("expiryTime")?.trim().parse().ok()?;
    Some(RegistrationRecord {
        aor: aor.to_string(),
        proxy: fields.get("proxy")?.clone(),
        expiry_time: DateTime::from_timestamp_millis(millis)?,
        contact: fields.get("contact").cloned().unwrap_or_default(),
    })
}

#[async_trait]
impl RegistrationStore for RedisRegistrar {
    async fn query(&self, aor: &str) -> StoreResult<Option<RegistrationRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(registration_key(aor)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let Some(record) = record_from_hash(aor, &fields) else {
            warn!("ignoring malformed registration for {}: {:?}", aor, fields);
            return Ok(None);
        };
        Ok(Some(record).filter(|r| r.expiry_time > Utc::now()))
    }

    async fn count_of_users(&self, realm: &str) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let pattern = realm_pattern(realm);
        let mut cursor: u64 = 0;
        let mut count = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            count += keys.len();
            if next == 0 {
                return Ok(count);
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(aor: &str, expires_in: i64) -> RegistrationRecord {
        RegistrationRecord {
            aor: aor.to_string(),
            proxy: "sip:10.0.0.1:5060".into(),
            expiry_time: Utc::now() + Duration::seconds(expires_in),
            contact: format!("<sip:{}>", aor),
        }
    }

    #[tokio::test]
    async fn expired_records_are_invisible() {
        let registrar = InMemoryRegistrar::new();
        registrar.add(record("alice@acme.com", 300));
        registrar.add(record("bob@acme.com", -1));
        registrar.add(record("carol@other.com", 300));

        assert!(registrar.query("alice@acme.com").await.unwrap().is_some());
        assert!(registrar.query("bob@acme.com").await.unwrap().is_none());
        assert_eq!(registrar.count_of_users("acme.com").await.unwrap(), 1);
        assert_eq!(registrar.count_of_users("other.com").await.unwrap(), 1);
    }

    #[test]
    fn redis_keys_follow_registrar_layout() {
        assert_eq!(registration_key("alice@acme.com"), "user:alice@acme.com");
        assert_eq!(realm_pattern("acme.com"), "user:*@acme.com");
    }

    #[test]
    fn parses_registration_hash() {
        let mut fields = HashMap::new();
        fields.insert("proxy".to_string(), "sip:203.0.113.7:5060".to_string());
        fields.insert("contact".to_string(), "<sip:alice@192.168.1.20:5060>".to_string());
        fields.insert("expiryTime".to_string(), "1760000000000".to_string());

        let record = record_from_hash("alice@acme.com", &fields).unwrap();
        assert_eq!(record.proxy, "sip:203.0.113.7:5060");
        assert_eq!(record.realm(), "acme.com");
        assert_eq!(record.expiry_time.timestamp_millis(), 1_760_000_000_000);

        fields.insert("expiryTime".to_string(), "soon".to_string());
        assert!(record_from_hash("alice@acme.com", &fields).is_none());
        fields.remove("expiryTime");
        assert!(record_from_hash("alice@acme.com", &fields).is_none());
    }
}
