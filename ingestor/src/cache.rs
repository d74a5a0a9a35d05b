use crate::errors::{Error, Result};
use crate::model::LatestValue;
use crate::store::LatestValueStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

/// Redis-backed latest value per device, stored as JSON under
/// `device:<id>:latest` with no expiry.
#[derive(Clone)]
pub struct RedisLatestValueStore {
    conn: ConnectionManager,
}

impl RedisLatestValueStore {
    pub async fn connect(addr: &str, password: Option<&str>, db: i64) -> Result<Self> {
        let url = redis_url(addr, password, db);
        info!("Connecting to Redis at {}/{}", addr, db);

        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;

        info!("Redis connection established");
        Ok(Self { conn })
    }
}

#[async_trait]
impl LatestValueStore for RedisLatestValueStore {
    async fn set(&self, device_id: &str, value: &LatestValue) -> Result<()> {
        let data = encode(value)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key(device_id), data)
            .await
            .map_err(Error::latest_unavailable)
    }

    async fn get(&self, device_id: &str) -> Result<Option<LatestValue>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .get(key(device_id))
            .await
            .map_err(Error::latest_unavailable)?;

        data.map(|raw| decode(&raw)).transpose()
    }
}

fn key(device_id: &str) -> String {
    format!("device:{}:latest", device_id)
}

fn redis_url(addr: &str, password: Option<&str>, db: i64) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(password) => format!(
            "redis://:{}@{}/{}",
            urlencoding::encode(password),
            addr,
            db
        ),
        None => format!("redis://{}/{}", addr, db),
    }
}

fn encode(value: &LatestValue) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode(raw: &str) -> Result<LatestValue> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_key_uses_raw_device_id() {
        assert_eq!(key("sensor-1"), "device:sensor-1:latest");
        assert_eq!(key(" Sensor-1"), "device: Sensor-1:latest");
    }

    #[test]
    fn test_redis_url() {
        assert_eq!(redis_url("localhost:6379", None, 0), "redis://localhost:6379/0");
        assert_eq!(
            redis_url("cache:6380", Some(""), 2),
            "redis://cache:6380/2"
        );
        assert_eq!(
            redis_url("cache:6379", Some("p@ss word"), 1),
            "redis://:p%40ss%20word@cache:6379/1"
        );
    }

    #[test]
    fn test_encoding_preserves_value_bits_and_time() {
        let observed_at = Utc
            .with_ymd_and_hms(2024, 5, 17, 8, 15, 30)
            .unwrap()
            + chrono::Duration::nanoseconds(123_456_789);

        for value in [21.5, 0.1 + 0.2, -1.0e-300, f64::MAX, 1.0 / 3.0] {
            let latest = LatestValue {
                device_id: "sensor-1".to_string(),
                value,
                observed_at,
            };
            let back = decode(&encode(&latest).unwrap()).unwrap();
            assert_eq!(back.value.to_bits(), value.to_bits());
            assert_eq!(back.observed_at, observed_at);
        }
    }
}
