use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted measurement as read back from the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub id: i64,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// A reading about to be written; the history store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub device_id: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl NewReading {
    pub fn into_reading(self, id: i64) -> SensorReading {
        SensorReading {
            id,
            device_id: self.device_id,
            value: self.value,
            observed_at: self.observed_at,
            recorded_at: self.recorded_at,
        }
    }
}

/// Most recent value per device, overwritten in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestValue {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

impl From<&NewReading> for LatestValue {
    fn from(reading: &NewReading) -> Self {
        Self {
            device_id: reading.device_id.clone(),
            value: reading.value,
            observed_at: reading.observed_at,
        }
    }
}

/// REST API response wrapper for history queries
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub data: Vec<SensorReading>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
