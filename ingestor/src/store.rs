use crate::errors::Result;
use crate::model::{LatestValue, NewReading, SensorReading};
use async_trait::async_trait;

/// Durable, queryable record of every reading.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persists a reading and returns the id assigned to it.
    async fn create(&self, reading: &NewReading) -> Result<i64>;

    /// Readings for `device_id`, newest `observed_at` first.
    async fn history(&self, device_id: &str, limit: i64, offset: i64)
        -> Result<Vec<SensorReading>>;

    async fn count(&self, device_id: &str) -> Result<i64>;
}

/// Volatile key-value slot holding one value per device.
#[async_trait]
pub trait LatestValueStore: Send + Sync {
    async fn set(&self, device_id: &str, value: &LatestValue) -> Result<()>;

    /// `Ok(None)` when nothing was ever written for the device.
    async fn get(&self, device_id: &str) -> Result<Option<LatestValue>>;
}
