//! In-process store implementations with switchable failure, used to exercise
//! the service without Postgres or Redis.

use crate::errors::{Error, Result};
use crate::model::{LatestValue, NewReading, SensorReading};
use crate::store::{HistoryStore, LatestValueStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    rows: RwLock<Vec<SensorReading>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_count: AtomicBool,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_count(&self, fail: bool) {
        self.fail_count.store(fail, Ordering::SeqCst);
    }

    /// All stored rows in insertion order.
    pub async fn rows(&self) -> Vec<SensorReading> {
        self.rows.read().await.clone()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create(&self, reading: &NewReading) -> Result<i64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::history_unavailable("injected write failure"));
        }

        let mut rows = self.rows.write().await;
        let id = rows.len() as i64 + 1;
        rows.push(reading.clone().into_reading(id));
        Ok(id)
    }

    async fn history(
        &self,
        device_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SensorReading>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::history_unavailable("injected read failure"));
        }

        let rows = self.rows.read().await;
        let mut matching: Vec<SensorReading> = rows
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order between equal timestamps.
        matching.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));

        Ok(matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self, device_id: &str) -> Result<i64> {
        if self.fail_count.load(Ordering::SeqCst) {
            return Err(Error::history_unavailable("injected count failure"));
        }

        let rows = self.rows.read().await;
        Ok(rows.iter().filter(|r| r.device_id == device_id).count() as i64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryLatestValueStore {
    values: RwLock<HashMap<String, LatestValue>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryLatestValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `set` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }
}

#[async_trait]
impl LatestValueStore for MemoryLatestValueStore {
    async fn set(&self, device_id: &str, value: &LatestValue) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::latest_unavailable("injected write failure"));
        }

        self.values
            .write()
            .await
            .insert(device_id.to_string(), value.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, device_id: &str) -> Result<Option<LatestValue>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::latest_unavailable("injected read failure"));
        }

        Ok(self.values.read().await.get(device_id).cloned())
    }
}
