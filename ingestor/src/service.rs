use crate::errors::{Error, Result, Store};
use crate::metrics::{
    HISTORY_WRITE_FAILURES_TOTAL, LATEST_WRITE_FAILURES_TOTAL, PROCESS_LATENCY_SECONDS,
};
use crate::model::{LatestValue, NewReading, SensorReading};
use crate::mqtt::ReadingHandler;
use crate::store::{HistoryStore, LatestValueStore};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub const DEFAULT_HISTORY_LIMIT: i64 = 100;
pub const MAX_HISTORY_LIMIT: i64 = 1000;

/// Non-positive limits fall back to the default; everything is capped at the max.
pub fn normalize_limit(limit: i64) -> i64 {
    if limit <= 0 {
        DEFAULT_HISTORY_LIMIT
    } else {
        limit.min(MAX_HISTORY_LIMIT)
    }
}

/// Wall clock that never hands out a value older than one it already returned.
#[derive(Debug, Default)]
pub struct RecordClock {
    last_nanos: AtomicI64,
}

impl RecordClock {
    pub fn now(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let previous = self.last_nanos.fetch_max(now, Ordering::AcqRel);
        Utc.timestamp_nanos(previous.max(now))
    }
}

/// Sole entry point between ingestion/query and the two stores.
///
/// History writes are durability-critical and fail the operation; latest-value
/// writes are best effort. The two writes are independent calls, so a reader
/// may briefly see a latest value that lags (or, with out-of-order delivery,
/// regresses behind) the history.
pub struct SensorDataService {
    history: Arc<dyn HistoryStore>,
    latest: Arc<dyn LatestValueStore>,
    store_timeout: Duration,
    clock: RecordClock,
}

impl SensorDataService {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        latest: Arc<dyn LatestValueStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            history,
            latest,
            store_timeout,
            clock: RecordClock::default(),
        }
    }

    pub async fn process_reading(
        &self,
        device_id: &str,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<()> {
        let start = Instant::now();
        let reading = NewReading {
            device_id: device_id.to_string(),
            value,
            observed_at,
            recorded_at: self.clock.now(),
        };

        let id = self
            .bounded(Store::History, self.history.create(&reading))
            .await
            .map_err(|e| {
                HISTORY_WRITE_FAILURES_TOTAL.inc();
                error!(
                    device_id = %device_id,
                    value,
                    observed_at = %observed_at.to_rfc3339(),
                    "Failed to save reading to history store: {}",
                    e
                );
                e
            })?;

        let latest = LatestValue::from(&reading);
        if let Err(e) = self
            .bounded(Store::LatestValue, self.latest.set(device_id, &latest))
            .await
        {
            LATEST_WRITE_FAILURES_TOTAL.inc();
            warn!(
                device_id = %device_id,
                "Failed to update latest value, cache may be stale: {}",
                e
            );
        }

        PROCESS_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        debug!(
            device_id = %device_id,
            id,
            value,
            observed_at = %observed_at.to_rfc3339(),
            "Processed sensor reading"
        );
        Ok(())
    }

    pub async fn latest_value(&self, device_id: &str) -> Result<LatestValue> {
        self.bounded(Store::LatestValue, self.latest.get(device_id))
            .await?
            .ok_or_else(|| Error::NotFound(device_id.to_string()))
    }

    /// `offset` is forwarded untouched; callers reject negative values.
    pub async fn history(
        &self,
        device_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SensorReading>> {
        let limit = normalize_limit(limit);
        self.bounded(Store::History, self.history.history(device_id, limit, offset))
            .await
    }

    pub async fn history_count(&self, device_id: &str) -> Result<i64> {
        self.bounded(Store::History, self.history.count(device_id))
            .await
    }

    async fn bounded<T, F>(&self, store: Store, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::StoreUnavailable {
                store,
                reason: format!("deadline of {:?} exceeded", self.store_timeout),
            }),
        }
    }
}

#[async_trait]
impl ReadingHandler for SensorDataService {
    async fn handle(&self, device_id: &str, value: f64, observed_at: DateTime<Utc>) -> Result<()> {
        self.process_reading(device_id, value, observed_at).await
    }
}
