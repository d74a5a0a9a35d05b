use crate::errors::{Error, Result};
use crate::metrics::DB_RETRIES_TOTAL;
use crate::model::{NewReading, SensorReading};
use crate::store::HistoryStore;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

const MAX_INSERT_ATTEMPTS: u32 = 3;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// PostgreSQL-backed history of every reading (`sensor_data` table).
#[derive(Debug, Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }

    async fn insert(&self, reading: &NewReading) -> std::result::Result<i64, sqlx::Error> {
        let query = r#"
            INSERT INTO sensor_data (device_id, value, observed_at, recorded_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#;

        sqlx::query_scalar::<_, i64>(query)
            .bind(&reading.device_id)
            .bind(reading.value)
            .bind(reading.observed_at)
            .bind(reading.recorded_at)
            .fetch_one(&self.pool)
            .await
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn create(&self, reading: &NewReading) -> Result<i64> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.insert(reading).await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    if attempts >= MAX_INSERT_ATTEMPTS || !is_transient_error(&e) {
                        error!(
                            device_id = %reading.device_id,
                            "Database insert failed permanently after {} attempts: {}",
                            attempts, e
                        );
                        return Err(Error::history_unavailable(e));
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1);
                    warn!(
                        device_id = %reading.device_id,
                        "Database insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, MAX_INSERT_ATTEMPTS, wait_ms, e
                    );
                    DB_RETRIES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
            }
        }
    }

    async fn history(
        &self,
        device_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SensorReading>> {
        let query = r#"
            SELECT id, device_id, value, observed_at, recorded_at
            FROM sensor_data
            WHERE device_id = $1
            ORDER BY observed_at DESC, id ASC
            LIMIT $2 OFFSET $3
            "#;

        sqlx::query_as::<_, SensorReading>(query)
            .bind(device_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::history_unavailable)
    }

    async fn count(&self, device_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sensor_data WHERE device_id = $1")
            .bind(device_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::history_unavailable)
    }
}

/// Connection-class failures worth another attempt.
fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
        assert!(!is_transient_error(&sqlx::Error::Protocol(
            "bad message".to_string()
        )));
    }
}
