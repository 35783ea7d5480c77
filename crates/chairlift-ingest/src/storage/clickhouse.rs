//! ClickHouse storage engine.
//!
//! Rides land in a `ReplacingMergeTree` table ordered by
//! `(skier_id, season_day_time)`, so a redelivered event collapses onto the
//! row written the first time.
//!
//! The engine is driven from flush worker threads, which are plain std
//! threads; inserts run on a tokio runtime through its [`Handle`].
//! `batch_write` must therefore not be called from inside an async task.
//!
//! An insert is all-or-nothing: when it fails every request in the call is
//! reported unprocessed and the batch writer resubmits the lot.

use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use chairlift_core::RideRecord;

use super::{StorageEngine, StorageError, WriteRequest, check_batch_size};

/// Configuration for the ClickHouse store.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// ClickHouse server URL (e.g., "http://localhost:8123")
    pub url: String,

    /// Database name
    pub database: String,

    /// Table name for rides
    pub table: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "chairlift".to_string(),
            table: "lift_rides".to_string(),
        }
    }
}

/// Row structure matching the lift rides table.
#[derive(Debug, Clone, PartialEq, Eq, Row, Serialize, Deserialize)]
pub struct RideRow {
    pub skier_id: i32,
    pub season_day_time: String,
    pub resort_id: i32,
    pub lift_id: i32,
    pub time: i32,
    pub vertical_gain: i32,
    pub resort_season_day: String,
}

impl From<&RideRecord> for RideRow {
    fn from(record: &RideRecord) -> Self {
        Self {
            skier_id: record.skier_id,
            season_day_time: record.season_day_time.clone(),
            resort_id: record.resort_id,
            lift_id: record.lift_id,
            time: record.time,
            vertical_gain: record.vertical_gain,
            resort_season_day: record.resort_season_day.clone(),
        }
    }
}

/// Storage engine writing rides to ClickHouse.
pub struct ClickHouseStore {
    client: Client,
    config: ClickHouseConfig,
    runtime: Handle,
}

impl ClickHouseStore {
    /// Create a store that runs its inserts on `runtime`.
    pub fn new(config: ClickHouseConfig, runtime: Handle) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        tracing::info!(
            "ClickHouse store initialized: url={}, database={}, table={}",
            config.url,
            config.database,
            config.table
        );

        Self {
            client,
            config,
            runtime,
        }
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    /// Create the rides table if it doesn't exist.
    pub async fn ensure_table(&self) -> Result<(), StorageError> {
        self.client.query(&self.create_table_sql()).execute().await?;
        tracing::info!("ClickHouse table ready: {}", self.config.table);
        Ok(())
    }

    /// Check that the server answers queries.
    pub async fn health_check(&self) -> Result<(), StorageError> {
        self.client.query("SELECT 1").fetch_one::<u8>().await?;
        Ok(())
    }

    /// Number of stored rides, after merging duplicates.
    pub async fn ride_count(&self) -> Result<u64, StorageError> {
        let sql = format!("SELECT count() FROM {} FINAL", self.config.table);
        Ok(self.client.query(&sql).fetch_one::<u64>().await?)
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                skier_id Int32,
                season_day_time String,
                resort_id Int32,
                lift_id Int32,
                time Int32,
                vertical_gain Int32,
                resort_season_day String
            )
            ENGINE = ReplacingMergeTree
            ORDER BY (skier_id, season_day_time)",
            self.config.table
        )
    }

    async fn insert_rows(&self, requests: &[WriteRequest]) -> Result<(), StorageError> {
        let mut insert = self.client.insert::<RideRow>(&self.config.table)?;
        for request in requests {
            insert.write(&RideRow::from(&request.record)).await?;
        }
        insert.end().await?;
        Ok(())
    }
}

impl StorageEngine for ClickHouseStore {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn batch_write(&self, requests: &[WriteRequest]) -> Result<Vec<WriteRequest>, StorageError> {
        check_batch_size(requests.len())?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        match self.runtime.block_on(self.insert_rows(requests)) {
            Ok(()) => Ok(Vec::new()),
            Err(e) => {
                tracing::warn!(
                    table = %self.config.table,
                    rows = requests.len(),
                    error = %e,
                    "ClickHouse insert failed, reporting batch unprocessed"
                );
                Ok(requests.to_vec())
            }
        }
    }
}
