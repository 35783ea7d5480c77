//! Storage engines accepting bounded bulk writes.
//!
//! A [`StorageEngine`] takes at most [`MAX_BATCH_SIZE`] write requests per
//! call and answers with the subset it could not persist. A non-empty answer
//! is partial success, not an error; the batch writer resubmits exactly that
//! subset. Records are keyed by content ([`RideKey`]), so writing the same
//! record twice overwrites it.
//!
//! - [`MemoryStore`] - keyed in-memory map
//! - [`ClickHouseStore`] - `ReplacingMergeTree` table in ClickHouse

mod clickhouse;
mod memory;

pub use self::clickhouse::{ClickHouseConfig, ClickHouseStore, RideRow};
pub use memory::MemoryStore;

use chairlift_core::{RideKey, RideRecord};
use thiserror::Error;

/// Maximum number of requests in one bulk write.
pub const MAX_BATCH_SIZE: usize = 25;

/// One item of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub record: RideRecord,
}

impl WriteRequest {
    pub fn key(&self) -> RideKey {
        self.record.key()
    }
}

impl From<RideRecord> for WriteRequest {
    fn from(record: RideRecord) -> Self {
        Self { record }
    }
}

/// Errors raised by a storage engine call as a whole.
#[derive(Debug, Error)]
pub enum StorageError {
    /// More than [`MAX_BATCH_SIZE`] requests in one call.
    #[error("batch of {size} requests exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    /// The backend failed in a way not covered by another variant.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// ClickHouse error.
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] ::clickhouse::error::Error),
}

/// A durable store for ride records.
pub trait StorageEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Persist up to [`MAX_BATCH_SIZE`] requests.
    ///
    /// Returns the requests that were not persisted; empty means every
    /// request is durable.
    fn batch_write(&self, requests: &[WriteRequest]) -> Result<Vec<WriteRequest>, StorageError>;
}

/// Reject calls larger than [`MAX_BATCH_SIZE`].
pub fn check_batch_size(size: usize) -> Result<(), StorageError> {
    if size > MAX_BATCH_SIZE {
        return Err(StorageError::BatchTooLarge {
            size,
            max: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}
