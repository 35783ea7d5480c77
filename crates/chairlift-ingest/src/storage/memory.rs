//! In-memory storage engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chairlift_core::{RideKey, RideRecord};
use parking_lot::RwLock;

use super::{StorageEngine, StorageError, WriteRequest, check_batch_size};

/// Keyed map of ride records. Every write succeeds; rewriting a key replaces
/// the previous record.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RideKey, RideRecord>>,
    write_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct records stored.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn get(&self, key: &RideKey) -> Option<RideRecord> {
        self.records.read().get(key).cloned()
    }

    /// All records, ordered by key.
    pub fn records(&self) -> Vec<RideRecord> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by_key(RideRecord::key);
        records
    }

    /// Number of `batch_write` calls accepted so far.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }
}

impl StorageEngine for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn batch_write(&self, requests: &[WriteRequest]) -> Result<Vec<WriteRequest>, StorageError> {
        check_batch_size(requests.len())?;
        self.write_calls.fetch_add(1, Ordering::Relaxed);

        let mut records = self.records.write();
        for request in requests {
            records.insert(request.key(), request.record.clone());
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_event;

    fn request(skier: i32, time: i32) -> WriteRequest {
        sample_event(skier, time).to_record().into()
    }

    #[test]
    fn test_writes_are_idempotent_by_key() {
        let store = MemoryStore::new();
        let batch = vec![request(1, 10), request(2, 10)];

        assert!(store.batch_write(&batch).unwrap().is_empty());
        assert!(store.batch_write(&batch).unwrap().is_empty());

        assert_eq!(store.len(), 2);
        assert_eq!(store.write_calls(), 2);
        assert_eq!(store.get(&batch[0].key()), Some(batch[0].record.clone()));
    }

    #[test]
    fn test_rejects_oversized_batch() {
        let store = MemoryStore::new();
        let batch: Vec<_> = (1..=26).map(|skier| request(skier, 5)).collect();

        assert!(matches!(
            store.batch_write(&batch),
            Err(StorageError::BatchTooLarge { size: 26, .. })
        ));
        assert!(store.is_empty());
        assert_eq!(store.write_calls(), 0);
    }

    #[test]
    fn test_records_are_sorted_by_key() {
        let store = MemoryStore::new();
        store
            .batch_write(&[request(9, 1), request(3, 1), request(3, 0)])
            .unwrap();

        let skiers: Vec<_> = store.records().iter().map(|r| r.skier_id).collect();
        assert_eq!(skiers, vec![3, 3, 9]);
    }
}
