//! In-memory [`RecordStore`] backed by [`DashMap`]
//!
//! The reference adapter: used by the test suite and by embedded callers
//! that do not need durability. DashMap's per-shard locking makes the two
//! conditional writes atomic without external coordination.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StoreError;

use super::adapter::{InsertOutcome, RecordStore};
use super::record::{Partition, Record};

/// Concurrent in-memory record store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<(Partition, String), Record>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        MemoryRecordStore {
            records: DashMap::new(),
        }
    }

    /// Total records physically present, expired ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_by_key(
        &self,
        partition: Partition,
        key: &str,
    ) -> Result<Option<Record>, StoreError> {
        Ok(self
            .records
            .get(&(partition, key.to_string()))
            .map(|r| r.clone()))
    }

    async fn find_by_keys(
        &self,
        partition: Partition,
        keys: &[&str],
    ) -> Result<Vec<Record>, StoreError> {
        Ok(keys
            .iter()
            .filter_map(|key| {
                self.records
                    .get(&(partition, key.to_string()))
                    .map(|r| r.clone())
            })
            .collect())
    }

    async fn insert_unique(
        &self,
        partition: Partition,
        record: Record,
    ) -> Result<InsertOutcome, StoreError> {
        match self.records.entry((partition, record.key.clone())) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn replace_if_unchanged(
        &self,
        partition: Partition,
        expected_version: u64,
        record: Record,
    ) -> Result<bool, StoreError> {
        match self.records.entry((partition, record.key.clone())) {
            Entry::Occupied(mut slot) if slot.get().version == expected_version => {
                slot.insert(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_key(&self, partition: Partition, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.remove(&(partition, key.to_string())).is_some())
    }

    async fn delete_by_keys(
        &self,
        partition: Partition,
        keys: &[&str],
    ) -> Result<u64, StoreError> {
        let mut removed = 0;
        for key in keys {
            if self.records.remove(&(partition, key.to_string())).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn count_alive(
        &self,
        partition: Partition,
        keys: &[&str],
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        Ok(keys
            .iter()
            .filter(|key| {
                self.records
                    .get(&(partition, key.to_string()))
                    .map_or(false, |r| r.is_alive(now_ms))
            })
            .count() as u64)
    }

    async fn delete_where_expired(
        &self,
        partition: Partition,
        now_ms: u64,
    ) -> Result<u64, StoreError> {
        let expired: Vec<(Partition, String)> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == partition && !entry.value().is_alive(now_ms))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for key in expired {
            if self.records.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
