//! Record store adapter trait
//!
//! The engine's only view of the backing store. Adapters provide point
//! operations on single records plus two conditional writes: unique insert
//! and version-checked replace. No multi-record transactions exist; the
//! engine layers its optimistic retry protocol on top of these primitives.

use async_trait::async_trait;

use crate::error::StoreError;

use super::record::{Partition, Record};

/// Outcome of [`RecordStore::insert_unique`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same key already exists in the partition. Not an
    /// error: creation races resolve by treating rejection as "already
    /// exists" and re-reading.
    AlreadyExists,
}

/// Storage adapter for one logical key space, partitioned by type.
///
/// Implementations must guarantee key uniqueness within each partition and
/// honor the conditional-write semantics exactly; the engine's concurrency
/// model depends on them. Expired records may be returned by reads — the
/// engine applies the liveness filter itself.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Point lookup by key within a partition.
    async fn find_by_key(
        &self,
        partition: Partition,
        key: &str,
    ) -> Result<Option<Record>, StoreError>;

    /// Batch lookup; absent keys yield no record (order not guaranteed).
    async fn find_by_keys(
        &self,
        partition: Partition,
        keys: &[&str],
    ) -> Result<Vec<Record>, StoreError>;

    /// Insert a record, rejecting it if the key already exists in the
    /// partition.
    async fn insert_unique(
        &self,
        partition: Partition,
        record: Record,
    ) -> Result<InsertOutcome, StoreError>;

    /// Replace the record for `record.key` only if its current version is
    /// `expected_version`. Returns whether a matching record was replaced.
    async fn replace_if_unchanged(
        &self,
        partition: Partition,
        expected_version: u64,
        record: Record,
    ) -> Result<bool, StoreError>;

    /// Delete by key. Returns whether a record was removed.
    async fn delete_by_key(&self, partition: Partition, key: &str) -> Result<bool, StoreError>;

    /// Delete several keys; returns the number of records removed.
    async fn delete_by_keys(&self, partition: Partition, keys: &[&str])
        -> Result<u64, StoreError>;

    /// Count how many of `keys` are alive (present and unexpired) at
    /// `now_ms`.
    async fn count_alive(
        &self,
        partition: Partition,
        keys: &[&str],
        now_ms: u64,
    ) -> Result<u64, StoreError>;

    /// Delete every record in the partition whose expiry lies at or before
    /// `now_ms`. Returns the number reclaimed.
    async fn delete_where_expired(
        &self,
        partition: Partition,
        now_ms: u64,
    ) -> Result<u64, StoreError>;
}
