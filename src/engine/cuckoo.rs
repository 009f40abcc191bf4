//! Counting filter store
//!
//! Interface-compatible with a counting cuckoo filter, but backed by an
//! exact multiset: each distinct item is tracked with its insertion count
//! under a stable hex key. No false positives can occur; `exists` and
//! `count` answer from the true counts.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{CuckooItem, CuckooPayload, Partition, Payload, Record};

use super::{Commit, Engine};

const DEFAULT_CAPACITY: u64 = 1024;

/// Metadata returned by [`Engine::cuckoo_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CuckooInfoReply {
    pub capacity: u64,
    /// Count of distinct tracked items.
    pub item_count: u64,
    /// Sum of all insertion counts.
    pub total_insertions: u64,
}

fn cuckoo_of(rec: &Record) -> Result<&CuckooPayload> {
    match &rec.payload {
        Payload::Cuckoo(filter) => Ok(filter),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

fn find_item<'a>(filter: &'a CuckooPayload, item_key: &str) -> Option<&'a CuckooItem> {
    filter.items.iter().find(|i| i.item_key == item_key)
}

impl Engine {
    /// Create an empty filter with an explicit capacity. An existing key is
    /// `Exists`; a zero capacity is rejected.
    pub async fn cuckoo_reserve(
        &self,
        key: &str,
        capacity: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if capacity == 0 {
            return Err(EngineError::invalid("capacity must be a positive integer"));
        }
        self.guard_partition(Partition::Cuckoo, key).await?;
        self.apply(Partition::Cuckoo, key, cancel, |current, _now| {
            if current.is_some() {
                return Err(EngineError::Exists);
            }
            let record = Record::new(
                key,
                Payload::Cuckoo(CuckooPayload {
                    capacity,
                    items: Vec::new(),
                }),
            );
            Ok(Commit::Insert(record, ()))
        })
        .await?;
        Ok(())
    }

    /// Increment an item's count, tracking it on first sight. `no_create`
    /// makes a missing key `NotFound` instead of auto-creating the filter.
    pub async fn cuckoo_add(
        &self,
        key: &str,
        item: &[u8],
        no_create: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard_partition(Partition::Cuckoo, key).await?;
        let item_key = hex::encode(item);
        self.apply(Partition::Cuckoo, key, cancel, |current, _now| {
            let mut filter = match current {
                Some(rec) => cuckoo_of(rec)?.clone(),
                None if no_create => return Err(EngineError::NotFound),
                None => CuckooPayload {
                    capacity: DEFAULT_CAPACITY,
                    items: Vec::new(),
                },
            };
            match filter.items.iter_mut().find(|i| i.item_key == item_key) {
                Some(tracked) => tracked.count += 1,
                None => filter.items.push(CuckooItem {
                    item_key: item_key.clone(),
                    raw_item: item.to_vec(),
                    count: 1,
                }),
            }
            match current {
                Some(rec) => {
                    let mut updated = rec.clone();
                    updated.payload = Payload::Cuckoo(filter);
                    Ok(Commit::Replace(updated, ()))
                }
                None => Ok(Commit::Insert(Record::new(key, Payload::Cuckoo(filter)), ())),
            }
        })
        .await?;
        Ok(())
    }

    /// Add only if the item is not yet tracked. Returns whether it was
    /// added.
    pub async fn cuckoo_add_nx(
        &self,
        key: &str,
        item: &[u8],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.guard_partition(Partition::Cuckoo, key).await?;
        let item_key = hex::encode(item);
        let applied = self
            .apply(Partition::Cuckoo, key, cancel, |current, _now| {
                let mut filter = match current {
                    Some(rec) => cuckoo_of(rec)?.clone(),
                    None => CuckooPayload {
                        capacity: DEFAULT_CAPACITY,
                        items: Vec::new(),
                    },
                };
                if find_item(&filter, &item_key).is_some() {
                    return Ok(Commit::Skip(false));
                }
                filter.items.push(CuckooItem {
                    item_key: item_key.clone(),
                    raw_item: item.to_vec(),
                    count: 1,
                });
                match current {
                    Some(rec) => {
                        let mut updated = rec.clone();
                        updated.payload = Payload::Cuckoo(filter);
                        Ok(Commit::Replace(updated, true))
                    }
                    None => Ok(Commit::Insert(Record::new(key, Payload::Cuckoo(filter)), true)),
                }
            })
            .await?;
        Ok(applied.unwrap_or(false))
    }

    /// Decrement an item's count, dropping it at zero. The filter record
    /// itself persists even with no items left. Returns whether a tracked
    /// item was decremented.
    pub async fn cuckoo_delete(
        &self,
        key: &str,
        item: &[u8],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.guard_partition(Partition::Cuckoo, key).await?;
        let item_key = hex::encode(item);
        let applied = self
            .apply(Partition::Cuckoo, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Ok(Commit::Skip(false));
                };
                let mut filter = cuckoo_of(rec)?.clone();
                let Some(tracked) = filter.items.iter_mut().find(|i| i.item_key == item_key)
                else {
                    return Ok(Commit::Skip(false));
                };
                tracked.count -= 1;
                if tracked.count == 0 {
                    filter.items.retain(|i| i.item_key != item_key);
                }
                let mut updated = rec.clone();
                updated.payload = Payload::Cuckoo(filter);
                Ok(Commit::Replace(updated, true))
            })
            .await?;
        Ok(applied.unwrap_or(false))
    }

    /// Whether the item is currently tracked with a positive count.
    pub async fn cuckoo_exists(
        &self,
        key: &str,
        item: &[u8],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(self.cuckoo_count(key, item, cancel).await? > 0)
    }

    /// Exact insertion count for the item; 0 when untracked or the key is
    /// absent.
    pub async fn cuckoo_count(
        &self,
        key: &str,
        item: &[u8],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::Cuckoo, key).await? {
            Some(rec) => Ok(find_item(cuckoo_of(&rec)?, &hex::encode(item))
                .map(|i| i.count)
                .unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Filter metadata; `NotFound` when the key is absent.
    pub async fn cuckoo_info(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<CuckooInfoReply> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::Cuckoo, key).await? else {
            return Err(EngineError::NotFound);
        };
        let filter = cuckoo_of(&rec)?;
        Ok(CuckooInfoReply {
            capacity: filter.capacity,
            item_count: filter.items.len() as u64,
            total_insertions: filter.items.iter().map(|i| i.count).sum(),
        })
    }
}
