//! Hash store
//!
//! Field/value maps per key, persisted as ordered `(field, value)` pairs
//! with unique fields. The record disappears once its last field is removed.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{Partition, Payload, Record};

use super::{Commit, Engine};

fn fields_of(rec: &Record) -> Result<&Vec<(String, Vec<u8>)>> {
    match &rec.payload {
        Payload::Hash { fields } => Ok(fields),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

impl Engine {
    /// Upsert one field. Returns whether the field was newly created (as
    /// opposed to overwritten).
    pub async fn hset(
        &self,
        key: &str,
        field: &str,
        value: &[u8],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.guard_partition(Partition::Hash, key).await?;
        let applied = self
            .apply(Partition::Hash, key, cancel, |current, _now| {
                match current {
                    Some(rec) => {
                        let mut fields = fields_of(rec)?.clone();
                        let created = match fields.iter_mut().find(|(f, _)| f == field) {
                            Some((_, v)) => {
                                *v = value.to_vec();
                                false
                            }
                            None => {
                                fields.push((field.to_string(), value.to_vec()));
                                true
                            }
                        };
                        let mut updated = rec.clone();
                        updated.payload = Payload::Hash { fields };
                        Ok(Commit::Replace(updated, created))
                    }
                    None => {
                        let record = Record::new(
                            key,
                            Payload::Hash {
                                fields: vec![(field.to_string(), value.to_vec())],
                            },
                        );
                        Ok(Commit::Insert(record, true))
                    }
                }
            })
            .await?;
        Ok(applied.unwrap_or(false))
    }

    /// Fetch one field's value.
    pub async fn hget(
        &self,
        key: &str,
        field: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::Hash, key).await? {
            Some(rec) => Ok(fields_of(&rec)?
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, v)| v.clone())),
            None => Ok(None),
        }
    }

    /// All `(field, value)` pairs in insertion order; empty when the key is
    /// absent.
    pub async fn hgetall(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::Hash, key).await? {
            Some(rec) => Ok(fields_of(&rec)?.clone()),
            None => Ok(Vec::new()),
        }
    }

    /// Remove the listed fields, deleting the record once no fields remain.
    /// Returns the number of fields removed.
    pub async fn hdel(
        &self,
        key: &str,
        fields: &[&str],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.guard_partition(Partition::Hash, key).await?;
        let applied = self
            .apply(Partition::Hash, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Ok(Commit::Skip(0));
                };
                let mut remaining = fields_of(rec)?.clone();
                let before = remaining.len();
                remaining.retain(|(f, _)| !fields.contains(&f.as_str()));
                let removed = (before - remaining.len()) as u64;
                if removed == 0 {
                    return Ok(Commit::Skip(0));
                }
                if remaining.is_empty() {
                    return Ok(Commit::Delete(removed));
                }
                let mut updated = rec.clone();
                updated.payload = Payload::Hash { fields: remaining };
                Ok(Commit::Replace(updated, removed))
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }
}
