//! Set store
//!
//! Unordered unique-member collections, deduplicated by exact byte equality.
//! The record disappears when its last member is removed.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{Partition, Payload, Record};

use super::{Commit, Engine};

fn members_of(rec: &Record) -> Result<&Vec<Vec<u8>>> {
    match &rec.payload {
        Payload::Set { members } => Ok(members),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

impl Engine {
    /// Add members, creating the set on first add. Returns how many were
    /// newly added (duplicates in the input count once).
    pub async fn set_add(
        &self,
        key: &str,
        members: &[&[u8]],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.guard_partition(Partition::Set, key).await?;
        let applied = self
            .apply(Partition::Set, key, cancel, |current, _now| {
                let mut stored = match current {
                    Some(rec) => members_of(rec)?.clone(),
                    None => Vec::new(),
                };
                let mut added = 0;
                for member in members {
                    if !stored.iter().any(|m| m == member) {
                        stored.push(member.to_vec());
                        added += 1;
                    }
                }
                if added == 0 {
                    return Ok(Commit::Skip(0));
                }
                match current {
                    Some(rec) => {
                        let mut updated = rec.clone();
                        updated.payload = Payload::Set { members: stored };
                        Ok(Commit::Replace(updated, added))
                    }
                    None => Ok(Commit::Insert(
                        Record::new(key, Payload::Set { members: stored }),
                        added,
                    )),
                }
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// Remove members; deletes the record once empty. Returns how many were
    /// actually removed.
    pub async fn set_remove(
        &self,
        key: &str,
        members: &[&[u8]],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.guard_partition(Partition::Set, key).await?;
        let applied = self
            .apply(Partition::Set, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Ok(Commit::Skip(0));
                };
                let mut stored = members_of(rec)?.clone();
                let before = stored.len();
                stored.retain(|m| !members.iter().any(|target| *target == m.as_slice()));
                let removed = (before - stored.len()) as u64;
                if removed == 0 {
                    return Ok(Commit::Skip(0));
                }
                if stored.is_empty() {
                    return Ok(Commit::Delete(removed));
                }
                let mut updated = rec.clone();
                updated.payload = Payload::Set { members: stored };
                Ok(Commit::Replace(updated, removed))
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// All members; empty when the key is absent.
    pub async fn set_members(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::Set, key).await? {
            Some(rec) => Ok(members_of(&rec)?.clone()),
            None => Ok(Vec::new()),
        }
    }

    /// Member count; 0 when the key is absent.
    pub async fn set_cardinality(&self, key: &str, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::Set, key).await? {
            Some(rec) => Ok(members_of(&rec)?.len() as u64),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_add_dedups_by_byte_identity() {
        let engine = Engine::in_memory();
        let added = engine
            .set_add("s", &[b"a", b"b", b"a"], &cancel())
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(engine.set_add("s", &[b"b"], &cancel()).await.unwrap(), 0);
        assert_eq!(engine.set_cardinality("s", &cancel()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove_counts_and_deletes_empty_record() {
        let engine = Engine::in_memory();
        engine.set_add("s", &[b"a", b"b"], &cancel()).await.unwrap();

        assert_eq!(
            engine.set_remove("s", &[b"a", b"x"], &cancel()).await.unwrap(),
            1
        );
        assert_eq!(engine.set_remove("s", &[b"b"], &cancel()).await.unwrap(), 1);
        assert!(!engine.exists("s", &cancel()).await.unwrap());
        assert!(engine.set_members("s", &cancel()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type_guard() {
        let engine = Engine::in_memory();
        engine.list_push("k", &[b"v"], false, &cancel()).await.unwrap();
        assert_eq!(
            engine.set_add("k", &[b"a"], &cancel()).await,
            Err(EngineError::WrongType)
        );
    }
}
