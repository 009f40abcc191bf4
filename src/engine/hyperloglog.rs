//! Cardinality store
//!
//! Interface-compatible with a HyperLogLog counter, but tracking the exact
//! set of distinct member identities. Counting across several keys unions
//! the sets, so the reported cardinality is the true distinct count.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{Partition, Payload, Record};

use super::{Commit, Engine};

fn members_of(rec: &Record) -> Result<&Vec<Vec<u8>>> {
    match &rec.payload {
        Payload::HyperLogLog { members } => Ok(members),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

fn union_into(target: &mut Vec<Vec<u8>>, members: &[Vec<u8>]) -> bool {
    let mut changed = false;
    for member in members {
        if !target.iter().any(|m| m == member) {
            target.push(member.clone());
            changed = true;
        }
    }
    changed
}

impl Engine {
    /// Observe members, creating the counter when absent. True when at
    /// least one member was new.
    pub async fn pf_add(
        &self,
        key: &str,
        members: &[&[u8]],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.guard_partition(Partition::HyperLogLog, key).await?;
        let applied = self
            .apply(Partition::HyperLogLog, key, cancel, |current, _now| {
                let mut stored = match current {
                    Some(rec) => members_of(rec)?.clone(),
                    None => Vec::new(),
                };
                let owned: Vec<Vec<u8>> = members.iter().map(|m| m.to_vec()).collect();
                let changed = union_into(&mut stored, &owned);
                match current {
                    Some(_) if !changed => Ok(Commit::Skip(false)),
                    Some(rec) => {
                        let mut updated = rec.clone();
                        updated.payload = Payload::HyperLogLog { members: stored };
                        Ok(Commit::Replace(updated, true))
                    }
                    None => Ok(Commit::Insert(
                        Record::new(key, Payload::HyperLogLog { members: stored }),
                        changed,
                    )),
                }
            })
            .await?;
        Ok(applied.unwrap_or(false))
    }

    /// Distinct count of the union across `keys`; absent keys contribute
    /// nothing.
    pub async fn pf_count(&self, keys: &[&str], cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut union: Vec<Vec<u8>> = Vec::new();
        for key in keys {
            if let Some(rec) = self.read_alive(Partition::HyperLogLog, key).await? {
                union_into(&mut union, members_of(&rec)?);
            }
        }
        Ok(union.len() as u64)
    }

    /// Union the source counters into `destination`, creating it when
    /// absent. Sources are read before the destination commit, so a source
    /// mutated mid-merge may or may not be reflected.
    pub async fn pf_merge(
        &self,
        destination: &str,
        sources: &[&str],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut incoming: Vec<Vec<u8>> = Vec::new();
        for source in sources {
            if let Some(rec) = self.read_alive(Partition::HyperLogLog, source).await? {
                union_into(&mut incoming, members_of(&rec)?);
            }
        }
        self.guard_partition(Partition::HyperLogLog, destination).await?;
        self.apply(Partition::HyperLogLog, destination, cancel, |current, _now| {
            let mut stored = match current {
                Some(rec) => members_of(rec)?.clone(),
                None => Vec::new(),
            };
            let changed = union_into(&mut stored, &incoming);
            match current {
                Some(_) if !changed => Ok(Commit::Skip(())),
                Some(rec) => {
                    let mut updated = rec.clone();
                    updated.payload = Payload::HyperLogLog { members: stored };
                    Ok(Commit::Replace(updated, ()))
                }
                None => Ok(Commit::Insert(
                    Record::new(destination, Payload::HyperLogLog { members: stored }),
                    (),
                )),
            }
        })
        .await?;
        Ok(())
    }
}
