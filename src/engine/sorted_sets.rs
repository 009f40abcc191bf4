//! Sorted set store
//!
//! Score-ordered collections with rank queries. The persisted entry list is
//! re-sorted after every mutation (score ascending, ties by member bytes
//! ascending), which keeps reads O(k) at single-record granularity.

use std::cmp::Ordering as CmpOrdering;

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{Partition, Payload, Record, ScoredMember};

use super::{Commit, Engine};

fn entries_of(rec: &Record) -> Result<&Vec<ScoredMember>> {
    match &rec.payload {
        Payload::SortedSet { entries } => Ok(entries),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

/// Score ascending, ties broken by member bytes ascending.
fn order(a: &ScoredMember, b: &ScoredMember) -> CmpOrdering {
    a.score
        .partial_cmp(&b.score)
        .unwrap_or(CmpOrdering::Equal)
        .then_with(|| a.member.cmp(&b.member))
}

fn reject_nan(score: f64) -> Result<()> {
    if score.is_nan() {
        return Err(EngineError::invalid("score is not a valid float"));
    }
    Ok(())
}

/// Same normalization as list ranges: negative indices from the end,
/// clamped, `None` when nothing is selected.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let resolve = |i: i64| if i < 0 { len as i64 + i } else { i };
    let from = resolve(start).max(0);
    let to = resolve(stop).min(len as i64 - 1);
    if from > to || from >= len as i64 {
        return None;
    }
    Some((from as usize, to as usize))
}

impl Engine {
    /// Upsert `(member, score)` pairs. Returns the count of newly inserted
    /// members; score-only updates do not count.
    pub async fn zadd(
        &self,
        key: &str,
        entries: &[(&[u8], f64)],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        for (_, score) in entries {
            reject_nan(*score)?;
        }
        self.guard_partition(Partition::SortedSet, key).await?;
        let applied = self
            .apply(Partition::SortedSet, key, cancel, |current, _now| {
                let mut stored = match current {
                    Some(rec) => entries_of(rec)?.clone(),
                    None => Vec::new(),
                };
                let mut inserted = 0;
                for (member, score) in entries {
                    match stored.iter_mut().find(|e| e.member == *member) {
                        Some(existing) => existing.score = *score,
                        None => {
                            stored.push(ScoredMember {
                                member: member.to_vec(),
                                score: *score,
                            });
                            inserted += 1;
                        }
                    }
                }
                stored.sort_by(order);
                match current {
                    Some(rec) => {
                        let mut updated = rec.clone();
                        updated.payload = Payload::SortedSet { entries: stored };
                        Ok(Commit::Replace(updated, inserted))
                    }
                    None => Ok(Commit::Insert(
                        Record::new(key, Payload::SortedSet { entries: stored }),
                        inserted,
                    )),
                }
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// Remove members; deletes the record once empty. Returns the count
    /// removed.
    pub async fn zrem(
        &self,
        key: &str,
        members: &[&[u8]],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.guard_partition(Partition::SortedSet, key).await?;
        let applied = self
            .apply(Partition::SortedSet, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Ok(Commit::Skip(0));
                };
                let mut stored = entries_of(rec)?.clone();
                let before = stored.len();
                stored.retain(|e| !members.iter().any(|m| *m == e.member.as_slice()));
                let removed = (before - stored.len()) as u64;
                if removed == 0 {
                    return Ok(Commit::Skip(0));
                }
                if stored.is_empty() {
                    return Ok(Commit::Delete(removed));
                }
                let mut updated = rec.clone();
                updated.payload = Payload::SortedSet { entries: stored };
                Ok(Commit::Replace(updated, removed))
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// Inclusive index range in sort order, with negative-index support.
    pub async fn zrange_by_index(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScoredMember>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::SortedSet, key).await? else {
            return Ok(Vec::new());
        };
        let entries = entries_of(&rec)?;
        match normalize_range(entries.len(), start, stop) {
            Some((from, to)) => Ok(entries[from..=to].to_vec()),
            None => Ok(Vec::new()),
        }
    }

    /// Members with `min <= score <= max`, in sort order.
    pub async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ScoredMember>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::SortedSet, key).await? else {
            return Ok(Vec::new());
        };
        Ok(entries_of(&rec)?
            .iter()
            .filter(|e| e.score >= min && e.score <= max)
            .cloned()
            .collect())
    }

    /// Zero-based position of `member` in the sort order, optionally from
    /// the high end. `None` when the key or member is absent.
    pub async fn zrank(
        &self,
        key: &str,
        member: &[u8],
        reverse: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::SortedSet, key).await? else {
            return Ok(None);
        };
        let entries = entries_of(&rec)?;
        Ok(entries
            .iter()
            .position(|e| e.member == member)
            .map(|pos| {
                if reverse {
                    (entries.len() - 1 - pos) as u64
                } else {
                    pos as u64
                }
            }))
    }

    /// Score of `member`, or `None` when absent.
    pub async fn zscore(
        &self,
        key: &str,
        member: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Option<f64>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::SortedSet, key).await? else {
            return Ok(None);
        };
        Ok(entries_of(&rec)?
            .iter()
            .find(|e| e.member == member)
            .map(|e| e.score))
    }

    /// Add `delta` to `member`'s score, creating it at `delta` when absent.
    /// Returns the new score, or `None` when the retry budget ran out.
    pub async fn zincr_by(
        &self,
        key: &str,
        member: &[u8],
        delta: f64,
        cancel: &CancellationToken,
    ) -> Result<Option<f64>> {
        reject_nan(delta)?;
        self.guard_partition(Partition::SortedSet, key).await?;
        self.apply(Partition::SortedSet, key, cancel, |current, _now| {
            let mut stored = match current {
                Some(rec) => entries_of(rec)?.clone(),
                None => Vec::new(),
            };
            let new_score = match stored.iter_mut().find(|e| e.member == member) {
                Some(existing) => {
                    existing.score += delta;
                    reject_nan(existing.score)?;
                    existing.score
                }
                None => {
                    stored.push(ScoredMember {
                        member: member.to_vec(),
                        score: delta,
                    });
                    delta
                }
            };
            stored.sort_by(order);
            match current {
                Some(rec) => {
                    let mut updated = rec.clone();
                    updated.payload = Payload::SortedSet { entries: stored };
                    Ok(Commit::Replace(updated, new_score))
                }
                None => Ok(Commit::Insert(
                    Record::new(key, Payload::SortedSet { entries: stored }),
                    new_score,
                )),
            }
        })
        .await
    }

    /// Bulk-delete members with `min <= score <= max`; deletes the record
    /// once empty. Returns the count removed.
    pub async fn zrem_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.guard_partition(Partition::SortedSet, key).await?;
        let applied = self
            .apply(Partition::SortedSet, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Ok(Commit::Skip(0));
                };
                let mut stored = entries_of(rec)?.clone();
                let before = stored.len();
                stored.retain(|e| e.score < min || e.score > max);
                let removed = (before - stored.len()) as u64;
                if removed == 0 {
                    return Ok(Commit::Skip(0));
                }
                if stored.is_empty() {
                    return Ok(Commit::Delete(removed));
                }
                let mut updated = rec.clone();
                updated.payload = Payload::SortedSet { entries: stored };
                Ok(Commit::Replace(updated, removed))
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// Member count; 0 when absent.
    pub async fn zcard(&self, key: &str, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::SortedSet, key).await? {
            Some(rec) => Ok(entries_of(&rec)?.len() as u64),
            None => Ok(0),
        }
    }

    /// Count of members with `min <= score <= max`.
    pub async fn zcount(
        &self,
        key: &str,
        min: f64,
        max: f64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        Ok(self.zrange_by_score(key, min, max, cancel).await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn members(entries: &[ScoredMember]) -> Vec<&[u8]> {
        entries.iter().map(|e| e.member.as_slice()).collect()
    }

    #[tokio::test]
    async fn test_score_order_with_byte_tiebreak() {
        let engine = Engine::in_memory();
        engine
            .zadd(
                "z",
                &[(b"m1", 5.0), (b"m2", 5.0), (b"m3", 1.0)],
                &cancel(),
            )
            .await
            .unwrap();
        let all = engine.zrange_by_index("z", 0, -1, &cancel()).await.unwrap();
        assert_eq!(members(&all), vec![b"m3".as_ref(), b"m1", b"m2"]);
    }

    #[tokio::test]
    async fn test_add_counts_only_new_members() {
        let engine = Engine::in_memory();
        assert_eq!(
            engine.zadd("z", &[(b"a", 1.0), (b"b", 2.0)], &cancel()).await.unwrap(),
            2
        );
        // Score-only update does not count.
        assert_eq!(
            engine.zadd("z", &[(b"a", 9.0), (b"c", 3.0)], &cancel()).await.unwrap(),
            1
        );
        assert_eq!(engine.zscore("z", b"a", &cancel()).await.unwrap(), Some(9.0));
    }

    #[tokio::test]
    async fn test_rank_forward_and_reverse() {
        let engine = Engine::in_memory();
        engine
            .zadd("z", &[(b"a", 1.0), (b"b", 2.0), (b"c", 3.0)], &cancel())
            .await
            .unwrap();
        assert_eq!(engine.zrank("z", b"a", false, &cancel()).await.unwrap(), Some(0));
        assert_eq!(engine.zrank("z", b"a", true, &cancel()).await.unwrap(), Some(2));
        assert_eq!(engine.zrank("z", b"x", false, &cancel()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_creates_and_resorts() {
        let engine = Engine::in_memory();
        assert_eq!(
            engine.zincr_by("z", b"a", 2.5, &cancel()).await.unwrap(),
            Some(2.5)
        );
        engine.zadd("z", &[(b"b", 1.0)], &cancel()).await.unwrap();
        engine.zincr_by("z", b"b", 5.0, &cancel()).await.unwrap();
        let all = engine.zrange_by_index("z", 0, -1, &cancel()).await.unwrap();
        assert_eq!(members(&all), vec![b"a".as_ref(), b"b"]);
    }

    #[tokio::test]
    async fn test_range_and_remove_by_score_inclusive() {
        let engine = Engine::in_memory();
        engine
            .zadd("z", &[(b"a", 1.0), (b"b", 2.0), (b"c", 3.0)], &cancel())
            .await
            .unwrap();
        let mid = engine.zrange_by_score("z", 1.0, 2.0, &cancel()).await.unwrap();
        assert_eq!(members(&mid), vec![b"a".as_ref(), b"b"]);
        assert_eq!(engine.zcount("z", 1.0, 3.0, &cancel()).await.unwrap(), 3);

        assert_eq!(
            engine.zrem_range_by_score("z", 1.0, 3.0, &cancel()).await.unwrap(),
            3
        );
        assert!(!engine.exists("z", &cancel()).await.unwrap());
    }

    #[tokio::test]
    async fn test_nan_scores_rejected() {
        let engine = Engine::in_memory();
        assert!(matches!(
            engine.zadd("z", &[(b"a", f64::NAN)], &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
