//! List store
//!
//! Ordered, index-addressable, double-ended byte sequences. Indices may be
//! negative (counted from the end); an empty list deletes its record.

use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{Partition, Payload, Record};

use super::{Commit, Engine};

fn items_of(rec: &Record) -> Result<&VecDeque<Vec<u8>>> {
    match &rec.payload {
        Payload::List { items } => Ok(items),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

/// Resolve one possibly-negative index against `len`; out of range is `None`.
fn normalize_index(len: usize, index: i64) -> Option<usize> {
    let resolved = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    (0..len as i64).contains(&resolved).then(|| resolved as usize)
}

/// Normalize a `[start, stop]` pair into inclusive positions. Negative
/// indices count from the end; negatives beyond the head clamp to 0 and
/// stops past the tail clamp to `len - 1`. `None` means the range selects
/// nothing.
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
    /// Push values at the head or tail, creating the list when absent. Head
    /// pushes insert each value at the front in turn, so the argument order
    /// ends up reversed. Returns the resulting length.
    pub async fn list_push(
        &self,
        key: &str,
        values: &[&[u8]],
        at_left: bool,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.guard_partition(Partition::List, key).await?;
        let applied = self
            .apply(Partition::List, key, cancel, |current, _now| {
                let mut items = match current {
                    Some(rec) => items_of(rec)?.clone(),
                    None => VecDeque::new(),
                };
                for value in values {
                    if at_left {
                        items.push_front(value.to_vec());
                    } else {
                        items.push_back(value.to_vec());
                    }
                }
                let len = items.len() as u64;
                match current {
                    Some(rec) => {
                        let mut updated = rec.clone();
                        updated.payload = Payload::List { items };
                        Ok(Commit::Replace(updated, len))
                    }
                    None => Ok(Commit::Insert(Record::new(key, Payload::List { items }), len)),
                }
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// Pop from the head or tail; the record is deleted once it empties.
    pub async fn list_pop(
        &self,
        key: &str,
        at_left: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        self.guard_partition(Partition::List, key).await?;
        let applied = self
            .apply(Partition::List, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Ok(Commit::Skip(None));
                };
                let mut items = items_of(rec)?.clone();
                let popped = if at_left {
                    items.pop_front()
                } else {
                    items.pop_back()
                };
                match popped {
                    None => Ok(Commit::Skip(None)),
                    Some(value) if items.is_empty() => Ok(Commit::Delete(Some(value))),
                    Some(value) => {
                        let mut updated = rec.clone();
                        updated.payload = Payload::List { items };
                        Ok(Commit::Replace(updated, Some(value)))
                    }
                }
            })
            .await?;
        Ok(applied.unwrap_or(None))
    }

    /// Inclusive sub-range with negative-index support; invalid ranges yield
    /// an empty result.
    pub async fn list_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::List, key).await? else {
            return Ok(Vec::new());
        };
        let items = items_of(&rec)?;
        match normalize_range(items.len(), start, stop) {
            Some((from, to)) => Ok(items.iter().skip(from).take(to - from + 1).cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Element at `index`, or `None` when the key or position is absent.
    pub async fn list_index(
        &self,
        key: &str,
        index: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::List, key).await? else {
            return Ok(None);
        };
        let items = items_of(&rec)?;
        Ok(normalize_index(items.len(), index).map(|i| items[i].clone()))
    }

    /// Overwrite the element at `index`. Absent keys are `NotFound`;
    /// positions outside the list are `OutOfRange`.
    pub async fn list_set(
        &self,
        key: &str,
        index: i64,
        value: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard_partition(Partition::List, key).await?;
        let applied = self
            .apply(Partition::List, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Err(EngineError::NotFound);
                };
                let mut items = items_of(rec)?.clone();
                let Some(i) = normalize_index(items.len(), index) else {
                    return Err(EngineError::OutOfRange);
                };
                items[i] = value.to_vec();
                let mut updated = rec.clone();
                updated.payload = Payload::List { items };
                Ok(Commit::Replace(updated, ()))
            })
            .await?;
        let _ = applied;
        Ok(())
    }

    /// Keep only the inclusive `[start, stop]` range. A range that selects
    /// nothing deletes the whole record.
    pub async fn list_trim(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard_partition(Partition::List, key).await?;
        self.apply(Partition::List, key, cancel, |current, _now| {
            let Some(rec) = current else {
                return Ok(Commit::Skip(()));
            };
            let items = items_of(rec)?;
            match normalize_range(items.len(), start, stop) {
                None => Ok(Commit::Delete(())),
                Some((from, to)) => {
                    let kept: VecDeque<Vec<u8>> =
                        items.iter().skip(from).take(to - from + 1).cloned().collect();
                    let mut updated = rec.clone();
                    updated.payload = Payload::List { items: kept };
                    Ok(Commit::Replace(updated, ()))
                }
            }
        })
        .await?;
        Ok(())
    }

    /// Current list length; 0 when absent.
    pub async fn list_len(&self, key: &str, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::List, key).await? {
            Some(rec) => Ok(items_of(&rec)?.len() as u64),
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

    async fn seed(engine: &Engine, key: &str, values: &[&[u8]]) {
        engine.list_push(key, values, false, &cancel()).await.unwrap();
    }

    #[tokio::test]
    async fn test_left_push_reverses_argument_order() {
        let engine = Engine::in_memory();
        engine
            .list_push("l", &[b"a", b"b", b"c"], true, &cancel())
            .await
            .unwrap();
        let all = engine.list_range("l", 0, -1, &cancel()).await.unwrap();
        assert_eq!(all, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[tokio::test]
    async fn test_range_negative_indices_and_overrun() {
        let engine = Engine::in_memory();
        seed(&engine, "l", &[b"a", b"b", b"c", b"d"]).await;

        let tail = engine.list_range("l", -2, -1, &cancel()).await.unwrap();
        assert_eq!(tail, vec![b"c".to_vec(), b"d".to_vec()]);

        assert!(engine.list_range("l", 5, 10, &cancel()).await.unwrap().is_empty());
        assert!(engine.list_range("l", 2, 1, &cancel()).await.unwrap().is_empty());
        assert_eq!(
            engine.list_index("l", -1, &cancel()).await.unwrap(),
            Some(b"d".to_vec())
        );
        assert_eq!(engine.list_index("l", 9, &cancel()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pop_both_ends_and_record_removal() {
        let engine = Engine::in_memory();
        seed(&engine, "l", &[b"a", b"b"]).await;

        assert_eq!(
            engine.list_pop("l", true, &cancel()).await.unwrap(),
            Some(b"a".to_vec())
        );
        assert_eq!(
            engine.list_pop("l", false, &cancel()).await.unwrap(),
            Some(b"b".to_vec())
        );
        assert!(!engine.exists("l", &cancel()).await.unwrap());
        assert_eq!(engine.list_pop("l", true, &cancel()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_out_of_range_and_missing_key() {
        let engine = Engine::in_memory();
        assert_eq!(
            engine.list_set("l", 0, b"x", &cancel()).await,
            Err(EngineError::NotFound)
        );
        seed(&engine, "l", &[b"a"]).await;
        assert_eq!(
            engine.list_set("l", 3, b"x", &cancel()).await,
            Err(EngineError::OutOfRange)
        );
        engine.list_set("l", -1, b"z", &cancel()).await.unwrap();
        assert_eq!(
            engine.list_index("l", 0, &cancel()).await.unwrap(),
            Some(b"z".to_vec())
        );
    }

    #[tokio::test]
    async fn test_trim_keeps_window_and_deletes_on_invalid() {
        let engine = Engine::in_memory();
        seed(&engine, "l", &[b"a", b"b", b"c", b"d"]).await;
        engine.list_trim("l", 1, 2, &cancel()).await.unwrap();
        assert_eq!(
            engine.list_range("l", 0, -1, &cancel()).await.unwrap(),
            vec![b"b".to_vec(), b"c".to_vec()]
        );

        engine.list_trim("l", 5, 9, &cancel()).await.unwrap();
        assert!(!engine.exists("l", &cancel()).await.unwrap());
    }

    #[test]
    fn test_normalize_range_edge_cases() {
        assert_eq!(normalize_range(0, 0, -1), None);
        assert_eq!(normalize_range(4, -100, 100), Some((0, 3)));
        assert_eq!(normalize_range(4, 3, 3), Some((3, 3)));
        assert_eq!(normalize_range(4, 4, 9), None);
    }
}
