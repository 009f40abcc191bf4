//! Scalar & counter store
//!
//! String values with conditional set (NX/XX), optional TTL, and atomic
//! base-10 increment over the retry protocol.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{Partition, Payload, Record};

use super::{Commit, Engine};

/// Conditions accepted by [`Engine::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    /// Unconditional upsert.
    #[default]
    None,
    /// Succeed only when the key does not already exist (NX).
    IfNotExists,
    /// Succeed only when the key already exists (XX).
    IfExists,
}

fn value_of(rec: &Record) -> Result<&Vec<u8>> {
    match &rec.payload {
        Payload::String { value } => Ok(value),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

impl Engine {
    /// Set `key` to `value`, optionally with a lifetime, under the given
    /// condition. Returns whether the write took effect.
    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl_ms: Option<u64>,
        condition: SetCondition,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.guard_partition(Partition::String, key).await?;
        let applied = self
            .apply(Partition::String, key, cancel, |current, now| {
                let expire_at = ttl_ms.map(|ttl| now + ttl);
                let fresh = Record::with_expiry(
                    key,
                    Payload::String {
                        value: value.to_vec(),
                    },
                    expire_at,
                );
                match (condition, current) {
                    (SetCondition::IfNotExists, Some(_)) => Ok(Commit::Skip(false)),
                    (SetCondition::IfNotExists, None) => Ok(Commit::Insert(fresh, true)),
                    (SetCondition::IfExists, Some(_)) => Ok(Commit::Replace(fresh, true)),
                    (SetCondition::IfExists, None) => Ok(Commit::Skip(false)),
                    (SetCondition::None, Some(_)) => Ok(Commit::Replace(fresh, true)),
                    (SetCondition::None, None) => Ok(Commit::Insert(fresh, true)),
                }
            })
            .await?;
        Ok(applied.unwrap_or(false))
    }

    /// Fetch the value of `key`, or `None` when missing or expired.
    pub async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Option<Vec<u8>>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::String, key).await? {
            Some(rec) => Ok(Some(value_of(&rec)?.clone())),
            None => Ok(None),
        }
    }

    /// Batch fetch: one slot per requested key, `None` for misses.
    pub async fn get_many(
        &self,
        keys: &[&str],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let now = super::now_ms();
        let found = self.store().find_by_keys(Partition::String, keys).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let hit = found
                .iter()
                .find(|rec| rec.key == *key && rec.is_alive(now));
            out.push(match hit {
                Some(rec) => Some(value_of(rec)?.clone()),
                None => None,
            });
        }
        Ok(out)
    }

    /// Unconditional upsert of several key/value pairs.
    pub async fn set_many(
        &self,
        items: &[(&str, &[u8])],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        for (key, value) in items {
            self.set(key, value, None, SetCondition::None, cancel).await?;
        }
        Ok(true)
    }

    /// Add `delta` to the integer stored at `key` (absent counts as 0) and
    /// return the new value.
    ///
    /// Returns `Ok(None)` when the key is occupied by a non-scalar type or
    /// when the retry budget runs out; a non-integer current value or an
    /// overflowing addition is `InvalidArgument`.
    pub async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<i64>> {
        match self.guard_partition(Partition::String, key).await {
            Ok(()) => {}
            Err(EngineError::WrongType) => return Ok(None),
            Err(err) => return Err(err),
        }
        self.apply(Partition::String, key, cancel, |current, _now| {
            let (current_value, expire_at) = match current {
                Some(rec) => {
                    let text = std::str::from_utf8(value_of(rec)?)
                        .map_err(|_| EngineError::invalid("value is not an integer or out of range"))?;
                    let parsed = text
                        .parse::<i64>()
                        .map_err(|_| EngineError::invalid("value is not an integer or out of range"))?;
                    (parsed, rec.expire_at)
                }
                None => (0, None),
            };
            let updated = current_value
                .checked_add(delta)
                .ok_or_else(|| EngineError::invalid("increment or decrement would overflow"))?;
            let record = Record::with_expiry(
                key,
                Payload::String {
                    value: updated.to_string().into_bytes(),
                },
                expire_at,
            );
            if current.is_some() {
                Ok(Commit::Replace(record, updated))
            } else {
                Ok(Commit::Insert(record, updated))
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let engine = Engine::in_memory();
        assert!(engine
            .set("k", b"hello", None, SetCondition::None, &cancel())
            .await
            .unwrap());
        assert_eq!(
            engine.get("k", &cancel()).await.unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(engine.get("missing", &cancel()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_and_xx_conditions() {
        let engine = Engine::in_memory();
        assert!(!engine
            .set("k", b"a", None, SetCondition::IfExists, &cancel())
            .await
            .unwrap());
        assert!(engine
            .set("k", b"a", None, SetCondition::IfNotExists, &cancel())
            .await
            .unwrap());
        assert!(!engine
            .set("k", b"b", None, SetCondition::IfNotExists, &cancel())
            .await
            .unwrap());
        assert!(engine
            .set("k", b"c", None, SetCondition::IfExists, &cancel())
            .await
            .unwrap());
        assert_eq!(engine.get("k", &cancel()).await.unwrap(), Some(b"c".to_vec()));
    }

    #[tokio::test]
    async fn test_nx_succeeds_after_expiry() {
        let engine = Engine::in_memory();
        assert!(engine
            .set("k", b"a", Some(10), SetCondition::None, &cancel())
            .await
            .unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        // The expired record is reaped, so NX sees an absent key.
        assert!(engine
            .set("k", b"b", None, SetCondition::IfNotExists, &cancel())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_incr_by_from_absent_and_existing() {
        let engine = Engine::in_memory();
        assert_eq!(engine.incr_by("n", 5, &cancel()).await.unwrap(), Some(5));
        assert_eq!(engine.incr_by("n", -2, &cancel()).await.unwrap(), Some(3));
        assert_eq!(
            engine.get("n", &cancel()).await.unwrap(),
            Some(b"3".to_vec())
        );
    }

    #[tokio::test]
    async fn test_incr_by_rejects_non_integer() {
        let engine = Engine::in_memory();
        engine
            .set("k", b"abc", None, SetCondition::None, &cancel())
            .await
            .unwrap();
        assert!(matches!(
            engine.incr_by("k", 1, &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_incr_by_overflow_leaves_value_untouched() {
        let engine = Engine::in_memory();
        engine
            .set("k", b"1", None, SetCondition::None, &cancel())
            .await
            .unwrap();
        assert!(matches!(
            engine.incr_by("k", i64::MAX, &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert_eq!(engine.get("k", &cancel()).await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_incr_by_on_wrong_type_is_null() {
        let engine = Engine::in_memory();
        engine.hset("k", "f", b"v", &cancel()).await.unwrap();
        assert_eq!(engine.incr_by("k", 1, &cancel()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_many_preserves_request_order() {
        let engine = Engine::in_memory();
        engine
            .set_many(&[("a", b"1".as_ref()), ("b", b"2".as_ref())], &cancel())
            .await
            .unwrap();
        let got = engine.get_many(&["b", "missing", "a"], &cancel()).await.unwrap();
        assert_eq!(
            got,
            vec![Some(b"2".to_vec()), None, Some(b"1".to_vec())]
        );
    }
}
