//! Engine core for Oxidis
//!
//! Hosts the per-type stores (one submodule each), the cross-partition type
//! guard, key lifecycle (expiry, TTL introspection, sweeps), and the
//! optimistic retry protocol every compound mutation runs through.

pub mod bloom;
pub mod cuckoo;
pub mod digest;
pub mod groups;
pub mod hashes;
pub mod hyperloglog;
pub mod lists;
pub mod sets;
pub mod sorted_sets;
pub mod streams;
pub mod strings;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::storage::{InsertOutcome, MemoryRecordStore, Partition, Record, RecordStore};

/// Maximum conditional-write attempts per operation. Exhausting the budget
/// yields the operation's "no effect" result, never an error.
pub const WRITE_RETRY_BUDGET: u32 = 5;

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// The write (or non-write) an operation decided on after reading the
/// current record.
pub(crate) enum Commit<T> {
    /// Nothing to persist; the result is final.
    Skip(T),
    /// First creation: insert with uniqueness rejection.
    Insert(Record, T),
    /// Replace conditioned on the version that was read.
    Replace(Record, T),
    /// Remove the record outright.
    Delete(T),
}

/// The multi-type data-structure engine.
///
/// One instance per logical key space. Operations are independently
/// schedulable async units; concurrent writers to the same key serialize
/// through the conflict-and-retry protocol, not locks.
pub struct Engine {
    store: Arc<dyn RecordStore>,
}

impl Engine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Engine { store }
    }

    /// Engine over the in-memory reference store. Intended for tests and
    /// embedded use.
    pub fn in_memory() -> Self {
        Engine::new(Arc::new(MemoryRecordStore::new()))
    }

    pub(crate) fn store(&self) -> &dyn RecordStore {
        &*self.store
    }

    // --- Lazy expiry -----------------------------------------------------

    /// Point read filtered through the liveness rule. A physically present
    /// but expired record is reaped and reported absent.
    pub(crate) async fn read_alive(
        &self,
        partition: Partition,
        key: &str,
    ) -> Result<Option<Record>> {
        let now = now_ms();
        match self.store.find_by_key(partition, key).await? {
            Some(rec) if rec.is_alive(now) => Ok(Some(rec)),
            Some(_) => {
                trace!(partition = partition.name(), key, "reaping expired record");
                self.store.delete_by_key(partition, key).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // --- Type guard ------------------------------------------------------

    /// Wrong-type detection: fail if `key` is alive in any partition other
    /// than `own`. Expired strays found on the way are reaped.
    pub(crate) async fn guard_partition(&self, own: Partition, key: &str) -> Result<()> {
        for partition in Partition::ALL {
            if partition == own {
                continue;
            }
            if self.read_alive(partition, key).await?.is_some() {
                return Err(EngineError::WrongType);
            }
        }
        Ok(())
    }

    // --- Optimistic retry protocol ---------------------------------------

    /// Read-compute-conditionally-write loop.
    ///
    /// `compute` sees the current alive record (or its absence) and the
    /// current time, and decides the [`Commit`]. Conflicts re-enter the loop
    /// up to [`WRITE_RETRY_BUDGET`] times; exhaustion returns `Ok(None)` so
    /// the caller can report its "no effect" result. The cancellation token
    /// is honored between attempts.
    pub(crate) async fn apply<T>(
        &self,
        partition: Partition,
        key: &str,
        cancel: &CancellationToken,
        mut compute: impl FnMut(Option<&Record>, u64) -> Result<Commit<T>>,
    ) -> Result<Option<T>> {
        for attempt in 0..WRITE_RETRY_BUDGET {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let now = now_ms();
            let current = self.read_alive(partition, key).await?;

            match compute(current.as_ref(), now)? {
                Commit::Skip(value) => return Ok(Some(value)),
                Commit::Insert(mut record, value) => {
                    record.version = 1;
                    match self.store.insert_unique(partition, record).await? {
                        InsertOutcome::Inserted => return Ok(Some(value)),
                        InsertOutcome::AlreadyExists => {
                            trace!(
                                partition = partition.name(),
                                key,
                                attempt,
                                "insert raced an existing record, retrying"
                            );
                        }
                    }
                }
                Commit::Replace(mut record, value) => {
                    let Some(base) = current.as_ref() else {
                        // The record vanished between read and compute
                        // bookkeeping; treat as a conflict.
                        continue;
                    };
                    let expected = base.version;
                    record.version = expected + 1;
                    if self
                        .store
                        .replace_if_unchanged(partition, expected, record)
                        .await?
                    {
                        return Ok(Some(value));
                    }
                    trace!(
                        partition = partition.name(),
                        key,
                        attempt,
                        "conditional replace lost a race, retrying"
                    );
                }
                Commit::Delete(value) => {
                    self.store.delete_by_key(partition, key).await?;
                    return Ok(Some(value));
                }
            }
        }
        debug!(
            partition = partition.name(),
            key, "retry budget exhausted, surfacing no-effect result"
        );
        Ok(None)
    }

    // --- Key lifecycle ---------------------------------------------------

    /// Find the partition currently holding `key`, if any.
    pub(crate) async fn find_anywhere(&self, key: &str) -> Result<Option<(Partition, Record)>> {
        for partition in Partition::ALL {
            if let Some(rec) = self.read_alive(partition, key).await? {
                return Ok(Some((partition, rec)));
            }
        }
        Ok(None)
    }

    /// Delete keys from whichever partitions hold them. Returns the number
    /// of distinct keys that were alive before deletion.
    pub async fn delete(&self, keys: &[&str], cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        // Dedup so a key listed twice counts (and deletes) once.
        let mut unique: Vec<&str> = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(key) {
                unique.push(key);
            }
        }
        let alive = self.exists_many(&unique, cancel).await?;
        for partition in Partition::ALL {
            self.store.delete_by_keys(partition, &unique).await?;
        }
        Ok(alive)
    }

    /// Whether `key` is alive in any partition.
    pub async fn exists(&self, key: &str, cancel: &CancellationToken) -> Result<bool> {
        Ok(self.exists_many(&[key], cancel).await? > 0)
    }

    /// Count how many of `keys` are alive. A key alive in some partition
    /// counts once; the type-exclusivity invariant rules out double counts.
    pub async fn exists_many(&self, keys: &[&str], cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let now = now_ms();
        let counts = try_join_all(
            Partition::ALL
                .iter()
                .map(|&p| self.store.count_alive(p, keys, now)),
        )
        .await?;
        Ok(counts.into_iter().sum())
    }

    /// Set or clear a key's lifetime, in milliseconds.
    ///
    /// `ttl_ms <= 0` deletes the key from whichever partition holds it;
    /// `ttl_ms > 0` stamps `expire_at = now + ttl_ms` on the first alive
    /// match. Returns whether an alive record was affected.
    pub async fn pexpire(&self, key: &str, ttl_ms: i64, cancel: &CancellationToken) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if ttl_ms <= 0 {
            let existed = self.find_anywhere(key).await?.is_some();
            for partition in Partition::ALL {
                self.store.delete_by_key(partition, key).await?;
            }
            return Ok(existed);
        }
        let Some((partition, _)) = self.find_anywhere(key).await? else {
            return Ok(false);
        };
        let applied = self
            .apply(partition, key, cancel, |current, now| {
                let Some(rec) = current else {
                    return Ok(Commit::Skip(false));
                };
                let mut updated = rec.clone();
                updated.expire_at = Some(now + ttl_ms as u64);
                Ok(Commit::Replace(updated, true))
            })
            .await?;
        Ok(applied.unwrap_or(false))
    }

    /// Second-granularity variant of [`Engine::pexpire`].
    pub async fn expire(&self, key: &str, ttl_secs: i64, cancel: &CancellationToken) -> Result<bool> {
        self.pexpire(key, ttl_secs.saturating_mul(1000), cancel).await
    }

    /// Milliseconds remaining before expiry: `-1` when the key has no
    /// expiry, `-2` when absent or expired (expired records are reaped as a
    /// side effect).
    pub async fn pttl(&self, key: &str, cancel: &CancellationToken) -> Result<i64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.find_anywhere(key).await? {
            Some((_, rec)) => match rec.expire_at {
                Some(at) => Ok(at.saturating_sub(now_ms()) as i64),
                None => Ok(-1),
            },
            None => Ok(-2),
        }
    }

    /// Seconds remaining before expiry (rounded up), with the same `-1`/`-2`
    /// sentinels as [`Engine::pttl`].
    pub async fn ttl(&self, key: &str, cancel: &CancellationToken) -> Result<i64> {
        match self.pttl(key, cancel).await? {
            ms if ms < 0 => Ok(ms),
            ms => Ok((ms + 999) / 1000),
        }
    }

    /// Sweep every partition, physically deleting records past expiry.
    /// Returns the number reclaimed.
    pub async fn cleanup_expired_keys(&self, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let now = now_ms();
        let counts = try_join_all(
            Partition::ALL
                .iter()
                .map(|&p| self.store.delete_where_expired(p, now)),
        )
        .await?;
        let reclaimed: u64 = counts.into_iter().sum();
        if reclaimed > 0 {
            debug!(reclaimed, "expiry sweep reclaimed records");
        }
        Ok(reclaimed)
    }

    /// Run [`Engine::cleanup_expired_keys`] on a fixed period until `cancel`
    /// fires. Intended to be spawned alongside the engine as its active
    /// expiration cycle; lazy reaping still covers keys touched between
    /// ticks. Returns the total records reclaimed over the run.
    pub async fn run_expiry_sweeper(
        &self,
        period: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reclaimed = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(reclaimed),
                _ = ticker.tick() => match self.cleanup_expired_keys(cancel).await {
                    Ok(swept) => reclaimed += swept,
                    Err(EngineError::Cancelled) => return Ok(reclaimed),
                    Err(err) => return Err(err),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Payload;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_guard_rejects_cross_partition_key() {
        let engine = Engine::in_memory();
        engine
            .store()
            .insert_unique(
                Partition::Hash,
                Record::new("k", Payload::Hash { fields: vec![("f".into(), b"v".to_vec())] }),
            )
            .await
            .unwrap();

        assert!(engine.guard_partition(Partition::Hash, "k").await.is_ok());
        assert_eq!(
            engine.guard_partition(Partition::List, "k").await,
            Err(EngineError::WrongType)
        );
    }

    #[tokio::test]
    async fn test_guard_ignores_expired_strays() {
        let engine = Engine::in_memory();
        let mut rec = Record::new("k", Payload::String { value: b"v".to_vec() });
        rec.expire_at = Some(1); // long past
        engine
            .store()
            .insert_unique(Partition::String, rec)
            .await
            .unwrap();

        assert!(engine.guard_partition(Partition::List, "k").await.is_ok());
        // The stray was reaped on the way through.
        assert!(engine
            .store()
            .find_by_key(Partition::String, "k")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_pexpire_deletes_on_nonpositive_ttl() {
        let engine = Engine::in_memory();
        engine
            .store()
            .insert_unique(
                Partition::String,
                Record::new("k", Payload::String { value: b"v".to_vec() }),
            )
            .await
            .unwrap();

        assert!(engine.pexpire("k", 0, &cancel()).await.unwrap());
        assert!(!engine.exists("k", &cancel()).await.unwrap());
        // Idempotent on the second round.
        assert!(!engine.pexpire("k", -5, &cancel()).await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_sentinels() {
        let engine = Engine::in_memory();
        assert_eq!(engine.pttl("missing", &cancel()).await.unwrap(), -2);

        engine
            .store()
            .insert_unique(
                Partition::String,
                Record::new("k", Payload::String { value: b"v".to_vec() }),
            )
            .await
            .unwrap();
        assert_eq!(engine.pttl("k", &cancel()).await.unwrap(), -1);

        assert!(engine.pexpire("k", 60_000, &cancel()).await.unwrap());
        let remaining = engine.pttl("k", &cancel()).await.unwrap();
        assert!(remaining > 0 && remaining <= 60_000);
        let secs = engine.ttl("k", &cancel()).await.unwrap();
        assert!(secs >= 1 && secs <= 60);
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_any_effect() {
        let engine = Engine::in_memory();
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            engine.delete(&["k"], &token).await,
            Err(EngineError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_delete_counts_duplicate_keys_once() {
        let engine = Engine::in_memory();
        engine
            .store()
            .insert_unique(
                Partition::String,
                Record::new("k", Payload::String { value: b"v".to_vec() }),
            )
            .await
            .unwrap();

        assert_eq!(
            engine.delete(&["k", "k", "missing"], &cancel()).await.unwrap(),
            1
        );
        assert!(!engine.exists("k", &cancel()).await.unwrap());
    }

    #[tokio::test]
    async fn test_periodic_sweeper_runs_until_cancelled() {
        let engine = Engine::in_memory();
        let mut rec = Record::new("k", Payload::String { value: b"v".to_vec() });
        rec.expire_at = Some(1); // long past
        engine.store().insert_unique(Partition::String, rec).await.unwrap();

        let token = CancellationToken::new();
        let stop = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });

        let reclaimed = engine
            .run_expiry_sweeper(Duration::from_millis(5), &token)
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);
        assert!(!engine.exists("k", &cancel()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_all_partitions() {
        let engine = Engine::in_memory();
        let mut a = Record::new("a", Payload::String { value: b"v".to_vec() });
        a.expire_at = Some(1);
        let mut b = Record::new("b", Payload::Set { members: vec![b"m".to_vec()] });
        b.expire_at = Some(1);
        engine.store().insert_unique(Partition::String, a).await.unwrap();
        engine.store().insert_unique(Partition::Set, b).await.unwrap();

        assert_eq!(engine.cleanup_expired_keys(&cancel()).await.unwrap(), 2);
        assert_eq!(engine.cleanup_expired_keys(&cancel()).await.unwrap(), 0);
    }
}
