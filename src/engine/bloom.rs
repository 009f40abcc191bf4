//! Bloom filter store
//!
//! Classic fixed-size Bloom filter: a bit array sized from the requested
//! capacity and error rate, with double hashing over a Sha-256 digest. No
//! false negatives; false positives at roughly the configured rate once the
//! filter reaches capacity.

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{BloomPayload, Partition, Payload, Record};

use super::{Commit, Engine};

const DEFAULT_ERROR_RATE: f64 = 0.01;
const DEFAULT_CAPACITY: u64 = 1000;

/// Metadata returned by [`Engine::bloom_info`].
#[derive(Debug, Clone, PartialEq)]
pub struct BloomInfoReply {
    pub capacity: u64,
    pub error_rate: f64,
    pub bit_size: u64,
    pub hash_function_count: u32,
    pub items_inserted: u64,
}

fn bloom_of(rec: &Record) -> Result<&BloomPayload> {
    match &rec.payload {
        Payload::Bloom(bloom) => Ok(bloom),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

/// Bit-array size for `capacity` items at `error_rate`, floored at 64 bits.
fn optimal_bit_size(capacity: u64, error_rate: f64) -> u64 {
    let ln2 = std::f64::consts::LN_2;
    let m = -(capacity as f64) * error_rate.ln() / (ln2 * ln2);
    (m.ceil() as u64).max(64)
}

/// Hash-function count for `bit_size` bits over `capacity` items.
fn optimal_hash_count(bit_size: u64, capacity: u64) -> u32 {
    let k = (bit_size as f64 / capacity as f64) * std::f64::consts::LN_2;
    (k.round() as u32).max(1)
}

fn new_filter(error_rate: f64, capacity: u64) -> BloomPayload {
    let bit_size = optimal_bit_size(capacity, error_rate);
    BloomPayload {
        error_rate,
        capacity,
        hash_function_count: optimal_hash_count(bit_size, capacity),
        bit_size,
        bits: vec![0u8; ((bit_size + 7) / 8) as usize],
        items_inserted: 0,
    }
}

/// Two independent 64-bit hash lanes from one Sha-256 digest. The second
/// lane is forced non-zero so the double-hash probe sequence never
/// degenerates to a single position.
fn hash_lanes(item: &[u8]) -> (u64, u64) {
    let digest = Sha256::digest(item);
    let mut h1 = [0u8; 8];
    let mut h2 = [0u8; 8];
    h1.copy_from_slice(&digest[0..8]);
    h2.copy_from_slice(&digest[8..16]);
    let h1 = u64::from_le_bytes(h1);
    let mut h2 = u64::from_le_bytes(h2);
    if h2 == 0 {
        h2 = 0x9e37_79b9_7f4a_7c15;
    }
    (h1, h2)
}

fn bit_positions(item: &[u8], filter: &BloomPayload) -> Vec<u64> {
    let (h1, h2) = hash_lanes(item);
    (0..filter.hash_function_count as u64)
        .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % filter.bit_size)
        .collect()
}

fn test_bit(bits: &[u8], position: u64) -> bool {
    bits[(position / 8) as usize] & (1 << (position % 8)) != 0
}

fn set_bit(bits: &mut [u8], position: u64) {
    bits[(position / 8) as usize] |= 1 << (position % 8);
}

/// Set every probe bit for `item`; true when at least one was previously
/// clear (the item was certainly absent before).
fn insert_item(filter: &mut BloomPayload, item: &[u8]) -> bool {
    let mut newly_set = false;
    for position in bit_positions(item, filter) {
        if !test_bit(&filter.bits, position) {
            set_bit(&mut filter.bits, position);
            newly_set = true;
        }
    }
    if newly_set {
        filter.items_inserted += 1;
    }
    newly_set
}

fn contains_item(filter: &BloomPayload, item: &[u8]) -> bool {
    bit_positions(item, filter)
        .into_iter()
        .all(|position| test_bit(&filter.bits, position))
}

impl Engine {
    /// Create an empty filter with explicit parameters. An existing key is
    /// `Exists`; a rate outside `(0, 1)` or a zero capacity is rejected.
    pub async fn bloom_reserve(
        &self,
        key: &str,
        error_rate: f64,
        capacity: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !(error_rate > 0.0 && error_rate < 1.0) {
            return Err(EngineError::invalid("(0 < error rate range < 1)"));
        }
        if capacity == 0 {
            return Err(EngineError::invalid("capacity must be a positive integer"));
        }
        self.guard_partition(Partition::Bloom, key).await?;
        self.apply(Partition::Bloom, key, cancel, |current, _now| {
            if current.is_some() {
                return Err(EngineError::Exists);
            }
            let record = Record::new(key, Payload::Bloom(new_filter(error_rate, capacity)));
            Ok(Commit::Insert(record, ()))
        })
        .await?;
        Ok(())
    }

    /// Add one item, creating the filter with default parameters when the
    /// key is absent. True when the item was certainly not present before.
    pub async fn bloom_add(
        &self,
        key: &str,
        item: &[u8],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let added = self.bloom_madd(key, &[item], cancel).await?;
        Ok(added.first().copied().unwrap_or(false))
    }

    /// Add several items in one commit; per-item results as in
    /// [`Engine::bloom_add`].
    pub async fn bloom_madd(
        &self,
        key: &str,
        items: &[&[u8]],
        cancel: &CancellationToken,
    ) -> Result<Vec<bool>> {
        self.guard_partition(Partition::Bloom, key).await?;
        let applied = self
            .apply(Partition::Bloom, key, cancel, |current, _now| {
                let mut filter = match current {
                    Some(rec) => bloom_of(rec)?.clone(),
                    None => new_filter(DEFAULT_ERROR_RATE, DEFAULT_CAPACITY),
                };
                let results: Vec<bool> =
                    items.iter().map(|item| insert_item(&mut filter, item)).collect();
                match current {
                    Some(rec) => {
                        if !results.iter().any(|&r| r) {
                            return Ok(Commit::Skip(results));
                        }
                        let mut updated = rec.clone();
                        updated.payload = Payload::Bloom(filter);
                        Ok(Commit::Replace(updated, results))
                    }
                    None => Ok(Commit::Insert(
                        Record::new(key, Payload::Bloom(filter)),
                        results,
                    )),
                }
            })
            .await?;
        Ok(applied.unwrap_or_else(|| vec![false; items.len()]))
    }

    /// Membership probe: false means certainly absent.
    pub async fn bloom_exists(
        &self,
        key: &str,
        item: &[u8],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let found = self.bloom_mexists(key, &[item], cancel).await?;
        Ok(found.first().copied().unwrap_or(false))
    }

    /// Probe several items. An absent key is created with default
    /// parameters and reports every item absent.
    pub async fn bloom_mexists(
        &self,
        key: &str,
        items: &[&[u8]],
        cancel: &CancellationToken,
    ) -> Result<Vec<bool>> {
        self.guard_partition(Partition::Bloom, key).await?;
        let applied = self
            .apply(Partition::Bloom, key, cancel, |current, _now| match current {
                Some(rec) => {
                    let filter = bloom_of(rec)?;
                    Ok(Commit::Skip(
                        items.iter().map(|item| contains_item(filter, item)).collect(),
                    ))
                }
                None => {
                    let filter = new_filter(DEFAULT_ERROR_RATE, DEFAULT_CAPACITY);
                    Ok(Commit::Insert(
                        Record::new(key, Payload::Bloom(filter)),
                        vec![false; items.len()],
                    ))
                }
            })
            .await?;
        Ok(applied.unwrap_or_else(|| vec![false; items.len()]))
    }

    /// Filter metadata; `NotFound` when the key is absent.
    pub async fn bloom_info(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<BloomInfoReply> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::Bloom, key).await? else {
            return Err(EngineError::NotFound);
        };
        let filter = bloom_of(&rec)?;
        Ok(BloomInfoReply {
            capacity: filter.capacity,
            error_rate: filter.error_rate,
            bit_size: filter.bit_size,
            hash_function_count: filter.hash_function_count,
            items_inserted: filter.items_inserted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn test_sizing_floors() {
        // Tiny capacity still gets a usable filter.
        assert!(optimal_bit_size(1, 0.5) >= 64);
        assert!(optimal_hash_count(64, 1000) >= 1);
        // Standard parameters land near the textbook values.
        let m = optimal_bit_size(1000, 0.01);
        assert!((9500..10000).contains(&m));
        assert_eq!(optimal_hash_count(m, 1000), 7);
    }

    #[test]
    fn test_second_hash_lane_is_never_zero() {
        let (_, h2) = hash_lanes(b"anything");
        assert_ne!(h2, 0);
    }

    #[tokio::test]
    async fn test_no_false_negatives() {
        let engine = Engine::in_memory();
        let items: Vec<Vec<u8>> = (0..200).map(|i| format!("item-{i}").into_bytes()).collect();
        for item in &items {
            engine.bloom_add("bf", item, &cancel()).await.unwrap();
        }
        for item in &items {
            assert!(engine.bloom_exists("bf", item, &cancel()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_add_reports_first_insertion_only() {
        let engine = Engine::in_memory();
        assert!(engine.bloom_add("bf", b"a", &cancel()).await.unwrap());
        assert!(!engine.bloom_add("bf", b"a", &cancel()).await.unwrap());

        let results = engine
            .bloom_madd("bf", &[b"a", b"b", b"b"], &cancel())
            .await
            .unwrap();
        assert_eq!(results, vec![false, true, false]);
    }

    #[tokio::test]
    async fn test_reserve_validation_and_exists() {
        let engine = Engine::in_memory();
        assert!(matches!(
            engine.bloom_reserve("bf", 0.0, 100, &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.bloom_reserve("bf", 1.5, 100, &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.bloom_reserve("bf", 0.01, 0, &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));

        engine.bloom_reserve("bf", 0.001, 5000, &cancel()).await.unwrap();
        assert_eq!(
            engine.bloom_reserve("bf", 0.01, 100, &cancel()).await,
            Err(EngineError::Exists)
        );

        let info = engine.bloom_info("bf", &cancel()).await.unwrap();
        assert_eq!(info.capacity, 5000);
        assert_eq!(info.items_inserted, 0);
        assert!(info.bit_size >= 64);
        assert!(info.hash_function_count >= 1);
    }

    #[tokio::test]
    async fn test_auto_create_uses_defaults() {
        let engine = Engine::in_memory();
        engine.bloom_add("bf", b"x", &cancel()).await.unwrap();
        let info = engine.bloom_info("bf", &cancel()).await.unwrap();
        assert_eq!(info.capacity, DEFAULT_CAPACITY);
        assert_eq!(info.error_rate, DEFAULT_ERROR_RATE);
        assert_eq!(info.items_inserted, 1);
    }

    #[tokio::test]
    async fn test_missing_key_probe_creates_default_filter() {
        let engine = Engine::in_memory();
        assert_eq!(
            engine.bloom_info("bf", &cancel()).await,
            Err(EngineError::NotFound)
        );
        assert_eq!(
            engine
                .bloom_mexists("bf", &[b"x", b"y"], &cancel())
                .await
                .unwrap(),
            vec![false, false]
        );
        // The probe created the filter with default parameters.
        let info = engine.bloom_info("bf", &cancel()).await.unwrap();
        assert_eq!(info.capacity, DEFAULT_CAPACITY);
        assert_eq!(info.items_inserted, 0);
    }
}
