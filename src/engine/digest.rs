//! Quantile digest store
//!
//! Interface-compatible with a t-digest, but keeping every observation in a
//! sorted array. The compression parameter is stored and reported, no
//! clustering is applied, so every quantile answer is exact.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{DigestPayload, Partition, Payload, Record};

use super::{Commit, Engine};

/// Metadata returned by [`Engine::digest_info`].
#[derive(Debug, Clone, PartialEq)]
pub struct DigestInfoReply {
    pub compression: u32,
    pub observation_count: u64,
}

fn digest_of(rec: &Record) -> Result<&DigestPayload> {
    match &rec.payload {
        Payload::Digest(digest) => Ok(digest),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

/// Exact quantile by linear interpolation between neighboring order
/// statistics at position `q * (n - 1)`. Empty input yields NaN.
fn quantile_of(values: &[f64], q: f64) -> f64 {
    let n = values.len();
    if n == 0 {
        return f64::NAN;
    }
    if q <= 0.0 {
        return values[0];
    }
    if q >= 1.0 {
        return values[n - 1];
    }
    let position = q * (n - 1) as f64;
    let lower = position.floor() as usize;
    let fraction = position - lower as f64;
    if lower + 1 >= n {
        values[n - 1]
    } else {
        values[lower] + (values[lower + 1] - values[lower]) * fraction
    }
}

impl Engine {
    /// Create an empty digest. An existing key is `Exists`; a zero
    /// compression is rejected.
    pub async fn digest_create(
        &self,
        key: &str,
        compression: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if compression == 0 {
            return Err(EngineError::invalid("compression must be a positive integer"));
        }
        self.guard_partition(Partition::Digest, key).await?;
        self.apply(Partition::Digest, key, cancel, |current, _now| {
            if current.is_some() {
                return Err(EngineError::Exists);
            }
            let record = Record::new(
                key,
                Payload::Digest(DigestPayload {
                    compression,
                    values: Vec::new(),
                }),
            );
            Ok(Commit::Insert(record, ()))
        })
        .await?;
        Ok(())
    }

    /// Insert observations into an existing digest. A missing key is
    /// `NotFound`; NaN observations are rejected before any mutation.
    pub async fn digest_add(
        &self,
        key: &str,
        observations: &[f64],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if observations.iter().any(|v| v.is_nan()) {
            return Err(EngineError::invalid("observation is not a valid float"));
        }
        self.guard_partition(Partition::Digest, key).await?;
        self.apply(Partition::Digest, key, cancel, |current, _now| {
            let Some(rec) = current else {
                return Err(EngineError::NotFound);
            };
            let mut digest = digest_of(rec)?.clone();
            for &v in observations {
                let idx = digest.values.partition_point(|&existing| existing < v);
                digest.values.insert(idx, v);
            }
            let mut updated = rec.clone();
            updated.payload = Payload::Digest(digest);
            Ok(Commit::Replace(updated, ()))
        })
        .await?;
        Ok(())
    }

    /// Exact quantile; NaN when the digest is empty.
    pub async fn digest_quantile(
        &self,
        key: &str,
        q: f64,
        cancel: &CancellationToken,
    ) -> Result<f64> {
        let digest = self.read_digest(key, cancel).await?;
        Ok(quantile_of(&digest.values, q))
    }

    /// Fraction of observations `<= v`; NaN when the digest is empty.
    pub async fn digest_cdf(&self, key: &str, v: f64, cancel: &CancellationToken) -> Result<f64> {
        let digest = self.read_digest(key, cancel).await?;
        let n = digest.values.len();
        if n == 0 {
            return Ok(f64::NAN);
        }
        let below_or_equal = digest.values.partition_point(|&x| x <= v);
        Ok(below_or_equal as f64 / n as f64)
    }

    /// Zero-based ascending rank: how many observations are strictly below
    /// `v`. `NotFound` when the digest is empty.
    pub async fn digest_rank(
        &self,
        key: &str,
        v: f64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let digest = self.read_digest(key, cancel).await?;
        if digest.values.is_empty() {
            return Err(EngineError::NotFound);
        }
        Ok(digest.values.partition_point(|&x| x < v) as u64)
    }

    /// Zero-based descending rank: how many observations are strictly above
    /// `v`. `NotFound` when the digest is empty.
    pub async fn digest_rev_rank(
        &self,
        key: &str,
        v: f64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let digest = self.read_digest(key, cancel).await?;
        let n = digest.values.len();
        if n == 0 {
            return Err(EngineError::NotFound);
        }
        Ok((n - digest.values.partition_point(|&x| x <= v)) as u64)
    }

    /// Observation at ascending rank `r`; NaN when `r` is out of range,
    /// `NotFound` when the digest is empty.
    pub async fn digest_by_rank(
        &self,
        key: &str,
        r: u64,
        cancel: &CancellationToken,
    ) -> Result<f64> {
        let digest = self.read_digest(key, cancel).await?;
        if digest.values.is_empty() {
            return Err(EngineError::NotFound);
        }
        Ok(digest
            .values
            .get(r as usize)
            .copied()
            .unwrap_or(f64::NAN))
    }

    /// Observation at descending rank `r`; NaN when `r` is out of range,
    /// `NotFound` when the digest is empty.
    pub async fn digest_by_rev_rank(
        &self,
        key: &str,
        r: u64,
        cancel: &CancellationToken,
    ) -> Result<f64> {
        let digest = self.read_digest(key, cancel).await?;
        let n = digest.values.len();
        if n == 0 {
            return Err(EngineError::NotFound);
        }
        if (r as usize) >= n {
            return Ok(f64::NAN);
        }
        Ok(digest.values[n - 1 - r as usize])
    }

    /// Mean of the observations in the inclusive index window
    /// `[ceil(lo * (n-1)), floor(hi * (n-1))]`. Bounds outside
    /// `0 <= lo <= hi <= 1` are rejected; an empty digest yields NaN.
    pub async fn digest_trimmed_mean(
        &self,
        key: &str,
        lo: f64,
        hi: f64,
        cancel: &CancellationToken,
    ) -> Result<f64> {
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
            return Err(EngineError::invalid("cut fractions must satisfy 0 <= low <= high <= 1"));
        }
        let digest = self.read_digest(key, cancel).await?;
        let n = digest.values.len();
        if n == 0 {
            return Ok(f64::NAN);
        }
        let from = (lo * (n - 1) as f64).ceil() as usize;
        let to = (hi * (n - 1) as f64).floor() as usize;
        if from > to {
            return Ok(f64::NAN);
        }
        let window = &digest.values[from..=to];
        Ok(window.iter().sum::<f64>() / window.len() as f64)
    }

    /// Smallest observation; `NotFound` when the digest is empty.
    pub async fn digest_min(&self, key: &str, cancel: &CancellationToken) -> Result<f64> {
        let digest = self.read_digest(key, cancel).await?;
        digest.values.first().copied().ok_or(EngineError::NotFound)
    }

    /// Greatest observation; `NotFound` when the digest is empty.
    pub async fn digest_max(&self, key: &str, cancel: &CancellationToken) -> Result<f64> {
        let digest = self.read_digest(key, cancel).await?;
        digest.values.last().copied().ok_or(EngineError::NotFound)
    }

    /// Clear all observations, keeping the digest itself.
    pub async fn digest_reset(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        self.guard_partition(Partition::Digest, key).await?;
        self.apply(Partition::Digest, key, cancel, |current, _now| {
            let Some(rec) = current else {
                return Err(EngineError::NotFound);
            };
            let mut digest = digest_of(rec)?.clone();
            if digest.values.is_empty() {
                return Ok(Commit::Skip(()));
            }
            digest.values.clear();
            let mut updated = rec.clone();
            updated.payload = Payload::Digest(digest);
            Ok(Commit::Replace(updated, ()))
        })
        .await?;
        Ok(())
    }

    /// Digest metadata; `NotFound` when the key is absent.
    pub async fn digest_info(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<DigestInfoReply> {
        let digest = self.read_digest(key, cancel).await?;
        Ok(DigestInfoReply {
            compression: digest.compression,
            observation_count: digest.values.len() as u64,
        })
    }

    async fn read_digest(&self, key: &str, cancel: &CancellationToken) -> Result<DigestPayload> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::Digest, key).await? else {
            return Err(EngineError::NotFound);
        };
        Ok(digest_of(&rec)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    async fn seed(engine: &Engine, key: &str, values: &[f64]) {
        engine.digest_create(key, 100, &cancel()).await.unwrap();
        engine.digest_add(key, values, &cancel()).await.unwrap();
    }

    #[test]
    fn test_quantile_interpolation() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(quantile_of(&values, -1.0), 10.0);
        assert_eq!(quantile_of(&values, 0.0), 10.0);
        assert_eq!(quantile_of(&values, 1.0), 40.0);
        assert_eq!(quantile_of(&values, 2.0), 40.0);
        assert_eq!(quantile_of(&values, 0.5), 25.0);
        assert!((quantile_of(&values, 0.25) - 17.5).abs() < 1e-9);
        assert!(quantile_of(&[], 0.5).is_nan());
    }

    #[tokio::test]
    async fn test_create_add_and_ordering() {
        let engine = Engine::in_memory();
        seed(&engine, "d", &[5.0, 1.0, 3.0]).await;
        engine.digest_add("d", &[2.0], &cancel()).await.unwrap();

        assert_eq!(engine.digest_min("d", &cancel()).await.unwrap(), 1.0);
        assert_eq!(engine.digest_max("d", &cancel()).await.unwrap(), 5.0);
        assert_eq!(engine.digest_by_rank("d", 1, &cancel()).await.unwrap(), 2.0);
        assert_eq!(
            engine.digest_by_rev_rank("d", 0, &cancel()).await.unwrap(),
            5.0
        );
    }

    #[tokio::test]
    async fn test_add_requires_existing_digest_and_rejects_nan() {
        let engine = Engine::in_memory();
        assert_eq!(
            engine.digest_add("d", &[1.0], &cancel()).await,
            Err(EngineError::NotFound)
        );
        engine.digest_create("d", 100, &cancel()).await.unwrap();
        assert!(matches!(
            engine.digest_add("d", &[1.0, f64::NAN], &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));
        // The rejected batch left nothing behind.
        let info = engine.digest_info("d", &cancel()).await.unwrap();
        assert_eq!(info.observation_count, 0);
    }

    #[tokio::test]
    async fn test_cdf_and_ranks() {
        let engine = Engine::in_memory();
        seed(&engine, "d", &[1.0, 2.0, 2.0, 4.0]).await;

        assert_eq!(engine.digest_cdf("d", 2.0, &cancel()).await.unwrap(), 0.75);
        assert_eq!(engine.digest_cdf("d", 0.5, &cancel()).await.unwrap(), 0.0);
        assert_eq!(engine.digest_cdf("d", 9.0, &cancel()).await.unwrap(), 1.0);

        assert_eq!(engine.digest_rank("d", 2.0, &cancel()).await.unwrap(), 1);
        assert_eq!(engine.digest_rank("d", 5.0, &cancel()).await.unwrap(), 4);
        assert_eq!(engine.digest_rev_rank("d", 2.0, &cancel()).await.unwrap(), 1);
        assert_eq!(engine.digest_rev_rank("d", 0.0, &cancel()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_empty_digest_results() {
        let engine = Engine::in_memory();
        engine.digest_create("d", 100, &cancel()).await.unwrap();

        assert!(engine.digest_quantile("d", 0.5, &cancel()).await.unwrap().is_nan());
        assert!(engine.digest_cdf("d", 1.0, &cancel()).await.unwrap().is_nan());
        assert_eq!(
            engine.digest_rank("d", 1.0, &cancel()).await,
            Err(EngineError::NotFound)
        );
        assert_eq!(
            engine.digest_by_rank("d", 0, &cancel()).await,
            Err(EngineError::NotFound)
        );
        assert_eq!(
            engine.digest_min("d", &cancel()).await,
            Err(EngineError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_trimmed_mean_window() {
        let engine = Engine::in_memory();
        seed(&engine, "d", &[1.0, 2.0, 3.0, 4.0, 100.0]).await;

        // [ceil(0.1 * 4), floor(0.9 * 4)] = [1, 3] -> mean of 2, 3, 4.
        assert_eq!(
            engine
                .digest_trimmed_mean("d", 0.1, 0.9, &cancel())
                .await
                .unwrap(),
            3.0
        );
        assert!(matches!(
            engine.digest_trimmed_mean("d", 0.9, 0.1, &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.digest_trimmed_mean("d", -0.1, 0.5, &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_keeps_digest() {
        let engine = Engine::in_memory();
        seed(&engine, "d", &[1.0, 2.0]).await;
        engine.digest_reset("d", &cancel()).await.unwrap();

        let info = engine.digest_info("d", &cancel()).await.unwrap();
        assert_eq!(info.compression, 100);
        assert_eq!(info.observation_count, 0);
        assert!(engine.exists("d", &cancel()).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_create_and_validation() {
        let engine = Engine::in_memory();
        assert!(matches!(
            engine.digest_create("d", 0, &cancel()).await,
            Err(EngineError::InvalidArgument(_))
        ));
        engine.digest_create("d", 50, &cancel()).await.unwrap();
        assert_eq!(
            engine.digest_create("d", 50, &cancel()).await,
            Err(EngineError::Exists)
        );
    }
}
