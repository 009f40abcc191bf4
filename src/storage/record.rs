//! Record types for the document-per-record backing store
//!
//! Every key occupies exactly one type partition at a time; a record is the
//! single document representing a key within its partition. The serde shapes
//! here are the at-rest format, so field names and nesting must be preserved
//! across implementations.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::stream::StreamPayload;

/// The ten type partitions a key may occupy.
///
/// A key may be alive in at most one partition at a time; every mutating
/// store checks the other nine before creating a record (wrong-type
/// detection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    String,
    Hash,
    List,
    Set,
    SortedSet,
    Stream,
    HyperLogLog,
    Bloom,
    Cuckoo,
    Digest,
}

impl Partition {
    /// All partitions, in guard-scan order.
    pub const ALL: [Partition; 10] = [
        Partition::String,
        Partition::Hash,
        Partition::List,
        Partition::Set,
        Partition::SortedSet,
        Partition::Stream,
        Partition::HyperLogLog,
        Partition::Bloom,
        Partition::Cuckoo,
        Partition::Digest,
    ];

    /// Stable name for logs and adapter namespaces (e.g. collection names).
    pub fn name(&self) -> &'static str {
        match self {
            Partition::String => "string",
            Partition::Hash => "hash",
            Partition::List => "list",
            Partition::Set => "set",
            Partition::SortedSet => "zset",
            Partition::Stream => "stream",
            Partition::HyperLogLog => "hll",
            Partition::Bloom => "bloom",
            Partition::Cuckoo => "cuckoo",
            Partition::Digest => "tdigest",
        }
    }
}

/// A sorted-set member with its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMember {
    pub member: Vec<u8>,
    pub score: f64,
}

/// Persisted Bloom filter state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomPayload {
    pub error_rate: f64,
    pub capacity: u64,
    pub hash_function_count: u32,
    pub bit_size: u64,
    /// Bit array, least-significant bit first within each byte.
    pub bits: Vec<u8>,
    pub items_inserted: u64,
}

/// One tracked item of the counting filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CuckooItem {
    /// Stable text key derived from the raw bytes (hex), unique per item.
    pub item_key: String,
    pub raw_item: Vec<u8>,
    pub count: u64,
}

/// Persisted counting-filter state. An exact multiset: each distinct item is
/// tracked with its insertion count, so no false positives can occur.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CuckooPayload {
    pub capacity: u64,
    pub items: Vec<CuckooItem>,
}

/// Persisted quantile-digest state: every observation, kept sorted. The
/// compression parameter is stored for interface compatibility but no
/// clustering is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestPayload {
    pub compression: u32,
    pub values: Vec<f64>,
}

/// Type-specific record payload. The tag doubles as the partition marker in
/// at-rest documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Payload {
    String {
        value: Vec<u8>,
    },
    Hash {
        /// `(field, value)` pairs in insertion order, fields unique.
        fields: Vec<(String, Vec<u8>)>,
    },
    List {
        items: VecDeque<Vec<u8>>,
    },
    Set {
        /// Unique members, deduplicated by exact byte equality.
        members: Vec<Vec<u8>>,
    },
    SortedSet {
        /// Kept sorted by score ascending, ties by member bytes ascending.
        entries: Vec<ScoredMember>,
    },
    Stream(StreamPayload),
    HyperLogLog {
        /// Exact set of distinct member identities observed.
        members: Vec<Vec<u8>>,
    },
    Bloom(BloomPayload),
    Cuckoo(CuckooPayload),
    Digest(DigestPayload),
}

impl Payload {
    /// The partition this payload shape belongs to.
    pub fn partition(&self) -> Partition {
        match self {
            Payload::String { .. } => Partition::String,
            Payload::Hash { .. } => Partition::Hash,
            Payload::List { .. } => Partition::List,
            Payload::Set { .. } => Partition::Set,
            Payload::SortedSet { .. } => Partition::SortedSet,
            Payload::Stream(_) => Partition::Stream,
            Payload::HyperLogLog { .. } => Partition::HyperLogLog,
            Payload::Bloom(_) => Partition::Bloom,
            Payload::Cuckoo(_) => Partition::Cuckoo,
            Payload::Digest(_) => Partition::Digest,
        }
    }
}

/// One stored document: a key within its partition, its payload, optional
/// absolute expiry, and the conditional-write version token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub key: String,
    pub payload: Payload,
    /// Absolute expiry in epoch milliseconds; `None` = no expiry. A record
    /// past this instant is logically absent even while physically present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<u64>,
    /// Monotonic per-record version, bumped on every replace. The token for
    /// `replace_if_unchanged`.
    #[serde(default)]
    pub version: u64,
}

impl Record {
    pub fn new(key: impl Into<String>, payload: Payload) -> Self {
        Record {
            key: key.into(),
            payload,
            expire_at: None,
            version: 0,
        }
    }

    pub fn with_expiry(key: impl Into<String>, payload: Payload, expire_at: Option<u64>) -> Self {
        Record {
            key: key.into(),
            payload,
            expire_at,
            version: 0,
        }
    }

    /// True iff the record has no expiry or its expiry lies after `now_ms`.
    pub fn is_alive(&self, now_ms: u64) -> bool {
        self.expire_at.map_or(true, |at| at > now_ms)
    }

    pub fn partition(&self) -> Partition {
        self.payload.partition()
    }
}
