//! Stream record payload: entries, groups, and pending-entry bookkeeping
//!
//! A stream is persisted as one document holding its entries (sorted by id),
//! the last generated id, and every consumer group with its pending-entry
//! list. Pending entries reference entry ids, not the entries themselves, so
//! they are re-validated against the surviving entries after trims/deletes.

use std::cmp::Ordering as CmpOrdering;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A stream entry id: `(milliseconds, sequence)`, compared lexicographically.
///
/// Textual form is `"<ms>-<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamEntryId {
    /// The zero id `0-0`. A fresh stream's `last_id` starts here, so the
    /// smallest acceptable explicit id is `0-1`.
    pub const ZERO: StreamEntryId = StreamEntryId { ms: 0, seq: 0 };

    /// The greatest representable id, used as an open upper range bound.
    pub const MAX: StreamEntryId = StreamEntryId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        StreamEntryId { ms, seq }
    }

    /// The id immediately after this one.
    pub fn next(&self) -> StreamEntryId {
        match self.seq.checked_add(1) {
            Some(seq) => StreamEntryId { ms: self.ms, seq },
            None => StreamEntryId {
                ms: self.ms + 1,
                seq: 0,
            },
        }
    }

    /// Parse a range start bound: `-` is the open lower bound, a bare
    /// `<ms>` fills the sequence with 0.
    pub fn parse_range_start(s: &str) -> crate::error::Result<Self> {
        if s == "-" {
            return Ok(StreamEntryId::ZERO);
        }
        Self::parse_partial(s, 0)
    }

    /// Parse a range end bound: `+` is the open upper bound, a bare
    /// `<ms>` fills the sequence with the maximum.
    pub fn parse_range_end(s: &str) -> crate::error::Result<Self> {
        if s == "+" {
            return Ok(StreamEntryId::MAX);
        }
        Self::parse_partial(s, u64::MAX)
    }

    fn parse_partial(s: &str, default_seq: u64) -> crate::error::Result<Self> {
        match s.split_once('-') {
            Some((ms, seq)) => {
                let ms = ms
                    .parse::<u64>()
                    .map_err(|_| EngineError::invalid("Invalid stream ID specified as stream command argument"))?;
                let seq = seq
                    .parse::<u64>()
                    .map_err(|_| EngineError::invalid("Invalid stream ID specified as stream command argument"))?;
                Ok(StreamEntryId { ms, seq })
            }
            None => {
                let ms = s
                    .parse::<u64>()
                    .map_err(|_| EngineError::invalid("Invalid stream ID specified as stream command argument"))?;
                Ok(StreamEntryId {
                    ms,
                    seq: default_seq,
                })
            }
        }
    }
}

impl PartialOrd for StreamEntryId {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamEntryId {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.ms, self.seq).cmp(&(other.ms, other.seq))
    }
}

impl Display for StreamEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamEntryId {
    type Err = EngineError;

    /// Parse an exact `"<ms>-<seq>"` id; a bare `"<ms>"` means `<ms>-0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_partial(s, 0)
    }
}

/// A single stream entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: StreamEntryId,
    /// Field/value pairs in insertion order.
    pub fields: Vec<(String, Vec<u8>)>,
}

/// A consumer registered within a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConsumer {
    pub name: String,
    /// Epoch milliseconds of the consumer's last group-read or claim.
    pub last_seen_ms: u64,
}

/// A delivered-but-unacknowledged entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    /// Id of the referenced stream entry. A foreign key, not an ownership
    /// pointer: the entry itself may be trimmed away independently.
    pub entry_id: StreamEntryId,
    /// Consumer currently owning the delivery.
    pub consumer: String,
    /// Epoch milliseconds of the most recent delivery.
    pub last_delivery_ms: u64,
    pub delivery_count: u64,
}

/// A named cursor over the stream with per-consumer delivery state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamGroup {
    pub name: String,
    pub last_delivered_id: StreamEntryId,
    pub consumers: Vec<StreamConsumer>,
    /// Pending entries, kept sorted by entry id.
    pub pending: Vec<PendingEntry>,
}

impl StreamGroup {
    pub fn new(name: String, start_id: StreamEntryId) -> Self {
        StreamGroup {
            name,
            last_delivered_id: start_id,
            consumers: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Register `consumer` if unseen, then stamp its last-seen time.
    pub fn touch_consumer(&mut self, consumer: &str, now_ms: u64) {
        match self.consumers.iter_mut().find(|c| c.name == consumer) {
            Some(c) => c.last_seen_ms = now_ms,
            None => self.consumers.push(StreamConsumer {
                name: consumer.to_string(),
                last_seen_ms: now_ms,
            }),
        }
    }

    pub fn pending_for(&self, consumer: &str) -> usize {
        self.pending.iter().filter(|p| p.consumer == consumer).count()
    }

    /// Record a delivery: create the pending entry or bump the existing one.
    pub fn note_delivery(&mut self, id: StreamEntryId, consumer: &str, now_ms: u64) {
        match self.pending.iter_mut().find(|p| p.entry_id == id) {
            Some(p) => {
                p.consumer = consumer.to_string();
                p.last_delivery_ms = now_ms;
                p.delivery_count += 1;
            }
            None => {
                let idx = self
                    .pending
                    .partition_point(|p| p.entry_id < id);
                self.pending.insert(
                    idx,
                    PendingEntry {
                        entry_id: id,
                        consumer: consumer.to_string(),
                        last_delivery_ms: now_ms,
                        delivery_count: 1,
                    },
                );
            }
        }
    }
}

/// Persisted payload of a stream key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPayload {
    /// Entries sorted by id ascending.
    pub entries: Vec<StreamEntry>,
    /// Highest id ever generated for this stream. Survives deletion of the
    /// entries themselves.
    pub last_id: StreamEntryId,
    pub groups: Vec<StreamGroup>,
}

impl StreamPayload {
    pub fn new() -> Self {
        StreamPayload {
            entries: Vec::new(),
            last_id: StreamEntryId::ZERO,
            groups: Vec::new(),
        }
    }

    pub fn find_entry(&self, id: StreamEntryId) -> Option<&StreamEntry> {
        self.entries
            .binary_search_by(|e| e.id.cmp(&id))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Entries with id strictly greater than `after`, oldest first.
    pub fn entries_after(&self, after: StreamEntryId, count: Option<usize>) -> Vec<StreamEntry> {
        let start = self.entries.partition_point(|e| e.id <= after);
        let take = count.unwrap_or(usize::MAX);
        self.entries[start..].iter().take(take).cloned().collect()
    }

    /// Inclusive range query with optional reversal and count cap.
    pub fn range(
        &self,
        start: StreamEntryId,
        end: StreamEntryId,
        count: Option<usize>,
        reverse: bool,
    ) -> Vec<StreamEntry> {
        let lo = self.entries.partition_point(|e| e.id < start);
        let hi = self.entries.partition_point(|e| e.id <= end);
        let take = count.unwrap_or(usize::MAX);
        if reverse {
            self.entries[lo..hi].iter().rev().take(take).cloned().collect()
        } else {
            self.entries[lo..hi].iter().take(take).cloned().collect()
        }
    }

    pub fn group(&self, name: &str) -> Option<&StreamGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut StreamGroup> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    /// Drop pending entries (in every group) whose referenced entry no
    /// longer exists. Called after any trim or delete.
    pub fn prune_dangling_pending(&mut self) {
        let ids: Vec<StreamEntryId> = self.entries.iter().map(|e| e.id).collect();
        for group in &mut self.groups {
            group
                .pending
                .retain(|p| ids.binary_search(&p.entry_id).is_ok());
        }
    }

    /// Remove the oldest entries beyond `max_len`, then re-validate pending
    /// references. Returns the number of entries removed.
    pub fn trim_to_max_len(&mut self, max_len: usize) -> usize {
        if self.entries.len() <= max_len {
            return 0;
        }
        let removed = self.entries.len() - max_len;
        self.entries.drain(..removed);
        self.prune_dangling_pending();
        removed
    }

    /// Remove every entry with id strictly below `min_id`, then re-validate
    /// pending references. Returns the number of entries removed.
    pub fn trim_to_min_id(&mut self, min_id: StreamEntryId) -> usize {
        let split = self.entries.partition_point(|e| e.id < min_id);
        if split == 0 {
            return 0;
        }
        self.entries.drain(..split);
        self.prune_dangling_pending();
        split
    }

    /// Delete specific entries by id. Returns the number removed.
    pub fn delete_entries(&mut self, ids: &[StreamEntryId]) -> usize {
        let before = self.entries.len();
        let mut targets = ids.to_vec();
        targets.sort();
        targets.dedup();
        self.entries
            .retain(|e| targets.binary_search(&e.id).is_err());
        let removed = before - self.entries.len();
        if removed > 0 {
            self.prune_dangling_pending();
        }
        removed
    }
}

impl Default for StreamPayload {
    fn default() -> Self {
        Self::new()
    }
}
