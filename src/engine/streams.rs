//! Stream store
//!
//! Append-only logs with composite `(ms, seq)` entry ids. Id generation is
//! monotonic per stream: wall-clock regressions are absorbed by continuing
//! the sequence under the last id's millisecond. Streams persist with zero
//! entries (groups may still point at them), so emptying one never deletes
//! the record.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result, StoreError};
use crate::storage::{Partition, Payload, Record, StreamEntry, StreamEntryId, StreamPayload};

use super::{Commit, Engine};

/// Parsed id argument of a stream append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddIdSpec {
    /// `*`: current wall-clock milliseconds, sequence auto-assigned.
    Auto,
    /// `<ms>-*`: explicit milliseconds, sequence auto-assigned.
    AutoSeq(u64),
    /// `<ms>-<seq>` (or bare `<ms>`, meaning sequence 0).
    Explicit(StreamEntryId),
}

impl AddIdSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        if spec == "*" {
            return Ok(AddIdSpec::Auto);
        }
        if let Some(ms) = spec.strip_suffix("-*") {
            let ms = ms
                .parse::<u64>()
                .map_err(|_| EngineError::invalid("Invalid stream ID specified as stream command argument"))?;
            return Ok(AddIdSpec::AutoSeq(ms));
        }
        Ok(AddIdSpec::Explicit(spec.parse()?))
    }
}

/// Trim target accepted by [`Engine::stream_trim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimStrategy {
    /// Keep at most this many newest entries.
    MaxLen(usize),
    /// Drop every entry with id strictly below this one.
    MinId(StreamEntryId),
}

/// Snapshot returned by [`Engine::stream_info`].
#[derive(Debug, Clone)]
pub struct StreamInfoReply {
    pub length: u64,
    pub last_id: StreamEntryId,
    pub group_count: u64,
    pub first_entry: Option<StreamEntry>,
    pub last_entry: Option<StreamEntry>,
}

pub(crate) fn stream_of(rec: &Record) -> Result<&StreamPayload> {
    match &rec.payload {
        Payload::Stream(stream) => Ok(stream),
        _ => Err(StoreError::Corrupt(rec.key.clone()).into()),
    }
}

/// Resolve the id for a new entry against the stream's current `last_id`.
fn next_entry_id(stream: &StreamPayload, spec: AddIdSpec, now_ms: u64) -> Result<StreamEntryId> {
    let last = stream.last_id;
    match spec {
        AddIdSpec::Auto => {
            if now_ms > last.ms {
                Ok(StreamEntryId::new(now_ms, 0))
            } else {
                // Same millisecond, or the clock went backwards: continue
                // the sequence under the last id's millisecond.
                Ok(last.next())
            }
        }
        AddIdSpec::AutoSeq(ms) => {
            if ms < last.ms {
                Err(EngineError::invalid(
                    "The ID specified in XADD is equal or smaller than the target stream top item",
                ))
            } else if ms == last.ms {
                Ok(last.next())
            } else {
                Ok(StreamEntryId::new(ms, 0))
            }
        }
        AddIdSpec::Explicit(id) => {
            if id <= last {
                Err(EngineError::invalid(
                    "The ID specified in XADD is equal or smaller than the target stream top item",
                ))
            } else {
                Ok(id)
            }
        }
    }
}

impl Engine {
    /// Append an entry, creating the stream when absent. Returns the
    /// assigned id, or `None` when the retry budget ran out.
    pub async fn stream_add(
        &self,
        key: &str,
        id_spec: &str,
        fields: &[(&str, &[u8])],
        cancel: &CancellationToken,
    ) -> Result<Option<StreamEntryId>> {
        let spec = AddIdSpec::parse(id_spec)?;
        self.guard_partition(Partition::Stream, key).await?;
        self.apply(Partition::Stream, key, cancel, |current, now| {
            let mut stream = match current {
                Some(rec) => stream_of(rec)?.clone(),
                None => StreamPayload::new(),
            };
            let id = next_entry_id(&stream, spec, now)?;
            stream.entries.push(StreamEntry {
                id,
                fields: fields
                    .iter()
                    .map(|(f, v)| (f.to_string(), v.to_vec()))
                    .collect(),
            });
            stream.last_id = id;
            match current {
                Some(rec) => {
                    let mut updated = rec.clone();
                    updated.payload = Payload::Stream(stream);
                    Ok(Commit::Replace(updated, id))
                }
                None => Ok(Commit::Insert(Record::new(key, Payload::Stream(stream)), id)),
            }
        })
        .await
    }

    /// Inclusive id-range query. `start`/`end` accept the `-`/`+` sentinels
    /// and bare-millisecond bounds.
    pub async fn stream_range(
        &self,
        key: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
        reverse: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamEntry>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let start = StreamEntryId::parse_range_start(start)?;
        let end = StreamEntryId::parse_range_end(end)?;
        match self.read_alive(Partition::Stream, key).await? {
            Some(rec) => Ok(stream_of(&rec)?.range(start, end, count, reverse)),
            None => Ok(Vec::new()),
        }
    }

    /// Entries strictly after `after`, oldest first. The non-group read
    /// path.
    pub async fn stream_read(
        &self,
        key: &str,
        after: &str,
        count: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamEntry>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let after: StreamEntryId = after.parse()?;
        match self.read_alive(Partition::Stream, key).await? {
            Some(rec) => Ok(stream_of(&rec)?.entries_after(after, count)),
            None => Ok(Vec::new()),
        }
    }

    /// Delete specific entries. Dangling pending references are pruned.
    /// Returns the number of entries removed.
    pub async fn stream_del(
        &self,
        key: &str,
        ids: &[&str],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let ids: Vec<StreamEntryId> = ids.iter().map(|s| s.parse()).collect::<Result<_>>()?;
        self.guard_partition(Partition::Stream, key).await?;
        let applied = self
            .apply(Partition::Stream, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Ok(Commit::Skip(0));
                };
                let mut stream = stream_of(rec)?.clone();
                let removed = stream.delete_entries(&ids) as u64;
                if removed == 0 {
                    return Ok(Commit::Skip(0));
                }
                let mut updated = rec.clone();
                updated.payload = Payload::Stream(stream);
                Ok(Commit::Replace(updated, removed))
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// Drop the oldest entries per the strategy; dangling pending
    /// references are pruned. Returns the number of entries removed.
    pub async fn stream_trim(
        &self,
        key: &str,
        strategy: TrimStrategy,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.guard_partition(Partition::Stream, key).await?;
        let applied = self
            .apply(Partition::Stream, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Ok(Commit::Skip(0));
                };
                let mut stream = stream_of(rec)?.clone();
                let removed = match strategy {
                    TrimStrategy::MaxLen(max) => stream.trim_to_max_len(max),
                    TrimStrategy::MinId(min) => stream.trim_to_min_id(min),
                } as u64;
                if removed == 0 {
                    return Ok(Commit::Skip(0));
                }
                let mut updated = rec.clone();
                updated.payload = Payload::Stream(stream);
                Ok(Commit::Replace(updated, removed))
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// Force the stream's `last_id`. Rejected when below the greatest
    /// existing entry id.
    pub async fn stream_set_last_id(
        &self,
        key: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id: StreamEntryId = id.parse()?;
        self.guard_partition(Partition::Stream, key).await?;
        self.apply(Partition::Stream, key, cancel, |current, _now| {
            let Some(rec) = current else {
                return Err(EngineError::NoStream);
            };
            let mut stream = stream_of(rec)?.clone();
            if let Some(max) = stream.entries.last().map(|e| e.id) {
                if id < max {
                    return Err(EngineError::invalid(
                        "The ID specified in XSETID is smaller than the target stream top item",
                    ));
                }
            }
            stream.last_id = id;
            let mut updated = rec.clone();
            updated.payload = Payload::Stream(stream);
            Ok(Commit::Replace(updated, ()))
        })
        .await?;
        Ok(())
    }

    /// Entry count; 0 when the key is absent.
    pub async fn stream_len(&self, key: &str, cancel: &CancellationToken) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::Stream, key).await? {
            Some(rec) => Ok(stream_of(&rec)?.entries.len() as u64),
            None => Ok(0),
        }
    }

    /// Highest id ever generated, or `None` when the key is absent.
    pub async fn stream_last_id(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamEntryId>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.read_alive(Partition::Stream, key).await? {
            Some(rec) => Ok(Some(stream_of(&rec)?.last_id)),
            None => Ok(None),
        }
    }

    /// Stream metadata snapshot; `NotFound` when the key is absent.
    pub async fn stream_info(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamInfoReply> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::Stream, key).await? else {
            return Err(EngineError::NotFound);
        };
        let stream = stream_of(&rec)?;
        Ok(StreamInfoReply {
            length: stream.entries.len() as u64,
            last_id: stream.last_id,
            group_count: stream.groups.len() as u64,
            first_entry: stream.entries.first().cloned(),
            last_entry: stream.entries.last().cloned(),
        })
    }
}
