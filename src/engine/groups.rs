//! Consumer groups
//!
//! Each group is a named cursor over one stream plus a pending-entry list
//! (delivered but unacknowledged ids). Group state lives inside the stream's
//! record, so every mutation here goes through the same optimistic commit
//! path as entry appends.

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::storage::{Partition, Payload, Record, StreamEntry, StreamEntryId, StreamGroup, StreamPayload};

use super::streams::stream_of;
use super::{Commit, Engine};

/// Aggregate view of a group's pending list.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSummary {
    pub count: u64,
    pub min_id: Option<StreamEntryId>,
    pub max_id: Option<StreamEntryId>,
    /// `(consumer, owned pending count)` for every consumer with at least
    /// one pending entry.
    pub consumers: Vec<(String, u64)>,
}

/// One pending entry in the detailed view.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDetail {
    pub entry_id: StreamEntryId,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Per-group row of [`Engine::groups_info`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub name: String,
    pub consumer_count: u64,
    pub pending_count: u64,
    pub last_delivered_id: StreamEntryId,
}

/// Per-consumer row of [`Engine::consumers_info`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending_count: u64,
    pub idle_ms: u64,
}

/// Resolve a group start-id argument: `$` means the stream's current
/// `last_id`, `-` the zero id, anything else an explicit id.
fn resolve_start_id(spec: &str, stream: &StreamPayload) -> Result<StreamEntryId> {
    match spec {
        "$" => Ok(stream.last_id),
        "-" => Ok(StreamEntryId::ZERO),
        other => other.parse(),
    }
}

impl Engine {
    /// Create a consumer group on a stream. `mkstream` creates an empty
    /// stream when the key is absent; otherwise a missing key is `NoStream`,
    /// and an existing group name is `Exists`.
    pub async fn group_create(
        &self,
        key: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard_partition(Partition::Stream, key).await?;
        let group = group.to_string();
        let start_id = start_id.to_string();
        self.apply(Partition::Stream, key, cancel, |current, _now| {
            let mut stream = match current {
                Some(rec) => stream_of(rec)?.clone(),
                None if mkstream => StreamPayload::new(),
                None => return Err(EngineError::NoStream),
            };
            if stream.group(&group).is_some() {
                return Err(EngineError::Exists);
            }
            let start = resolve_start_id(&start_id, &stream)?;
            stream.groups.push(StreamGroup::new(group.clone(), start));
            match current {
                Some(rec) => {
                    let mut updated = rec.clone();
                    updated.payload = Payload::Stream(stream);
                    Ok(Commit::Replace(updated, ()))
                }
                None => Ok(Commit::Insert(Record::new(key, Payload::Stream(stream)), ())),
            }
        })
        .await?;
        Ok(())
    }

    /// Remove a group with all its state. Returns whether it existed.
    pub async fn group_destroy(
        &self,
        key: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.guard_partition(Partition::Stream, key).await?;
        let applied = self
            .apply(Partition::Stream, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Err(EngineError::NoStream);
                };
                let mut stream = stream_of(rec)?.clone();
                let before = stream.groups.len();
                stream.groups.retain(|g| g.name != group);
                if stream.groups.len() == before {
                    return Ok(Commit::Skip(false));
                }
                let mut updated = rec.clone();
                updated.payload = Payload::Stream(stream);
                Ok(Commit::Replace(updated, true))
            })
            .await?;
        Ok(applied.unwrap_or(false))
    }

    /// Reposition a group's cursor. Pending entries are left untouched.
    pub async fn group_set_id(
        &self,
        key: &str,
        group: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.guard_partition(Partition::Stream, key).await?;
        let id = id.to_string();
        self.apply(Partition::Stream, key, cancel, |current, _now| {
            let Some(rec) = current else {
                return Err(EngineError::NoStream);
            };
            let mut stream = stream_of(rec)?.clone();
            let target = resolve_start_id(&id, &stream)?;
            let Some(g) = stream.group_mut(group) else {
                return Err(EngineError::NoGroup);
            };
            g.last_delivered_id = target;
            let mut updated = rec.clone();
            updated.payload = Payload::Stream(stream);
            Ok(Commit::Replace(updated, ()))
        })
        .await?;
        Ok(())
    }

    /// Remove a consumer from a group, discarding the pending entries it
    /// owns. Returns how many pending entries were discarded.
    pub async fn group_del_consumer(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.guard_partition(Partition::Stream, key).await?;
        let applied = self
            .apply(Partition::Stream, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Err(EngineError::NoStream);
                };
                let mut stream = stream_of(rec)?.clone();
                let Some(g) = stream.group_mut(group) else {
                    return Err(EngineError::NoGroup);
                };
                let before = g.pending.len();
                g.pending.retain(|p| p.consumer != consumer);
                let dropped = (before - g.pending.len()) as u64;
                let had_consumer = g.consumers.iter().any(|c| c.name == consumer);
                g.consumers.retain(|c| c.name != consumer);
                if dropped == 0 && !had_consumer {
                    return Ok(Commit::Skip(0));
                }
                let mut updated = rec.clone();
                updated.payload = Payload::Stream(stream);
                Ok(Commit::Replace(updated, dropped))
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// Read entries on behalf of `consumer`. The `>` spec delivers entries
    /// past the group cursor; an explicit id delivers entries past that id.
    /// Either way the delivered entries join the pending list and the
    /// cursor advances.
    pub async fn group_read(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        id_spec: &str,
        count: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamEntry>> {
        self.guard_partition(Partition::Stream, key).await?;
        let explicit: Option<StreamEntryId> = if id_spec == ">" {
            None
        } else {
            Some(id_spec.parse()?)
        };
        let applied = self
            .apply(Partition::Stream, key, cancel, |current, now| {
                let Some(rec) = current else {
                    return Err(EngineError::NoStream);
                };
                let mut stream = stream_of(rec)?.clone();
                let Some(g) = stream.group(group) else {
                    return Err(EngineError::NoGroup);
                };
                let after = explicit.unwrap_or(g.last_delivered_id);
                let delivered = stream.entries_after(after, count);
                if delivered.is_empty() {
                    // Still register the consumer so it shows up in info
                    // listings even before its first delivery.
                    let g = stream.group_mut(group).ok_or(EngineError::NoGroup)?;
                    g.touch_consumer(consumer, now);
                    let mut updated = rec.clone();
                    updated.payload = Payload::Stream(stream);
                    return Ok(Commit::Replace(updated, Vec::new()));
                }
                let g = stream.group_mut(group).ok_or(EngineError::NoGroup)?;
                g.touch_consumer(consumer, now);
                for entry in &delivered {
                    g.note_delivery(entry.id, consumer, now);
                }
                let last = delivered[delivered.len() - 1].id;
                if last > g.last_delivered_id {
                    g.last_delivered_id = last;
                }
                let mut updated = rec.clone();
                updated.payload = Payload::Stream(stream);
                Ok(Commit::Replace(updated, delivered))
            })
            .await?;
        Ok(applied.unwrap_or_default())
    }

    /// Acknowledge delivered entries, removing them from the pending list.
    /// Returns how many were actually pending.
    pub async fn ack(
        &self,
        key: &str,
        group: &str,
        ids: &[&str],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let ids: Vec<StreamEntryId> = ids.iter().map(|s| s.parse()).collect::<Result<_>>()?;
        self.guard_partition(Partition::Stream, key).await?;
        let applied = self
            .apply(Partition::Stream, key, cancel, |current, _now| {
                let Some(rec) = current else {
                    return Err(EngineError::NoStream);
                };
                let mut stream = stream_of(rec)?.clone();
                let Some(g) = stream.group_mut(group) else {
                    return Err(EngineError::NoGroup);
                };
                let before = g.pending.len();
                g.pending.retain(|p| !ids.contains(&p.entry_id));
                let acked = (before - g.pending.len()) as u64;
                if acked == 0 {
                    return Ok(Commit::Skip(0));
                }
                let mut updated = rec.clone();
                updated.payload = Payload::Stream(stream);
                Ok(Commit::Replace(updated, acked))
            })
            .await?;
        Ok(applied.unwrap_or(0))
    }

    /// Transfer ownership of pending entries to `consumer`. Only entries
    /// idle for at least `min_idle_ms` move; `force` additionally adopts
    /// ids that are not pending at all, as long as the entry still exists.
    /// Pending references whose entry is gone are dropped instead of
    /// claimed. Returns the claimed entries.
    pub async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[&str],
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamEntry>> {
        let ids: Vec<StreamEntryId> = ids.iter().map(|s| s.parse()).collect::<Result<_>>()?;
        self.guard_partition(Partition::Stream, key).await?;
        let applied = self
            .apply(Partition::Stream, key, cancel, |current, now| {
                let Some(rec) = current else {
                    return Err(EngineError::NoStream);
                };
                let mut stream = stream_of(rec)?.clone();
                if stream.group(group).is_none() {
                    return Err(EngineError::NoGroup);
                }

                let mut claimed = Vec::new();
                let mut changed = false;
                for &id in &ids {
                    let entry = stream.find_entry(id).cloned();
                    let g = stream.group_mut(group).ok_or(EngineError::NoGroup)?;
                    let pending_idx = g.pending.iter().position(|p| p.entry_id == id);
                    match (pending_idx, entry) {
                        (Some(idx), Some(entry)) => {
                            let idle = now.saturating_sub(g.pending[idx].last_delivery_ms);
                            if idle < min_idle_ms {
                                continue;
                            }
                            let p = &mut g.pending[idx];
                            p.consumer = consumer.to_string();
                            p.last_delivery_ms = now;
                            p.delivery_count += 1;
                            claimed.push(entry);
                            changed = true;
                        }
                        (Some(idx), None) => {
                            // Entry trimmed away under the pending list.
                            g.pending.remove(idx);
                            changed = true;
                        }
                        (None, Some(entry)) if force => {
                            g.note_delivery(id, consumer, now);
                            claimed.push(entry);
                            changed = true;
                        }
                        _ => {}
                    }
                }
                if !changed {
                    return Ok(Commit::Skip(Vec::new()));
                }
                let g = stream.group_mut(group).ok_or(EngineError::NoGroup)?;
                g.touch_consumer(consumer, now);
                let mut updated = rec.clone();
                updated.payload = Payload::Stream(stream);
                Ok(Commit::Replace(updated, claimed))
            })
            .await?;
        Ok(applied.unwrap_or_default())
    }

    /// Pending-list summary: total count, id bounds, and per-consumer
    /// ownership counts.
    pub async fn pending_summary(
        &self,
        key: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<PendingSummary> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::Stream, key).await? else {
            return Err(EngineError::NoStream);
        };
        let stream = stream_of(&rec)?;
        let g = stream.group(group).ok_or(EngineError::NoGroup)?;
        let mut consumers: Vec<(String, u64)> = Vec::new();
        for p in &g.pending {
            match consumers.iter_mut().find(|(name, _)| *name == p.consumer) {
                Some((_, n)) => *n += 1,
                None => consumers.push((p.consumer.clone(), 1)),
            }
        }
        Ok(PendingSummary {
            count: g.pending.len() as u64,
            min_id: g.pending.first().map(|p| p.entry_id),
            max_id: g.pending.last().map(|p| p.entry_id),
            consumers,
        })
    }

    /// Detailed pending listing, optionally bounded by id range, consumer,
    /// minimum idle time, and count.
    pub async fn pending_details(
        &self,
        key: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
        consumer: Option<&str>,
        min_idle_ms: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PendingDetail>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let start = StreamEntryId::parse_range_start(start)?;
        let end = StreamEntryId::parse_range_end(end)?;
        let Some(rec) = self.read_alive(Partition::Stream, key).await? else {
            return Err(EngineError::NoStream);
        };
        let stream = stream_of(&rec)?;
        let g = stream.group(group).ok_or(EngineError::NoGroup)?;
        let now = super::now_ms();
        Ok(g.pending
            .iter()
            .filter(|p| p.entry_id >= start && p.entry_id <= end)
            .filter(|p| consumer.map_or(true, |c| p.consumer == c))
            .filter(|p| {
                min_idle_ms.map_or(true, |idle| now.saturating_sub(p.last_delivery_ms) >= idle)
            })
            .take(count)
            .map(|p| PendingDetail {
                entry_id: p.entry_id,
                consumer: p.consumer.clone(),
                idle_ms: now.saturating_sub(p.last_delivery_ms),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    /// One row per group on the stream; `NoStream` when the key is absent.
    pub async fn groups_info(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupInfo>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::Stream, key).await? else {
            return Err(EngineError::NoStream);
        };
        Ok(stream_of(&rec)?
            .groups
            .iter()
            .map(|g| GroupInfo {
                name: g.name.clone(),
                consumer_count: g.consumers.len() as u64,
                pending_count: g.pending.len() as u64,
                last_delivered_id: g.last_delivered_id,
            })
            .collect())
    }

    /// One row per consumer registered in the group.
    pub async fn consumers_info(
        &self,
        key: &str,
        group: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ConsumerInfo>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let Some(rec) = self.read_alive(Partition::Stream, key).await? else {
            return Err(EngineError::NoStream);
        };
        let stream = stream_of(&rec)?;
        let g = stream.group(group).ok_or(EngineError::NoGroup)?;
        let now = super::now_ms();
        Ok(g.consumers
            .iter()
            .map(|c| ConsumerInfo {
                name: c.name.clone(),
                pending_count: g.pending_for(&c.name) as u64,
                idle_ms: now.saturating_sub(c.last_seen_ms),
            })
            .collect())
    }
}
