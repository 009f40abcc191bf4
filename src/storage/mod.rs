//! Storage layer for Oxidis
//!
//! Record shapes (the at-rest document format), the backing-store adapter
//! trait, and the in-memory reference adapter.

pub mod adapter;
pub mod memory;
pub mod record;
pub mod stream;

pub use adapter::{InsertOutcome, RecordStore};
pub use memory::MemoryRecordStore;
pub use record::{
    BloomPayload, CuckooItem, CuckooPayload, DigestPayload, Partition, Payload, Record,
    ScoredMember,
};
pub use stream::{
    PendingEntry, StreamConsumer, StreamEntry, StreamEntryId, StreamGroup, StreamPayload,
};
