//! Oxidis library
//!
//! A multi-type data-structure engine that reproduces Redis-style key-space
//! semantics (strings, hashes, lists, sets, sorted sets, streams with
//! consumer groups, and four statistical structures) on top of a generic,
//! non-transactional document-per-record backing store.
//!
//! The backing store is abstracted behind [`storage::RecordStore`]; a
//! command-dispatch layer drives the engine through [`engine::Engine`].

pub mod engine;
pub mod error;
pub mod storage;

// Re-export commonly used types
pub use engine::Engine;
pub use error::{EngineError, Result, StoreError};
pub use storage::{MemoryRecordStore, Partition, Payload, Record, RecordStore};
