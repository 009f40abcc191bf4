//! Error types for Oxidis
//!
//! Defines the typed failure taxonomy exposed by every engine operation.
//! We follow Redis's error conventions where applicable so that a dispatch
//! layer can map failures to protocol responses deterministically.

use thiserror::Error;

/// Typed failures returned by engine operations.
///
/// Transient backing-store write conflicts never surface here; they are
/// absorbed by the optimistic retry protocol. Only the retry budget running
/// out is observable, and that is reported as the operation's "no effect"
/// result, not as an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The key is alive under a different data-type partition.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// The target key/record is absent (distinct from a no-op on empty input).
    #[error("ERR no such key")]
    NotFound,

    /// A stream operation targeted a key with no stream.
    #[error("ERR The XGROUP subcommand requires the key to exist")]
    NoStream,

    /// A consumer-group operation targeted a group that does not exist.
    #[error("NOGROUP No such consumer group")]
    NoGroup,

    /// Creation was attempted against an already-present unique resource.
    #[error("ERR item exists")]
    Exists,

    /// Malformed argument: bad numeric range, out-of-bounds probability, etc.
    #[error("ERR {0}")]
    InvalidArgument(String),

    /// List/array index outside the valid range.
    #[error("ERR index out of range")]
    OutOfRange,

    /// The operation's cancellation token fired between retry attempts.
    ///
    /// No partial effect is visible beyond the last committed conditional
    /// write.
    #[error("ERR operation cancelled")]
    Cancelled,

    /// The backing record store failed.
    #[error("ERR record store: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Shorthand for an `InvalidArgument` with a formatted message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }
}

/// Failures raised by a [`RecordStore`](crate::storage::RecordStore) adapter.
///
/// Conditional-write misses (insert rejection, stale replace) are *not*
/// errors; adapters report them through their return values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The backing store could not be reached or timed out.
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    /// A persisted record could not be decoded.
    #[error("malformed record for key '{0}'")]
    Corrupt(String),
}

/// Type alias for Results throughout Oxidis
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            EngineError::WrongType.to_string(),
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        );
        assert_eq!(
            EngineError::invalid("value is not an integer or out of range").to_string(),
            "ERR value is not an integer or out of range"
        );
    }

    #[test]
    fn test_store_error_conversion() {
        let err: EngineError = StoreError::Corrupt("k".into()).into();
        assert!(matches!(err, EngineError::Store(StoreError::Corrupt(_))));
    }
}
