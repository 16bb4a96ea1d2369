//! Error types for the archival metadata state machine.
//!
//! # Error Handling Patterns
//!
//! Errors fall into two classes based on what the caller can do about them.
//!
//! ## Transient (Return to Caller)
//!
//! - [`ArchivalError::NotLeader`]: retry against the current leader
//! - [`ArchivalError::Timeout`]: outcome unknown, re-query state before retrying
//! - [`ArchivalError::ReplicationRejected`]: backpressure or disconnect, retry
//!
//! A timed out write may still be committed and applied later. Callers must
//! never assume the mutation did not happen.
//!
//! ## Fatal (Halt the Apply Path)
//!
//! - [`ArchivalError::Decode`]: corrupted or unsupported command or snapshot
//! - [`ArchivalError::InvariantViolation`]: an internal consistency check failed, e.g. a
//!   non-monotonic offset was observed
//!
//! A fatal error stops the partition's apply task. Every pending waiter and
//! every later call receives [`ArchivalError::Halted`] carrying the reason,
//! and the owning supervisor is expected to reconcile, for example by forcing
//! a fresh snapshot-based recovery.

use thiserror::Error;

/// Result type for archival operations.
pub type ArchivalResult<T> = Result<T, ArchivalError>;

/// Errors that can occur in the archival metadata state machine.
#[derive(Debug, Error)]
pub enum ArchivalError {
    /// This replica is not the leader of the partition's replication group.
    #[error("Not the leader (current leader: {leader_id:?})")]
    NotLeader { leader_id: Option<u64> },

    /// The deadline expired before the operation completed locally.
    ///
    /// The command may still be committed and applied later.
    #[error("Timed out waiting for {operation}, outcome unknown")]
    Timeout { operation: &'static str },

    /// The consensus layer refused the command (backpressure, disconnect).
    #[error("Replication rejected: {0}")]
    ReplicationRejected(String),

    /// A committed command or a snapshot could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A command could not be encoded.
    #[error("Encode error: {0}")]
    Encode(String),

    /// An internal consistency check failed; indicates a bug upstream.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The apply path stopped after a fatal error.
    #[error("State machine halted: {0}")]
    Halted(String),

    /// A segment submitted by a caller is malformed.
    #[error("Invalid segment: {0}")]
    InvalidSegment(String),

    /// Persisting or loading a snapshot failed.
    #[error("Snapshot store error: {0}")]
    SnapshotStore(String),

    /// Error from object store operations.
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ArchivalError {
    /// Check if this error means the caller should retry against another replica.
    #[inline]
    pub fn is_not_leader(&self) -> bool {
        matches!(self, ArchivalError::NotLeader { .. })
    }

    /// Check if the caller may retry the same operation.
    ///
    /// Timeouts are retryable but the caller must re-query state first since
    /// the original command may have been applied.
    pub fn is_retryable(&self) -> bool {
        match self {
            ArchivalError::NotLeader { .. }
            | ArchivalError::Timeout { .. }
            | ArchivalError::ReplicationRejected(_) => true,
            ArchivalError::SnapshotStore(_) | ArchivalError::ObjectStore(_) => true,
            ArchivalError::Decode(_)
            | ArchivalError::Encode(_)
            | ArchivalError::InvariantViolation(_)
            | ArchivalError::Halted(_)
            | ArchivalError::InvalidSegment(_)
            | ArchivalError::Config(_)
            | ArchivalError::Serde(_) => false,
        }
    }

    /// Check if this error must stop the apply path.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArchivalError::Decode(_)
                | ArchivalError::InvariantViolation(_)
                | ArchivalError::Halted(_)
        )
    }

    /// Returns a string label suitable for logs and metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            ArchivalError::NotLeader { .. } => "not_leader",
            ArchivalError::Timeout { .. } => "timeout",
            ArchivalError::ReplicationRejected(_) => "replication_rejected",
            ArchivalError::Decode(_) => "decode",
            ArchivalError::Encode(_) => "encode",
            ArchivalError::InvariantViolation(_) => "invariant_violation",
            ArchivalError::Halted(_) => "halted",
            ArchivalError::InvalidSegment(_) => "invalid_segment",
            ArchivalError::SnapshotStore(_) => "snapshot_store",
            ArchivalError::ObjectStore(_) => "object_store",
            ArchivalError::Config(_) => "config",
            ArchivalError::Serde(_) => "serde",
        }
    }
}

impl From<bincode::Error> for ArchivalError {
    fn from(e: bincode::Error) -> Self {
        ArchivalError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(ArchivalError::NotLeader { leader_id: Some(2) }.is_retryable());
        assert!(ArchivalError::Timeout { operation: "sync" }.is_retryable());
        assert!(ArchivalError::ReplicationRejected("full".to_string()).is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ArchivalError::Decode("bad tag".to_string()).is_fatal());
        assert!(ArchivalError::InvariantViolation("offset went back".to_string()).is_fatal());
        assert!(ArchivalError::Halted("decode".to_string()).is_fatal());
        assert!(!ArchivalError::Decode("bad tag".to_string()).is_retryable());
        assert!(!ArchivalError::Timeout { operation: "sync" }.is_fatal());
    }

    #[test]
    fn test_is_not_leader() {
        assert!(ArchivalError::NotLeader { leader_id: None }.is_not_leader());
        assert!(!ArchivalError::ReplicationRejected("x".to_string()).is_not_leader());
    }

    #[test]
    fn test_display() {
        let err = ArchivalError::Timeout {
            operation: "add_segments",
        };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for add_segments, outcome unknown"
        );

        let err = ArchivalError::NotLeader { leader_id: Some(3) };
        assert!(err.to_string().contains("Some(3)"));
    }

    #[test]
    fn test_metric_labels() {
        assert_eq!(
            ArchivalError::NotLeader { leader_id: None }.as_metric_label(),
            "not_leader"
        );
        assert_eq!(
            ArchivalError::InvariantViolation(String::new()).as_metric_label(),
            "invariant_violation"
        );
    }

    #[test]
    fn test_from_bincode_is_decode() {
        let err: bincode::Error = Box::new(bincode::ErrorKind::SizeLimit);
        let converted: ArchivalError = err.into();
        assert!(matches!(converted, ArchivalError::Decode(_)));
    }
}
