//! Type-safe wrappers for log and partition primitives.
//!
//! These newtypes keep record offsets, leadership terms and partition
//! revisions from being mixed up even though they share an `i64`
//! representation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An offset in a partition's log.
///
/// The same type is used for record offsets inside a segment and for the
/// position of a command in the replicated log; the context decides which.
///
/// # Special Values
///
/// - `-1` (`NONE`): nothing has been applied yet. Every real offset
///   compares greater than it, which lets "wait until applied >= K" work
///   for the very first command.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Offset(pub i64);

impl Offset {
    /// No offset applied or recorded.
    pub const NONE: Self = Offset(-1);

    /// Create a new offset from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        Offset(value)
    }

    /// Get the raw i64 value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Check if this is a valid (non-negative) offset.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The offset immediately after this one.
    #[inline]
    pub const fn next(self) -> Self {
        Offset(self.0 + 1)
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Offset(value)
    }
}

impl From<Offset> for i64 {
    fn from(offset: Offset) -> Self {
        offset.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A leadership term of the partition's replication group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Term(pub i64);

impl Term {
    /// Create a new term from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        Term(value)
    }

    /// Get the raw i64 value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term(value)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The revision at which a partition was created.
///
/// Part of every remote object path, so that a topic deleted and re-created
/// under the same name never aliases the old objects. Zero is the unset
/// sentinel written by older snapshots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RevisionId(pub i64);

impl RevisionId {
    /// The unset revision.
    pub const UNSET: Self = RevisionId(0);

    /// Create a new revision from a raw value.
    #[inline]
    pub const fn new(value: i64) -> Self {
        RevisionId(value)
    }

    /// Get the raw i64 value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Check whether this is the unset sentinel.
    #[inline]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

impl From<i64> for RevisionId {
    fn from(value: i64) -> Self {
        RevisionId(value)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Ntp
// ============================================================================

/// A namespace-topic-partition identifier.
///
/// # Usage
///
/// ```
/// use archival_stm::types::Ntp;
///
/// let ntp = Ntp::kafka("orders", 3);
/// assert_eq!(ntp.to_string(), "kafka/orders/3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ntp {
    namespace: String,
    topic: String,
    partition: i32,
}

impl Ntp {
    /// Namespace used for user topics.
    pub const KAFKA_NAMESPACE: &'static str = "kafka";

    /// Create a new identifier.
    #[inline]
    pub fn new(namespace: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Create an identifier in the `kafka` namespace.
    #[inline]
    pub fn kafka(topic: impl Into<String>, partition: i32) -> Self {
        Self::new(Self::KAFKA_NAMESPACE, topic, partition)
    }

    /// Get the namespace.
    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get the topic name.
    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the partition index.
    #[inline]
    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}
