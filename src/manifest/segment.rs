//! Identity and metadata of a single archived segment.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Offset, RevisionId, Term};

/// Identity of a segment: its first record offset and the term it was
/// written under.
///
/// Keys order by `base_offset` first, then `term`. A recompacted segment
/// keeps the key of the segment it replaces; the two are told apart by
/// their metadata.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SegmentKey {
    pub base_offset: Offset,
    pub term: Term,
}

impl SegmentKey {
    /// Create a new segment key.
    #[inline]
    pub const fn new(base_offset: Offset, term: Term) -> Self {
        Self { base_offset, term }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base_offset, self.term)
    }
}

/// How the remote object name of a segment is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SegmentNameFormat {
    /// `{base_offset}-{term}-v1.log`, derived from the key alone.
    #[default]
    V1,
    /// `{base_offset}-{committed_offset}-{size_bytes}-{term}-v1.log`.
    ///
    /// Distinguishes a recompacted segment from the one it replaces.
    V2,
}

/// Metadata describing one segment uploaded to remote storage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// First record offset in the segment.
    pub base_offset: Offset,
    /// Last record offset in the segment (inclusive).
    pub committed_offset: Offset,
    /// Term of the archiver that uploaded the segment.
    pub archiver_term: Term,
    /// Term the segment's records were written under (the key's term).
    pub segment_term: Term,
    /// Whether the segment was produced by compaction.
    pub is_compacted: bool,
    /// Size of the remote object.
    pub size_bytes: u64,
    /// Timestamp of the first record, if known.
    pub base_timestamp: Option<i64>,
    /// Largest record timestamp, if known.
    pub max_timestamp: Option<i64>,
    /// Offset translation delta at the start of the segment, if known.
    pub delta_offset: Option<i64>,
    /// Remote naming scheme.
    pub name_format: SegmentNameFormat,
    /// Creation revision of the partition; [`RevisionId::UNSET`] means "use
    /// the manifest's revision".
    pub ntp_revision: RevisionId,
}

impl SegmentMeta {
    /// Create metadata for a segment covering `[base_offset, committed_offset]`
    /// written and archived under `term`.
    pub fn new(base_offset: Offset, committed_offset: Offset, term: Term) -> Self {
        Self {
            base_offset,
            committed_offset,
            archiver_term: term,
            segment_term: term,
            ..Default::default()
        }
    }

    /// The key this segment is stored under.
    #[inline]
    pub fn key(&self) -> SegmentKey {
        SegmentKey::new(self.base_offset, self.segment_term)
    }

    /// Check whether `offset` falls inside this segment.
    #[inline]
    pub fn contains(&self, offset: Offset) -> bool {
        self.base_offset <= offset && offset <= self.committed_offset
    }

    /// Check whether this segment's offset range intersects `other`'s.
    #[inline]
    pub fn overlaps(&self, other: &SegmentMeta) -> bool {
        self.base_offset <= other.committed_offset && other.base_offset <= self.committed_offset
    }

    /// Revision to use for the remote path, falling back to `default`.
    #[inline]
    pub fn ntp_revision_or(&self, default: RevisionId) -> RevisionId {
        if self.ntp_revision.is_unset() {
            default
        } else {
            self.ntp_revision
        }
    }

    /// Check the metadata is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if !self.base_offset.is_valid() {
            return Err(format!("negative base offset {}", self.base_offset));
        }
        if self.committed_offset < self.base_offset {
            return Err(format!(
                "committed offset {} below base offset {}",
                self.committed_offset, self.base_offset
            ));
        }
        if let (Some(base), Some(max)) = (self.base_timestamp, self.max_timestamp)
            && max < base
        {
            return Err(format!("max timestamp {} below base timestamp {}", max, base));
        }
        Ok(())
    }
}

impl fmt::Display for SegmentMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] term={} compacted={}",
            self.base_offset, self.committed_offset, self.segment_term, self.is_compacted
        )
    }
}
