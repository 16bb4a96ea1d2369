//! Partition manifest: the ordered set of segments offloaded for one partition.
//!
//! The manifest is mutated only by the state machine's apply path. Every
//! mutation is deterministic so that replicas replaying the same commands
//! arrive at equal manifests.
//!
//! # Bookkeeping
//!
//! Segments leave the retained set in two ways, and neither loses track of
//! the remote object:
//!
//! - **Replacement**: a new segment whose offset range intersects retained
//!   segments (recompaction, re-upload) supersedes them. They move to
//!   [`PartitionManifest::replaced_segments`].
//! - **Truncation**: advancing the start offset evicts segments that end
//!   below it. They move to [`PartitionManifest::cleanup_backlog`].
//!
//! Both lists shrink only through [`PartitionManifest::acknowledge_cleanup`],
//! once remote deletion is durable.

mod name;
mod segment;
mod state;

use std::collections::BTreeMap;

use crate::error::{ArchivalError, ArchivalResult};
use crate::types::{Ntp, Offset, RevisionId, Term};

pub use name::{
    ParsedSegmentName, local_segment_name, parse_segment_name, remote_segment_path, segment_name,
};
pub use segment::{SegmentKey, SegmentMeta, SegmentNameFormat};
pub use state::ManifestState;

/// Manifest of the segments of one partition stored in remote storage.
#[derive(Debug, Clone)]
pub struct PartitionManifest {
    ntp: Ntp,
    revision: RevisionId,
    segments: BTreeMap<SegmentKey, SegmentMeta>,
    /// Explicit start offset; `None` until the first truncation.
    start_offset: Option<Offset>,
    insync_offset: Offset,
    replaced: Vec<SegmentMeta>,
    cleanup_backlog: Vec<SegmentMeta>,
}

impl PartitionManifest {
    /// Create an empty manifest for a partition created at `revision`.
    pub fn new(ntp: Ntp, revision: RevisionId) -> Self {
        Self {
            ntp,
            revision,
            segments: BTreeMap::new(),
            start_offset: None,
            insync_offset: Offset::NONE,
            replaced: Vec::new(),
            cleanup_backlog: Vec::new(),
        }
    }

    /// Partition this manifest describes.
    pub fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    /// Creation revision of the partition.
    pub fn revision(&self) -> RevisionId {
        self.revision
    }

    /// Number of retained segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check whether no segments are retained.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Iterate over retained segments in ascending offset order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&SegmentKey, &SegmentMeta)> {
        self.segments.iter()
    }

    /// Look up a retained segment by key.
    pub fn get(&self, key: &SegmentKey) -> Option<&SegmentMeta> {
        self.segments.get(key)
    }

    /// Look up a retained segment by its base offset and term.
    pub fn get_by_offset(&self, base_offset: Offset, term: Term) -> Option<&SegmentMeta> {
        self.get(&SegmentKey::new(base_offset, term))
    }

    /// Retained segment containing `offset`, if any.
    pub fn segment_containing(&self, offset: Offset) -> Option<&SegmentMeta> {
        let upper = SegmentKey::new(offset, Term::new(i64::MAX));
        self.segments
            .range(..=upper)
            .next_back()
            .map(|(_, meta)| meta)
            .filter(|meta| meta.contains(offset))
    }

    /// Lowest retained segment.
    pub fn first_segment(&self) -> Option<&SegmentMeta> {
        self.segments.values().next()
    }

    /// Highest retained segment.
    pub fn last_segment(&self) -> Option<&SegmentMeta> {
        self.segments.values().next_back()
    }

    /// Last offset covered by the retained segments.
    pub fn last_offset(&self) -> Option<Offset> {
        self.last_segment().map(|meta| meta.committed_offset)
    }

    /// Combined size of the retained segments.
    pub fn total_size_bytes(&self) -> u64 {
        self.segments.values().map(|meta| meta.size_bytes).sum()
    }

    /// Explicitly recorded start offset, if one was ever set.
    pub fn start_offset(&self) -> Option<Offset> {
        self.start_offset
    }

    /// Offset from which the partition's remote data is readable.
    ///
    /// Falls back to the first segment's base offset when no start offset was
    /// recorded, and to zero for an empty manifest.
    pub fn get_start_offset(&self) -> Offset {
        self.start_offset
            .or_else(|| self.first_segment().map(|meta| meta.base_offset))
            .unwrap_or_default()
    }

    /// Log offset through which this manifest reflects applied commands.
    pub fn insync_offset(&self) -> Offset {
        self.insync_offset
    }

    /// Segments superseded by a newer upload of an overlapping range.
    pub fn replaced_segments(&self) -> &[SegmentMeta] {
        &self.replaced
    }

    /// Segments evicted by a start offset advance.
    pub fn cleanup_backlog(&self) -> &[SegmentMeta] {
        &self.cleanup_backlog
    }

    /// Remote object name of a retained segment.
    pub fn segment_name(&self, key: &SegmentKey) -> Option<String> {
        self.get(key).map(segment_name)
    }

    /// Full remote path of a segment, defaulting to this manifest's revision.
    pub fn remote_segment_path(&self, meta: &SegmentMeta) -> String {
        remote_segment_path(&self.ntp, meta, self.revision)
    }

    /// Insert or replace a segment.
    ///
    /// Every retained segment whose offset range intersects the new one,
    /// including one stored under the same key, moves to the replaced list.
    /// Re-adding a segment identical to the retained one is a no-op, so a
    /// retried upload never schedules its own object for deletion.
    ///
    /// A segment ending below the recorded start offset is not retained and
    /// goes straight to the cleanup backlog, once. A segment that begins
    /// below the start offset but ends at or above it is retained whole and
    /// the start offset is left unchanged, so the first retained segment may
    /// straddle the start offset. Only truncation moves the start offset.
    ///
    /// Returns whether the manifest changed.
    pub fn add(&mut self, key: SegmentKey, mut meta: SegmentMeta) -> ArchivalResult<bool> {
        if key.base_offset != meta.base_offset {
            return Err(ArchivalError::InvariantViolation(format!(
                "segment key {} does not match base offset {}",
                key, meta.base_offset
            )));
        }
        meta.validate()
            .map_err(|e| ArchivalError::InvariantViolation(format!("segment {}: {}", key, e)))?;

        meta.segment_term = key.term;
        if meta.ntp_revision.is_unset() {
            meta.ntp_revision = self.revision;
        }

        if self.segments.get(&key) == Some(&meta) {
            return Ok(false);
        }

        if let Some(start) = self.start_offset
            && meta.committed_offset < start
        {
            if self.cleanup_backlog.contains(&meta) {
                return Ok(false);
            }
            self.cleanup_backlog.push(meta);
            return Ok(true);
        }

        // Retained segments never overlap, so committed offsets rise with
        // base offsets and the overlapping ones form a contiguous run.
        let upper = SegmentKey::new(meta.committed_offset, Term::new(i64::MAX));
        let overlapping: Vec<SegmentKey> = self
            .segments
            .range(..=upper)
            .rev()
            .take_while(|(_, existing)| existing.overlaps(&meta))
            .map(|(existing_key, _)| *existing_key)
            .collect();

        for existing_key in overlapping.into_iter().rev() {
            if let Some(existing) = self.segments.remove(&existing_key) {
                self.replaced.push(existing);
            }
        }

        self.segments.insert(key, meta);
        Ok(true)
    }

    /// Insert or replace a segment under the key derived from its metadata.
    pub fn add_segment(&mut self, meta: SegmentMeta) -> ArchivalResult<bool> {
        self.add(meta.key(), meta)
    }

    /// Move the start offset forward, evicting segments that end below it.
    ///
    /// The resulting start offset never splits a segment: if `new_start`
    /// falls strictly inside a retained segment, the start offset becomes
    /// that segment's base offset.
    ///
    /// Returns whether the start offset changed.
    pub fn advance_start_offset(&mut self, new_start: Offset) -> bool {
        let current = self.get_start_offset();
        if new_start <= current {
            return false;
        }

        let evicted: Vec<SegmentKey> = self
            .segments
            .iter()
            .take_while(|(_, meta)| meta.committed_offset < new_start)
            .map(|(key, _)| *key)
            .collect();
        for key in evicted {
            if let Some(meta) = self.segments.remove(&key) {
                self.cleanup_backlog.push(meta);
            }
        }

        let aligned = match self.segment_containing(new_start) {
            Some(meta) => meta.base_offset.max(current),
            None => new_start,
        };

        if aligned <= current {
            return false;
        }
        self.start_offset = Some(aligned);
        true
    }

    /// Record that all commands through `offset` are reflected here.
    pub fn advance_insync_offset(&mut self, offset: Offset) -> ArchivalResult<()> {
        if offset < self.insync_offset {
            return Err(ArchivalError::InvariantViolation(format!(
                "insync offset moving backwards from {} to {}",
                self.insync_offset, offset
            )));
        }
        self.insync_offset = offset;
        Ok(())
    }

    /// Drop replaced and backlog entries whose remote objects are deleted.
    ///
    /// Entries are matched on their full metadata. Unknown entries are
    /// ignored. Returns the number of entries removed.
    pub fn acknowledge_cleanup(&mut self, deleted: &[SegmentMeta]) -> usize {
        let before = self.replaced.len() + self.cleanup_backlog.len();
        self.replaced.retain(|meta| !deleted.contains(meta));
        self.cleanup_backlog.retain(|meta| !deleted.contains(meta));
        before - (self.replaced.len() + self.cleanup_backlog.len())
    }

    /// Render the manifest as JSON for diagnostics.
    pub fn to_json(&self) -> ArchivalResult<String> {
        Ok(serde_json::to_string(&ManifestState::from(self))?)
    }

    pub(crate) fn from_parts(
        ntp: Ntp,
        revision: RevisionId,
        segments: BTreeMap<SegmentKey, SegmentMeta>,
        start_offset: Option<Offset>,
        insync_offset: Offset,
        replaced: Vec<SegmentMeta>,
        cleanup_backlog: Vec<SegmentMeta>,
    ) -> Self {
        Self {
            ntp,
            revision,
            segments,
            start_offset,
            insync_offset,
            replaced,
            cleanup_backlog,
        }
    }
}

/// Logical equality: retained segments, effective start offset and revision.
///
/// Replaced segments, the backlog and the insync offset depend on the command
/// history and are not compared.
impl PartialEq for PartitionManifest {
    fn eq(&self, other: &Self) -> bool {
        self.revision == other.revision
            && self.get_start_offset() == other.get_start_offset()
            && self.segments == other.segments
    }
}

impl Eq for PartitionManifest {}
