//! Flat, serializable form of a [`PartitionManifest`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::PartitionManifest;
use super::segment::{SegmentKey, SegmentMeta};
use crate::error::{ArchivalError, ArchivalResult};
use crate::types::{Ntp, Offset, RevisionId};

/// Every field of a manifest, with segments as an ordered list.
///
/// This is the payload of the current snapshot format and the shape of the
/// manifest's JSON rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestState {
    pub ntp: Ntp,
    pub revision: RevisionId,
    pub start_offset: Option<Offset>,
    pub insync_offset: Offset,
    pub segments: Vec<(SegmentKey, SegmentMeta)>,
    pub replaced: Vec<SegmentMeta>,
    pub cleanup_backlog: Vec<SegmentMeta>,
}

impl From<&PartitionManifest> for ManifestState {
    fn from(manifest: &PartitionManifest) -> Self {
        Self {
            ntp: manifest.ntp.clone(),
            revision: manifest.revision,
            start_offset: manifest.start_offset,
            insync_offset: manifest.insync_offset,
            segments: manifest
                .segments
                .iter()
                .map(|(key, meta)| (*key, meta.clone()))
                .collect(),
            replaced: manifest.replaced.clone(),
            cleanup_backlog: manifest.cleanup_backlog.clone(),
        }
    }
}

impl ManifestState {
    /// Rebuild a manifest, rejecting state that breaks manifest invariants.
    ///
    /// Broken invariants in persisted state mean corruption, so they are
    /// reported as decode errors.
    pub fn into_manifest(self) -> ArchivalResult<PartitionManifest> {
        let mut segments = BTreeMap::new();
        let mut previous: Option<&SegmentMeta> = None;

        for (key, meta) in &self.segments {
            if key.base_offset != meta.base_offset {
                return Err(ArchivalError::Decode(format!(
                    "segment key {} does not match base offset {}",
                    key, meta.base_offset
                )));
            }
            meta.validate()
                .map_err(|e| ArchivalError::Decode(format!("segment {}: {}", key, e)))?;
            if let Some(prev) = previous
                && prev.committed_offset >= meta.base_offset
            {
                return Err(ArchivalError::Decode(format!(
                    "segment {} overlaps or precedes segment {}",
                    meta, prev
                )));
            }
            if let Some(start) = self.start_offset
                && meta.committed_offset < start
            {
                return Err(ArchivalError::Decode(format!(
                    "segment {} retained below start offset {}",
                    meta, start
                )));
            }
            previous = Some(meta);
        }

        for (key, meta) in self.segments {
            segments.insert(key, meta);
        }

        Ok(PartitionManifest::from_parts(
            self.ntp,
            self.revision,
            segments,
            self.start_offset,
            self.insync_offset,
            self.replaced,
            self.cleanup_backlog,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Term;

    fn seg(base: i64, committed: i64) -> SegmentMeta {
        SegmentMeta::new(Offset::new(base), Offset::new(committed), Term::new(1))
    }

    fn sample() -> PartitionManifest {
        let mut m = PartitionManifest::new(Ntp::kafka("t", 0), RevisionId::new(3));
        m.add_segment(seg(0, 99)).unwrap();
        m.add_segment(seg(100, 199)).unwrap();
        m.add_segment(seg(200, 299)).unwrap();
        let mut compacted = seg(100, 199);
        compacted.is_compacted = true;
        m.add_segment(compacted).unwrap();
        m.advance_start_offset(Offset::new(100));
        m.advance_insync_offset(Offset::new(7)).unwrap();
        m
    }

    #[test]
    fn test_state_preserves_every_field() {
        let m = sample();
        let restored = ManifestState::from(&m).into_manifest().unwrap();

        assert_eq!(restored, m);
        assert_eq!(restored.insync_offset(), Offset::new(7));
        assert_eq!(restored.start_offset(), Some(Offset::new(100)));
        assert_eq!(restored.replaced_segments(), m.replaced_segments());
        assert_eq!(restored.cleanup_backlog(), m.cleanup_backlog());
    }

    #[test]
    fn test_rejects_overlapping_segments() {
        let mut state = ManifestState::from(&sample());
        state.segments.push((seg(250, 350).key(), seg(250, 350)));
        let err = state.into_manifest().unwrap_err();
        assert!(matches!(err, ArchivalError::Decode(_)));
    }

    #[test]
    fn test_rejects_segment_below_start() {
        let mut state = ManifestState::from(&sample());
        state.start_offset = Some(Offset::new(250));
        assert!(state.into_manifest().is_err());
    }

    #[test]
    fn test_rejects_mismatched_key() {
        let mut state = ManifestState::from(&sample());
        state.segments[0].0 = SegmentKey::new(Offset::new(1), Term::new(1));
        assert!(state.into_manifest().is_err());
    }
}
