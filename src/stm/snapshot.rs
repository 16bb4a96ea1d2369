//! Snapshot formats.
//!
//! Every snapshot starts with a 9-byte header: a format tag byte followed by
//! the little-endian insync offset at which it was taken. The payload that
//! follows depends on the format:
//!
//! - **Current** (`1`): a [`ManifestState`] with every manifest field.
//! - **Legacy** (`0`): a flat list of `(deprecated_ntp_revision, name, meta)`
//!   triples. It has no start offset, replaced segments or cleanup backlog,
//!   and its segment metadata predates the segment term and name format
//!   fields; both are recovered from the stored name.
//!
//! The two decoders are kept separate behind [`decode_snapshot`].

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::commands::wire_options;
use crate::error::{ArchivalError, ArchivalResult};
use crate::manifest::{
    ManifestState, PartitionManifest, SegmentMeta, local_segment_name, parse_segment_name,
};
use crate::types::{Ntp, Offset, RevisionId, Term};

/// Length of the header preceding every snapshot payload.
pub const SNAPSHOT_HEADER_LEN: usize = 9;

/// On-disk snapshot format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotFormat {
    Legacy = 0,
    Current = 1,
}

impl TryFrom<u8> for SnapshotFormat {
    type Error = ArchivalError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(SnapshotFormat::Legacy),
            1 => Ok(SnapshotFormat::Current),
            other => Err(ArchivalError::Decode(format!(
                "unknown snapshot format tag {}",
                other
            ))),
        }
    }
}

/// A decoded snapshot.
#[derive(Debug, Clone)]
pub struct DecodedSnapshot {
    pub format: SnapshotFormat,
    /// Log offset through which the snapshot reflects applied commands.
    pub offset: Offset,
    pub manifest: PartitionManifest,
}

/// Segment metadata as stored by the legacy format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LegacySegmentMeta {
    is_compacted: bool,
    size_bytes: u64,
    base_offset: Offset,
    committed_offset: Offset,
    base_timestamp: Option<i64>,
    max_timestamp: Option<i64>,
    delta_offset: Option<i64>,
    ntp_revision: RevisionId,
    archiver_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LegacySegment {
    ntp_revision_deprecated: RevisionId,
    name: String,
    meta: LegacySegmentMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LegacySnapshot {
    segments: Vec<LegacySegment>,
}

fn with_header(format: SnapshotFormat, offset: Offset, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_LEN + payload.len());
    buf.put_u8(format as u8);
    buf.put_i64_le(offset.value());
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode `manifest` in the current format, taken at its insync offset.
pub fn encode_snapshot(manifest: &PartitionManifest) -> ArchivalResult<Bytes> {
    let payload = wire_options()
        .serialize(&ManifestState::from(manifest))
        .map_err(|e| ArchivalError::Encode(e.to_string()))?;
    Ok(with_header(
        SnapshotFormat::Current,
        manifest.insync_offset(),
        &payload,
    ))
}

/// Encode `manifest` in the legacy format.
///
/// Only retained segments are written. Every segment is named by its key in
/// the short `{base}-{term}-v1.log` form, so V2 naming does not survive a
/// round trip. Used to produce state readable by older replicas and to
/// exercise the legacy decoder.
pub fn encode_legacy_snapshot(manifest: &PartitionManifest) -> ArchivalResult<Bytes> {
    let segments = manifest
        .iter()
        .map(|(_, meta)| LegacySegment {
            ntp_revision_deprecated: meta.ntp_revision_or(manifest.revision()),
            name: local_segment_name(meta.base_offset, meta.segment_term),
            meta: LegacySegmentMeta {
                is_compacted: meta.is_compacted,
                size_bytes: meta.size_bytes,
                base_offset: meta.base_offset,
                committed_offset: meta.committed_offset,
                base_timestamp: meta.base_timestamp,
                max_timestamp: meta.max_timestamp,
                delta_offset: meta.delta_offset,
                ntp_revision: meta.ntp_revision,
                archiver_term: meta.archiver_term,
            },
        })
        .collect();

    let payload = wire_options()
        .serialize(&LegacySnapshot { segments })
        .map_err(|e| ArchivalError::Encode(e.to_string()))?;
    Ok(with_header(
        SnapshotFormat::Legacy,
        manifest.insync_offset(),
        &payload,
    ))
}

/// Decode a snapshot of either format.
///
/// `ntp` and `revision` identify the partition the snapshot is loaded for;
/// the legacy format does not record them.
pub fn decode_snapshot(
    bytes: &[u8],
    ntp: &Ntp,
    revision: RevisionId,
) -> ArchivalResult<DecodedSnapshot> {
    if bytes.len() < SNAPSHOT_HEADER_LEN {
        return Err(ArchivalError::Decode(format!(
            "snapshot of {} bytes is shorter than its header",
            bytes.len()
        )));
    }

    let mut header = &bytes[..SNAPSHOT_HEADER_LEN];
    let format = SnapshotFormat::try_from(header.get_u8())?;
    let offset = Offset::new(header.get_i64_le());
    let payload = &bytes[SNAPSHOT_HEADER_LEN..];

    let manifest = match format {
        SnapshotFormat::Current => decode_current(payload, offset)?,
        SnapshotFormat::Legacy => decode_legacy(payload, offset, ntp, revision)?,
    };

    debug!(
        ntp = %manifest.ntp(),
        offset = %offset,
        format = ?format,
        segments = manifest.len(),
        "Decoded snapshot"
    );

    Ok(DecodedSnapshot {
        format,
        offset,
        manifest,
    })
}

fn decode_current(payload: &[u8], offset: Offset) -> ArchivalResult<PartitionManifest> {
    let state: ManifestState = wire_options().deserialize(payload)?;
    if state.insync_offset != offset {
        return Err(ArchivalError::Decode(format!(
            "snapshot header offset {} does not match manifest insync offset {}",
            offset, state.insync_offset
        )));
    }
    state.into_manifest()
}

fn decode_legacy(
    payload: &[u8],
    offset: Offset,
    ntp: &Ntp,
    revision: RevisionId,
) -> ArchivalResult<PartitionManifest> {
    let legacy: LegacySnapshot = wire_options().deserialize(payload)?;

    let mut segments = Vec::with_capacity(legacy.segments.len());
    for segment in legacy.segments {
        let parsed = parse_segment_name(&segment.name).ok_or_else(|| {
            ArchivalError::Decode(format!("unparseable segment name {:?}", segment.name))
        })?;
        if parsed.key.base_offset != segment.meta.base_offset {
            return Err(ArchivalError::Decode(format!(
                "segment name {:?} does not match base offset {}",
                segment.name, segment.meta.base_offset
            )));
        }

        let ntp_revision = [segment.meta.ntp_revision, segment.ntp_revision_deprecated]
            .into_iter()
            .find(|rev| !rev.is_unset())
            .unwrap_or(revision);

        let meta = SegmentMeta {
            base_offset: segment.meta.base_offset,
            committed_offset: segment.meta.committed_offset,
            archiver_term: segment.meta.archiver_term,
            segment_term: parsed.key.term,
            is_compacted: segment.meta.is_compacted,
            size_bytes: segment.meta.size_bytes,
            base_timestamp: segment.meta.base_timestamp,
            max_timestamp: segment.meta.max_timestamp,
            delta_offset: segment.meta.delta_offset,
            name_format: parsed.format,
            ntp_revision,
        };
        segments.push((parsed.key, meta));
    }
    segments.sort_by_key(|(key, _)| *key);

    ManifestState {
        ntp: ntp.clone(),
        revision,
        start_offset: None,
        insync_offset: offset,
        segments,
        replaced: Vec::new(),
        cleanup_backlog: Vec::new(),
    }
    .into_manifest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SegmentNameFormat;

    fn ntp() -> Ntp {
        Ntp::kafka("test-topic", 0)
    }

    fn seg(base: i64, committed: i64, term: i64) -> SegmentMeta {
        SegmentMeta::new(Offset::new(base), Offset::new(committed), Term::new(term))
    }

    fn sample() -> PartitionManifest {
        let mut m = PartitionManifest::new(ntp(), RevisionId::new(5));
        m.add_segment(seg(0, 99, 1)).unwrap();
        m.add_segment(seg(100, 199, 1)).unwrap();
        let mut v2 = seg(200, 299, 2);
        v2.name_format = SegmentNameFormat::V2;
        v2.size_bytes = 2048;
        m.add_segment(v2).unwrap();
        m.advance_insync_offset(Offset::new(12)).unwrap();
        m
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode_snapshot(&sample()).unwrap();
        assert_eq!(bytes[0], SnapshotFormat::Current as u8);
        assert_eq!(&bytes[1..9], &12i64.to_le_bytes());

        let legacy = encode_legacy_snapshot(&sample()).unwrap();
        assert_eq!(legacy[0], SnapshotFormat::Legacy as u8);
        assert_eq!(&legacy[1..9], &12i64.to_le_bytes());
    }

    #[test]
    fn test_current_format_keeps_bookkeeping() {
        let mut m = sample();
        let mut compacted = seg(0, 99, 1);
        compacted.is_compacted = true;
        m.add_segment(compacted).unwrap();
        m.advance_start_offset(Offset::new(150));

        let decoded =
            decode_snapshot(&encode_snapshot(&m).unwrap(), &ntp(), RevisionId::new(5)).unwrap();
        assert_eq!(decoded.format, SnapshotFormat::Current);
        assert_eq!(decoded.offset, Offset::new(12));
        assert_eq!(decoded.manifest, m);
        assert_eq!(decoded.manifest.replaced_segments().len(), 1);
        assert_eq!(decoded.manifest.cleanup_backlog().len(), 1);
        assert_eq!(decoded.manifest.start_offset(), Some(Offset::new(100)));
    }

    #[test]
    fn test_legacy_format_recovers_terms_with_short_names() {
        let m = sample();
        let decoded = decode_snapshot(
            &encode_legacy_snapshot(&m).unwrap(),
            &ntp(),
            RevisionId::new(5),
        )
        .unwrap();

        assert_eq!(decoded.format, SnapshotFormat::Legacy);
        assert_eq!(decoded.manifest.len(), m.len());
        assert_eq!(decoded.manifest.insync_offset(), Offset::new(12));
        assert!(decoded.manifest.replaced_segments().is_empty());

        let last = decoded.manifest.last_segment().unwrap();
        assert_eq!(last.segment_term, Term::new(2));
        assert_eq!(last.size_bytes, 2048);
        assert_eq!(last.name_format, SegmentNameFormat::V1);
        assert_eq!(
            decoded.manifest.segment_name(&last.key()).unwrap(),
            "200-2-v1.log"
        );

        let mut expected = m.last_segment().unwrap().clone();
        expected.name_format = SegmentNameFormat::V1;
        assert_eq!(last, &expected);
        assert_eq!(decoded.manifest.first_segment(), m.first_segment());
    }

    #[test]
    fn test_legacy_synthesizes_unset_revision() {
        let legacy = LegacySnapshot {
            segments: vec![LegacySegment {
                ntp_revision_deprecated: RevisionId::UNSET,
                name: "0-3-v1.log".to_string(),
                meta: LegacySegmentMeta {
                    is_compacted: false,
                    size_bytes: 10,
                    base_offset: Offset::new(0),
                    committed_offset: Offset::new(9),
                    base_timestamp: None,
                    max_timestamp: None,
                    delta_offset: None,
                    ntp_revision: RevisionId::UNSET,
                    archiver_term: Term::new(3),
                },
            }],
        };
        let payload = wire_options().serialize(&legacy).unwrap();
        let bytes = with_header(SnapshotFormat::Legacy, Offset::new(4), &payload);

        let decoded = decode_snapshot(&bytes, &ntp(), RevisionId::new(77)).unwrap();
        let meta = decoded.manifest.first_segment().unwrap();
        assert_eq!(meta.ntp_revision, RevisionId::new(77));
        assert_eq!(meta.segment_term, Term::new(3));
        assert_eq!(decoded.manifest.get_start_offset(), Offset::new(0));
    }

    #[test]
    fn test_legacy_rejects_bad_name() {
        let legacy = LegacySnapshot {
            segments: vec![LegacySegment {
                ntp_revision_deprecated: RevisionId::new(1),
                name: "not-a-segment".to_string(),
                meta: LegacySegmentMeta {
                    is_compacted: false,
                    size_bytes: 0,
                    base_offset: Offset::new(0),
                    committed_offset: Offset::new(9),
                    base_timestamp: None,
                    max_timestamp: None,
                    delta_offset: None,
                    ntp_revision: RevisionId::new(1),
                    archiver_term: Term::new(1),
                },
            }],
        };
        let payload = wire_options().serialize(&legacy).unwrap();
        let bytes = with_header(SnapshotFormat::Legacy, Offset::new(0), &payload);
        assert!(matches!(
            decode_snapshot(&bytes, &ntp(), RevisionId::new(1)),
            Err(ArchivalError::Decode(_))
        ));
    }

    #[test]
    fn test_rejects_short_and_unknown() {
        assert!(decode_snapshot(&[1, 0, 0], &ntp(), RevisionId::new(1)).is_err());

        let mut bytes = encode_snapshot(&sample()).unwrap().to_vec();
        bytes[0] = 9;
        let err = decode_snapshot(&bytes, &ntp(), RevisionId::new(1)).unwrap_err();
        assert!(err.to_string().contains("unknown snapshot format tag 9"));
    }

    #[test]
    fn test_rejects_header_offset_mismatch() {
        let mut bytes = encode_snapshot(&sample()).unwrap().to_vec();
        bytes[1] = 13;
        assert!(decode_snapshot(&bytes, &ntp(), RevisionId::new(5)).is_err());
    }
}
