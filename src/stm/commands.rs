//! Commands replicated through the partition's log.
//!
//! Commands are the inputs to the archival state machine. Each one is
//! encoded as a single kind tag byte followed by the kind's payload, and
//! decoded by dispatching on that tag. An unknown tag is a decode error,
//! never silently skipped: it means corruption or a command written by a
//! newer version this replica cannot apply.

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{ArchivalError, ArchivalResult};
use crate::manifest::{PartitionManifest, SegmentKey, SegmentMeta};
use crate::types::Offset;

/// Binary encoding shared by commands and snapshots.
///
/// Fixed-width little-endian integers; trailing bytes are rejected so that a
/// payload written by a newer layout does not decode as a truncated one.
pub(crate) fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Tag identifying a command kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    AddSegments = 1,
    Truncate = 2,
    CleanupMetadata = 3,
}

impl CommandKind {
    /// Returns a string label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::AddSegments => "add_segments",
            CommandKind::Truncate => "truncate",
            CommandKind::CleanupMetadata => "cleanup_metadata",
        }
    }
}

impl TryFrom<u8> for CommandKind {
    type Error = ArchivalError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(CommandKind::AddSegments),
            2 => Ok(CommandKind::Truncate),
            3 => Ok(CommandKind::CleanupMetadata),
            other => Err(ArchivalError::Decode(format!(
                "unknown command tag {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AddSegmentsPayload {
    segments: Vec<(SegmentKey, SegmentMeta)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TruncatePayload {
    start_offset: Offset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CleanupMetadataPayload {
    segments: Vec<SegmentMeta>,
}

/// Commands that can be applied to the archival state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchivalCommand {
    /// Insert or replace segments, in order.
    AddSegments {
        segments: Vec<(SegmentKey, SegmentMeta)>,
    },

    /// Advance the start offset, evicting segments below it.
    Truncate { start_offset: Offset },

    /// Forget replaced and backlog segments whose remote objects are deleted.
    CleanupMetadata { segments: Vec<SegmentMeta> },
}

impl ArchivalCommand {
    /// Build an add-segments command carrying every segment of `delta`.
    pub fn add_segments(delta: &PartitionManifest) -> Self {
        ArchivalCommand::AddSegments {
            segments: delta
                .iter()
                .map(|(key, meta)| (*key, meta.clone()))
                .collect(),
        }
    }

    /// The wire tag of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            ArchivalCommand::AddSegments { .. } => CommandKind::AddSegments,
            ArchivalCommand::Truncate { .. } => CommandKind::Truncate,
            ArchivalCommand::CleanupMetadata { .. } => CommandKind::CleanupMetadata,
        }
    }

    /// Encode as tag byte plus payload.
    pub fn encode(&self) -> ArchivalResult<Bytes> {
        let payload = match self {
            ArchivalCommand::AddSegments { segments } => {
                wire_options().serialize(&AddSegmentsPayload {
                    segments: segments.clone(),
                })
            }
            ArchivalCommand::Truncate { start_offset } => {
                wire_options().serialize(&TruncatePayload {
                    start_offset: *start_offset,
                })
            }
            ArchivalCommand::CleanupMetadata { segments } => {
                wire_options().serialize(&CleanupMetadataPayload {
                    segments: segments.clone(),
                })
            }
        }
        .map_err(|e| ArchivalError::Encode(e.to_string()))?;

        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(self.kind() as u8);
        buf.put_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decode a command, dispatching on its tag byte.
    pub fn decode(bytes: &[u8]) -> ArchivalResult<Self> {
        let (tag, payload) = bytes
            .split_first()
            .ok_or_else(|| ArchivalError::Decode("empty command".to_string()))?;

        match CommandKind::try_from(*tag)? {
            CommandKind::AddSegments => {
                let p: AddSegmentsPayload = wire_options().deserialize(payload)?;
                Ok(ArchivalCommand::AddSegments {
                    segments: p.segments,
                })
            }
            CommandKind::Truncate => {
                let p: TruncatePayload = wire_options().deserialize(payload)?;
                Ok(ArchivalCommand::Truncate {
                    start_offset: p.start_offset,
                })
            }
            CommandKind::CleanupMetadata => {
                let p: CleanupMetadataPayload = wire_options().deserialize(payload)?;
                Ok(ArchivalCommand::CleanupMetadata {
                    segments: p.segments,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SegmentNameFormat;
    use crate::types::{Ntp, RevisionId, Term};

    fn seg(base: i64, committed: i64) -> SegmentMeta {
        SegmentMeta::new(Offset::new(base), Offset::new(committed), Term::new(1))
    }

    #[test]
    fn test_add_segments_from_delta_manifest() {
        let mut delta = PartitionManifest::new(Ntp::kafka("t", 0), RevisionId::new(9));
        delta.add_segment(seg(100, 199)).unwrap();
        delta.add_segment(seg(0, 99)).unwrap();

        let cmd = ArchivalCommand::add_segments(&delta);
        let ArchivalCommand::AddSegments { segments } = &cmd else {
            panic!("Expected AddSegments");
        };
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].0.base_offset, Offset::new(0));
        assert_eq!(segments[1].0.base_offset, Offset::new(100));
        assert_eq!(segments[0].1.ntp_revision, RevisionId::new(9));
    }

    #[test]
    fn test_tag_byte_leads_encoding() {
        let truncate = ArchivalCommand::Truncate {
            start_offset: Offset::new(101),
        };
        assert_eq!(truncate.encode().unwrap()[0], 2);

        let add = ArchivalCommand::AddSegments { segments: vec![] };
        assert_eq!(add.encode().unwrap()[0], 1);

        let cleanup = ArchivalCommand::CleanupMetadata { segments: vec![] };
        assert_eq!(cleanup.encode().unwrap()[0], 3);
    }

    #[test]
    fn test_decode_each_kind() {
        let mut compacted = seg(0, 999);
        compacted.is_compacted = true;
        compacted.name_format = SegmentNameFormat::V2;
        compacted.size_bytes = 1024;
        compacted.max_timestamp = Some(1_700_000_000_000);

        let commands = vec![
            ArchivalCommand::AddSegments {
                segments: vec![(compacted.key(), compacted.clone())],
            },
            ArchivalCommand::Truncate {
                start_offset: Offset::new(200),
            },
            ArchivalCommand::CleanupMetadata {
                segments: vec![compacted],
            },
        ];

        for cmd in commands {
            let bytes = cmd.encode().unwrap();
            assert_eq!(ArchivalCommand::decode(&bytes).unwrap(), cmd);
        }
    }

    #[test]
    fn test_unknown_tag_is_decode_error() {
        let mut bytes = ArchivalCommand::Truncate {
            start_offset: Offset::new(1),
        }
        .encode()
        .unwrap()
        .to_vec();
        bytes[0] = 42;

        let err = ArchivalCommand::decode(&bytes).unwrap_err();
        assert!(matches!(err, ArchivalError::Decode(ref msg) if msg.contains("42")));
    }

    #[test]
    fn test_empty_command_is_decode_error() {
        assert!(matches!(
            ArchivalCommand::decode(&[]),
            Err(ArchivalError::Decode(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_decode_error() {
        let bytes = ArchivalCommand::Truncate {
            start_offset: Offset::new(1),
        }
        .encode()
        .unwrap();
        assert!(ArchivalCommand::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = ArchivalCommand::Truncate {
            start_offset: Offset::new(1),
        }
        .encode()
        .unwrap()
        .to_vec();
        bytes.push(0);
        assert!(ArchivalCommand::decode(&bytes).is_err());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(CommandKind::AddSegments.as_str(), "add_segments");
        assert_eq!(CommandKind::Truncate.as_str(), "truncate");
        assert_eq!(CommandKind::CleanupMetadata.as_str(), "cleanup_metadata");
        assert!(CommandKind::try_from(0).is_err());
    }
}
