//! Remote object names for segments.
//!
//! V1 names carry only the key, V2 names also carry the committed offset and
//! size so that a recompacted segment never shares an object name with the
//! segment it replaced.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, i64 as parse_i64, u64 as parse_u64},
    combinator::{all_consuming, map},
    sequence::{terminated, tuple},
};

use super::segment::{SegmentKey, SegmentMeta, SegmentNameFormat};
use crate::types::{Ntp, Offset, RevisionId, Term};

const NAME_SUFFIX: &str = "-v1.log";

/// Name of a segment derived from its key alone.
pub fn local_segment_name(base_offset: Offset, term: Term) -> String {
    format!("{}-{}{}", base_offset, term, NAME_SUFFIX)
}

/// Name of a segment's remote object according to its naming scheme.
pub fn segment_name(meta: &SegmentMeta) -> String {
    match meta.name_format {
        SegmentNameFormat::V1 => local_segment_name(meta.base_offset, meta.segment_term),
        SegmentNameFormat::V2 => format!(
            "{}-{}-{}-{}{}",
            meta.base_offset, meta.committed_offset, meta.size_bytes, meta.segment_term, NAME_SUFFIX
        ),
    }
}

/// Full remote path of a segment object.
///
/// `default_revision` is used when the segment does not carry its own
/// partition revision.
pub fn remote_segment_path(ntp: &Ntp, meta: &SegmentMeta, default_revision: RevisionId) -> String {
    format!(
        "{}/{}/{}_{}/{}",
        ntp.namespace(),
        ntp.topic(),
        ntp.partition(),
        meta.ntp_revision_or(default_revision),
        segment_name(meta)
    )
}

/// Parsed form of a segment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSegmentName {
    pub key: SegmentKey,
    pub format: SegmentNameFormat,
    /// Present for V2 names only.
    pub committed_offset: Option<Offset>,
    /// Present for V2 names only.
    pub size_bytes: Option<u64>,
}

fn v2_name(input: &str) -> IResult<&str, ParsedSegmentName> {
    map(
        terminated(
            tuple((
                parse_i64,
                char('-'),
                parse_i64,
                char('-'),
                parse_u64,
                char('-'),
                parse_i64,
            )),
            tag(NAME_SUFFIX),
        ),
        |(base, _, committed, _, size, _, term)| ParsedSegmentName {
            key: SegmentKey::new(Offset::new(base), Term::new(term)),
            format: SegmentNameFormat::V2,
            committed_offset: Some(Offset::new(committed)),
            size_bytes: Some(size),
        },
    )(input)
}

fn v1_name(input: &str) -> IResult<&str, ParsedSegmentName> {
    map(
        terminated(tuple((parse_i64, char('-'), parse_i64)), tag(NAME_SUFFIX)),
        |(base, _, term)| ParsedSegmentName {
            key: SegmentKey::new(Offset::new(base), Term::new(term)),
            format: SegmentNameFormat::V1,
            committed_offset: None,
            size_bytes: None,
        },
    )(input)
}

/// Parse a V1 or V2 segment name. Returns `None` for anything else.
pub fn parse_segment_name(name: &str) -> Option<ParsedSegmentName> {
    all_consuming(alt((v2_name, v1_name)))(name)
        .ok()
        .map(|(_, parsed)| parsed)
}
