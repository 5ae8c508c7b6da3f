//! Tagged wire framing for catalogue values and queue records.
//!
//! A bare value is a version byte at offset 0, a record tag byte, then the
//! serialized body; catalogue entries and queue slots store this form, since
//! the container already bounds the bytes. Stream and file transport
//! prepends a little-endian `u32` length covering everything after the
//! prefix. Tag numbering is stable; decoders reject unknown versions and
//! tags so such frames can be dead-lettered rather than misread.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{
    Bundle, BuildOutput, BuildRequest, ConfirmedVulnerability, Crash, DeadLetter, DownloadedSources, PatchRequest,
    PatchResult, PovReproduceRequest, PovReproduceResponse, RawCrash, SeedRequest,
    SubmissionEntry, TaskDelete, TaskDownload, TaskReady, TaskRecord, TracedCrash,
    VulnDiscoveryRequest, WeightedHarness,
};

/// Current frame version, at offset 0 of every bare value.
pub const FRAME_VERSION: u8 = 1;

/// Hard cap on a single frame. Larger payloads (crash inputs, artifacts)
/// travel as filesystem paths, never inline.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4 + 2;

/// Stable record tags. Numbers are wire format; never reuse a retired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    TaskDownload = 1,
    TaskReady = 2,
    TaskDelete = 3,
    BuildRequest = 4,
    BuildOutput = 5,
    RawCrash = 6,
    Crash = 7,
    TracedCrash = 8,
    ConfirmedVulnerability = 9,
    PatchRequest = 10,
    PatchResult = 11,
    PovReproduceRequest = 12,
    PovReproduceResponse = 13,
    SeedRequest = 14,
    VulnDiscoveryRequest = 15,
    DeadLetter = 16,
    TaskRecord = 17,
    SubmissionEntry = 18,
    WeightedHarness = 19,
    Bundle = 20,
    DownloadedSources = 21,
}

impl RecordTag {
    pub fn from_u8(byte: u8) -> Option<RecordTag> {
        use RecordTag::*;
        Some(match byte {
            1 => TaskDownload,
            2 => TaskReady,
            3 => TaskDelete,
            4 => BuildRequest,
            5 => BuildOutput,
            6 => RawCrash,
            7 => Crash,
            8 => TracedCrash,
            9 => ConfirmedVulnerability,
            10 => PatchRequest,
            11 => PatchResult,
            12 => PovReproduceRequest,
            13 => PovReproduceResponse,
            14 => SeedRequest,
            15 => VulnDiscoveryRequest,
            16 => DeadLetter,
            17 => TaskRecord,
            18 => SubmissionEntry,
            19 => WeightedHarness,
            20 => Bundle,
            21 => DownloadedSources,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        use RecordTag::*;
        match self {
            TaskDownload => "task_download",
            TaskReady => "task_ready",
            TaskDelete => "task_delete",
            BuildRequest => "build_request",
            BuildOutput => "build_output",
            RawCrash => "raw_crash",
            Crash => "crash",
            TracedCrash => "traced_crash",
            ConfirmedVulnerability => "confirmed_vulnerability",
            PatchRequest => "patch_request",
            PatchResult => "patch_result",
            PovReproduceRequest => "pov_reproduce_request",
            PovReproduceResponse => "pov_reproduce_response",
            SeedRequest => "seed_request",
            VulnDiscoveryRequest => "vuln_discovery_request",
            DeadLetter => "dead_letter",
            TaskRecord => "task_record",
            SubmissionEntry => "submission_entry",
            WeightedHarness => "weighted_harness",
            Bundle => "bundle",
            DownloadedSources => "downloaded_sources",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("frame length {len} exceeds cap of {MAX_FRAME_LEN} bytes")]
    Oversize { len: usize },
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown record tag {0}")]
    UnknownTag(u8),
    #[error("expected {expected:?} frame, got {got:?}")]
    TagMismatch { expected: RecordTag, got: RecordTag },
    #[error("frame body: {0}")]
    Body(#[from] serde_json::Error),
}

/// A record type with a fixed wire tag.
pub trait Framed: Serialize + DeserializeOwned {
    const TAG: RecordTag;
}

macro_rules! framed {
    ($($ty:ty => $tag:ident),+ $(,)?) => {
        $(impl Framed for $ty {
            const TAG: RecordTag = RecordTag::$tag;
        })+
    };
}

framed! {
    TaskDownload => TaskDownload,
    TaskReady => TaskReady,
    TaskDelete => TaskDelete,
    BuildRequest => BuildRequest,
    BuildOutput => BuildOutput,
    RawCrash => RawCrash,
    Crash => Crash,
    TracedCrash => TracedCrash,
    ConfirmedVulnerability => ConfirmedVulnerability,
    PatchRequest => PatchRequest,
    PatchResult => PatchResult,
    PovReproduceRequest => PovReproduceRequest,
    PovReproduceResponse => PovReproduceResponse,
    SeedRequest => SeedRequest,
    VulnDiscoveryRequest => VulnDiscoveryRequest,
    DeadLetter => DeadLetter,
    TaskRecord => TaskRecord,
    SubmissionEntry => SubmissionEntry,
    WeightedHarness => WeightedHarness,
    Bundle => Bundle,
    DownloadedSources => DownloadedSources,
}

/// Encode a record into a bare value: version byte at offset 0, then the tag,
/// then the body. This is the form stored in registry catalogues and queue
/// slots, where the container already bounds the bytes.
pub fn encode_value<T: Framed>(value: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(value)?;
    let payload_len = 2 + body.len();
    if payload_len > MAX_FRAME_LEN {
        return Err(FrameError::Oversize { len: payload_len });
    }
    let mut out = Vec::with_capacity(payload_len);
    out.push(FRAME_VERSION);
    out.push(T::TAG as u8);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Encode a record into a complete length-prefixed frame for stream or file
/// transport.
pub fn encode<T: Framed>(value: &T) -> Result<Vec<u8>, FrameError> {
    let payload = encode_value(value)?;
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn split_value(bytes: &[u8]) -> Result<(RecordTag, &[u8]), FrameError> {
    if bytes.len() < 2 {
        return Err(FrameError::Truncated {
            expected: 2,
            got: bytes.len(),
        });
    }
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversize { len: bytes.len() });
    }
    let version = bytes[0];
    if version != FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let tag = RecordTag::from_u8(bytes[1]).ok_or(FrameError::UnknownTag(bytes[1]))?;
    Ok((tag, &bytes[2..]))
}

fn split_frame(bytes: &[u8]) -> Result<(RecordTag, &[u8]), FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN,
            got: bytes.len(),
        });
    }
    let payload_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if payload_len > MAX_FRAME_LEN {
        return Err(FrameError::Oversize { len: payload_len });
    }
    if payload_len < 2 || bytes.len() < 4 + payload_len {
        return Err(FrameError::Truncated {
            expected: 4 + payload_len.max(2),
            got: bytes.len(),
        });
    }
    split_value(&bytes[4..4 + payload_len])
}

/// Decode a bare value (no length prefix) into a known record type.
pub fn decode_value<T: Framed>(bytes: &[u8]) -> Result<T, FrameError> {
    let (tag, body) = split_value(bytes)?;
    if tag != T::TAG {
        return Err(FrameError::TagMismatch {
            expected: T::TAG,
            got: tag,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

/// Decode a bare value into its tag and an untyped JSON body.
pub fn decode_value_any(bytes: &[u8]) -> Result<(RecordTag, serde_json::Value), FrameError> {
    let (tag, body) = split_value(bytes)?;
    Ok((tag, serde_json::from_slice(body)?))
}

/// Decode a length-prefixed frame into a known record type, rejecting tag
/// mismatches.
pub fn decode<T: Framed>(bytes: &[u8]) -> Result<T, FrameError> {
    let (tag, body) = split_frame(bytes)?;
    if tag != T::TAG {
        return Err(FrameError::TagMismatch {
            expected: T::TAG,
            got: tag,
        });
    }
    Ok(serde_json::from_slice(body)?)
}

/// Read the tag of a length-prefixed frame without decoding the body.
pub fn peek_tag(bytes: &[u8]) -> Result<RecordTag, FrameError> {
    split_frame(bytes).map(|(tag, _)| tag)
}

/// Decode a length-prefixed frame into its tag and an untyped JSON body, for
/// observability surfaces that print records without knowing their type up
/// front.
pub fn decode_any(bytes: &[u8]) -> Result<(RecordTag, serde_json::Value), FrameError> {
    let (tag, body) = split_frame(bytes)?;
    Ok((tag, serde_json::from_slice(body)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ready() -> TaskReady {
        TaskReady {
            task_id: "t1".to_string(),
        }
    }

    #[test]
    fn round_trips_a_record() {
        let record = sample_ready();
        let bytes = encode(&record).expect("encode");
        let decoded: TaskReady = decode(&bytes).expect("decode");
        assert_eq!(decoded.task_id, record.task_id);
    }

    #[test]
    fn frame_layout_has_version_then_tag() {
        let bytes = encode(&sample_ready()).expect("encode");
        assert_eq!(bytes[4], FRAME_VERSION);
        assert_eq!(bytes[5], RecordTag::TaskReady as u8);
        let payload_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + payload_len);
    }

    #[test]
    fn rejects_truncated_frames() {
        let bytes = encode(&sample_ready()).expect("encode");
        for cut in [0, 3, 5, bytes.len() - 1] {
            let err = decode::<TaskReady>(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, FrameError::Truncated { .. }), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode(&sample_ready()).expect("encode");
        bytes[4] = 99;
        let err = decode::<TaskReady>(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedVersion(99)));
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut bytes = encode(&sample_ready()).expect("encode");
        bytes[5] = 250;
        let err = decode::<TaskReady>(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::UnknownTag(250)));
    }

    #[test]
    fn rejects_tag_mismatch() {
        let bytes = encode(&sample_ready()).expect("encode");
        let err = decode::<TaskDelete>(&bytes).unwrap_err();
        assert!(matches!(
            err,
            FrameError::TagMismatch {
                expected: RecordTag::TaskDelete,
                got: RecordTag::TaskReady,
            }
        ));
    }

    #[test]
    fn rejects_oversize_declared_length() {
        let mut bytes = encode(&sample_ready()).expect("encode");
        let huge = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        bytes[..4].copy_from_slice(&huge);
        let err = decode::<TaskReady>(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::Oversize { .. }));
    }

    #[test]
    fn bare_value_has_version_at_offset_zero() {
        let bytes = encode_value(&sample_ready()).expect("encode_value");
        assert_eq!(bytes[0], FRAME_VERSION);
        assert_eq!(bytes[1], RecordTag::TaskReady as u8);
        let decoded: TaskReady = decode_value(&bytes).expect("decode_value");
        assert_eq!(decoded.task_id, "t1");
    }

    #[test]
    fn frame_is_length_prefixed_value() {
        let value = encode_value(&sample_ready()).expect("encode_value");
        let frame = encode(&sample_ready()).expect("encode");
        assert_eq!(&frame[4..], &value[..]);
    }

    #[test]
    fn decode_value_rejects_tag_mismatch() {
        let bytes = encode_value(&sample_ready()).expect("encode_value");
        assert!(matches!(
            decode_value::<TaskDelete>(&bytes).unwrap_err(),
            FrameError::TagMismatch { .. }
        ));
    }

    #[test]
    fn peek_tag_reads_without_decoding() {
        let bytes = encode(&sample_ready()).expect("encode");
        assert_eq!(peek_tag(&bytes).expect("peek"), RecordTag::TaskReady);
    }

    #[test]
    fn decode_any_yields_tag_and_json() {
        let bytes = encode(&sample_ready()).expect("encode");
        let (tag, json) = decode_any(&bytes).expect("decode_any");
        assert_eq!(tag, RecordTag::TaskReady);
        assert_eq!(json["task_id"], "t1");
    }

    #[test]
    fn every_tag_byte_round_trips_through_from_u8() {
        for byte in 1u8..=21 {
            let tag = RecordTag::from_u8(byte).expect("known tag");
            assert_eq!(tag as u8, byte);
            assert!(!tag.name().is_empty());
        }
        assert!(RecordTag::from_u8(0).is_none());
        assert!(RecordTag::from_u8(22).is_none());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// The decoder never panics on arbitrary bytes.
            #[test]
            fn decode_any_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
                let _ = decode_any(&bytes);
                let _ = peek_tag(&bytes);
                let _ = decode::<TaskReady>(&bytes);
                let _ = decode_value_any(&bytes);
                let _ = decode_value::<TaskReady>(&bytes);
            }

            /// Framed records decode to a value equal to their source.
            #[test]
            fn task_ready_round_trip(task_id in "[a-zA-Z0-9_-]{1,40}") {
                let record = TaskReady { task_id: task_id.clone() };
                let bytes = encode(&record).unwrap();
                let decoded: TaskReady = decode(&bytes).unwrap();
                prop_assert_eq!(decoded.task_id, task_id);
            }

            #[test]
            fn patch_request_round_trip(
                ipid in "[a-f0-9-]{1,36}",
                task_id in "[a-zA-Z0-9_-]{1,40}",
                attempt in 1u32..10,
            ) {
                let record = PatchRequest {
                    internal_patch_id: ipid.clone(),
                    task_id: task_id.clone(),
                    attempt,
                };
                let bytes = encode(&record).unwrap();
                let decoded: PatchRequest = decode(&bytes).unwrap();
                prop_assert_eq!(decoded.internal_patch_id, ipid);
                prop_assert_eq!(decoded.task_id, task_id);
                prop_assert_eq!(decoded.attempt, attempt);
            }
        }
    }
}
