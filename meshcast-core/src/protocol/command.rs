//! Control command codec.
//!
//! Commands travel as compact JSON objects `{"c": code, "i": id, "s": size,
//! "m": map}`. Frames share the channel with raw payload chunks; a frame is
//! only treated as a command when it looks like a JSON object (`{"` ... `}`)
//! and parses as JSON. Once parsed, the command is validated strictly.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ProtocolError;
use super::availability::SegmentsMapPayload;
use crate::segment::SegmentId;

const SEGMENT_DATA: u8 = 0;
const SEGMENT_ABSENT: u8 = 1;
const SEGMENTS_MAP: u8 = 2;
const SEGMENT_REQUEST: u8 = 3;
const CANCEL_SEGMENT_REQUEST: u8 = 4;

/// Control messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Header announcing `size` payload bytes for `segment_id`
    SegmentData { segment_id: SegmentId, size: usize },
    /// The requested segment is not held
    SegmentAbsent { segment_id: SegmentId },
    /// Advertises the sender's availability
    SegmentsMap { map: SegmentsMapPayload },
    /// Asks the receiver to send a segment
    SegmentRequest { segment_id: SegmentId },
    /// Abandons an outstanding request
    CancelSegmentRequest { segment_id: SegmentId },
}

/// One decoded channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command(PeerCommand),
    /// Looked like a command but failed validation
    Malformed(ProtocolError),
    /// Raw segment bytes
    Payload(Bytes),
}

#[derive(Debug, Serialize, Deserialize)]
struct RawCommand {
    c: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    i: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    m: Option<serde_json::Value>,
}

impl PeerCommand {
    /// Serializes the command into a channel frame.
    pub fn encode(&self) -> Bytes {
        let raw = match self {
            PeerCommand::SegmentData { segment_id, size } => RawCommand {
                c: SEGMENT_DATA,
                i: Some(segment_id.to_string()),
                s: Some(*size as u64),
                m: None,
            },
            PeerCommand::SegmentAbsent { segment_id } => RawCommand {
                c: SEGMENT_ABSENT,
                i: Some(segment_id.to_string()),
                s: None,
                m: None,
            },
            PeerCommand::SegmentsMap { map } => RawCommand {
                c: SEGMENTS_MAP,
                i: None,
                s: None,
                m: serde_json::to_value(map).ok(),
            },
            PeerCommand::SegmentRequest { segment_id } => RawCommand {
                c: SEGMENT_REQUEST,
                i: Some(segment_id.to_string()),
                s: None,
                m: None,
            },
            PeerCommand::CancelSegmentRequest { segment_id } => RawCommand {
                c: CANCEL_SEGMENT_REQUEST,
                i: Some(segment_id.to_string()),
                s: None,
                m: None,
            },
        };

        // Serializing plain strings, integers and a JSON value cannot fail
        Bytes::from(serde_json::to_vec(&raw).unwrap_or_default())
    }

    fn from_raw(raw: RawCommand) -> Result<Self, ProtocolError> {
        let segment_id = |raw: &RawCommand| {
            raw.i
                .as_deref()
                .map(SegmentId::from)
                .ok_or_else(|| ProtocolError::MalformedCommand {
                    reason: format!("command {} is missing a segment id", raw.c),
                })
        };

        match raw.c {
            SEGMENT_DATA => {
                let segment_id = segment_id(&raw)?;
                let size = raw
                    .s
                    .and_then(|size| usize::try_from(size).ok())
                    .ok_or_else(|| ProtocolError::MalformedCommand {
                        reason: format!("segment data header for {segment_id} has no valid size"),
                    })?;
                Ok(PeerCommand::SegmentData { segment_id, size })
            }
            SEGMENT_ABSENT => Ok(PeerCommand::SegmentAbsent {
                segment_id: segment_id(&raw)?,
            }),
            SEGMENTS_MAP => {
                let value = raw.m.ok_or_else(|| ProtocolError::MalformedSegmentsMap {
                    reason: "missing map".to_string(),
                })?;
                Ok(PeerCommand::SegmentsMap {
                    map: SegmentsMapPayload::from_value(value)?,
                })
            }
            SEGMENT_REQUEST => Ok(PeerCommand::SegmentRequest {
                segment_id: segment_id(&raw)?,
            }),
            CANCEL_SEGMENT_REQUEST => Ok(PeerCommand::CancelSegmentRequest {
                segment_id: segment_id(&raw)?,
            }),
            code => Err(ProtocolError::MalformedCommand {
                reason: format!("unknown command code {code}"),
            }),
        }
    }
}

/// Classifies a frame received from a peer.
pub fn decode_frame(frame: Bytes) -> Frame {
    if !looks_like_command(&frame) {
        return Frame::Payload(frame);
    }

    // Binary data that merely resembles JSON stays payload
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&frame) else {
        return Frame::Payload(frame);
    };

    let raw = match serde_json::from_value::<RawCommand>(value) {
        Ok(raw) => raw,
        Err(e) => {
            return Frame::Malformed(ProtocolError::MalformedCommand {
                reason: e.to_string(),
            });
        }
    };

    match PeerCommand::from_raw(raw) {
        Ok(command) => Frame::Command(command),
        Err(error) => Frame::Malformed(error),
    }
}

fn looks_like_command(frame: &[u8]) -> bool {
    frame.len() >= 3 && frame.starts_with(b"{\"") && frame.ends_with(b"}")
}
