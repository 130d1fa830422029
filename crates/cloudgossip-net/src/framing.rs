//! Message framing for the gossip wire protocol
//!
//! Every message crossing a multiplexed connection is a length-prefixed,
//! self-describing frame: the type byte identifies the message, the payload
//! is the postcard encoding of that message's body. Wire format:
//!
//! - 4 bytes: length (big-endian, includes the type byte)
//! - 1 byte: frame type
//! - N bytes: payload

use bytes::{Buf, BufMut, BytesMut};
use cloudgossip_core::{EntryDiff, EntryDiffData, EntryMetadata};
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("frame length {0} too short to carry a type byte")]
    TooShort(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
    #[error("payload error: {0}")]
    Payload(#[from] postcard::Error),
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }
}

/// Frame types, one per protocol phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Full metadata mapping of the sender's active entries
    Metadata = 0,
    /// Metadata-only deltas (timestamp newer, content identical)
    MetadataUpdate = 1,
    /// Keys the sender wants diff data for
    KeyList = 2,
    /// Diff-data advertisements for a set of keys
    DiffData = 3,
    /// The diffs themselves
    Diffs = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Metadata),
            1 => Ok(Self::MetadataUpdate),
            2 => Ok(Self::KeyList),
            3 => Ok(Self::DiffData),
            4 => Ok(Self::Diffs),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// Codec for length-prefixed frames
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        // The length covers the type byte, so anything shorter is malformed.
        if length < 1 {
            return Err(FrameError::TooShort(length));
        }
        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);
        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// The messages exchanged over a multiplexed connection, in the strict
/// alternating order each protocol phase defines. `DiffData(None)` and
/// `MetadataUpdate(None)` signal "nothing for you this phase" without
/// breaking the alternation.
#[derive(Clone, Debug, PartialEq)]
pub enum WireMessage {
    Metadata(HashMap<String, EntryMetadata>),
    MetadataUpdate(Option<HashMap<String, EntryMetadata>>),
    KeyList(Vec<String>),
    DiffData(Option<Vec<EntryDiffData>>),
    Diffs(Vec<EntryDiff>),
}

impl WireMessage {
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        let (frame_type, payload) = match self {
            Self::Metadata(map) => (FrameType::Metadata, postcard::to_allocvec(map)?),
            Self::MetadataUpdate(map) => (FrameType::MetadataUpdate, postcard::to_allocvec(map)?),
            Self::KeyList(keys) => (FrameType::KeyList, postcard::to_allocvec(keys)?),
            Self::DiffData(data) => (FrameType::DiffData, postcard::to_allocvec(data)?),
            Self::Diffs(diffs) => (FrameType::Diffs, postcard::to_allocvec(diffs)?),
        };
        Ok(Frame::new(frame_type, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        Ok(match frame.frame_type {
            FrameType::Metadata => Self::Metadata(postcard::from_bytes(&frame.payload)?),
            FrameType::MetadataUpdate => {
                Self::MetadataUpdate(postcard::from_bytes(&frame.payload)?)
            }
            FrameType::KeyList => Self::KeyList(postcard::from_bytes(&frame.payload)?),
            FrameType::DiffData => Self::DiffData(postcard::from_bytes(&frame.payload)?),
            FrameType::Diffs => Self::Diffs(postcard::from_bytes(&frame.payload)?),
        })
    }
}
