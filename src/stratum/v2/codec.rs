//! V2 plaintext framing
//!
//! Frame header, little-endian: `extension_type:u16 | msg_type:u8 |
//! msg_length:u24`, followed by `msg_length` payload bytes. The codec
//! enforces the configured frame ceiling on both directions.

use super::V2Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame header length in bytes.
pub const HEADER_LEN: usize = 6;

/// One decoded v2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub extension_type: u16,
    pub msg_type: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Self {
        Self { extension_type: 0, msg_type, payload: Bytes::from(payload) }
    }

    /// Serialize header + payload into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.extension_type.to_le_bytes());
        out.push(self.msg_type);
        let len = self.payload.len() as u32;
        out.extend_from_slice(&len.to_le_bytes()[..3]);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a whole frame from a plaintext buffer (used on the decrypted
    /// side of the noise transport, where record boundaries already exist).
    pub fn from_bytes(data: &[u8]) -> Result<Self, V2Error> {
        if data.len() < HEADER_LEN {
            return Err(V2Error::Truncated("frame header"));
        }
        let extension_type = u16::from_le_bytes([data[0], data[1]]);
        let msg_type = data[2];
        let len = u32::from_le_bytes([data[3], data[4], data[5], 0]) as usize;
        if data.len() != HEADER_LEN + len {
            return Err(V2Error::Truncated("frame payload"));
        }
        Ok(Self {
            extension_type,
            msg_type,
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..]),
        })
    }
}

/// Streaming codec for plaintext v2 frames.
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = V2Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, V2Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[3], src[4], src[5], 0]) as usize;
        if HEADER_LEN + len > self.max_frame_bytes {
            return Err(V2Error::Oversize { len: HEADER_LEN + len, max: self.max_frame_bytes });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        let extension_type = u16::from_le_bytes([src[0], src[1]]);
        let msg_type = src[2];
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { extension_type, msg_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = V2Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), V2Error> {
        let total = HEADER_LEN + frame.payload.len();
        if total > self.max_frame_bytes {
            return Err(V2Error::Oversize { len: total, max: self.max_frame_bytes });
        }
        dst.reserve(total);
        dst.put_u16_le(frame.extension_type);
        dst.put_u8(frame.msg_type);
        let len = frame.payload.len() as u32;
        dst.put_slice(&len.to_le_bytes()[..3]);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
