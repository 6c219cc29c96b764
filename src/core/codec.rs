//! Length-prefixed frame codec.
//!
//! Each frame on the wire is a 4-byte big-endian length N followed by N
//! payload bytes. Exactly one handshake frame or one envelope travels per
//! frame; no partial delivery is visible above this layer.
//!
//! The decoder accumulates bytes into the read buffer and yields a payload
//! once the full frame is present; the encoder writes the prefix and payload
//! as one reserved chunk so frames never interleave on a direction.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::error::ChatError;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Codec yielding whole frame payloads from a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ChatError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 {
            return Err(ChatError::Codec("zero-length frame".into()));
        }
        if len > MAX_FRAME_SIZE {
            return Err(ChatError::Codec(format!(
                "frame length {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }

        if src.len() < LENGTH_PREFIX + len {
            // Reserve what the rest of the frame needs so the next read can
            // complete it in one pass.
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(len).freeze();
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ChatError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.is_empty() {
            return Err(ChatError::Codec("refusing to write zero-length frame".into()));
        }
        if item.len() > MAX_FRAME_SIZE {
            return Err(ChatError::Codec(format!(
                "payload length {} exceeds maximum {MAX_FRAME_SIZE}",
                item.len()
            )));
        }

        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}
