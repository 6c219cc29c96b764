//! Session envelope wire format.
//!
//! Once key exchange completes, every frame payload is one envelope:
//!
//! ```text
//! [Version(1)=1] [Seq(8)] [Timestamp(8)] [IV(16)] [CiphertextLen(4)] [Ciphertext(N)] [Tag(32)]
//! ```
//!
//! All integers are network byte order. Handshake frames use version byte 0
//! and a JSON body instead; [`is_handshake_frame`] distinguishes the two
//! before parsing.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ChatError, Result};

/// Version byte opening every envelope.
pub const ENVELOPE_VERSION: u8 = 1;

/// Version byte opening every pre-session handshake frame.
pub const HANDSHAKE_VERSION: u8 = 0;

/// Random per-message IV length.
pub const IV_LEN: usize = 16;

/// HMAC-SHA256 tag length.
pub const TAG_LEN: usize = 32;

/// Fixed bytes before the ciphertext.
pub const HEADER_LEN: usize = 1 + 8 + 8 + IV_LEN + 4;

/// One encrypted application message in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Per-direction sequence number, starting at 0
    pub seq: u64,
    /// Sender clock at encrypt time, unix milliseconds (informational)
    pub timestamp_ms: u64,
    /// Random IV for this message
    pub iv: [u8; IV_LEN],
    /// AES-256-CTR output
    pub ciphertext: Vec<u8>,
    /// HMAC-SHA256 over seq, timestamp, iv, and ciphertext
    pub tag: [u8; TAG_LEN],
}

impl Envelope {
    /// Serialize to the binary wire layout.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.ciphertext.len() + TAG_LEN);
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u64(self.seq);
        buf.put_u64(self.timestamp_ms);
        buf.put_slice(&self.iv);
        buf.put_u32(self.ciphertext.len() as u32);
        buf.put_slice(&self.ciphertext);
        buf.put_slice(&self.tag);
        buf.freeze()
    }

    /// Parse the binary wire layout.
    ///
    /// Malformed envelopes are fatal: the framing below this layer is
    /// length-checked, so a structural mismatch here means a corrupted or
    /// hostile peer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + TAG_LEN {
            return Err(ChatError::DecryptFailed("envelope too short"));
        }
        if buf[0] != ENVELOPE_VERSION {
            return Err(ChatError::DecryptFailed("unknown envelope version"));
        }

        let seq = u64::from_be_bytes(buf[1..9].try_into().expect("slice length checked"));
        let timestamp_ms = u64::from_be_bytes(buf[9..17].try_into().expect("slice length checked"));
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&buf[17..17 + IV_LEN]);

        let len_off = 17 + IV_LEN;
        let ct_len =
            u32::from_be_bytes(buf[len_off..len_off + 4].try_into().expect("slice length checked"))
                as usize;
        if ct_len > MAX_PAYLOAD_SIZE {
            return Err(ChatError::DecryptFailed("ciphertext length out of range"));
        }

        let ct_off = len_off + 4;
        if buf.len() != ct_off + ct_len + TAG_LEN {
            return Err(ChatError::DecryptFailed("envelope length mismatch"));
        }

        let ciphertext = buf[ct_off..ct_off + ct_len].to_vec();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&buf[ct_off + ct_len..]);

        Ok(Self {
            seq,
            timestamp_ms,
            iv,
            ciphertext,
            tag,
        })
    }
}

/// Whether a frame payload is a pre-session handshake frame (version byte 0)
/// rather than an envelope.
pub fn is_handshake_frame(payload: &[u8]) -> bool {
    payload.first() == Some(&HANDSHAKE_VERSION)
}
