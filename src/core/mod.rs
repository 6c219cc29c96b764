//! # Core Wire Components
//!
//! Low-level frame handling over a byte stream.
//!
//! This module provides the foundation for the protocol: length-prefixed
//! framing between the transport (TCP, optionally TLS) and the session layer.
//!
//! ## Components
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 1 MiB + envelope overhead (prevents memory exhaustion)
//! - Zero-length frames rejected
//! - Length validation before allocation

pub mod codec;

pub use codec::FrameCodec;
