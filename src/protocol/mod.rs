//! # Protocol Layer
//!
//! Everything between raw frames and the connection state machine: the
//! application message model, the envelope wire format, the session key
//! exchange, and the per-connection crypto context.

pub mod envelope;
pub mod handshake;
pub mod message;
pub mod session;

pub use envelope::Envelope;
pub use handshake::{CipherSuite, HandshakeFrame, SessionKeys};
pub use message::{ChatMessage, MessageKind};
pub use session::SessionCrypto;
