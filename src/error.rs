//! # Error Types
//!
//! Comprehensive error handling for the chat server.
//!
//! This module defines all error variants that can occur between accepting a
//! socket and tearing a connection down, from low-level I/O failures to
//! session-crypto violations.
//!
//! ## Error Categories
//! - **Startup errors**: configuration and bind failures (abort the process)
//! - **Connection errors**: TLS/key-exchange/integrity failures (terminate the
//!   connection)
//! - **Recoverable errors**: rate limiting and application decode errors (the
//!   peer is informed, the connection stays up)
//! - **Send-path errors**: queue overflow and delivery timeouts (the sender is
//!   notified, traffic continues)
//!
//! The fatal/recoverable split is encoded in [`ChatError::is_fatal`]: crypto
//! and framing integrity violations always terminate the connection, while
//! application-level decode errors never do.

use std::io;
use thiserror::Error;

/// Primary error type for all server operations.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Configuration failed validation. Startup aborts with exit code 1.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The listen socket could not be bound. Startup aborts with exit code 1.
    #[error("bind failed: {0}")]
    BindFailed(io::Error),

    /// TLS termination failed during the transport handshake.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// The session key exchange could not complete.
    #[error("key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// Credentials were rejected. The peer is informed; the failure counts
    /// toward the login lockout.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A rate-limit dimension was exhausted on the receive path.
    #[error("rate limited: {0}")]
    RateLimited(&'static str),

    /// HMAC verification of an envelope failed.
    #[error("envelope integrity check failed")]
    IntegrityFailed,

    /// An envelope arrived with a sequence number that is not the next
    /// expected one. Gaps and repeats are equally fatal on an ordered
    /// transport.
    #[error("sequence violation: expected {expected}, got {got}")]
    ReplayDetected {
        /// The sequence number the receiver expected next.
        expected: u64,
        /// The sequence number carried by the rejected envelope.
        got: u64,
    },

    /// The envelope was structurally malformed or could not be decrypted.
    #[error("decrypt failed: {0}")]
    DecryptFailed(&'static str),

    /// The plaintext was not a valid application message. Recoverable: the
    /// peer receives an error frame.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// A frame violated the length-prefixed wire format.
    #[error("frame codec error: {0}")]
    Codec(String),

    /// The peer sent a frame that is not allowed in the current state.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The per-connection send queue is at capacity with no Low entry to
    /// evict.
    #[error("send queue full")]
    QueueFull,

    /// No delivery acknowledgement arrived within the configured window.
    #[error("delivery ack timeout for message {0}")]
    AckTimeout(String),

    /// A targeted send named a user that is not connected and authenticated.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The transport closed underneath us.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation was abandoned because the server is shutting down.
    #[error("cancelled by shutdown")]
    CancelledShutdown,

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization failure outside the message decode path.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Whether this error must terminate the connection.
    ///
    /// Crypto and framing integrity violations never recover; decode and
    /// rate-limit errors are answered with an error frame and the connection
    /// stays up.
    pub fn is_fatal(&self) -> bool {
        match self {
            ChatError::TlsHandshakeFailed(_)
            | ChatError::KeyExchangeFailed(_)
            | ChatError::IntegrityFailed
            | ChatError::ReplayDetected { .. }
            | ChatError::DecryptFailed(_)
            | ChatError::Codec(_)
            | ChatError::Protocol(_)
            | ChatError::ConnectionClosed
            | ChatError::CancelledShutdown
            | ChatError::Io(_) => true,

            ChatError::RateLimited(_)
            | ChatError::DecodeError(_)
            | ChatError::AuthFailed(_)
            | ChatError::QueueFull
            | ChatError::AckTimeout(_)
            | ChatError::PeerNotFound(_) => false,

            // Startup errors never reach a live connection.
            ChatError::ConfigInvalid(_) | ChatError::BindFailed(_) | ChatError::Json(_) => true,
        }
    }

    /// Short machine-readable code carried in outbound error frames.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::ConfigInvalid(_) => "CONFIG_INVALID",
            ChatError::BindFailed(_) => "BIND_FAILED",
            ChatError::TlsHandshakeFailed(_) => "TLS_HANDSHAKE_FAILED",
            ChatError::KeyExchangeFailed(_) => "KEY_EXCHANGE_FAILED",
            ChatError::AuthFailed(_) => "AUTH_FAILED",
            ChatError::RateLimited(_) => "RATE_LIMITED",
            ChatError::IntegrityFailed => "INTEGRITY_FAILED",
            ChatError::ReplayDetected { .. } => "REPLAY_DETECTED",
            ChatError::DecryptFailed(_) => "DECRYPT_FAILED",
            ChatError::DecodeError(_) => "DECODE_ERROR",
            ChatError::Codec(_) => "CODEC_ERROR",
            ChatError::Protocol(_) => "PROTOCOL_ERROR",
            ChatError::QueueFull => "QUEUE_FULL",
            ChatError::AckTimeout(_) => "MESSAGE_FAILED",
            ChatError::PeerNotFound(_) => "PEER_NOT_FOUND",
            ChatError::ConnectionClosed => "CONNECTION_CLOSED",
            ChatError::CancelledShutdown => "CANCELLED_SHUTDOWN",
            ChatError::Io(_) => "IO_ERROR",
            ChatError::Json(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Type alias for Results using ChatError
pub type Result<T> = std::result::Result<T, ChatError>;
