//! # Transport Layer
//!
//! The listening endpoint: TCP accept loop, socket configuration, optional
//! TLS termination, and handoff of accepted connections to the service
//! layer.

pub mod acceptor;
pub mod tls;

pub use acceptor::{ChatServer, ShutdownHandle};
