//! # SecureChat Server
//!
//! A multi-user real-time chat server. Clients hold one long-lived,
//! optionally TLS-protected connection, authenticate, and exchange framed
//! messages routed point-to-point or broadcast. Above the transport, every
//! application message rides in a session envelope providing
//! confidentiality, integrity, replay protection, and forward secrecy
//! through periodic rekeying.
//!
//! ## Layers
//!
//! - [`core`]: length-prefixed frame codec over a byte stream
//! - [`protocol`]: message model, envelope format, key exchange, session
//!   crypto
//! - [`service`]: connection state machine, registry/router, send queue,
//!   scheduler, auth surface
//! - [`transport`]: acceptor and TLS termination
//! - [`utils`]: rate limiting and metrics
//!
//! ## Data Path
//!
//! ```text
//! socket ──► TLS (optional) ──► frame codec ──► envelope decrypt ──► JSON ──► dispatch
//!                                                                              │
//! socket ◄── TLS (optional) ◄── frame codec ◄── envelope encrypt ◄── send queue
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use securechat::config::ServerConfig;
//! use securechat::service::auth::StaticVerifier;
//! use securechat::transport::ChatServer;
//!
//! #[tokio::main]
//! async fn main() -> securechat::error::Result<()> {
//!     let config = ServerConfig::default();
//!     let verifier = StaticVerifier::from_config(&config.auth);
//!     let server = ChatServer::bind(config, Box::new(verifier)).await?;
//!     server.run().await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::ServerConfig;
pub use error::{ChatError, Result};
pub use protocol::{ChatMessage, MessageKind};
pub use service::{ConnState, Registry};
pub use transport::{ChatServer, ShutdownHandle};
