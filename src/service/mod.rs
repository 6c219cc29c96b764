//! # Service Layer
//!
//! The connection engine proper: the per-connection state machine and I/O
//! drivers, the registry/router, the priority send queue, the maintenance
//! scheduler, and the pluggable authentication surface.

pub mod auth;
pub mod connection;
pub mod registry;
pub mod scheduler;
pub mod send_queue;

pub use auth::{AuthService, CredentialVerifier, Principal, StaticVerifier};
pub use connection::{ConnState, ConnectionContext, ConnectionHandle};
pub use registry::{BroadcastOutcome, Registry};
pub use send_queue::{Priority, QueuedMessage, SendQueue};
