//! # Utility Modules
//!
//! Supporting utilities used throughout the server.
//!
//! ## Components
//! - **Rate limit**: Per-connection token buckets for messages, bytes, and
//!   login attempts
//! - **Metrics**: Thread-safe observability counters
//!
//! ## Security
//! - Cryptographically secure RNG (getrandom)
//! - Continuous linear bucket refill bounds abusive peers

pub mod metrics;
pub mod rate_limit;

// Re-export public types for advanced users
pub use rate_limit::{ConnectionLimiter, LoginGate, TokenBucket};
