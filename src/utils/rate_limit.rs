//! Per-connection token buckets.
//!
//! Three independent dimensions guard the receive path: messages per
//! second, bytes per second, and login attempts per minute. Tokens refill
//! continuously at the configured rate; an operation that would overdraw the
//! bucket is rejected and the peer receives a RateLimited error frame.
//! Exhausting the login bucket locks the connection out for the configured
//! duration.
//!
//! The limiter is connection-local and never coordinates across connections.

use std::time::{Duration, Instant};

use crate::config::LimitsConfig;

/// A single continuously refilling token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to take `amount` tokens. Returns false without consuming anything
    /// when the bucket cannot cover it.
    pub fn try_consume(&mut self, amount: f64) -> bool {
        self.try_consume_at(amount, Instant::now())
    }

    fn try_consume_at(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Whether the bucket could cover `amount` right now, without consuming.
    pub fn can_cover(&mut self, amount: f64) -> bool {
        self.refill(Instant::now());
        self.tokens >= amount
    }

    /// Current token count, after refilling.
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

/// Outcome of a login-attempt check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginGate {
    /// The attempt may proceed.
    Allowed,
    /// The bucket is exhausted; the connection is locked out until the
    /// contained deadline.
    LockedOut,
}

/// All rate dimensions for one connection.
#[derive(Debug)]
pub struct ConnectionLimiter {
    messages: TokenBucket,
    bytes: TokenBucket,
    logins: TokenBucket,
    locked_until: Option<Instant>,
    lockout: Duration,
}

impl ConnectionLimiter {
    /// Build buckets from the configured limits.
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            messages: TokenBucket::new(limits.burst as f64, limits.messages_per_sec as f64),
            bytes: TokenBucket::new(limits.bytes_burst as f64, limits.bytes_per_sec as f64),
            logins: TokenBucket::new(
                limits.login_attempts_per_min as f64,
                limits.login_attempts_per_min as f64 / 60.0,
            ),
            locked_until: None,
            lockout: limits.lockout(),
        }
    }

    /// Charge one inbound message of the given size. Returns false when
    /// either dimension is exhausted.
    ///
    /// A rejected message consumes nothing: both buckets are checked before
    /// either is charged, so one exhausted dimension cannot drain the other.
    pub fn allow_message(&mut self, bytes: usize) -> bool {
        if !self.messages.can_cover(1.0) || !self.bytes.can_cover(bytes as f64) {
            return false;
        }
        // Refill only ever adds tokens, so these cannot fail after the
        // checks above.
        self.messages.try_consume(1.0) && self.bytes.try_consume(bytes as f64)
    }

    /// Gate a login attempt. Each call consumes one attempt; exhausting the
    /// bucket starts the lockout clock.
    pub fn allow_login(&mut self) -> LoginGate {
        let now = Instant::now();
        if let Some(until) = self.locked_until {
            if now < until {
                return LoginGate::LockedOut;
            }
            self.locked_until = None;
        }

        if self.logins.try_consume(1.0) {
            LoginGate::Allowed
        } else {
            self.locked_until = Some(now + self.lockout);
            LoginGate::LockedOut
        }
    }

    /// Whether the login lockout is currently active.
    pub fn login_locked(&self) -> bool {
        self.locked_until.is_some_and(|until| Instant::now() < until)
    }
}
