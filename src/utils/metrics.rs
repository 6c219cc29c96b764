//! Observability and Metrics
//!
//! This module provides metrics collection and observability features
//! for monitoring server performance and health.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Global metrics collector for server operations
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted
    pub connections_total: AtomicU64,
    /// Currently live connections
    pub connections_active: AtomicU64,
    /// Accepts rejected at the connection cap
    pub connections_rejected: AtomicU64,
    /// Successful authentications
    pub auth_success: AtomicU64,
    /// Rejected credential presentations
    pub auth_failed: AtomicU64,
    /// Messages routed point-to-point
    pub messages_routed: AtomicU64,
    /// Broadcast fan-outs performed
    pub broadcasts_total: AtomicU64,
    /// Messages dropped (queue overflow, eviction, or retry exhaustion)
    pub messages_dropped: AtomicU64,
    /// Delivery retries performed
    pub send_retries: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Messages rejected by the rate limiter
    pub rate_limited: AtomicU64,
    /// Sequence violations observed
    pub replays_detected: AtomicU64,
    /// HMAC verification failures
    pub integrity_failures: AtomicU64,
    /// Completed session rekeys
    pub rekeys_completed: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            auth_success: AtomicU64::new(0),
            auth_failed: AtomicU64::new(0),
            messages_routed: AtomicU64::new(0),
            broadcasts_total: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            send_retries: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            replays_detected: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
            rekeys_completed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record an accept rejected at the cap
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful authentication
    pub fn auth_succeeded(&self) {
        self.auth_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed authentication
    pub fn auth_rejected(&self) {
        self.auth_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a targeted message routed
    pub fn message_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a broadcast fan-out
    pub fn broadcast_performed(&self) {
        self.broadcasts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped message
    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivery retry
    pub fn send_retried(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record inbound bytes
    pub fn bytes_in(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Record outbound bytes
    pub fn bytes_out(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a rate-limited message
    pub fn message_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sequence violation
    pub fn replay_detected(&self) {
        self.replays_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an HMAC failure
    pub fn integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed rekey
    pub fn rekey_completed(&self) {
        self.rekeys_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            auth_success: self.auth_success.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            broadcasts_total: self.broadcasts_total.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            replays_detected: self.replays_detected.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            rekeys_completed: self.rekeys_completed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_rejected = snapshot.connections_rejected,
            auth_success = snapshot.auth_success,
            auth_failed = snapshot.auth_failed,
            messages_routed = snapshot.messages_routed,
            broadcasts_total = snapshot.broadcasts_total,
            messages_dropped = snapshot.messages_dropped,
            send_retries = snapshot.send_retries,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            rate_limited = snapshot.rate_limited,
            replays_detected = snapshot.replays_detected,
            integrity_failures = snapshot.integrity_failures,
            rekeys_completed = snapshot.rekeys_completed,
            uptime_seconds = snapshot.uptime_seconds,
            "Server metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub auth_success: u64,
    pub auth_failed: u64,
    pub messages_routed: u64,
    pub broadcasts_total: u64,
    pub messages_dropped: u64,
    pub send_retries: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub rate_limited: u64,
    pub replays_detected: u64,
    pub integrity_failures: u64,
    pub rekeys_completed: u64,
    pub uptime_seconds: u64,
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_snapshot() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();
        metrics.bytes_in(100);
        metrics.bytes_out(250);
        metrics.replay_detected();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
        assert_eq!(snap.bytes_received, 100);
        assert_eq!(snap.bytes_sent, 250);
        assert_eq!(snap.replays_detected, 1);
    }
}
