//! Periodic maintenance.
//!
//! One timer task drives four recurring jobs across the whole registry:
//! keep-alive probes, idle reaping, per-connection rekey scheduling, and the
//! metrics tick. Connection-local deadlines (ack waits, drains) live in the
//! connection drivers; everything with a fixed cadence lives here.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::protocol::message::ChatMessage;
use crate::service::connection::ConnState;
use crate::service::registry::Registry;
use crate::service::send_queue::QueuedMessage;
use crate::utils::metrics::global_metrics;

/// Cadence of the idle-reap scan.
const IDLE_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the rekey-due scan.
const REKEY_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the metrics snapshot.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Spawn the timer service. Runs until the shutdown signal flips.
pub fn spawn(
    registry: Arc<Registry>,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(config.session.keepalive());
        let mut idle_scan = tokio::time::interval(IDLE_SCAN_INTERVAL);
        let mut rekey_scan = tokio::time::interval(REKEY_SCAN_INTERVAL);
        let mut metrics_tick = tokio::time::interval(METRICS_INTERVAL);

        // The first tick of an interval fires immediately; skip it so the
        // probes start one period in.
        keepalive.tick().await;
        idle_scan.tick().await;
        rekey_scan.tick().await;
        metrics_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler stopping");
                        return;
                    }
                }
                _ = keepalive.tick() => send_keepalive_probes(&registry),
                _ = idle_scan.tick() => reap_idle(&registry, &config),
                _ = rekey_scan.tick() => request_due_rekeys(&registry, &config),
                _ = metrics_tick.tick() => log_metrics(&registry),
            }
        }
    })
}

fn send_keepalive_probes(registry: &Registry) {
    let probe = ChatMessage::system("ping");
    let entry = match QueuedMessage::from_message(&probe, None) {
        Ok(entry) => entry,
        Err(_) => return,
    };

    for conn in registry.connections() {
        if conn.state() == ConnState::Authenticated {
            if let Err(e) = conn.queue.push(entry.clone()) {
                debug!(conn = conn.id(), error = %e, "keep-alive enqueue failed");
            }
        }
    }
}

fn reap_idle(registry: &Registry, config: &ServerConfig) {
    let idle_timeout = config.session.idle_timeout();
    for conn in registry.connections() {
        let state = conn.state();
        if state == ConnState::Closed || state == ConnState::Disconnecting {
            continue;
        }
        if conn.idle_for() > idle_timeout {
            info!(
                conn = conn.id(),
                idle_secs = conn.idle_for().as_secs(),
                "reaping idle connection"
            );
            conn.begin_disconnect();
        }
    }
}

fn request_due_rekeys(registry: &Registry, config: &ServerConfig) {
    let interval = config.session.rekey_interval();
    for conn in registry.connections() {
        if conn.state() == ConnState::Authenticated && conn.rekey_age() > interval {
            debug!(conn = conn.id(), "scheduling rekey");
            conn.request_rekey();
        }
    }
}

fn log_metrics(registry: &Registry) {
    let connections = registry.connections();
    let queue_depth: usize = connections.iter().map(|c| c.queue.depth()).sum();
    debug!(
        connections = connections.len(),
        queued_messages = queue_depth,
        "queue depths"
    );
    global_metrics().log_metrics();
}
