//! Connection registry and message router.
//!
//! The registry is the authoritative owner of live connections: a primary
//! id index and a secondary username index kept under one reader/writer
//! lock. Structural changes take the write lock; lookups, the directory,
//! and broadcast target snapshots take the read lock. Fan-out enqueues
//! happen after the lock is released.
//!
//! At most one live connection per username: binding a name already in use
//! kicks the previous holder with a SessionReplaced error.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::message::ChatMessage;
use crate::service::connection::{ConnState, ConnectionHandle};
use crate::service::send_queue::QueuedMessage;
use crate::utils::metrics::global_metrics;

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<u64, Arc<ConnectionHandle>>,
    by_name: HashMap<String, u64>,
}

/// Directory of live connections.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

/// Result of a broadcast fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Recipients whose queue accepted the message
    pub delivered: usize,
    /// Recipients whose enqueue failed
    pub failed: usize,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly accepted connection under its id.
    pub fn insert(&self, handle: Arc<ConnectionHandle>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.by_id.insert(handle.id(), handle);
    }

    /// Bind a username to a connection after authentication.
    ///
    /// Returns the displaced connection when the name was already bound, so
    /// the caller can notify and terminate it.
    pub fn bind_username(&self, id: u64, username: &str) -> Option<Arc<ConnectionHandle>> {
        let mut inner = self.inner.write().expect("registry lock poisoned");

        let displaced = inner
            .by_name
            .insert(username.to_string(), id)
            .filter(|prior| *prior != id)
            .and_then(|prior| inner.by_id.get(&prior).cloned());

        if let Some(prior) = &displaced {
            info!(
                username,
                prior_id = prior.id(),
                new_id = id,
                "re-login replaces existing session"
            );
        }
        displaced
    }

    /// Remove a connection from both indices. Idempotent.
    pub fn unregister(&self, id: u64) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let removed = inner.by_id.remove(&id).is_some();
        if removed {
            inner.by_name.retain(|_, bound| *bound != id);
        }
        removed
    }

    /// Look up a connection by id.
    pub fn get(&self, id: u64) -> Option<Arc<ConnectionHandle>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_id
            .get(&id)
            .cloned()
    }

    /// Look up a connection by username.
    pub fn lookup(&self, username: &str) -> Option<Arc<ConnectionHandle>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .by_name
            .get(username)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Usernames currently authenticated, sorted.
    pub fn directory(&self) -> Vec<String> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut names: Vec<String> = inner
            .by_name
            .iter()
            .filter(|(_, id)| {
                inner
                    .by_id
                    .get(id)
                    .is_some_and(|h| h.state() == ConnState::Authenticated)
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_id
            .values()
            .cloned()
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").by_id.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Used as the last step of shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.by_id.clear();
        inner.by_name.clear();
    }

    /// Enqueue a message on every Authenticated connection except the
    /// sender. Best-effort: individual failures are counted, never
    /// propagated.
    pub fn broadcast(&self, msg: &ChatMessage, sender_id: u64) -> BroadcastOutcome {
        // Snapshot targets under the read lock, enqueue without it.
        let targets: Vec<Arc<ConnectionHandle>> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .by_id
                .values()
                .filter(|h| h.id() != sender_id && h.state() == ConnState::Authenticated)
                .cloned()
                .collect()
        };

        let entry = match QueuedMessage::from_message(msg, Some(sender_id)) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast message");
                return BroadcastOutcome {
                    delivered: 0,
                    failed: targets.len(),
                };
            }
        };

        let mut outcome = BroadcastOutcome {
            delivered: 0,
            failed: 0,
        };
        for target in targets {
            match target.queue.push(entry.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    outcome.failed += 1;
                    debug!(target = target.id(), error = %e, "broadcast enqueue failed");
                }
            }
        }

        global_metrics().broadcast_performed();
        outcome
    }

    /// Enqueue a message for one username.
    ///
    /// Returns PeerNotFound when the user is absent or not yet
    /// Authenticated.
    pub fn send_to_user(
        &self,
        username: &str,
        msg: &ChatMessage,
        origin: Option<u64>,
    ) -> Result<()> {
        let target = self
            .lookup(username)
            .filter(|h| h.state() == ConnState::Authenticated)
            .ok_or_else(|| ChatError::PeerNotFound(username.to_string()))?;

        let entry = QueuedMessage::from_message(msg, origin)?;
        target.queue.push(entry)?;
        global_metrics().message_routed();
        Ok(())
    }

    /// Enqueue a message for one connection id.
    pub fn send_to_id(&self, id: u64, msg: &ChatMessage, origin: Option<u64>) -> Result<()> {
        let target = self
            .get(id)
            .ok_or_else(|| ChatError::PeerNotFound(format!("connection {id}")))?;
        let entry = QueuedMessage::from_message(msg, origin)?;
        target.queue.push(entry)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendConfig;
    use crate::protocol::message::MessageKind;

    fn handle(id: u64) -> Arc<ConnectionHandle> {
        ConnectionHandle::new(id, &SendConfig::default())
    }

    fn authed(id: u64, name: &str, registry: &Registry) -> Arc<ConnectionHandle> {
        let h = handle(id);
        registry.insert(h.clone());
        h.set_state(ConnState::Authenticated);
        h.set_username(name);
        registry.bind_username(id, name);
        h
    }

    #[test]
    fn username_uniqueness_kicks_prior() {
        let registry = Registry::new();
        let first = authed(1, "alice", &registry);

        let second = handle(2);
        registry.insert(second.clone());
        second.set_state(ConnState::Authenticated);
        let displaced = registry.bind_username(2, "alice");

        assert_eq!(displaced.unwrap().id(), first.id());
        assert_eq!(registry.lookup("alice").unwrap().id(), 2);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = Registry::new();
        authed(1, "alice", &registry);

        assert!(registry.unregister(1));
        assert!(!registry.unregister(1));
        assert!(registry.lookup("alice").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_removes_only_own_binding() {
        let registry = Registry::new();
        authed(1, "alice", &registry);
        authed(2, "bob", &registry);

        registry.unregister(1);
        assert!(registry.lookup("alice").is_none());
        assert_eq!(registry.lookup("bob").unwrap().id(), 2);
    }

    #[test]
    fn directory_lists_only_authenticated() {
        let registry = Registry::new();
        authed(1, "alice", &registry);
        authed(2, "bob", &registry);

        let pending = handle(3);
        registry.insert(pending.clone());

        assert_eq!(registry.directory(), vec!["alice", "bob"]);
    }

    #[test]
    fn broadcast_skips_sender_and_unauthenticated() {
        let registry = Registry::new();
        let _alice = authed(1, "alice", &registry);
        let bob = authed(2, "bob", &registry);
        let carol = authed(3, "carol", &registry);
        let pending = handle(4);
        registry.insert(pending.clone());

        let msg = ChatMessage::new(MessageKind::Text).with_new_id();
        let outcome = registry.broadcast(&msg, 1);

        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(bob.queue.depth(), 1);
        assert_eq!(carol.queue.depth(), 1);
        assert_eq!(pending.queue.depth(), 0);
    }

    #[test]
    fn send_to_unknown_user_is_not_found() {
        let registry = Registry::new();
        let msg = ChatMessage::new(MessageKind::Text).with_new_id();
        assert!(matches!(
            registry.send_to_user("ghost", &msg, None),
            Err(ChatError::PeerNotFound(_))
        ));
    }

    #[test]
    fn send_to_unauthenticated_user_is_not_found() {
        let registry = Registry::new();
        let h = handle(1);
        registry.insert(h.clone());
        registry.bind_username(1, "early");

        let msg = ChatMessage::new(MessageKind::Text).with_new_id();
        assert!(registry.send_to_user("early", &msg, None).is_err());
    }
}
