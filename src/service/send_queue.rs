//! Per-connection outbound queue.
//!
//! A bounded priority queue drained by exactly one send task per
//! connection. Critical beats High beats Normal beats Low; entries of equal
//! priority leave in arrival order. When the queue is full the oldest Low
//! entry is evicted to make room; with no Low entry to sacrifice the push
//! fails with QueueFull.
//!
//! User-visible entries carry their message id so the drain task can await
//! the delivery acknowledgement; [`AckTable`] correlates inbound delivery
//! frames with the waiting task.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::{oneshot, Notify};

use crate::error::{ChatError, Result};
use crate::protocol::message::{ChatMessage, MessageKind};

/// Outbound scheduling class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Typing indicators and other ephemeral traffic; evictable
    Low = 0,
    /// User-visible content
    Normal = 1,
    /// Delivery receipts, read receipts, directory replies
    High = 2,
    /// Auth responses, errors, control plane
    Critical = 3,
}

impl Priority {
    /// Scheduling class for a message kind.
    pub fn for_kind(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Typing => Priority::Low,
            MessageKind::Text
            | MessageKind::Image
            | MessageKind::File
            | MessageKind::Audio
            | MessageKind::Video => Priority::Normal,
            MessageKind::Delivery
            | MessageKind::ReadReceipt
            | MessageKind::UserList
            | MessageKind::UserStatus => Priority::High,
            MessageKind::System | MessageKind::Auth | MessageKind::Error => Priority::Critical,
        }
    }

    fn lane(self) -> usize {
        self as usize
    }
}

/// One queued outbound message.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Serialized message, encrypted at send time
    pub payload: Bytes,
    /// Scheduling class
    pub priority: Priority,
    /// Message id when a delivery acknowledgement is expected
    pub message_id: Option<String>,
    /// Connection id of the originating user, for failure notification
    pub origin: Option<u64>,
    /// When the entry entered the queue
    pub enqueued_at: Instant,
    /// Delivery attempts so far
    pub retries: u32,
}

impl QueuedMessage {
    /// Serialize a message into a queue entry.
    pub fn from_message(msg: &ChatMessage, origin: Option<u64>) -> Result<Self> {
        let payload = msg.encode()?;
        Ok(Self {
            payload,
            priority: Priority::for_kind(msg.kind),
            message_id: if msg.is_user_visible() {
                msg.id.clone()
            } else {
                None
            },
            origin,
            enqueued_at: Instant::now(),
            retries: 0,
        })
    }
}

struct QueueInner {
    lanes: [VecDeque<QueuedMessage>; 4],
    len: usize,
    closed: bool,
}

impl QueueInner {
    fn pop_highest(&mut self) -> Option<QueuedMessage> {
        for lane in self.lanes.iter_mut().rev() {
            if let Some(entry) = lane.pop_front() {
                self.len -= 1;
                return Some(entry);
            }
        }
        None
    }
}

/// Bounded priority queue with a single consumer.
pub struct SendQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    /// Create an empty queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                lanes: Default::default(),
                len: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an entry, evicting the oldest Low entry when full.
    pub fn push(&self, entry: QueuedMessage) -> Result<()> {
        {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| ChatError::Protocol("send queue lock poisoned".into()))?;

            if inner.closed {
                return Err(ChatError::CancelledShutdown);
            }

            if inner.len >= self.capacity {
                if inner.lanes[Priority::Low.lane()].pop_front().is_some() {
                    inner.len -= 1;
                    crate::utils::metrics::global_metrics().message_dropped();
                } else {
                    return Err(ChatError::QueueFull);
                }
            }

            let lane = entry.priority.lane();
            inner.lanes[lane].push_back(entry);
            inner.len += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Await the highest-priority entry. Returns `None` once the queue is
    /// closed and drained.
    pub async fn pop(&self) -> Option<QueuedMessage> {
        loop {
            {
                let mut inner = self.inner.lock().ok()?;
                if let Some(entry) = inner.pop_highest() {
                    return Some(entry);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Take the next entry without waiting.
    pub fn try_pop(&self) -> Option<QueuedMessage> {
        self.inner.lock().ok()?.pop_highest()
    }

    /// Close the queue and collect everything still pending.
    pub fn close(&self) -> Vec<QueuedMessage> {
        let drained = match self.inner.lock() {
            Ok(mut inner) => {
                inner.closed = true;
                let mut drained = Vec::with_capacity(inner.len);
                while let Some(entry) = inner.pop_highest() {
                    drained.push(entry);
                }
                drained
            }
            Err(_) => Vec::new(),
        };
        self.notify.notify_one();
        drained
    }

    /// Wake the consumer without enqueuing (used to surface out-of-band work
    /// like a due rekey).
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    /// Entries currently queued.
    pub fn depth(&self) -> usize {
        self.inner.lock().map(|inner| inner.len).unwrap_or(0)
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|inner| inner.closed).unwrap_or(true)
    }
}

/// In-flight delivery acknowledgements keyed by message id.
#[derive(Default)]
pub struct AckTable {
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

impl AckTable {
    /// Register interest in an acknowledgement for `id`.
    pub fn register(&self, id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id.to_string(), tx);
        }
        rx
    }

    /// Resolve a waiting sender. Returns false for unknown ids.
    pub fn acknowledge(&self, id: &str) -> bool {
        match self.pending.lock() {
            Ok(mut pending) => match pending.remove(id) {
                Some(tx) => tx.send(()).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Drop interest in an id (timeout path).
    pub fn forget(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: Priority, tag: &str) -> QueuedMessage {
        QueuedMessage {
            payload: Bytes::copy_from_slice(tag.as_bytes()),
            priority,
            message_id: None,
            origin: None,
            enqueued_at: Instant::now(),
            retries: 0,
        }
    }

    #[tokio::test]
    async fn priority_order_with_fifo_ties() {
        let queue = SendQueue::new(16);
        queue.push(entry(Priority::Normal, "n1")).unwrap();
        queue.push(entry(Priority::Low, "l1")).unwrap();
        queue.push(entry(Priority::Critical, "c1")).unwrap();
        queue.push(entry(Priority::Normal, "n2")).unwrap();
        queue.push(entry(Priority::High, "h1")).unwrap();

        let order: Vec<Bytes> = [
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.payload)
        .collect();

        assert_eq!(order, vec!["c1", "h1", "n1", "n2", "l1"]);
    }

    #[test]
    fn full_queue_evicts_oldest_low() {
        let queue = SendQueue::new(3);
        queue.push(entry(Priority::Low, "old-low")).unwrap();
        queue.push(entry(Priority::Low, "new-low")).unwrap();
        queue.push(entry(Priority::Normal, "n")).unwrap();

        // Fourth push evicts "old-low".
        queue.push(entry(Priority::High, "h")).unwrap();
        assert_eq!(queue.depth(), 3);

        let mut seen = Vec::new();
        while let Some(e) = queue.try_pop() {
            seen.push(e.payload);
        }
        assert!(!seen.contains(&Bytes::from_static(b"old-low")));
        assert!(seen.contains(&Bytes::from_static(b"new-low")));
    }

    #[test]
    fn full_queue_without_low_fails() {
        let queue = SendQueue::new(2);
        queue.push(entry(Priority::Normal, "a")).unwrap();
        queue.push(entry(Priority::High, "b")).unwrap();
        assert!(matches!(
            queue.push(entry(Priority::Normal, "c")),
            Err(ChatError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn close_drains_and_wakes_consumer() {
        let queue = std::sync::Arc::new(SendQueue::new(8));
        queue.push(entry(Priority::Normal, "pending")).unwrap();

        let drained = queue.close();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_closed());
        assert!(queue.pop().await.is_none());
        assert!(matches!(
            queue.push(entry(Priority::Normal, "late")),
            Err(ChatError::CancelledShutdown)
        ));
    }

    #[tokio::test]
    async fn ack_table_resolves_registered_ids() {
        let acks = AckTable::default();
        let rx = acks.register("00112233445566778899aabbccddeeff");
        assert!(acks.acknowledge("00112233445566778899aabbccddeeff"));
        rx.await.unwrap();
        assert!(!acks.acknowledge("00112233445566778899aabbccddeeff"));
        assert!(!acks.acknowledge("ffffffffffffffffffffffffffffffff"));
    }

    #[test]
    fn kind_to_priority_mapping() {
        assert_eq!(Priority::for_kind(MessageKind::Typing), Priority::Low);
        assert_eq!(Priority::for_kind(MessageKind::Text), Priority::Normal);
        assert_eq!(Priority::for_kind(MessageKind::Delivery), Priority::High);
        assert_eq!(Priority::for_kind(MessageKind::Error), Priority::Critical);
    }
}
