//! Bounded priority queue for recovery work.
//!
//! Priority is dynamic: a base level from the classified error, a bonus for
//! the origin queue (later pipeline stages are more urgent), and an age
//! bonus, clamped to `CRITICAL`. Insertion keeps the vector sorted by
//! binary search; dequeue returns the highest-priority message that is
//! ready (no `retry_after`, or `retry_after` in the past).
//! `schedule_retry` sets `retry_after` without reordering.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use crate::queue::{MessageAttributes, QueueKind, ReceiptHandle};
use crate::types::UnixMillis;

/// Base priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 1,
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl Priority {
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// A DLQ message queued for recovery, with its computed priority.
#[derive(Debug, Clone)]
pub struct PriorityMessage {
    /// The DLQ message id; used for retry scheduling and deduplication.
    pub id: String,
    /// Origin queue of the failed payload.
    pub origin: QueueKind,
    pub body: String,
    pub attributes: MessageAttributes,
    /// Serialized error carried on the DLQ message.
    pub error: String,
    /// Receipt handle of the DLQ delivery, for deletion on success.
    pub receipt: ReceiptHandle,
    pub base: Priority,
    pub enqueued_at: UnixMillis,
    pub retry_after: Option<UnixMillis>,
    /// Effective priority computed at insertion.
    priority: u8,
}

impl PriorityMessage {
    pub fn new(
        id: String,
        origin: QueueKind,
        body: String,
        attributes: MessageAttributes,
        error: String,
        receipt: ReceiptHandle,
        base: Priority,
    ) -> Self {
        Self {
            id,
            origin,
            body,
            attributes,
            error,
            receipt,
            base,
            enqueued_at: UnixMillis::now(),
            retry_after: None,
            priority: 0,
        }
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Base + origin-queue bonus + age bonus, clamped to `CRITICAL`.
    fn effective_priority(&self, now: UnixMillis) -> u8 {
        let queue_bonus = match self.origin {
            QueueKind::BroadcastTx => 2,
            QueueKind::SignedTx => 1,
            QueueKind::TxRequest => 0,
        };
        let age = Duration::from_millis(now.0.saturating_sub(self.enqueued_at.0));
        let age_bonus = if age > Duration::from_secs(60 * 60) {
            3
        } else if age > Duration::from_secs(30 * 60) {
            2
        } else if age > Duration::from_secs(10 * 60) {
            1
        } else {
            0
        };
        (self.base.value() + queue_bonus + age_bonus).min(Priority::Critical.value())
    }

    fn is_ready(&self, now: UnixMillis) -> bool {
        self.retry_after.is_none_or(|at| at <= now)
    }
}

/// Error for a full queue; insertion fails loudly rather than dropping.
#[derive(Debug, thiserror::Error)]
#[error("recovery queue full ({capacity} messages)")]
pub struct QueueFull {
    pub capacity: usize,
}

/// The bounded recovery queue. Sorted descending by priority; FIFO among
/// equals.
pub struct RecoveryQueue {
    items: StdMutex<Vec<PriorityMessage>>,
    capacity: usize,
}

impl RecoveryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: StdMutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("recovery queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert with priority computed at this moment. Rejects duplicates of
    /// an id already queued, and fails when full.
    pub fn insert(&self, mut message: PriorityMessage) -> Result<(), QueueFull> {
        let mut items = self.items.lock().expect("recovery queue lock");
        if items.len() >= self.capacity {
            return Err(QueueFull {
                capacity: self.capacity,
            });
        }
        if items.iter().any(|m| m.id == message.id) {
            tracing::debug!(id = %message.id, "duplicate recovery message ignored");
            return Ok(());
        }
        message.priority = message.effective_priority(UnixMillis::now());
        let position = items.partition_point(|m| m.priority >= message.priority);
        items.insert(position, message);
        Ok(())
    }

    /// Remove and return the highest-priority ready message.
    pub fn dequeue(&self) -> Option<PriorityMessage> {
        let now = UnixMillis::now();
        let mut items = self.items.lock().expect("recovery queue lock");
        let position = items.iter().position(|m| m.is_ready(now))?;
        Some(items.remove(position))
    }

    /// Defer `id` until `delay` from now. Position in the queue is
    /// unchanged.
    pub fn schedule_retry(&self, id: &str, delay: Duration) {
        let mut items = self.items.lock().expect("recovery queue lock");
        if let Some(message) = items.iter_mut().find(|m| m.id == id) {
            message.retry_after = Some(UnixMillis::now().saturating_add(delay));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, origin: QueueKind, base: Priority) -> PriorityMessage {
        PriorityMessage::new(
            id.to_string(),
            origin,
            "{}".to_string(),
            MessageAttributes::default(),
            "error".to_string(),
            ReceiptHandle(format!("receipt-{id}")),
            base,
        )
    }

    #[test]
    fn orders_by_effective_priority() {
        let queue = RecoveryQueue::new(10);
        queue
            .insert(message("low", QueueKind::TxRequest, Priority::Low))
            .unwrap();
        queue
            .insert(message("high", QueueKind::TxRequest, Priority::High))
            .unwrap();
        // Same base, but broadcast origin gets +2.
        queue
            .insert(message("normal-bcast", QueueKind::BroadcastTx, Priority::Normal))
            .unwrap();
        queue
            .insert(message("normal", QueueKind::TxRequest, Priority::Normal))
            .unwrap();

        assert_eq!(queue.dequeue().unwrap().id, "high");
        assert_eq!(queue.dequeue().unwrap().id, "normal-bcast");
        assert_eq!(queue.dequeue().unwrap().id, "normal");
        assert_eq!(queue.dequeue().unwrap().id, "low");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn fifo_among_equal_priority() {
        let queue = RecoveryQueue::new(10);
        for id in ["first", "second", "third"] {
            queue
                .insert(message(id, QueueKind::SignedTx, Priority::Normal))
                .unwrap();
        }
        assert_eq!(queue.dequeue().unwrap().id, "first");
        assert_eq!(queue.dequeue().unwrap().id, "second");
        assert_eq!(queue.dequeue().unwrap().id, "third");
    }

    #[test]
    fn age_bonus_is_clamped_to_critical() {
        let mut old = message("old", QueueKind::BroadcastTx, Priority::Critical);
        old.enqueued_at = UnixMillis(0);
        assert_eq!(
            old.effective_priority(UnixMillis::now()),
            Priority::Critical.value()
        );
        let mut aged = message("aged", QueueKind::TxRequest, Priority::Low);
        aged.enqueued_at = UnixMillis(UnixMillis::now().0 - 45 * 60 * 1000);
        // Low (1) + 0 + age >30min (+2).
        assert_eq!(aged.effective_priority(UnixMillis::now()), 3);
    }

    #[test]
    fn bounded_insert_fails_loudly() {
        let queue = RecoveryQueue::new(2);
        queue
            .insert(message("a", QueueKind::TxRequest, Priority::Normal))
            .unwrap();
        queue
            .insert(message("b", QueueKind::TxRequest, Priority::Normal))
            .unwrap();
        let err = queue
            .insert(message("c", QueueKind::TxRequest, Priority::Normal))
            .unwrap_err();
        assert_eq!(err.capacity, 2);
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let queue = RecoveryQueue::new(10);
        queue
            .insert(message("a", QueueKind::TxRequest, Priority::Normal))
            .unwrap();
        queue
            .insert(message("a", QueueKind::TxRequest, Priority::Normal))
            .unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn scheduled_retry_defers_dequeue_without_reordering() {
        let queue = RecoveryQueue::new(10);
        queue
            .insert(message("deferred", QueueKind::BroadcastTx, Priority::High))
            .unwrap();
        queue
            .insert(message("ready", QueueKind::TxRequest, Priority::Low))
            .unwrap();
        queue.schedule_retry("deferred", Duration::from_secs(60));
        // The high-priority message is deferred; the low one is served.
        assert_eq!(queue.dequeue().unwrap().id, "ready");
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.len(), 1);
        // Past deferral: dequeues again.
        queue.schedule_retry("deferred", Duration::from_secs(0));
        assert_eq!(queue.dequeue().unwrap().id, "deferred");
    }
}
