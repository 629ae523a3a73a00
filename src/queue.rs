//! Queue abstraction over a durable at-least-once message bus.
//!
//! The pipeline runs on three forward queues (`tx-request`, `signed-tx`,
//! `broadcast-tx`), each paired with a dead-letter queue. Components only see
//! the [`MessageQueue`] trait: long-polling receive with a visibility
//! timeout, delete by receipt handle, send with attributes, and explicit DLQ
//! forwarding. Receipt handles are valid only within the visibility window;
//! an uncompleted delete lets the message reappear, which is the backstop
//! for ungraceful worker death.
//!
//! [`InMemoryQueue`] implements the same contract in-process for local mode
//! and tests, including visibility-timeout redelivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// The three forward queues of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    TxRequest,
    SignedTx,
    BroadcastTx,
}

impl QueueKind {
    pub fn variants() -> &'static [QueueKind] {
        &[QueueKind::TxRequest, QueueKind::SignedTx, QueueKind::BroadcastTx]
    }
}

impl Display for QueueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueKind::TxRequest => "tx-request",
            QueueKind::SignedTx => "signed-tx",
            QueueKind::BroadcastTx => "broadcast-tx",
        };
        write!(f, "{s}")
    }
}

/// A concrete queue: a forward queue or its dead-letter pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueName {
    pub kind: QueueKind,
    pub dead_letter: bool,
}

impl QueueName {
    pub fn forward(kind: QueueKind) -> Self {
        Self {
            kind,
            dead_letter: false,
        }
    }

    pub fn dlq(kind: QueueKind) -> Self {
        Self {
            kind,
            dead_letter: true,
        }
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.dead_letter {
            write!(f, "{}-dlq", self.kind)
        } else {
            write!(f, "{}-queue", self.kind)
        }
    }
}

/// Attributes carried alongside every message body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAttributes {
    /// How many recovery or redelivery attempts this payload has seen.
    #[serde(default)]
    pub retry_count: u32,
    /// ISO timestamp of the last recovery attempt, if any.
    #[serde(default)]
    pub recovery_attempt: Option<String>,
    /// Serialized error, set on DLQ messages.
    #[serde(default)]
    pub error: Option<String>,
}

/// Opaque handle identifying one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

/// A received message. The receipt handle is only valid until the visibility
/// timeout elapses.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub body: String,
    pub attributes: MessageAttributes,
    pub receipt: ReceiptHandle,
    /// Delivery count including this one.
    pub receive_count: u32,
}

/// Errors surfaced by the queue boundary.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Transient I/O failure; the caller may retry.
    #[error("queue transport error: {0}")]
    Transport(String),
    /// The message body could not be serialized.
    #[error("queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Long-polling receive, delete, send, and DLQ forwarding over the bus.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receive up to `max` messages, long-polling up to `wait`. Received
    /// messages are invisible to other consumers for `visibility`.
    async fn receive(
        &self,
        queue: QueueName,
        max: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<Message>, QueueError>;

    /// Delete a delivered message. Deleting an expired receipt is a no-op:
    /// the message has already returned to the queue.
    async fn delete(&self, queue: QueueName, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Send a message body with attributes; returns the message id.
    async fn send(
        &self,
        queue: QueueName,
        body: String,
        attributes: MessageAttributes,
    ) -> Result<String, QueueError>;

    /// Forward a failed payload to the dead-letter queue of `kind`, recording
    /// the error in the message attributes.
    async fn send_to_dlq(
        &self,
        kind: QueueKind,
        body: String,
        mut attributes: MessageAttributes,
        error: String,
    ) -> Result<String, QueueError> {
        attributes.error = Some(error);
        self.send(QueueName::dlq(kind), body, attributes).await
    }
}

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: MessageAttributes,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    queue: QueueName,
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<QueueName, VecDeque<StoredMessage>>,
    inflight: HashMap<String, InFlight>,
}

/// In-process [`MessageQueue`] with visibility-timeout semantics.
///
/// Delivery is at-least-once: a message received but not deleted within its
/// visibility window returns to the head of its queue with an incremented
/// receive count.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    sequence: AtomicU64,
    poll_interval: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            sequence: AtomicU64::new(1),
            poll_interval: Duration::from_millis(25),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}")
    }

    /// Return expired in-flight messages to their queues.
    fn reap_expired(state: &mut QueueState, now: Instant) {
        let expired: Vec<String> = state
            .inflight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(flight) = state.inflight.remove(&receipt) {
                state
                    .queues
                    .entry(flight.queue)
                    .or_default()
                    .push_front(flight.message);
            }
        }
    }

    /// Number of visible messages, for tests and drain logging. Expired
    /// in-flight messages are reaped first.
    pub async fn depth(&self, queue: QueueName) -> usize {
        let mut state = self.state.lock().await;
        Self::reap_expired(&mut state, Instant::now());
        state.queues.get(&queue).map(VecDeque::len).unwrap_or(0)
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive(
        &self,
        queue: QueueName,
        max: usize,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            let mut received = Vec::new();
            {
                let mut state = self.state.lock().await;
                Self::reap_expired(&mut state, now);
                let QueueState { queues, inflight, .. } = &mut *state;
                if let Some(pending) = queues.get_mut(&queue) {
                    while received.len() < max {
                        let Some(mut message) = pending.pop_front() else {
                            break;
                        };
                        message.receive_count += 1;
                        let receipt = self.next_id("receipt");
                        received.push(Message {
                            message_id: message.message_id.clone(),
                            body: message.body.clone(),
                            attributes: message.attributes.clone(),
                            receipt: ReceiptHandle(receipt.clone()),
                            receive_count: message.receive_count,
                        });
                        inflight.insert(
                            receipt,
                            InFlight {
                                queue,
                                message,
                                visible_at: now + visibility,
                            },
                        );
                    }
                }
            }
            if !received.is_empty() || Instant::now() >= deadline {
                return Ok(received);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - Instant::now())).await;
        }
    }

    async fn delete(&self, _queue: QueueName, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.inflight.remove(&receipt.0).is_none() {
            tracing::debug!(receipt = %receipt.0, "delete on expired receipt, ignored");
        }
        Ok(())
    }

    async fn send(
        &self,
        queue: QueueName,
        body: String,
        attributes: MessageAttributes,
    ) -> Result<String, QueueError> {
        let message_id = self.next_id("msg");
        let mut state = self.state.lock().await;
        state.queues.entry(queue).or_default().push_back(StoredMessage {
            message_id: message_id.clone(),
            body,
            attributes,
            receive_count: 0,
        });
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_queue() -> QueueName {
        QueueName::forward(QueueKind::TxRequest)
    }

    #[tokio::test]
    async fn send_receive_delete() {
        let queue = InMemoryQueue::new();
        queue
            .send(request_queue(), "hello".into(), MessageAttributes::default())
            .await
            .unwrap();
        let messages = queue
            .receive(
                request_queue(),
                10,
                Duration::from_millis(10),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hello");
        assert_eq!(messages[0].receive_count, 1);
        queue
            .delete(request_queue(), &messages[0].receipt)
            .await
            .unwrap();
        assert_eq!(queue.depth(request_queue()).await, 0);
        let empty = queue
            .receive(
                request_queue(),
                10,
                Duration::from_millis(10),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn visibility_timeout_redelivers_undeleted() {
        let queue = InMemoryQueue::new();
        queue
            .send(request_queue(), "retry-me".into(), MessageAttributes::default())
            .await
            .unwrap();
        let first = queue
            .receive(
                request_queue(),
                1,
                Duration::from_millis(10),
                Duration::from_millis(30),
            )
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        // Not deleted; wait out the visibility window.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = queue
            .receive(
                request_queue(),
                1,
                Duration::from_millis(10),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].body, "retry-me");
        assert_eq!(second[0].receive_count, 2);
        // Stale receipt delete is a no-op.
        queue
            .delete(request_queue(), &first[0].receipt)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dlq_forwarding_records_error_attribute() {
        let queue = InMemoryQueue::new();
        let attributes = MessageAttributes {
            retry_count: 2,
            ..Default::default()
        };
        queue
            .send_to_dlq(
                QueueKind::SignedTx,
                "broken".into(),
                attributes,
                "nonce too low".into(),
            )
            .await
            .unwrap();
        let messages = queue
            .receive(
                QueueName::dlq(QueueKind::SignedTx),
                10,
                Duration::from_millis(10),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].attributes.error.as_deref(), Some("nonce too low"));
        assert_eq!(messages[0].attributes.retry_count, 2);
    }

    #[tokio::test]
    async fn long_poll_waits_for_late_sender() {
        let queue = std::sync::Arc::new(InMemoryQueue::new());
        let sender = std::sync::Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            sender
                .send(request_queue(), "late".into(), MessageAttributes::default())
                .await
                .unwrap();
        });
        let messages = queue
            .receive(
                request_queue(),
                1,
                Duration::from_millis(500),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "late");
        handle.await.unwrap();
    }

    #[test]
    fn queue_names_render() {
        assert_eq!(
            QueueName::forward(QueueKind::TxRequest).to_string(),
            "tx-request-queue"
        );
        assert_eq!(QueueName::dlq(QueueKind::BroadcastTx).to_string(), "broadcast-tx-dlq");
    }
}
