//! The recovery engine: DLQ consumption, classification, strategy dispatch.
//!
//! Three pollers long-poll the dead-letter queues in parallel and feed a
//! bounded priority queue. A processing loop dequeues ready messages,
//! classifies their error, and dispatches to the strategy registry:
//!
//! - a successful recovery deletes the DLQ message;
//! - a retryable failure goes back into the priority queue with a doubled
//!   deferral;
//! - anything else is dropped to the terminal failure log (and its DLQ
//!   message deleted — the strategies have already persisted the outcome).
//!
//! Non-retryable classes resolve through the terminal strategy and are never
//! re-enqueued to a forward queue.

pub mod classifier;
pub mod metrics;
pub mod priority_queue;
pub mod strategy;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::queue::{Message, MessageQueue, QueueKind, QueueName};
use classifier::{ClassifiedError, ErrorType, classify};
use metrics::{MetricsCollector, RecoveryDisposition};
use priority_queue::{Priority, PriorityMessage, RecoveryQueue};
use strategy::{RecoveryContext, StrategyRegistry};

/// Tuning for the recovery engine and its strategies.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Long-poll wait on each DLQ.
    pub poll_interval: Duration,
    pub receive_max: usize,
    pub visibility_timeout: Duration,
    /// Attempt budget shared by retryable strategies.
    pub max_attempts: u32,
    /// Delay before a network-class requeue.
    pub initial_delay: Duration,
    /// Base deferral for priority-queue retries; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Headroom factor on recomputed fees.
    pub fee_headroom: f64,
    pub enable_dummy_tx: bool,
    /// Largest nonce gap the dummy-transaction planner will fill.
    pub max_nonce_gap: u64,
    pub dummy_gas_limit: u64,
    /// Capacity of the priority queue; inserts beyond it fail loudly.
    pub max_queue_size: usize,
    /// Pause between processing passes when the queue is idle.
    pub process_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            receive_max: 10,
            visibility_timeout: Duration::from_secs(300),
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            retry_base_delay: Duration::from_secs(5),
            fee_headroom: 1.25,
            enable_dummy_tx: false,
            max_nonce_gap: 10,
            dummy_gas_limit: 21_000,
            max_queue_size: 1000,
            process_interval: Duration::from_millis(250),
        }
    }
}

/// The C8 recovery engine.
pub struct RecoveryEngine {
    ctx: RecoveryContext,
    strategies: StrategyRegistry,
    queue: RecoveryQueue,
    pub metrics: MetricsCollector,
}

impl RecoveryEngine {
    pub fn new(ctx: RecoveryContext) -> Self {
        let strategies = StrategyRegistry::defaults(&ctx.config);
        let queue = RecoveryQueue::new(ctx.config.max_queue_size);
        Self {
            ctx,
            strategies,
            queue,
            metrics: MetricsCollector::default(),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Pop the next ready message, for stepping the engine in tests.
    #[cfg(test)]
    pub(crate) fn dequeue_ready(&self) -> Option<PriorityMessage> {
        self.queue.dequeue()
    }

    /// Run the DLQ pollers and the processing loop until shutdown.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("recovery engine started");
        let tracker = TaskTracker::new();
        for kind in QueueKind::variants() {
            let engine = Arc::clone(&self);
            let cancel = cancel.clone();
            let kind = *kind;
            tracker.spawn(async move { engine.dlq_poller(kind, cancel).await });
        }
        {
            let engine = Arc::clone(&self);
            let cancel = cancel.clone();
            tracker.spawn(async move { engine.processing_loop(cancel).await });
        }
        cancel.cancelled().await;
        tracker.close();
        tracker.wait().await;
        let snapshot = self.metrics.snapshot();
        tracing::info!(
            received = snapshot.received,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            "recovery engine drained"
        );
    }

    async fn dlq_poller(&self, kind: QueueKind, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = self.ctx.queue.receive(
                    QueueName::dlq(kind),
                    self.ctx.config.receive_max,
                    self.ctx.config.poll_interval,
                    self.ctx.config.visibility_timeout,
                ) => received,
            };
            match received {
                Ok(messages) => {
                    for message in messages {
                        self.ingest(kind, message);
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, %kind, "dlq receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Classify and queue one DLQ message. On a full queue the message is
    /// left in flight so it redelivers after the visibility timeout.
    pub(crate) fn ingest(&self, kind: QueueKind, message: Message) {
        let error = message
            .attributes
            .error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        let classified = classify(&error);
        let priority = PriorityMessage::new(
            message.message_id.clone(),
            kind,
            message.body,
            message.attributes,
            error,
            message.receipt,
            base_priority(classified.error_type),
        );
        self.metrics.record_received(&message.message_id, kind);
        if let Err(err) = self.queue.insert(priority) {
            tracing::error!(%err, %kind, message_id = %message.message_id, "recovery queue full, message left on dlq");
        }
    }

    async fn processing_loop(&self, cancel: CancellationToken) {
        loop {
            if !crate::scheduler::after(self.ctx.config.process_interval, &cancel).await {
                return;
            }
            while let Some(message) = self.queue.dequeue() {
                self.process_one(message).await;
                if cancel.is_cancelled() {
                    return;
                }
            }
        }
    }

    /// Dispatch one priority message to its strategy and settle the outcome.
    #[instrument(skip_all, fields(id = %message.id, origin = %message.origin))]
    pub(crate) async fn process_one(&self, message: PriorityMessage) {
        let classified = classify(&message.error);
        let Some(strategy) = self.strategies.for_error(&classified) else {
            tracing::error!(
                error_type = %classified.error_type,
                "no strategy for classified error, dropping terminally"
            );
            self.settle_failure(&message, &classified).await;
            return;
        };
        tracing::debug!(strategy = strategy.name(), error_type = %classified.error_type, "dispatching recovery");
        let outcome = strategy.recover(&message, &classified, &self.ctx).await;
        if outcome.success {
            tracing::info!(strategy = strategy.name(), action = ?outcome.action, "recovery succeeded");
            self.delete_dlq(&message).await;
            self.metrics.record_completed(
                &message.id,
                RecoveryDisposition::Succeeded,
                classified.error_type,
                message.attributes.retry_count,
            );
            return;
        }
        let retries_left = message.attributes.retry_count < strategy.max_retries();
        if outcome.should_retry && retries_left {
            let attempt = message.attributes.retry_count + 1;
            let delay = self.ctx.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
            tracing::info!(
                strategy = strategy.name(),
                attempt,
                ?delay,
                reason = outcome.reason.as_deref().unwrap_or(""),
                "recovery deferred"
            );
            let id = message.id.clone();
            let mut retry = message;
            retry.attributes.retry_count = attempt;
            self.metrics.record_completed(
                &id,
                RecoveryDisposition::Requeued,
                classified.error_type,
                attempt,
            );
            self.metrics.record_received(&id, retry.origin);
            if let Err(err) = self.queue.insert(retry) {
                tracing::error!(%err, "re-insert failed, message left on dlq");
                return;
            }
            self.queue.schedule_retry(&id, delay);
            return;
        }
        tracing::warn!(
            strategy = strategy.name(),
            action = ?outcome.action,
            reason = outcome.reason.as_deref().unwrap_or(""),
            "recovery failed terminally"
        );
        self.settle_failure(&message, &classified).await;
    }

    /// Terminal failure log: the message is consumed and counted.
    async fn settle_failure(&self, message: &PriorityMessage, classified: &ClassifiedError) {
        self.delete_dlq(message).await;
        self.metrics.record_completed(
            &message.id,
            RecoveryDisposition::Failed,
            classified.error_type,
            message.attributes.retry_count,
        );
    }

    async fn delete_dlq(&self, message: &PriorityMessage) {
        if let Err(err) = self
            .ctx
            .queue
            .delete(QueueName::dlq(message.origin), &message.receipt)
            .await
        {
            tracing::warn!(%err, id = %message.id, "dlq delete failed");
        }
    }
}

/// Base priority by error class: ownership-threatening classes run first,
/// terminal bookkeeping last.
fn base_priority(error_type: ErrorType) -> Priority {
    match error_type {
        ErrorType::NonceError => Priority::High,
        ErrorType::GasError | ErrorType::NetworkError | ErrorType::Timeout => Priority::Normal,
        ErrorType::Unknown => Priority::Normal,
        ErrorType::InsufficientFunds | ErrorType::InvalidAddress | ErrorType::ContractError => {
            Priority::Low
        }
    }
}
