//! The broadcaster: signed-tx consumer that submits raw transactions.
//!
//! Each signed-tx message is submitted once via the chain's RPC. A node
//! answering `already known` (or an equivalent duplicate-transaction error)
//! counts as success, which makes redelivered messages idempotent. On
//! success the broadcaster persists the `SentTransaction` row, advances the
//! linked request/batch, and emits a broadcast result to the monitor's
//! queue. On failure the payload goes to the signed-tx DLQ with the error
//! attribute — the broadcaster never retries on its own; retries belong to
//! the recovery engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::chain::ChainKey;
use crate::queue::{Message, MessageAttributes, MessageQueue, QueueKind, QueueName};
use crate::registry::ChainRegistry;
use crate::rpc::RpcError;
use crate::store::RequestStore;
use crate::types::{
    BatchStatus, BroadcastMetadata, BroadcastResultMessage, BroadcastStatus, RequestStatus,
    SentTransaction, SignedTxKind, SignedTxMessage, TransactionType, UnixMillis,
};

/// Tuning for the broadcaster loop.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub receive_max: usize,
    pub receive_wait: Duration,
    pub visibility_timeout: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            receive_max: 10,
            receive_wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// Drain counters, logged at shutdown.
#[derive(Debug, Default)]
pub struct BroadcasterStats {
    pub received: AtomicU64,
    pub broadcasted: AtomicU64,
    pub duplicates: AtomicU64,
    pub failed: AtomicU64,
}

/// The C6 broadcaster.
pub struct Broadcaster {
    config: BroadcasterConfig,
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn RequestStore>,
    registry: Arc<ChainRegistry>,
    pub stats: BroadcasterStats,
}

/// Node error strings that mean the transaction is already in the pool or
/// chain; a resubmission of the same raw bytes is a success.
fn is_duplicate_error(error: &RpcError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("already known")
        || message.contains("known transaction")
        || message.contains("alreadyexists")
        || message.contains("transaction already imported")
}

impl Broadcaster {
    pub fn new(
        config: BroadcasterConfig,
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn RequestStore>,
        registry: Arc<ChainRegistry>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            registry,
            stats: BroadcasterStats::default(),
        }
    }

    /// Main loop: pull signed-tx batches until shutdown.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("broadcaster started");
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.queue.receive(
                    QueueName::forward(QueueKind::SignedTx),
                    self.config.receive_max,
                    self.config.receive_wait,
                    self.config.visibility_timeout,
                ) => received,
            };
            match received {
                Ok(messages) => {
                    for message in messages {
                        self.process_message(message).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "signed queue receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        tracing::info!(
            received = self.stats.received.load(Ordering::Relaxed),
            broadcasted = self.stats.broadcasted.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            "broadcaster drained"
        );
    }

    #[instrument(skip_all, fields(message_id = %message.message_id))]
    pub(crate) async fn process_message(&self, message: Message) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let signed: SignedTxMessage = match serde_json::from_str(&message.body) {
            Ok(signed) => signed,
            Err(err) => {
                tracing::warn!(%err, "malformed signed-tx payload");
                let _ = self
                    .queue
                    .send_to_dlq(
                        QueueKind::SignedTx,
                        message.body.clone(),
                        message.attributes.clone(),
                        format!("malformed payload: {err}"),
                    )
                    .await;
                self.delete(&message).await;
                return;
            }
        };

        let key = ChainKey::new(signed.chain, signed.network);
        let Some(rpc) = self.registry.rpc(key) else {
            tracing::error!(%key, tx_hash = %signed.tx_hash, "no provider for signed transaction");
            let _ = self
                .queue
                .send_to_dlq(
                    QueueKind::SignedTx,
                    message.body.clone(),
                    message.attributes.clone(),
                    format!("unsupported chain {key}"),
                )
                .await;
            self.delete(&message).await;
            return;
        };

        if let Err(err) = self
            .store
            .update_requests_status(&signed.affected_request_ids, RequestStatus::Broadcasting)
            .await
        {
            tracing::warn!(%err, "status update to BROADCASTING failed");
        }

        match rpc.send_raw_transaction(&signed.raw_transaction).await {
            Ok(node_hash) => {
                self.stats.broadcasted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(tx_hash = %node_hash, nonce = signed.nonce, "transaction broadcast");
                self.finish_success(&signed, Some(node_hash), &message).await;
            }
            Err(err) if is_duplicate_error(&err) => {
                // The node has the transaction from an earlier delivery.
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::info!(tx_hash = %signed.tx_hash, "transaction already known to node");
                self.finish_success(&signed, None, &message).await;
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%err, tx_hash = %signed.tx_hash, "broadcast failed, forwarding to dlq");
                let _ = self
                    .queue
                    .send_to_dlq(
                        QueueKind::SignedTx,
                        message.body.clone(),
                        message.attributes.clone(),
                        err.to_string(),
                    )
                    .await;
                self.delete(&message).await;
            }
        }
    }

    /// Persist the sent row, advance statuses, and emit the broadcast result.
    ///
    /// If the result emission fails the source message is left in flight;
    /// its redelivery re-submits the raw bytes and lands in the
    /// `already known` path.
    async fn finish_success(
        &self,
        signed: &SignedTxMessage,
        node_hash: Option<alloy_primitives::B256>,
        message: &Message,
    ) {
        let now = UnixMillis::now();
        let sent = SentTransaction {
            tx_hash: signed.tx_hash,
            request_id: signed.request_id.clone(),
            batch_id: signed.batch_id.clone(),
            chain: signed.chain,
            network: signed.network,
            nonce: signed.nonce,
            max_fee_per_gas: signed.max_fee_per_gas,
            sent_at: now,
            block_number: None,
        };
        if let Err(err) = self.store.record_sent(sent).await {
            tracing::error!(%err, "persisting sent transaction failed");
        }
        if let Err(err) = self
            .store
            .update_requests_status(&signed.affected_request_ids, RequestStatus::Confirming)
            .await
        {
            tracing::warn!(%err, "status update to CONFIRMING failed");
        }
        if let Some(batch_id) = &signed.batch_id {
            if let Err(err) = self
                .store
                .update_batch_status(batch_id, BatchStatus::Broadcasted, None)
                .await
            {
                tracing::warn!(%err, %batch_id, "batch status update failed");
            }
        }

        let result = BroadcastResultMessage {
            id: format!("bcast-{:016x}", rand::random::<u64>()),
            transaction_type: match signed.kind {
                SignedTxKind::Single => TransactionType::Single,
                SignedTxKind::Batch => TransactionType::Batch,
            },
            withdrawal_id: signed.request_id.clone(),
            batch_id: signed.batch_id.clone(),
            original_transaction_hash: signed.tx_hash,
            broadcast_transaction_hash: node_hash,
            status: BroadcastStatus::Broadcasted,
            error: None,
            broadcasted_at: Some(now),
            block_number: None,
            gas_used: None,
            chain: signed.chain,
            network: signed.network,
            nonce: signed.nonce,
            max_fee_per_gas: signed.max_fee_per_gas,
            metadata: BroadcastMetadata {
                affected_requests: signed.affected_request_ids.clone(),
            },
        };
        let body = match serde_json::to_string(&result) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(%err, "broadcast result serialization failed");
                return;
            }
        };
        if let Err(err) = self
            .queue
            .send(
                QueueName::forward(QueueKind::BroadcastTx),
                body,
                MessageAttributes::default(),
            )
            .await
        {
            tracing::error!(%err, "broadcast result emission failed, leaving message in flight");
            return;
        }
        self.delete(message).await;
    }

    async fn delete(&self, message: &Message) {
        if let Err(err) = self
            .queue
            .delete(QueueName::forward(QueueKind::SignedTx), &message.receipt)
            .await
        {
            tracing::warn!(%err, message_id = %message.message_id, "message delete failed");
        }
    }
}
