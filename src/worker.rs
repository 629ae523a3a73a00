//! The signing worker: request-queue consumer that validates, claims, and
//! signs withdrawals.
//!
//! One loop drives `receive → validate → claim → classify → sign → enqueue`.
//! Validation failures terminate the request with a human-readable reason
//! and consume the message. The atomic claim serializes ownership across
//! worker instances; messages that lose the claim are deleted to stop
//! redelivery thrash. Claimed requests are classified single-vs-batch: only
//! fresh (`try_count == 0`) token transfers sharing (chain, network, token)
//! may batch, and only when the projected gas saving clears the configured
//! threshold. Batch formation re-validates ownership of every member inside
//! one store transaction and falls back to single processing when members
//! were taken over. Signing failures release the request and leave the
//! source message in flight so the visibility timeout requeues it.

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolCall;
use dashmap::DashMap;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::batcher::{MulticallBatcher, NormalizedTransfer};
use crate::chain::ChainKey;
use crate::nonce::{NonceCache, SignerKey};
use crate::queue::{Message, MessageAttributes, MessageQueue, QueueKind, QueueName};
use crate::registry::{ChainRegistry, ChainSettings};
use crate::rpc::{EvmRpc, FeeData, GasEstimateRequest};
use crate::signer::{SignRequest, SignerCache};
use crate::store::{BatchFormation, ClaimOutcome, NewBatch, RequestStore};
use crate::types::{
    SignedTransaction, SignedTxKind, SignedTxMessage, UnixMillis, WithdrawalRequest,
};

/// Tuning for the signing worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity used for the atomic claim.
    pub instance_id: String,
    pub receive_max: usize,
    pub receive_wait: Duration,
    pub visibility_timeout: Duration,
    pub batch_enabled: bool,
    /// Minimum claimed fresh requests before batching is considered.
    pub min_batch_size: usize,
    /// Minimum size of a single token group to form a batch.
    pub batch_threshold: usize,
    /// Required projected gas saving, as a fraction.
    pub min_gas_savings_percent: f64,
    /// Projection constants for the savings estimate.
    pub single_tx_gas: u64,
    pub batch_base_gas: u64,
    pub batch_per_tx_gas: u64,
    pub fee_cache_ttl: Duration,
    /// `allowFailure` on each aggregated call.
    pub allow_failure_per_call: bool,
    pub native_gas_limit: u64,
    pub token_gas_limit: u64,
    /// Safety multiplier on node gas estimates.
    pub gas_estimate_multiplier: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("worker-{:08x}", rand::random::<u32>()),
            receive_max: 10,
            receive_wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(300),
            batch_enabled: true,
            min_batch_size: 3,
            batch_threshold: 3,
            min_gas_savings_percent: 0.20,
            single_tx_gas: 65_000,
            batch_base_gas: 120_000,
            batch_per_tx_gas: 30_000,
            fee_cache_ttl: Duration::from_secs(10),
            allow_failure_per_call: false,
            native_gas_limit: 21_000,
            token_gas_limit: 100_000,
            gas_estimate_multiplier: 1.15,
        }
    }
}

/// Drain counters, logged at shutdown.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub received: AtomicU64,
    pub signed_single: AtomicU64,
    pub signed_batch: AtomicU64,
    pub validation_failures: AtomicU64,
    pub ownership_skips: AtomicU64,
    pub signing_failures: AtomicU64,
}

/// The C5 signing worker.
pub struct SigningWorker {
    config: WorkerConfig,
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn RequestStore>,
    registry: Arc<ChainRegistry>,
    nonces: NonceCache,
    signers: Arc<SignerCache>,
    batcher: Arc<MulticallBatcher>,
    fee_cache: DashMap<ChainKey, (Instant, FeeData)>,
    pub stats: WorkerStats,
}

/// A message whose request passed validation and the claim.
struct ClaimedRequest {
    request: WithdrawalRequest,
    message: Message,
}

impl SigningWorker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn RequestStore>,
        registry: Arc<ChainRegistry>,
        nonces: NonceCache,
        signers: Arc<SignerCache>,
        batcher: Arc<MulticallBatcher>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            registry,
            nonces,
            signers,
            batcher,
            fee_cache: DashMap::new(),
            stats: WorkerStats::default(),
        }
    }

    /// Main loop: pull request batches until shutdown.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(instance = %self.config.instance_id, "signing worker started");
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.queue.receive(
                    QueueName::forward(QueueKind::TxRequest),
                    self.config.receive_max,
                    self.config.receive_wait,
                    self.config.visibility_timeout,
                ) => received,
            };
            match received {
                Ok(messages) if messages.is_empty() => continue,
                Ok(messages) => self.process_messages(messages).await,
                Err(err) => {
                    tracing::warn!(%err, "request queue receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        tracing::info!(
            instance = %self.config.instance_id,
            received = self.stats.received.load(Ordering::Relaxed),
            signed_single = self.stats.signed_single.load(Ordering::Relaxed),
            signed_batch = self.stats.signed_batch.load(Ordering::Relaxed),
            validation_failures = self.stats.validation_failures.load(Ordering::Relaxed),
            "signing worker drained"
        );
    }

    /// One processing cycle over a received message batch.
    #[instrument(skip_all, fields(instance = %self.config.instance_id, count = messages.len()))]
    pub(crate) async fn process_messages(&self, messages: Vec<Message>) {
        self.stats
            .received
            .fetch_add(messages.len() as u64, Ordering::Relaxed);

        let mut claimed: Vec<ClaimedRequest> = Vec::new();
        for message in messages {
            if let Some(entry) = self.validate_and_claim(message).await {
                claimed.push(entry);
            }
        }
        if claimed.is_empty() {
            return;
        }

        // Previously attempted requests are never batched: a retried request
        // can carry nonce history a batch would mask.
        let (fresh, retries): (Vec<ClaimedRequest>, Vec<ClaimedRequest>) =
            claimed.into_iter().partition(|c| c.request.try_count == 0);
        for entry in retries {
            self.sign_single(entry).await;
        }

        let (batch_groups, singles) = self.classify(fresh);
        for entry in singles {
            self.sign_single(entry).await;
        }
        for group in batch_groups {
            self.sign_batch(group).await;
        }
    }

    /// Parse, validate, and claim one message. Returns `None` when the
    /// message was consumed (or intentionally left for redelivery).
    async fn validate_and_claim(&self, message: Message) -> Option<ClaimedRequest> {
        let request: WithdrawalRequest = match serde_json::from_str(&message.body) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(%err, message_id = %message.message_id, "malformed request payload");
                let _ = self
                    .queue
                    .send_to_dlq(
                        QueueKind::TxRequest,
                        message.body.clone(),
                        message.attributes.clone(),
                        format!("malformed payload: {err}"),
                    )
                    .await;
                self.delete(&message).await;
                return None;
            }
        };

        if let Some(reason) = self.validate(&request) {
            self.stats.validation_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(request_id = %request.request_id, %reason, "request failed validation");
            if let Err(err) = self
                .store
                .mark_request_failed(&request.request_id, &reason)
                .await
            {
                tracing::debug!(%err, request_id = %request.request_id, "failed row missing on validation failure");
            }
            self.delete(&message).await;
            return None;
        }

        match self
            .store
            .claim_request(&request.request_id, &self.config.instance_id)
            .await
        {
            Ok(ClaimOutcome::Claimed) => {
                // Re-read for current try_count and row state.
                match self.store.get_request(&request.request_id).await {
                    Ok(Some(request)) => Some(ClaimedRequest { request, message }),
                    Ok(None) => {
                        self.delete(&message).await;
                        None
                    }
                    Err(err) => {
                        tracing::error!(%err, request_id = %request.request_id, "store read failed after claim");
                        None
                    }
                }
            }
            Ok(ClaimOutcome::AlreadyOwned) => {
                // Redelivery of something this instance already processed or
                // is processing; consuming it prevents a second signature.
                self.stats.ownership_skips.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(request_id = %request.request_id, "redelivery of owned request, dropping");
                self.delete(&message).await;
                None
            }
            Ok(ClaimOutcome::NotOurs) | Ok(ClaimOutcome::NotFound) => {
                self.stats.ownership_skips.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(request_id = %request.request_id, "request not claimable, dropping message");
                self.delete(&message).await;
                None
            }
            Err(err) => {
                // Transient store failure: leave the message for redelivery.
                tracing::warn!(%err, request_id = %request.request_id, "claim failed");
                None
            }
        }
    }

    /// Produce a validation error, or `None` for a well-formed request.
    fn validate(&self, request: &WithdrawalRequest) -> Option<String> {
        let key = ChainKey::new(request.chain, request.network);
        if !self.registry.supports(key) {
            return Some(format!("unsupported chain {key}"));
        }
        if Address::from_str(&request.to).is_err() {
            return Some(format!("malformed recipient address {}", request.to));
        }
        if let Some(token) = &request.token_address {
            if Address::from_str(token).is_err() {
                return Some(format!("malformed token address {token}"));
            }
        }
        let amount = request.amount.trim();
        let numeric_ok = if amount.contains('.') {
            rust_decimal::Decimal::from_str(amount)
                .map(|d| d > rust_decimal::Decimal::ZERO)
                .unwrap_or(false)
        } else {
            U256::from_str(amount).map(|v| !v.is_zero()).unwrap_or(false)
        };
        if !numeric_ok {
            return Some(format!("amount is not a positive number: {amount}"));
        }
        None
    }

    /// Partition fresh claims into batchable groups and singles.
    fn classify(
        &self,
        fresh: Vec<ClaimedRequest>,
    ) -> (Vec<Vec<ClaimedRequest>>, Vec<ClaimedRequest>) {
        if !self.config.batch_enabled || fresh.len() < self.config.min_batch_size {
            return (Vec::new(), fresh);
        }
        // Group by (chain, network, token fingerprint); native transfers
        // cannot ride transferFrom and always go single.
        let mut groups: HashMap<(ChainKey, String), Vec<ClaimedRequest>> = HashMap::new();
        let mut singles = Vec::new();
        for entry in fresh {
            let fingerprint = entry.request.token_fingerprint();
            if fingerprint == "native" {
                singles.push(entry);
                continue;
            }
            let key = ChainKey::new(entry.request.chain, entry.request.network);
            groups.entry((key, fingerprint)).or_default().push(entry);
        }
        let mut batches = Vec::new();
        for (_, group) in groups {
            let n = group.len();
            if n >= self.config.batch_threshold && self.projected_savings(n as u64) {
                batches.push(group);
            } else {
                singles.extend(group);
            }
        }
        (batches, singles)
    }

    /// Whether the projected gas saving for an `n`-transfer batch clears the
    /// configured minimum.
    fn projected_savings(&self, n: u64) -> bool {
        let single_total = (self.config.single_tx_gas * n) as f64;
        let batch_total = (self.config.batch_base_gas + self.config.batch_per_tx_gas * n) as f64;
        if single_total <= 0.0 {
            return false;
        }
        let saving = (single_total - batch_total) / single_total;
        saving >= self.config.min_gas_savings_percent
    }

    /// Fee data for a chain, cached with a short TTL.
    async fn fee_data(&self, key: ChainKey, rpc: &dyn EvmRpc) -> Result<FeeData, String> {
        if let Some(cached) = self.fee_cache.get(&key) {
            let (at, fee) = *cached.value();
            if at.elapsed() < self.config.fee_cache_ttl {
                return Ok(fee);
            }
        }
        let fee = rpc.get_fee_data().await.map_err(|e| e.to_string())?;
        self.fee_cache.insert(key, (Instant::now(), fee));
        Ok(fee)
    }

    /// Sign one request on its own.
    #[instrument(skip_all, fields(request_id = %entry.request.request_id))]
    async fn sign_single(&self, entry: ClaimedRequest) {
        let ClaimedRequest { request, message } = entry;
        // Ownership recheck guards the destructive VALIDATING → SIGNING
        // transition.
        match self
            .store
            .begin_single_signing(&request.request_id, &self.config.instance_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("ownership lost before signing, leaving message");
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "store failure before signing");
                return;
            }
        }

        match self.build_and_sign_single(&request).await {
            Ok(signed) => {
                if self.publish_signed(signed, &[message]).await {
                    self.stats.signed_single.fetch_add(1, Ordering::Relaxed);
                } else if let Err(err) = self
                    .store
                    .release_request(&request.request_id, "signed publication failed")
                    .await
                {
                    tracing::error!(%err, "release after publish failure failed");
                }
            }
            Err(reason) => {
                self.stats.signing_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%reason, "single signing failed, releasing request");
                if let Err(err) = self.store.release_request(&request.request_id, &reason).await {
                    tracing::error!(%err, "release after signing failure failed");
                }
                // Message intentionally not deleted: visibility timeout
                // requeues it.
            }
        }
    }

    async fn build_and_sign_single(
        &self,
        request: &WithdrawalRequest,
    ) -> Result<SignedTxMessage, String> {
        let key = ChainKey::new(request.chain, request.network);
        let settings = self
            .registry
            .settings(key)
            .ok_or_else(|| format!("unsupported chain {key}"))?
            .clone();
        let rpc = self
            .registry
            .rpc(key)
            .ok_or_else(|| format!("no rpc for {key}"))?;
        let signer = self
            .signers
            .signer_for(key)
            .map_err(|e| format!("signer unavailable: {e}"))?;
        let recipient = Address::from_str(&request.to).map_err(|e| e.to_string())?;

        let (to, value, data) = match &request.token_address {
            None => {
                let amount = normalize_native(&request.amount)?;
                (recipient, amount, Vec::new())
            }
            Some(token) => {
                let token = Address::from_str(token).map_err(|e| e.to_string())?;
                let amount = self
                    .batcher
                    .normalize_amount(&key, &token, &request.amount)
                    .map_err(|e| e.to_string())?;
                let call = crate::batcher::IERC20::transferCall {
                    to: recipient,
                    amount,
                };
                (token, U256::ZERO, call.abi_encode())
            }
        };

        let gas_limit = self
            .estimate_gas_limit(rpc.as_ref(), signer.address(), to, value, &data, &request.token_address)
            .await;
        let fee = self.fee_data(key, rpc.as_ref()).await?;
        let nonce = self
            .nonces
            .increment_and_get(rpc.as_ref(), SignerKey::new(signer.address(), key))
            .await
            .map_err(|e| format!("nonce allocation failed: {e}"))?;

        let envelope = signer
            .sign(&SignRequest {
                chain_id: settings.chain_id,
                nonce,
                to,
                value,
                data: data.clone(),
                gas_limit,
                max_fee_per_gas: fee.max_fee_per_gas,
                max_priority_fee_per_gas: fee.max_priority_fee_per_gas,
            })
            .map_err(|e| e.to_string())?;

        Ok(SignedTxMessage {
            kind: SignedTxKind::Single,
            request_id: Some(request.request_id.clone()),
            batch_id: None,
            tx_hash: envelope.hash,
            raw_transaction: envelope.raw,
            nonce,
            gas_limit,
            max_fee_per_gas: fee.max_fee_per_gas,
            max_priority_fee_per_gas: fee.max_priority_fee_per_gas,
            from: envelope.from,
            to,
            value,
            data,
            chain: request.chain,
            chain_id: settings.chain_id,
            network: request.network,
            affected_request_ids: vec![request.request_id.clone()],
        })
    }

    async fn estimate_gas_limit(
        &self,
        rpc: &dyn EvmRpc,
        from: Address,
        to: Address,
        value: U256,
        data: &[u8],
        token: &Option<String>,
    ) -> u64 {
        let request = GasEstimateRequest {
            from,
            to,
            value,
            data: data.to_vec(),
        };
        match rpc.estimate_gas(&request).await {
            Ok(estimate) => {
                ((estimate as f64) * self.config.gas_estimate_multiplier).ceil() as u64
            }
            Err(err) => {
                tracing::debug!(%err, "gas estimation failed, using default limit");
                if token.is_some() {
                    self.config.token_gas_limit
                } else {
                    self.config.native_gas_limit
                }
            }
        }
    }

    /// Sign a token group as one or more aggregate batches.
    #[instrument(skip_all, fields(members = group.len()))]
    async fn sign_batch(&self, group: Vec<ClaimedRequest>) {
        let Some(first) = group.first() else { return };
        let key = ChainKey::new(first.request.chain, first.request.network);
        let Some(settings) = self.registry.settings(key).cloned() else {
            return;
        };

        // Normalize up front; a member that cannot normalize sends the whole
        // group down the single path where it fails in isolation.
        let mut normalized = Vec::with_capacity(group.len());
        for entry in &group {
            let token = entry
                .request
                .token_address
                .as_deref()
                .and_then(|t| Address::from_str(t).ok());
            let Some(token) = token else {
                tracing::warn!(request_id = %entry.request.request_id, "batch member without token, falling back to single");
                return self.fall_back_to_single(group).await;
            };
            match self
                .batcher
                .normalize_amount(&key, &token, &entry.request.amount)
            {
                Ok(amount) => normalized.push(NormalizedTransfer {
                    transaction_id: entry.request.request_id.clone(),
                    token,
                    to: match Address::from_str(&entry.request.to) {
                        Ok(to) => to,
                        Err(_) => return self.fall_back_to_single(group).await,
                    },
                    amount,
                }),
                Err(err) => {
                    tracing::warn!(request_id = %entry.request.request_id, %err, "batch member normalization failed");
                    return self.fall_back_to_single(group).await;
                }
            }
        }

        let mut by_id: HashMap<String, ClaimedRequest> = group
            .into_iter()
            .map(|entry| (entry.request.request_id.clone(), entry))
            .collect();

        // Gas-bounded splitting keeps per-token grouping.
        for chunk in self.batcher.split(&settings, normalized) {
            let members: Vec<ClaimedRequest> = chunk
                .iter()
                .filter_map(|t| by_id.remove(&t.transaction_id))
                .collect();
            self.form_and_sign_batch(key, &settings, chunk, members).await;
        }
    }

    async fn fall_back_to_single(&self, group: Vec<ClaimedRequest>) {
        for entry in group {
            self.sign_single(entry).await;
        }
    }

    async fn form_and_sign_batch(
        &self,
        key: ChainKey,
        settings: &ChainSettings,
        transfers: Vec<NormalizedTransfer>,
        members: Vec<ClaimedRequest>,
    ) {
        let batch_id = format!("batch-{:016x}", rand::random::<u64>());
        let total: U256 = transfers.iter().map(|t| t.amount).fold(U256::ZERO, |a, b| a + b);
        let fingerprint = members
            .first()
            .map(|m| m.request.token_fingerprint())
            .unwrap_or_default();
        let member_ids: Vec<String> = transfers.iter().map(|t| t.transaction_id.clone()).collect();

        let formation = self
            .store
            .form_batch(
                NewBatch {
                    batch_id: batch_id.clone(),
                    aggregator: settings.aggregator,
                    member_request_ids: member_ids.clone(),
                    total_amount: total,
                    token_fingerprint: fingerprint,
                    chain: key.chain,
                    network: key.network,
                },
                &self.config.instance_id,
            )
            .await;

        match formation {
            Ok(BatchFormation::Formed(_)) => {
                self.sign_formed_batch(key, settings, batch_id, transfers, members)
                    .await;
            }
            Ok(BatchFormation::Aborted { still_owned }) => {
                tracing::info!(
                    expected = member_ids.len(),
                    surviving = still_owned.len(),
                    "batch formation aborted, falling back to single"
                );
                let mut survivors = Vec::new();
                for entry in members {
                    if still_owned.contains(&entry.request.request_id) {
                        survivors.push(entry);
                    } else {
                        // Lost to another instance: consume the message.
                        self.delete(&entry.message).await;
                    }
                }
                self.fall_back_to_single(survivors).await;
            }
            Err(err) => {
                tracing::error!(%err, "batch formation transaction failed");
                // Leave every message for redelivery.
            }
        }
    }

    async fn sign_formed_batch(
        &self,
        key: ChainKey,
        settings: &ChainSettings,
        batch_id: String,
        transfers: Vec<NormalizedTransfer>,
        members: Vec<ClaimedRequest>,
    ) {
        let result = self
            .build_and_sign_batch(key, settings, &batch_id, &transfers)
            .await;
        match result {
            Ok(signed) => {
                let messages: Vec<Message> =
                    members.into_iter().map(|entry| entry.message).collect();
                if self.publish_signed(signed, &messages).await {
                    self.stats.signed_batch.fetch_add(1, Ordering::Relaxed);
                } else if let Err(err) = self
                    .store
                    .dissolve_batch(&batch_id, "signed publication failed")
                    .await
                {
                    tracing::error!(%err, %batch_id, "dissolve after publish failure failed");
                }
            }
            Err(reason) => {
                self.stats.signing_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%reason, %batch_id, "batch signing failed, dissolving");
                if let Err(err) = self.store.dissolve_batch(&batch_id, &reason).await {
                    tracing::error!(%err, %batch_id, "batch dissolve failed");
                }
                // Messages intentionally not deleted; visibility requeues
                // the members for a fresh cycle.
            }
        }
    }

    async fn build_and_sign_batch(
        &self,
        key: ChainKey,
        settings: &ChainSettings,
        batch_id: &str,
        transfers: &[NormalizedTransfer],
    ) -> Result<SignedTxMessage, String> {
        let rpc = self
            .registry
            .rpc(key)
            .ok_or_else(|| format!("no rpc for {key}"))?;
        let signer = self
            .signers
            .signer_for(key)
            .map_err(|e| format!("signer unavailable: {e}"))?;

        let calls = self.batcher.encode_calls(
            signer.address(),
            transfers,
            self.config.allow_failure_per_call,
        );
        let data = self.batcher.encode_aggregate(calls);
        let gas_limit = self
            .batcher
            .estimate_batch_gas(
                rpc.as_ref(),
                settings,
                signer.address(),
                transfers,
                self.config.allow_failure_per_call,
            )
            .await;
        let fee = self.fee_data(key, rpc.as_ref()).await?;
        let nonce = self
            .nonces
            .increment_and_get(rpc.as_ref(), SignerKey::new(signer.address(), key))
            .await
            .map_err(|e| format!("nonce allocation failed: {e}"))?;

        let envelope = signer
            .sign(&SignRequest {
                chain_id: settings.chain_id,
                nonce,
                to: settings.aggregator,
                value: U256::ZERO,
                data: data.clone(),
                gas_limit,
                max_fee_per_gas: fee.max_fee_per_gas,
                max_priority_fee_per_gas: fee.max_priority_fee_per_gas,
            })
            .map_err(|e| e.to_string())?;

        Ok(SignedTxMessage {
            kind: SignedTxKind::Batch,
            request_id: None,
            batch_id: Some(batch_id.to_string()),
            tx_hash: envelope.hash,
            raw_transaction: envelope.raw,
            nonce,
            gas_limit,
            max_fee_per_gas: fee.max_fee_per_gas,
            max_priority_fee_per_gas: fee.max_priority_fee_per_gas,
            from: envelope.from,
            to: settings.aggregator,
            value: U256::ZERO,
            data,
            chain: key.chain,
            chain_id: settings.chain_id,
            network: key.network,
            affected_request_ids: transfers
                .iter()
                .map(|t| t.transaction_id.clone())
                .collect(),
        })
    }

    /// Persist the signed row, enqueue the signed-tx message, and consume the
    /// source messages. Returns `false` when publication failed (sources are
    /// left for redelivery).
    async fn publish_signed(&self, signed: SignedTxMessage, sources: &[Message]) -> bool {
        let row = SignedTransaction {
            tx_hash: signed.tx_hash,
            request_id: signed.request_id.clone(),
            batch_id: signed.batch_id.clone(),
            from: signed.from,
            to: signed.to,
            value: signed.value,
            data: signed.data.clone(),
            nonce: signed.nonce,
            gas_limit: signed.gas_limit,
            max_fee_per_gas: signed.max_fee_per_gas,
            max_priority_fee_per_gas: signed.max_priority_fee_per_gas,
            chain_id: signed.chain_id,
            raw_transaction: signed.raw_transaction.clone(),
            created_at: UnixMillis::now(),
        };
        if let Err(err) = self.store.mark_signed(row).await {
            tracing::error!(%err, tx_hash = %signed.tx_hash, "persisting signed transaction failed");
            return false;
        }
        let body = match serde_json::to_string(&signed) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(%err, "signed message serialization failed");
                return false;
            }
        };
        if let Err(err) = self
            .queue
            .send(
                QueueName::forward(QueueKind::SignedTx),
                body,
                MessageAttributes::default(),
            )
            .await
        {
            tracing::error!(%err, tx_hash = %signed.tx_hash, "signed queue send failed");
            return false;
        }
        tracing::info!(
            tx_hash = %signed.tx_hash,
            nonce = signed.nonce,
            kind = ?signed.kind,
            "transaction signed and enqueued"
        );
        for message in sources {
            self.delete(message).await;
        }
        true
    }

    async fn delete(&self, message: &Message) {
        if let Err(err) = self
            .queue
            .delete(QueueName::forward(QueueKind::TxRequest), &message.receipt)
            .await
        {
            tracing::warn!(%err, message_id = %message.message_id, "message delete failed");
        }
    }
}

/// Native amounts: base units unless a decimal string, which scales by 18.
fn normalize_native(raw: &str) -> Result<U256, String> {
    if raw.contains('.') {
        let decimal = rust_decimal::Decimal::from_str(raw).map_err(|e| e.to_string())?;
        if decimal <= rust_decimal::Decimal::ZERO {
            return Err(format!("amount is not positive: {raw}"));
        }
        let scale = decimal.scale();
        if scale > 18 {
            return Err(format!("amount {raw} exceeds native precision"));
        }
        let mantissa = decimal.mantissa();
        let multiplier = U256::from(10u64).pow(U256::from(18 - scale));
        Ok(U256::from(mantissa as u128) * multiplier)
    } else {
        let value = U256::from_str(raw).map_err(|e| e.to_string())?;
        if value.is_zero() {
            return Err(format!("amount is not positive: {raw}"));
        }
        Ok(value)
    }
}
