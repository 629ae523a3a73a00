//! Recovery strategies and their registry.
//!
//! Strategies implement `can_recover` / `recover` / `max_retries`. The
//! [`StrategyRegistry`] maps an [`ErrorType`] to candidate strategies and is
//! the only coupling between the classifier and the strategies: dispatch
//! picks the first candidate whose `can_recover` accepts the classified
//! error.

use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use super::RecoveryConfig;
use super::classifier::{ClassifiedError, ErrorType, NonceKind};
use super::priority_queue::PriorityMessage;
use crate::chain::ChainKey;
use crate::nonce::{NonceCache, SignerKey};
use crate::queue::{MessageAttributes, MessageQueue, QueueKind, QueueName};
use crate::registry::ChainRegistry;
use crate::signer::{SignRequest, SignerCache};
use crate::store::RequestStore;
use crate::types::{BroadcastResultMessage, SignedTxKind, SignedTxMessage, WithdrawalRequest};
use alloy_primitives::U256;

/// What a recovery pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Payload resent to its original forward queue.
    RequeuedToForward,
    /// Nonce already consumed on-chain; nothing to redo.
    NonceAlreadyProcessed,
    /// Dummy transactions were planned to fill a nonce gap.
    DummyTxPlanned { count: u64 },
    NonceGapTooLarge,
    DummyTxDisabled,
    /// Transaction re-signed with elevated fees and requeued.
    FeesBumpedAndRequeued,
    /// Affected requests terminally failed.
    MarkedFailed,
    /// Deferred for a later pass.
    RetryScheduled,
}

/// Result of one `recover` call.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub action: RecoveryAction,
    pub should_retry: bool,
    pub reason: Option<String>,
}

impl RecoveryOutcome {
    fn success(action: RecoveryAction) -> Self {
        Self {
            success: true,
            action,
            should_retry: false,
            reason: None,
        }
    }

    fn failure(action: RecoveryAction, reason: impl Into<String>, should_retry: bool) -> Self {
        Self {
            success: false,
            action,
            should_retry,
            reason: Some(reason.into()),
        }
    }
}

/// Shared services available to strategies.
pub struct RecoveryContext {
    pub queue: Arc<dyn MessageQueue>,
    pub store: Arc<dyn RequestStore>,
    pub registry: Arc<ChainRegistry>,
    pub signers: Arc<SignerCache>,
    pub nonces: NonceCache,
    pub config: RecoveryConfig,
}

/// A recovery strategy.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_recover(&self, classified: &ClassifiedError) -> bool;
    async fn recover(
        &self,
        message: &PriorityMessage,
        classified: &ClassifiedError,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome;
    fn max_retries(&self) -> u32;
}

// ---- network / timeout ---------------------------------------------------

/// Transient connectivity failures: wait briefly, then hand the payload back
/// to its original forward queue with an incremented retry count.
pub struct NetworkStrategy;

#[async_trait]
impl RecoveryStrategy for NetworkStrategy {
    fn name(&self) -> &'static str {
        "network"
    }

    fn can_recover(&self, classified: &ClassifiedError) -> bool {
        classified.is_retryable
            && matches!(
                classified.error_type,
                ErrorType::NetworkError | ErrorType::Timeout
            )
    }

    async fn recover(
        &self,
        message: &PriorityMessage,
        _classified: &ClassifiedError,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        if message.attributes.retry_count >= ctx.config.max_attempts {
            return RecoveryOutcome::failure(
                RecoveryAction::MarkedFailed,
                "network retries exhausted",
                false,
            );
        }
        tokio::time::sleep(ctx.config.initial_delay).await;
        let mut attributes = message.attributes.clone();
        attributes.retry_count += 1;
        attributes.recovery_attempt = Some(crate::types::UnixMillis::now().to_string());
        match ctx
            .queue
            .send(
                QueueName::forward(message.origin),
                message.body.clone(),
                attributes,
            )
            .await
        {
            Ok(_) => RecoveryOutcome::success(RecoveryAction::RequeuedToForward),
            Err(err) => RecoveryOutcome::failure(
                RecoveryAction::RetryScheduled,
                format!("requeue failed: {err}"),
                true,
            ),
        }
    }

    fn max_retries(&self) -> u32 {
        5
    }
}

// ---- nonce too low -------------------------------------------------------

/// A too-low nonce means the nonce was already consumed, most likely by this
/// very transaction in an earlier delivery. Surface as success.
pub struct NonceLowStrategy;

#[async_trait]
impl RecoveryStrategy for NonceLowStrategy {
    fn name(&self) -> &'static str {
        "nonce-low"
    }

    fn can_recover(&self, classified: &ClassifiedError) -> bool {
        classified.error_type == ErrorType::NonceError
            && classified
                .nonce
                .is_some_and(|n| n.kind == NonceKind::TooLow)
    }

    async fn recover(
        &self,
        message: &PriorityMessage,
        _classified: &ClassifiedError,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        reset_diverged_nonce(ctx, &message.body).await;
        tracing::info!(id = %message.id, "nonce already consumed, treating as processed");
        RecoveryOutcome::success(RecoveryAction::NonceAlreadyProcessed)
    }

    fn max_retries(&self) -> u32 {
        1
    }
}

/// Detected nonce divergence: drop the signer's cached counter so the next
/// allocation re-seeds from the node. Best effort; only signed payloads
/// identify the signer.
async fn reset_diverged_nonce(ctx: &RecoveryContext, body: &str) {
    if let Ok(signed) = serde_json::from_str::<SignedTxMessage>(body) {
        let key = ChainKey::new(signed.chain, signed.network);
        ctx.nonces.reset(SignerKey::new(signed.from, key)).await;
    }
}

// ---- nonce too high ------------------------------------------------------

/// A too-high nonce left a gap. For small gaps (and with dummy transactions
/// enabled) fill the gap with zero-value self-transfers and requeue the
/// original; otherwise fail with the blocking reason.
pub struct NonceHighStrategy;

#[async_trait]
impl RecoveryStrategy for NonceHighStrategy {
    fn name(&self) -> &'static str {
        "nonce-high"
    }

    fn can_recover(&self, classified: &ClassifiedError) -> bool {
        classified.error_type == ErrorType::NonceError
            && classified
                .nonce
                .is_some_and(|n| n.kind == NonceKind::TooHigh)
    }

    async fn recover(
        &self,
        message: &PriorityMessage,
        classified: &ClassifiedError,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        let details = classified.nonce.expect("checked by can_recover");
        let Some(gap) = details.gap() else {
            return RecoveryOutcome::failure(
                RecoveryAction::NonceGapTooLarge,
                "nonce gap not recoverable: node reported no numbers",
                false,
            );
        };
        if gap > ctx.config.max_nonce_gap {
            return RecoveryOutcome::failure(
                RecoveryAction::NonceGapTooLarge,
                format!("NONCE_GAP_TOO_LARGE: gap {gap}"),
                false,
            );
        }
        if !ctx.config.enable_dummy_tx {
            return RecoveryOutcome::failure(
                RecoveryAction::DummyTxDisabled,
                "DUMMY_TX_DISABLED",
                false,
            );
        }
        let signed: SignedTxMessage = match serde_json::from_str(&message.body) {
            Ok(signed) => signed,
            Err(err) => {
                return RecoveryOutcome::failure(
                    RecoveryAction::MarkedFailed,
                    format!("payload not a signed transaction: {err}"),
                    false,
                );
            }
        };
        let key = ChainKey::new(signed.chain, signed.network);
        let (expected, _actual) = (
            details.expected.expect("gap computed from both numbers"),
            details.actual.expect("gap computed from both numbers"),
        );
        match plan_dummy_transactions(ctx, key, expected, gap).await {
            Ok(()) => {}
            Err(reason) => {
                return RecoveryOutcome::failure(RecoveryAction::RetryScheduled, reason, true);
            }
        }
        // The cached counter drifted past the chain; re-seed on next use.
        ctx.nonces.reset(SignerKey::new(signed.from, key)).await;
        // The original rides behind the gap fillers.
        let mut attributes = message.attributes.clone();
        attributes.retry_count += 1;
        if let Err(err) = ctx
            .queue
            .send(
                QueueName::forward(QueueKind::SignedTx),
                message.body.clone(),
                attributes,
            )
            .await
        {
            return RecoveryOutcome::failure(
                RecoveryAction::RetryScheduled,
                format!("requeue failed: {err}"),
                true,
            );
        }
        tracing::info!(gap, first_nonce = expected, "planned dummy transactions for nonce gap");
        RecoveryOutcome::success(RecoveryAction::DummyTxPlanned { count: gap })
    }

    fn max_retries(&self) -> u32 {
        3
    }
}

/// Sign and enqueue one zero-value self-transfer per missing nonce.
async fn plan_dummy_transactions(
    ctx: &RecoveryContext,
    key: ChainKey,
    first_nonce: u64,
    count: u64,
) -> Result<(), String> {
    let settings = ctx
        .registry
        .settings(key)
        .ok_or_else(|| format!("unsupported chain {key}"))?
        .clone();
    let rpc = ctx.registry.rpc(key).ok_or_else(|| format!("no rpc for {key}"))?;
    let signer = ctx
        .signers
        .signer_for(key)
        .map_err(|e| format!("signer unavailable: {e}"))?;
    let fee = rpc
        .get_fee_data()
        .await
        .map_err(|e| format!("fee fetch failed: {e}"))?
        .with_headroom(ctx.config.fee_headroom);
    for nonce in first_nonce..first_nonce + count {
        let envelope = signer
            .sign(&SignRequest {
                chain_id: settings.chain_id,
                nonce,
                to: signer.address(),
                value: U256::ZERO,
                data: Vec::new(),
                gas_limit: ctx.config.dummy_gas_limit,
                max_fee_per_gas: fee.max_fee_per_gas,
                max_priority_fee_per_gas: fee.max_priority_fee_per_gas,
            })
            .map_err(|e| format!("dummy signing failed: {e}"))?;
        let dummy = SignedTxMessage {
            kind: SignedTxKind::Single,
            request_id: None,
            batch_id: None,
            tx_hash: envelope.hash,
            raw_transaction: envelope.raw,
            nonce,
            gas_limit: ctx.config.dummy_gas_limit,
            max_fee_per_gas: fee.max_fee_per_gas,
            max_priority_fee_per_gas: fee.max_priority_fee_per_gas,
            from: envelope.from,
            to: signer.address(),
            value: U256::ZERO,
            data: Vec::new(),
            chain: key.chain,
            chain_id: settings.chain_id,
            network: key.network,
            affected_request_ids: Vec::new(),
        };
        let body = serde_json::to_string(&dummy).map_err(|e| e.to_string())?;
        ctx.queue
            .send(
                QueueName::forward(QueueKind::SignedTx),
                body,
                MessageAttributes::default(),
            )
            .await
            .map_err(|e| format!("dummy enqueue failed: {e}"))?;
        tracing::debug!(nonce, "dummy transaction enqueued");
    }
    Ok(())
}

// ---- gas -----------------------------------------------------------------

/// Under-priced or under-provisioned gas: re-sign the same transaction with
/// elevated fees (same nonce, so it replaces the original) and requeue.
pub struct GasStrategy;

#[async_trait]
impl RecoveryStrategy for GasStrategy {
    fn name(&self) -> &'static str {
        "gas"
    }

    fn can_recover(&self, classified: &ClassifiedError) -> bool {
        classified.is_retryable && classified.error_type == ErrorType::GasError
    }

    async fn recover(
        &self,
        message: &PriorityMessage,
        _classified: &ClassifiedError,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        let signed: SignedTxMessage = match serde_json::from_str(&message.body) {
            Ok(signed) => signed,
            Err(err) => {
                return RecoveryOutcome::failure(
                    RecoveryAction::MarkedFailed,
                    format!("payload not a signed transaction: {err}"),
                    false,
                );
            }
        };
        let key = ChainKey::new(signed.chain, signed.network);
        let Some(rpc) = ctx.registry.rpc(key) else {
            return RecoveryOutcome::failure(
                RecoveryAction::MarkedFailed,
                format!("unsupported chain {key}"),
                false,
            );
        };
        let signer = match ctx.signers.signer_for(key) {
            Ok(signer) => signer,
            Err(err) => {
                return RecoveryOutcome::failure(
                    RecoveryAction::RetryScheduled,
                    format!("signer unavailable: {err}"),
                    true,
                );
            }
        };
        let fee = match rpc.get_fee_data().await {
            Ok(fee) => fee.with_headroom(ctx.config.fee_headroom),
            Err(err) => {
                return RecoveryOutcome::failure(
                    RecoveryAction::RetryScheduled,
                    format!("fee fetch failed: {err}"),
                    true,
                );
            }
        };
        // A replacement must outbid the original regardless of the market.
        let floor = signed.max_fee_per_gas + signed.max_fee_per_gas / 4;
        let max_fee = fee.max_fee_per_gas.max(floor);
        let priority_floor =
            signed.max_priority_fee_per_gas + signed.max_priority_fee_per_gas / 4;
        let max_priority = fee.max_priority_fee_per_gas.max(priority_floor);

        let envelope = match signer.sign(&SignRequest {
            chain_id: signed.chain_id,
            nonce: signed.nonce,
            to: signed.to,
            value: signed.value,
            data: signed.data.clone(),
            gas_limit: signed.gas_limit,
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: max_priority,
        }) {
            Ok(envelope) => envelope,
            Err(err) => {
                return RecoveryOutcome::failure(
                    RecoveryAction::RetryScheduled,
                    format!("re-signing failed: {err}"),
                    true,
                );
            }
        };

        let replacement = SignedTxMessage {
            tx_hash: envelope.hash,
            raw_transaction: envelope.raw,
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: max_priority,
            from: envelope.from,
            ..signed
        };
        let body = match serde_json::to_string(&replacement) {
            Ok(body) => body,
            Err(err) => {
                return RecoveryOutcome::failure(
                    RecoveryAction::MarkedFailed,
                    format!("serialization failed: {err}"),
                    false,
                );
            }
        };
        let mut attributes = message.attributes.clone();
        attributes.retry_count += 1;
        if let Err(err) = ctx
            .queue
            .send(QueueName::forward(QueueKind::SignedTx), body, attributes)
            .await
        {
            return RecoveryOutcome::failure(
                RecoveryAction::RetryScheduled,
                format!("requeue failed: {err}"),
                true,
            );
        }
        tracing::info!(
            new_hash = %replacement.tx_hash,
            nonce = replacement.nonce,
            max_fee_per_gas = max_fee,
            "re-signed with elevated fees and requeued"
        );
        RecoveryOutcome::success(RecoveryAction::FeesBumpedAndRequeued)
    }

    fn max_retries(&self) -> u32 {
        3
    }
}

// ---- unknown -------------------------------------------------------------

/// Unknown but retryable: defer with a doubled delay, capped at half the
/// configured attempt budget.
pub struct UnknownStrategy {
    cap: u32,
}

impl UnknownStrategy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            cap: (max_attempts / 2).max(2),
        }
    }
}

#[async_trait]
impl RecoveryStrategy for UnknownStrategy {
    fn name(&self) -> &'static str {
        "unknown"
    }

    fn can_recover(&self, classified: &ClassifiedError) -> bool {
        classified.is_retryable && classified.error_type == ErrorType::Unknown
    }

    async fn recover(
        &self,
        message: &PriorityMessage,
        _classified: &ClassifiedError,
        _ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        if message.attributes.retry_count >= self.cap {
            return RecoveryOutcome::failure(
                RecoveryAction::MarkedFailed,
                format!("unknown error retries exhausted after {}", self.cap),
                false,
            );
        }
        RecoveryOutcome::failure(
            RecoveryAction::RetryScheduled,
            "unknown error, deferring",
            true,
        )
    }

    fn max_retries(&self) -> u32 {
        self.cap
    }
}

// ---- terminal ------------------------------------------------------------

/// Non-retryable classes: mark every affected request failed with the
/// reason; never requeue.
pub struct TerminalStrategy;

#[async_trait]
impl RecoveryStrategy for TerminalStrategy {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn can_recover(&self, classified: &ClassifiedError) -> bool {
        !classified.is_retryable
    }

    async fn recover(
        &self,
        message: &PriorityMessage,
        classified: &ClassifiedError,
        ctx: &RecoveryContext,
    ) -> RecoveryOutcome {
        let reason = format!("{}: {}", classified.error_type, classified.raw);
        let (request_ids, batch_id) = affected_of(message.origin, &message.body);
        for request_id in &request_ids {
            if let Err(err) = ctx.store.mark_request_failed(request_id, &reason).await {
                tracing::warn!(%err, request_id, "terminal failure persistence failed");
            }
        }
        if let Some(batch_id) = batch_id {
            if let Err(err) = ctx.store.dissolve_batch(&batch_id, &reason).await {
                tracing::warn!(%err, %batch_id, "terminal batch dissolve failed");
            }
        }
        tracing::warn!(
            id = %message.id,
            error_type = %classified.error_type,
            affected = request_ids.len(),
            "non-retryable failure resolved terminally"
        );
        RecoveryOutcome::success(RecoveryAction::MarkedFailed)
    }

    fn max_retries(&self) -> u32 {
        1
    }
}

/// Pull the affected request ids (and batch, if any) out of a DLQ payload
/// according to its origin queue.
fn affected_of(origin: QueueKind, body: &str) -> (Vec<String>, Option<String>) {
    match origin {
        QueueKind::TxRequest => match serde_json::from_str::<WithdrawalRequest>(body) {
            Ok(request) => (vec![request.request_id], None),
            Err(_) => (Vec::new(), None),
        },
        QueueKind::SignedTx => match serde_json::from_str::<SignedTxMessage>(body) {
            Ok(signed) => (signed.affected_request_ids, signed.batch_id),
            Err(_) => (Vec::new(), None),
        },
        QueueKind::BroadcastTx => match serde_json::from_str::<BroadcastResultMessage>(body) {
            Ok(result) => (result.metadata.affected_requests, result.batch_id),
            Err(_) => (Vec::new(), None),
        },
    }
}

// ---- registry ------------------------------------------------------------

/// Maps error types to candidate strategies.
pub struct StrategyRegistry {
    strategies: HashMap<ErrorType, Vec<Arc<dyn RecoveryStrategy>>>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// The production wiring.
    pub fn defaults(config: &RecoveryConfig) -> Self {
        let mut registry = Self::empty();
        let network: Arc<dyn RecoveryStrategy> = Arc::new(NetworkStrategy);
        registry.register(ErrorType::NetworkError, Arc::clone(&network));
        registry.register(ErrorType::Timeout, network);
        registry.register(ErrorType::NonceError, Arc::new(NonceLowStrategy));
        registry.register(ErrorType::NonceError, Arc::new(NonceHighStrategy));
        registry.register(ErrorType::GasError, Arc::new(GasStrategy));
        registry.register(
            ErrorType::Unknown,
            Arc::new(UnknownStrategy::new(config.max_attempts)),
        );
        let terminal: Arc<dyn RecoveryStrategy> = Arc::new(TerminalStrategy);
        registry.register(ErrorType::InsufficientFunds, Arc::clone(&terminal));
        registry.register(ErrorType::InvalidAddress, Arc::clone(&terminal));
        registry.register(ErrorType::ContractError, terminal);
        registry
    }

    pub fn register(&mut self, error_type: ErrorType, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.entry(error_type).or_default().push(strategy);
    }

    /// First registered strategy that accepts the classified error.
    pub fn for_error(&self, classified: &ClassifiedError) -> Option<Arc<dyn RecoveryStrategy>> {
        self.strategies
            .get(&classified.error_type)?
            .iter()
            .find(|s| s.can_recover(classified))
            .map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::classifier::classify;

    fn config() -> RecoveryConfig {
        RecoveryConfig::default()
    }

    #[test]
    fn registry_dispatches_by_type_and_predicate() {
        let registry = StrategyRegistry::defaults(&config());
        let low = classify("nonce too low: next nonce 8, tx nonce 7");
        assert_eq!(registry.for_error(&low).unwrap().name(), "nonce-low");
        let high = classify("nonce too high: next nonce 7, tx nonce 10");
        assert_eq!(registry.for_error(&high).unwrap().name(), "nonce-high");
        let gas = classify("intrinsic gas too low");
        assert_eq!(registry.for_error(&gas).unwrap().name(), "gas");
        let network = classify("connection refused");
        assert_eq!(registry.for_error(&network).unwrap().name(), "network");
        let timeout = classify("rpc call timed out after 10s");
        assert_eq!(registry.for_error(&timeout).unwrap().name(), "network");
        let contract = classify("execution reverted");
        assert_eq!(registry.for_error(&contract).unwrap().name(), "terminal");
        let unknown = classify("novel weirdness");
        assert_eq!(registry.for_error(&unknown).unwrap().name(), "unknown");
    }

    #[test]
    fn unknown_cap_is_half_attempts_with_floor() {
        assert_eq!(UnknownStrategy::new(10).max_retries(), 5);
        assert_eq!(UnknownStrategy::new(3).max_retries(), 2);
        assert_eq!(UnknownStrategy::new(0).max_retries(), 2);
    }
}
