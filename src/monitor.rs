//! The transaction monitor: tracks broadcast transactions to finality.
//!
//! The monitor owns the in-memory `active` map, admitted from the
//! broadcast-tx queue and removed on terminal status. Three observers
//! cooperate:
//!
//! 1. **Block subscription** — held only while at least one transaction is
//!    active for a (chain, network). New blocks trigger receipt checks for
//!    `SENT` transactions included in the block (young ones are checked even
//!    when absent, to catch fast inclusion) and confirmation recomputation
//!    for `CONFIRMING` ones.
//! 2. **Transaction watcher** — an immediate receipt check on admission,
//!    after a short persistence wait.
//! 3. **Tiered polling** — fast/medium/full tiers as a WebSocket-independent
//!    safety net, each walking eligible transactions in batches.
//!
//! Receipt checks are idempotent, so the missed-block replay on WebSocket
//! reconnection simply re-checks every active transaction for the key.
//! Stuck transactions (old, zero confirmations, gas price now far above the
//! original fee) are reported once and delegated to recovery through the
//! signed-tx DLQ.

use alloy_primitives::B256;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::chain::ChainKey;
use crate::queue::{MessageAttributes, MessageQueue, QueueKind, QueueName};
use crate::registry::{BlockEvent, ChainEvent, ChainRegistry};
use crate::scheduler::Ticker;
use crate::store::RequestStore;
use crate::types::{
    BatchStatus, BroadcastResultMessage, BroadcastStatus, RequestStatus, SignedTxKind,
    SignedTxMessage, UnixMillis,
};

/// Status of a monitored transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorStatus {
    Sent,
    Confirming,
    Confirmed,
    Failed,
    /// The nonce was consumed by a replacement; the original fell out of the
    /// mempool after being flagged stuck.
    Canceled,
}

impl MonitorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MonitorStatus::Confirmed | MonitorStatus::Failed | MonitorStatus::Canceled
        )
    }
}

/// Link from a monitored transaction back to persistent state.
#[derive(Debug, Clone)]
pub enum TxLink {
    Request(String),
    Batch {
        batch_id: String,
        members: Vec<String>,
    },
}

/// In-memory record for one tracked transaction.
#[derive(Debug, Clone)]
pub struct MonitoredTransaction {
    pub tx_hash: B256,
    pub key: ChainKey,
    pub status: MonitorStatus,
    pub block_number: Option<u64>,
    pub confirmations: u64,
    pub submitted_at: UnixMillis,
    pub last_checked: UnixMillis,
    pub retry_count: u32,
    pub nonce: u64,
    pub max_fee_per_gas: u128,
    pub link: TxLink,
    /// Stuck detection fires once per transaction.
    pub stuck_reported: bool,
}

/// One polling tier.
#[derive(Debug, Clone, Copy)]
pub struct TierSpec {
    pub interval: Duration,
    /// `None` means unbounded age (the full tier).
    pub max_age: Option<Duration>,
    pub batch_size: usize,
}

/// Tuning for the monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub receive_max: usize,
    pub receive_wait: Duration,
    pub visibility_timeout: Duration,
    /// Nominal fast-tier interval.
    pub fast_interval: Duration,
    /// Fast-tier interval while young transactions are present.
    pub fast_interval_accelerated: Duration,
    pub fast_tier: TierSpec,
    pub medium_tier: TierSpec,
    pub full_tier: TierSpec,
    pub inter_batch_delay: Duration,
    /// A `SENT` transaction younger than this is polled eagerly.
    pub young_tx_age: Duration,
    /// Transient-error budget per transaction.
    pub max_retries: u32,
    /// Receipt absence beyond this age fails the transaction.
    pub mempool_drop_timeout: Duration,
    /// Wait after admission before the first receipt check, letting the
    /// broadcaster's writes land.
    pub persistence_wait: Duration,
    pub stuck_check_interval: Duration,
    /// Network gas price must exceed the original fee by this factor.
    pub stuck_gas_multiplier: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            receive_max: 10,
            receive_wait: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(300),
            fast_interval: Duration::from_secs(5 * 60),
            fast_interval_accelerated: Duration::from_secs(60),
            fast_tier: TierSpec {
                interval: Duration::from_secs(60),
                max_age: Some(Duration::from_secs(15 * 60)),
                batch_size: 30,
            },
            medium_tier: TierSpec {
                interval: Duration::from_secs(30 * 60),
                max_age: Some(Duration::from_secs(2 * 60 * 60)),
                batch_size: 50,
            },
            full_tier: TierSpec {
                interval: Duration::from_secs(2 * 60 * 60),
                max_age: None,
                batch_size: 100,
            },
            inter_batch_delay: Duration::from_millis(200),
            young_tx_age: Duration::from_secs(5 * 60),
            max_retries: 10,
            mempool_drop_timeout: Duration::from_secs(60 * 60),
            persistence_wait: Duration::from_millis(200),
            stuck_check_interval: Duration::from_secs(60),
            stuck_gas_multiplier: 2.0,
        }
    }
}

/// Drain counters, logged at shutdown.
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub admitted: AtomicU64,
    pub confirmed: AtomicU64,
    pub failed: AtomicU64,
    pub canceled: AtomicU64,
    pub stuck_flagged: AtomicU64,
}

/// The C7 transaction monitor.
pub struct TransactionMonitor {
    config: MonitorConfig,
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn RequestStore>,
    registry: Arc<ChainRegistry>,
    pub(crate) active: DashMap<B256, MonitoredTransaction>,
    /// Active transaction count per key, driving the lazy subscription.
    key_counts: DashMap<ChainKey, usize>,
    pub stats: MonitorStats,
}

impl TransactionMonitor {
    pub fn new(
        config: MonitorConfig,
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn RequestStore>,
        registry: Arc<ChainRegistry>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            registry,
            active: DashMap::new(),
            key_counts: DashMap::new(),
            stats: MonitorStats::default(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Run all monitor tasks until shutdown.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("transaction monitor started");
        let tracker = TaskTracker::new();

        {
            let monitor = Arc::clone(&self);
            let cancel = cancel.clone();
            tracker.spawn(async move { monitor.admission_loop(cancel).await });
        }
        {
            let monitor = Arc::clone(&self);
            let cancel = cancel.clone();
            tracker.spawn(async move { monitor.block_event_loop(cancel).await });
        }
        {
            let monitor = Arc::clone(&self);
            let cancel = cancel.clone();
            tracker.spawn(async move { monitor.chain_event_loop(cancel).await });
        }
        for tier in [TierKind::Fast, TierKind::Medium, TierKind::Full] {
            let monitor = Arc::clone(&self);
            let cancel = cancel.clone();
            tracker.spawn(async move { monitor.tier_loop(tier, cancel).await });
        }
        {
            let monitor = Arc::clone(&self);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                Ticker::new(monitor.config.stuck_check_interval)
                    .run(cancel, || {
                        let monitor = Arc::clone(&monitor);
                        async move { monitor.scan_stuck().await }
                    })
                    .await;
            });
        }

        cancel.cancelled().await;
        tracker.close();
        tracker.wait().await;
        tracing::info!(
            confirmed = self.stats.confirmed.load(Ordering::Relaxed),
            failed = self.stats.failed.load(Ordering::Relaxed),
            "transaction monitor drained"
        );
    }

    // ---- admission -------------------------------------------------------

    async fn admission_loop(&self, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = self.queue.receive(
                    QueueName::forward(QueueKind::BroadcastTx),
                    self.config.receive_max,
                    self.config.receive_wait,
                    self.config.visibility_timeout,
                ) => received,
            };
            let messages = match received {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(%err, "broadcast queue receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            for message in messages {
                match serde_json::from_str::<BroadcastResultMessage>(&message.body) {
                    Ok(result) => {
                        if let Some(hash) = self.admit(result) {
                            tokio::time::sleep(self.config.persistence_wait).await;
                            self.check_transaction(hash).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "malformed broadcast result");
                        let _ = self
                            .queue
                            .send_to_dlq(
                                QueueKind::BroadcastTx,
                                message.body.clone(),
                                message.attributes.clone(),
                                format!("malformed payload: {err}"),
                            )
                            .await;
                    }
                }
                if let Err(err) = self
                    .queue
                    .delete(QueueName::forward(QueueKind::BroadcastTx), &message.receipt)
                    .await
                {
                    tracing::warn!(%err, "broadcast message delete failed");
                }
            }
        }
    }

    /// Insert a fresh entry for a successful broadcast. Returns the hash
    /// when a new entry was admitted.
    pub(crate) fn admit(&self, result: BroadcastResultMessage) -> Option<B256> {
        if result.status != BroadcastStatus::Broadcasted {
            return None;
        }
        let tx_hash = result.original_transaction_hash;
        if self.active.contains_key(&tx_hash) {
            return None;
        }
        let key = ChainKey::new(result.chain, result.network);
        let link = match (&result.batch_id, &result.withdrawal_id) {
            (Some(batch_id), _) => TxLink::Batch {
                batch_id: batch_id.clone(),
                members: result.metadata.affected_requests.clone(),
            },
            (None, Some(request_id)) => TxLink::Request(request_id.clone()),
            (None, None) => {
                // Gap-filler transactions carry no link and are not tracked.
                tracing::debug!(%tx_hash, "broadcast result without request or batch link");
                return None;
            }
        };
        let now = UnixMillis::now();
        let entry = MonitoredTransaction {
            tx_hash,
            key,
            status: MonitorStatus::Sent,
            block_number: result.block_number,
            confirmations: 0,
            submitted_at: result.broadcasted_at.unwrap_or(now),
            last_checked: now,
            retry_count: 0,
            nonce: result.nonce,
            max_fee_per_gas: result.max_fee_per_gas,
            link,
            stuck_reported: false,
        };
        self.active.insert(tx_hash, entry);
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        let mut count = self.key_counts.entry(key).or_insert(0);
        *count += 1;
        if *count == 1 {
            // First active transaction for this key: attach the block
            // subscription.
            self.registry.acquire_blocks(key);
        }
        tracing::info!(%tx_hash, %key, "transaction admitted for monitoring");
        Some(tx_hash)
    }

    fn remove(&self, tx_hash: B256) {
        if let Some((_, entry)) = self.active.remove(&tx_hash) {
            if let Some(mut count) = self.key_counts.get_mut(&entry.key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.registry.release_blocks(entry.key);
                }
            }
        }
    }

    // ---- block events ----------------------------------------------------

    async fn block_event_loop(&self, cancel: CancellationToken) {
        let mut events = self.registry.subscribe_block_events();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.handle_block_event(event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    // The tier poller compensates for dropped block events.
                    tracing::debug!(skipped, "block event consumer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    #[instrument(skip_all, fields(key = %event.key, block = event.header.number))]
    pub(crate) async fn handle_block_event(&self, event: BlockEvent) {
        let key = event.key;
        let head = event.header.number;
        let Some(rpc) = self.registry.rpc(key) else { return };
        let in_block = match rpc.get_block_tx_hashes(head).await {
            Ok(Some(hashes)) => hashes,
            Ok(None) => Vec::new(),
            Err(err) => {
                tracing::debug!(%err, "block transaction listing failed");
                Vec::new()
            }
        };

        let mut to_check = Vec::new();
        for entry in self.active.iter() {
            if entry.key != key {
                continue;
            }
            match entry.status {
                MonitorStatus::Sent => {
                    let included = in_block.contains(&entry.tx_hash);
                    let young = entry.submitted_at.elapsed() < self.config.young_tx_age;
                    if included || young {
                        to_check.push(entry.tx_hash);
                    }
                }
                MonitorStatus::Confirming => {
                    if entry.block_number.is_some_and(|b| b < head) {
                        to_check.push(entry.tx_hash);
                    }
                }
                _ => {}
            }
        }
        for hash in to_check {
            self.check_transaction(hash).await;
        }
    }

    // ---- chain events (reconnect replay) ---------------------------------

    async fn chain_event_loop(&self, cancel: CancellationToken) {
        let mut events = self.registry.subscribe_chain_events();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.handle_chain_event(event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Missed-block replay: on reconnect, immediately re-check every active
    /// transaction for the key. The check algorithm is idempotent, so
    /// replaying an already-confirmed block range is harmless.
    pub(crate) async fn handle_chain_event(&self, event: ChainEvent) {
        let ChainEvent::WebsocketReconnected {
            key,
            last_block,
            current_block,
        } = event
        else {
            return;
        };
        tracing::info!(
            %key,
            last_block,
            current_block,
            "websocket reconnected, replaying missed range"
        );
        let hashes: Vec<B256> = self
            .active
            .iter()
            .filter(|e| e.key == key && !e.status.is_terminal())
            .map(|e| e.tx_hash)
            .collect();
        for hash in hashes {
            self.check_transaction(hash).await;
        }
    }

    // ---- tier polling ----------------------------------------------------

    async fn tier_loop(&self, tier: TierKind, cancel: CancellationToken) {
        let mut last_fast_pass = Instant::now();
        let period = match tier {
            TierKind::Fast => self.config.fast_interval_accelerated,
            TierKind::Medium => self.config.medium_tier.interval,
            TierKind::Full => self.config.full_tier.interval,
        };
        loop {
            if !crate::scheduler::after(period, &cancel).await {
                return;
            }
            if tier == TierKind::Fast {
                // Accelerated only while young transactions are in flight;
                // otherwise honor the nominal interval.
                let young = self.has_young_tx();
                if !young && last_fast_pass.elapsed() < self.config.fast_interval {
                    continue;
                }
                last_fast_pass = Instant::now();
            }
            self.run_tier(self.tier_spec(tier)).await;
        }
    }

    fn tier_spec(&self, tier: TierKind) -> TierSpec {
        match tier {
            TierKind::Fast => self.config.fast_tier,
            TierKind::Medium => self.config.medium_tier,
            TierKind::Full => self.config.full_tier,
        }
    }

    fn has_young_tx(&self) -> bool {
        self.active.iter().any(|e| {
            e.status == MonitorStatus::Sent && e.submitted_at.elapsed() < self.config.young_tx_age
        })
    }

    /// Walk every transaction eligible for the tier, in batches with a short
    /// pause between them.
    pub(crate) async fn run_tier(&self, tier: TierSpec) {
        let eligible: Vec<B256> = self
            .active
            .iter()
            .filter(|e| {
                if e.status.is_terminal() {
                    return false;
                }
                if e.last_checked.elapsed() < tier.interval {
                    return false;
                }
                match tier.max_age {
                    Some(max_age) => e.submitted_at.elapsed() <= max_age,
                    None => true,
                }
            })
            .map(|e| e.tx_hash)
            .collect();
        if eligible.is_empty() {
            return;
        }
        tracing::debug!(count = eligible.len(), "tier polling pass");
        let mut first = true;
        for chunk in eligible.chunks(tier.batch_size.max(1)) {
            if !first {
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }
            first = false;
            for hash in chunk {
                self.check_transaction(*hash).await;
            }
        }
    }

    // ---- the check algorithm ---------------------------------------------

    /// Fetch receipt (and transaction as fallback) for one tracked hash and
    /// advance its state. Idempotent; persists only on status change.
    #[instrument(skip_all, fields(%tx_hash))]
    pub(crate) async fn check_transaction(&self, tx_hash: B256) {
        let Some(entry) = self.active.get(&tx_hash).map(|e| e.clone()) else {
            return;
        };
        if entry.status.is_terminal() {
            return;
        }
        let Some(rpc) = self.registry.rpc(entry.key) else {
            return;
        };
        let Some(settings) = self.registry.settings(entry.key) else {
            return;
        };
        let required = settings.required_confirmations;

        match rpc.get_transaction_receipt(tx_hash).await {
            Ok(Some(receipt)) => {
                let head = match rpc.get_block_number().await {
                    Ok(head) => head,
                    Err(err) => {
                        tracing::debug!(%err, "head fetch failed during check");
                        self.note_transient_failure(tx_hash).await;
                        return;
                    }
                };
                let confirmations = head.saturating_sub(receipt.block_number);
                if !receipt.status {
                    self.finalize(tx_hash, MonitorStatus::Failed, "reverted on-chain")
                        .await;
                } else if confirmations >= required {
                    if let Some(mut entry) = self.active.get_mut(&tx_hash) {
                        entry.confirmations = confirmations;
                        entry.block_number = Some(receipt.block_number);
                    }
                    self.finalize(tx_hash, MonitorStatus::Confirmed, "confirmed")
                        .await;
                } else if let Some(mut entry) = self.active.get_mut(&tx_hash) {
                    entry.status = MonitorStatus::Confirming;
                    entry.block_number = Some(receipt.block_number);
                    entry.confirmations = confirmations;
                    entry.last_checked = UnixMillis::now();
                }
            }
            Ok(None) => {
                match rpc.get_transaction(tx_hash).await {
                    Ok(Some(tx)) if tx.block_number.is_some() => {
                        // Mined but the receipt is not indexed yet.
                        if let Some(mut entry) = self.active.get_mut(&tx_hash) {
                            entry.status = MonitorStatus::Confirming;
                            entry.block_number = tx.block_number;
                            entry.last_checked = UnixMillis::now();
                        }
                    }
                    Ok(_) => {
                        let age = entry.submitted_at.elapsed();
                        if age >= self.config.mempool_drop_timeout {
                            let status = if entry.stuck_reported {
                                MonitorStatus::Canceled
                            } else {
                                MonitorStatus::Failed
                            };
                            self.finalize(tx_hash, status, "dropped from mempool").await;
                        } else if let Some(mut entry) = self.active.get_mut(&tx_hash) {
                            entry.last_checked = UnixMillis::now();
                            entry.retry_count += 1;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(%err, "transaction lookup failed");
                        self.note_transient_failure(tx_hash).await;
                    }
                }
            }
            Err(err) => {
                tracing::debug!(%err, "receipt lookup failed");
                self.note_transient_failure(tx_hash).await;
            }
        }
    }

    async fn note_transient_failure(&self, tx_hash: B256) {
        let exhausted = {
            let Some(mut entry) = self.active.get_mut(&tx_hash) else {
                return;
            };
            entry.retry_count += 1;
            entry.last_checked = UnixMillis::now();
            entry.retry_count >= self.config.max_retries
        };
        if exhausted {
            self.finalize(tx_hash, MonitorStatus::Failed, "monitoring retries exhausted")
                .await;
        }
    }

    /// Persist the terminal status and drop the entry from the active map.
    async fn finalize(&self, tx_hash: B256, status: MonitorStatus, reason: &str) {
        let Some(entry) = self.active.get(&tx_hash).map(|e| e.clone()) else {
            return;
        };
        {
            if let Some(mut live) = self.active.get_mut(&tx_hash) {
                live.status = status;
            }
        }
        match status {
            MonitorStatus::Confirmed => {
                self.stats.confirmed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%tx_hash, confirmations = entry.confirmations, "transaction confirmed");
                match &entry.link {
                    TxLink::Request(request_id) => {
                        if let Err(err) = self
                            .store
                            .update_request_status(request_id, RequestStatus::Confirmed)
                            .await
                        {
                            tracing::error!(%err, request_id, "confirm persistence failed");
                        }
                    }
                    TxLink::Batch { batch_id, members } => {
                        if let Err(err) = self
                            .store
                            .update_batch_status(batch_id, BatchStatus::Confirmed, Some(tx_hash))
                            .await
                        {
                            tracing::error!(%err, batch_id, "batch confirm persistence failed");
                        }
                        if let Err(err) = self
                            .store
                            .update_requests_status(members, RequestStatus::Confirmed)
                            .await
                        {
                            tracing::error!(%err, batch_id, "member confirm persistence failed");
                        }
                    }
                }
            }
            MonitorStatus::Canceled => {
                // Superseded by a replacement; the replacement's lifecycle
                // owns the persistent state.
                self.stats.canceled.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%tx_hash, reason, "transaction canceled");
            }
            MonitorStatus::Failed => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%tx_hash, reason, "transaction failed");
                match &entry.link {
                    TxLink::Request(request_id) => {
                        if let Err(err) = self.store.mark_request_failed(request_id, reason).await {
                            tracing::error!(%err, request_id, "failure persistence failed");
                        }
                    }
                    TxLink::Batch { batch_id, .. } => {
                        // A failed batch dissolves: members revert to
                        // PENDING for reprocessing.
                        if let Err(err) = self.store.dissolve_batch(batch_id, reason).await {
                            tracing::error!(%err, batch_id, "batch dissolve failed");
                        }
                    }
                }
            }
            _ => {}
        }
        self.remove(tx_hash);
    }

    // ---- stuck detection -------------------------------------------------

    /// Flag transactions that are old, unconfirmed, and priced below the
    /// market by the configured factor. Replacement is recovery's job: the
    /// signed payload is forwarded to the signed-tx DLQ with a gas-class
    /// error.
    pub(crate) async fn scan_stuck(&self) {
        let candidates: Vec<MonitoredTransaction> = self
            .active
            .iter()
            .filter(|e| {
                matches!(e.status, MonitorStatus::Sent | MonitorStatus::Confirming)
                    && e.confirmations == 0
                    && !e.stuck_reported
            })
            .map(|e| e.clone())
            .collect();
        for entry in candidates {
            let Some(settings) = self.registry.settings(entry.key) else {
                continue;
            };
            if entry.submitted_at.elapsed() < settings.stuck_min_age {
                continue;
            }
            let Some(rpc) = self.registry.rpc(entry.key) else {
                continue;
            };
            let fee = match rpc.get_fee_data().await {
                Ok(fee) => fee,
                Err(err) => {
                    tracing::debug!(%err, "fee fetch failed during stuck scan");
                    continue;
                }
            };
            let threshold =
                ((entry.max_fee_per_gas as f64) * self.config.stuck_gas_multiplier) as u128;
            if fee.gas_price < threshold {
                continue;
            }
            tracing::warn!(
                tx_hash = %entry.tx_hash,
                key = %entry.key,
                age_secs = entry.submitted_at.elapsed().as_secs(),
                original_fee = entry.max_fee_per_gas,
                network_gas_price = fee.gas_price,
                "stuck transaction detected"
            );
            self.stats.stuck_flagged.fetch_add(1, Ordering::Relaxed);
            if let Some(mut live) = self.active.get_mut(&entry.tx_hash) {
                live.stuck_reported = true;
            }
            self.delegate_stuck(&entry).await;
        }
    }

    /// Hand the stuck transaction to recovery via the signed-tx DLQ.
    async fn delegate_stuck(&self, entry: &MonitoredTransaction) {
        let signed = match self.store.get_signed(entry.tx_hash).await {
            Ok(Some(signed)) => signed,
            Ok(None) => {
                tracing::warn!(tx_hash = %entry.tx_hash, "no signed row for stuck transaction");
                return;
            }
            Err(err) => {
                tracing::error!(%err, "signed row lookup failed for stuck transaction");
                return;
            }
        };
        let affected = match &entry.link {
            TxLink::Request(id) => vec![id.clone()],
            TxLink::Batch { members, .. } => members.clone(),
        };
        let message = SignedTxMessage {
            kind: match entry.link {
                TxLink::Request(_) => SignedTxKind::Single,
                TxLink::Batch { .. } => SignedTxKind::Batch,
            },
            request_id: signed.request_id.clone(),
            batch_id: signed.batch_id.clone(),
            tx_hash: signed.tx_hash,
            raw_transaction: signed.raw_transaction.clone(),
            nonce: signed.nonce,
            gas_limit: signed.gas_limit,
            max_fee_per_gas: signed.max_fee_per_gas,
            max_priority_fee_per_gas: signed.max_priority_fee_per_gas,
            from: signed.from,
            to: signed.to,
            value: signed.value,
            data: signed.data.clone(),
            chain: entry.key.chain,
            chain_id: signed.chain_id,
            network: entry.key.network,
            affected_request_ids: affected,
        };
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(%err, "stuck delegation serialization failed");
                return;
            }
        };
        if let Err(err) = self
            .queue
            .send_to_dlq(
                QueueKind::SignedTx,
                body,
                MessageAttributes::default(),
                "max fee per gas too low: transaction stuck".to_string(),
            )
            .await
        {
            tracing::error!(%err, "stuck delegation to dlq failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TierKind {
    Fast,
    Medium,
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Chain, Network};
    use crate::queue::InMemoryQueue;
    use crate::registry::{ChainEndpoint, ReconnectPolicy};
    use crate::rpc::testing::MockRpc;
    use crate::rpc::{BlockHeader, EvmRpc, FeeData, RpcReceipt, RpcTransaction};
    use crate::store::InMemoryStore;
    use crate::types::{BroadcastMetadata, SignedTransaction, TransactionType, WithdrawalRequest};
    use alloy_primitives::{Address, B256, U256};

    struct Harness {
        monitor: TransactionMonitor,
        queue: Arc<InMemoryQueue>,
        store: Arc<InMemoryStore>,
        rpc: Arc<MockRpc>,
        registry: Arc<ChainRegistry>,
    }

    fn polygon() -> ChainKey {
        ChainKey::new(Chain::Polygon, Network::Mainnet)
    }

    fn harness() -> Harness {
        let rpc = Arc::new(MockRpc::new());
        let endpoint = ChainEndpoint {
            key: polygon(),
            rpc_url: "http://localhost:8545".parse().unwrap(),
            ws_url: Some("ws://localhost:8546".parse().unwrap()),
            chain_id: None,
            required_confirmations: None,
        };
        let registry = Arc::new(
            ChainRegistry::with_rpcs(
                vec![(endpoint, Arc::clone(&rpc) as Arc<dyn EvmRpc>)],
                ReconnectPolicy::default(),
                CancellationToken::new(),
            )
            .unwrap(),
        );
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryStore::new());
        let monitor = TransactionMonitor::new(
            MonitorConfig::default(),
            Arc::clone(&queue) as Arc<dyn MessageQueue>,
            Arc::clone(&store) as Arc<dyn RequestStore>,
            Arc::clone(&registry),
        );
        Harness {
            monitor,
            queue,
            store,
            rpc,
            registry,
        }
    }

    fn broadcast_result(tx_hash: B256, request_id: &str) -> BroadcastResultMessage {
        BroadcastResultMessage {
            id: "bcast-1".into(),
            transaction_type: TransactionType::Single,
            withdrawal_id: Some(request_id.to_string()),
            batch_id: None,
            original_transaction_hash: tx_hash,
            broadcast_transaction_hash: Some(tx_hash),
            status: BroadcastStatus::Broadcasted,
            error: None,
            broadcasted_at: Some(UnixMillis::now()),
            block_number: None,
            gas_used: None,
            chain: Chain::Polygon,
            network: Network::Mainnet,
            nonce: 1,
            max_fee_per_gas: 30_000_000_000,
            metadata: BroadcastMetadata {
                affected_requests: vec![request_id.to_string()],
            },
        }
    }

    async fn seed_request(h: &Harness, id: &str) {
        let mut request = WithdrawalRequest::new(
            id,
            "0x742d35Cc6634C0532925a3b844Bc454e4438fAEd",
            "1",
            None,
            Chain::Polygon,
            Network::Mainnet,
        );
        request.status = RequestStatus::Confirming;
        h.store.insert_request(request).await.unwrap();
    }

    #[tokio::test]
    async fn admission_attaches_subscription_per_key() {
        let h = harness();
        // Feed a dummy subscription so the pump has something to hold.
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel::<BlockHeader>();
        h.rpc.push_block_feed(rx);
        let hash = B256::repeat_byte(1);
        assert!(!h.registry.ws_active(polygon()));
        assert!(h.monitor.admit(broadcast_result(hash, "r1")).is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.registry.ws_active(polygon()));
        // Duplicate admission is a no-op.
        assert!(h.monitor.admit(broadcast_result(hash, "r1")).is_none());
        assert_eq!(h.monitor.active_count(), 1);

        // Terminal removal detaches the subscription.
        h.monitor.remove(hash);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h.registry.ws_active(polygon()));
    }

    #[tokio::test]
    async fn failed_broadcast_results_are_not_admitted() {
        let h = harness();
        let mut result = broadcast_result(B256::repeat_byte(1), "r1");
        result.status = BroadcastStatus::Failed;
        assert!(h.monitor.admit(result).is_none());
        assert_eq!(h.monitor.active_count(), 0);
    }

    #[tokio::test]
    async fn check_confirms_at_required_depth() {
        let h = harness();
        seed_request(&h, "r1").await;
        let hash = B256::repeat_byte(1);
        h.monitor.admit(broadcast_result(hash, "r1"));

        // Mined at block 100, head at 110: 10 confirmations < 30 required.
        h.rpc.set_receipt(RpcReceipt {
            transaction_hash: hash,
            block_number: 100,
            status: true,
            gas_used: 21_000,
        });
        h.rpc.set_head(110);
        h.monitor.check_transaction(hash).await;
        {
            let entry = h.monitor.active.get(&hash).unwrap();
            assert_eq!(entry.status, MonitorStatus::Confirming);
            assert_eq!(entry.confirmations, 10);
            assert_eq!(entry.block_number, Some(100));
        }
        // Still CONFIRMING in the store (set by the broadcaster).
        assert_eq!(
            h.store.snapshot("r1").await.unwrap().status,
            RequestStatus::Confirming
        );

        // Head reaches the required depth.
        h.rpc.set_head(131);
        h.monitor.check_transaction(hash).await;
        assert!(h.monitor.active.get(&hash).is_none());
        assert_eq!(
            h.store.snapshot("r1").await.unwrap().status,
            RequestStatus::Confirmed
        );
        assert_eq!(h.monitor.stats.confirmed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn revert_fails_the_request() {
        let h = harness();
        seed_request(&h, "r1").await;
        let hash = B256::repeat_byte(2);
        h.monitor.admit(broadcast_result(hash, "r1"));
        h.rpc.set_receipt(RpcReceipt {
            transaction_hash: hash,
            block_number: 100,
            status: false,
            gas_used: 21_000,
        });
        h.rpc.set_head(105);
        h.monitor.check_transaction(hash).await;
        assert!(h.monitor.active.get(&hash).is_none());
        let snapshot = h.store.snapshot("r1").await.unwrap();
        assert_eq!(snapshot.status, RequestStatus::Failed);
        assert!(snapshot.error.as_deref().unwrap().contains("reverted"));
    }

    #[tokio::test]
    async fn batch_revert_dissolves_members() {
        let h = harness();
        use crate::store::NewBatch;
        for id in ["r1", "r2"] {
            let request = WithdrawalRequest::new(
                id,
                "0x742d35Cc6634C0532925a3b844Bc454e4438fAEd",
                "1000",
                Some("0xc2132D05D31c914a87C6611C10748AEb04B58e8F".to_string()),
                Chain::Polygon,
                Network::Mainnet,
            );
            h.store.insert_request(request).await.unwrap();
            h.store.claim_request(id, "worker-a").await.unwrap();
        }
        h.store
            .form_batch(
                NewBatch {
                    batch_id: "b1".into(),
                    aggregator: crate::chain::MULTICALL3_ADDRESS,
                    member_request_ids: vec!["r1".into(), "r2".into()],
                    total_amount: U256::from(2000u64),
                    token_fingerprint: "t".into(),
                    chain: Chain::Polygon,
                    network: Network::Mainnet,
                },
                "worker-a",
            )
            .await
            .unwrap();

        let hash = B256::repeat_byte(3);
        let mut result = broadcast_result(hash, "r1");
        result.transaction_type = TransactionType::Batch;
        result.withdrawal_id = None;
        result.batch_id = Some("b1".into());
        result.metadata.affected_requests = vec!["r1".into(), "r2".into()];
        h.monitor.admit(result);

        h.rpc.set_receipt(RpcReceipt {
            transaction_hash: hash,
            block_number: 100,
            status: false,
            gas_used: 300_000,
        });
        h.rpc.set_head(100);
        h.monitor.check_transaction(hash).await;

        let batch = h.store.get_batch("b1").await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        for id in ["r1", "r2"] {
            let snapshot = h.store.snapshot(id).await.unwrap();
            assert_eq!(snapshot.status, RequestStatus::Pending);
            assert!(snapshot.batch_id.is_none());
        }
    }

    #[tokio::test]
    async fn mined_without_receipt_moves_to_confirming() {
        let h = harness();
        seed_request(&h, "r1").await;
        let hash = B256::repeat_byte(4);
        h.monitor.admit(broadcast_result(hash, "r1"));
        h.rpc.set_transaction(RpcTransaction {
            hash,
            block_number: Some(120),
            nonce: 1,
        });
        h.monitor.check_transaction(hash).await;
        let entry = h.monitor.active.get(&hash).unwrap();
        assert_eq!(entry.status, MonitorStatus::Confirming);
        assert_eq!(entry.block_number, Some(120));
    }

    #[tokio::test]
    async fn unmined_increments_retry_and_drops_after_timeout() {
        let h = harness();
        seed_request(&h, "r1").await;
        let hash = B256::repeat_byte(5);
        h.monitor.admit(broadcast_result(hash, "r1"));
        h.monitor.check_transaction(hash).await;
        {
            let entry = h.monitor.active.get(&hash).unwrap();
            assert_eq!(entry.status, MonitorStatus::Sent);
            assert_eq!(entry.retry_count, 1);
        }
        // Age the entry past the mempool drop timeout.
        {
            let mut entry = h.monitor.active.get_mut(&hash).unwrap();
            entry.submitted_at = UnixMillis(0);
        }
        h.monitor.check_transaction(hash).await;
        assert!(h.monitor.active.get(&hash).is_none());
        let snapshot = h.store.snapshot("r1").await.unwrap();
        assert_eq!(snapshot.status, RequestStatus::Failed);
        assert!(snapshot.error.as_deref().unwrap().contains("mempool"));
    }

    #[tokio::test]
    async fn transient_errors_exhaust_retry_budget() {
        let h = harness();
        seed_request(&h, "r1").await;
        let hash = B256::repeat_byte(6);
        h.monitor.admit(broadcast_result(hash, "r1"));
        h.rpc.fail_receipts(20);
        for _ in 0..10 {
            h.monitor.check_transaction(hash).await;
        }
        assert!(h.monitor.active.get(&hash).is_none());
        assert_eq!(
            h.store.snapshot("r1").await.unwrap().status,
            RequestStatus::Failed
        );
    }

    #[tokio::test]
    async fn block_event_checks_included_and_young() {
        let h = harness();
        seed_request(&h, "r1").await;
        seed_request(&h, "r2").await;
        let included = B256::repeat_byte(7);
        let young_absent = B256::repeat_byte(8);
        h.monitor.admit(broadcast_result(included, "r1"));
        h.monitor.admit(broadcast_result(young_absent, "r2"));
        h.rpc.push_block(200, vec![included]);
        h.rpc.set_receipt(RpcReceipt {
            transaction_hash: included,
            block_number: 200,
            status: true,
            gas_used: 21_000,
        });
        h.monitor
            .handle_block_event(BlockEvent {
                key: polygon(),
                header: BlockHeader {
                    number: 200,
                    hash: B256::repeat_byte(0xbb),
                },
            })
            .await;
        // The included tx advanced; the young absent one was polled too
        // (remains SENT with a retry recorded).
        assert_eq!(
            h.monitor.active.get(&included).unwrap().status,
            MonitorStatus::Confirming
        );
        let young = h.monitor.active.get(&young_absent).unwrap();
        assert_eq!(young.status, MonitorStatus::Sent);
        assert_eq!(young.retry_count, 1);
    }

    #[tokio::test]
    async fn reconnect_replay_rechecks_active_set() {
        let h = harness();
        seed_request(&h, "r1").await;
        let hash = B256::repeat_byte(9);
        h.monitor.admit(broadcast_result(hash, "r1"));
        // The tx confirmed during the outage.
        h.rpc.set_receipt(RpcReceipt {
            transaction_hash: hash,
            block_number: 100,
            status: true,
            gas_used: 21_000,
        });
        h.rpc.set_head(140);
        h.monitor
            .handle_chain_event(ChainEvent::WebsocketReconnected {
                key: polygon(),
                last_block: 100,
                current_block: 140,
            })
            .await;
        assert!(h.monitor.active.get(&hash).is_none());
        assert_eq!(
            h.store.snapshot("r1").await.unwrap().status,
            RequestStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn tier_eligibility_respects_interval_and_age() {
        let h = harness();
        seed_request(&h, "r1").await;
        let hash = B256::repeat_byte(10);
        h.monitor.admit(broadcast_result(hash, "r1"));
        // Fresh entry: not eligible for a 60 s tier interval.
        h.monitor
            .run_tier(TierSpec {
                interval: Duration::from_secs(60),
                max_age: Some(Duration::from_secs(900)),
                batch_size: 30,
            })
            .await;
        assert_eq!(h.monitor.active.get(&hash).unwrap().retry_count, 0);

        // Make it look unchecked for two minutes.
        {
            let mut entry = h.monitor.active.get_mut(&hash).unwrap();
            entry.last_checked = UnixMillis(UnixMillis::now().0 - 120_000);
        }
        h.monitor
            .run_tier(TierSpec {
                interval: Duration::from_secs(60),
                max_age: Some(Duration::from_secs(900)),
                batch_size: 30,
            })
            .await;
        assert_eq!(h.monitor.active.get(&hash).unwrap().retry_count, 1);

        // An old transaction is outside the fast tier's age window.
        {
            let mut entry = h.monitor.active.get_mut(&hash).unwrap();
            entry.last_checked = UnixMillis(UnixMillis::now().0 - 120_000);
            entry.submitted_at = UnixMillis(UnixMillis::now().0 - 3_600_000);
        }
        h.monitor
            .run_tier(TierSpec {
                interval: Duration::from_secs(60),
                max_age: Some(Duration::from_secs(900)),
                batch_size: 30,
            })
            .await;
        assert_eq!(h.monitor.active.get(&hash).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn stuck_detection_flags_once_and_delegates() {
        let h = harness();
        seed_request(&h, "r1").await;
        let hash = B256::repeat_byte(11);
        h.monitor.admit(broadcast_result(hash, "r1"));
        // Persist a signed row so delegation can reconstruct the payload.
        h.store
            .mark_signed(SignedTransaction {
                tx_hash: hash,
                request_id: Some("r1".into()),
                batch_id: None,
                from: Address::repeat_byte(0x11),
                to: Address::repeat_byte(0x22),
                value: U256::from(1u64),
                data: vec![],
                nonce: 1,
                gas_limit: 21_000,
                max_fee_per_gas: 30_000_000_000,
                max_priority_fee_per_gas: 1_500_000_000,
                chain_id: 137,
                raw_transaction: vec![0x02],
                created_at: UnixMillis::now(),
            })
            .await
            .unwrap();
        // 16 minutes old (past polygon's 15 min), gas price doubled.
        {
            let mut entry = h.monitor.active.get_mut(&hash).unwrap();
            entry.submitted_at = UnixMillis(UnixMillis::now().0 - 16 * 60 * 1000);
        }
        h.rpc.set_fee(FeeData {
            gas_price: 70_000_000_000,
            max_fee_per_gas: 70_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
        });
        h.monitor.scan_stuck().await;
        assert_eq!(h.monitor.stats.stuck_flagged.load(Ordering::Relaxed), 1);
        assert_eq!(h.queue.depth(QueueName::dlq(QueueKind::SignedTx)).await, 1);
        // Second scan does not re-flag.
        h.monitor.scan_stuck().await;
        assert_eq!(h.monitor.stats.stuck_flagged.load(Ordering::Relaxed), 1);

        let dlq = h
            .queue
            .receive(
                QueueName::dlq(QueueKind::SignedTx),
                1,
                Duration::from_millis(10),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(
            dlq[0]
                .attributes
                .error
                .as_deref()
                .unwrap()
                .contains("max fee per gas")
        );
    }

    #[tokio::test]
    async fn stuck_scan_skips_recent_or_fairly_priced() {
        let h = harness();
        seed_request(&h, "r1").await;
        let hash = B256::repeat_byte(12);
        h.monitor.admit(broadcast_result(hash, "r1"));
        // Old enough but gas price unchanged: not stuck.
        {
            let mut entry = h.monitor.active.get_mut(&hash).unwrap();
            entry.submitted_at = UnixMillis(UnixMillis::now().0 - 16 * 60 * 1000);
        }
        h.monitor.scan_stuck().await;
        assert_eq!(h.monitor.stats.stuck_flagged.load(Ordering::Relaxed), 0);
    }
}
