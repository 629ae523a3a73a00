//! Chain registry: per-(chain, network) providers, WebSocket lifecycle, and
//! typed chain events.
//!
//! The registry resolves a static endpoint table into [`ChainSettings`]
//! (chain id, required confirmations, block time, aggregator address) and
//! caches one RPC handle per key. Block subscriptions are reference-counted:
//! a per-key pump task runs only while at least one consumer holds the
//! subscription, reconnects with exponential backoff, and opens a circuit
//! breaker after repeated failures so a dead endpoint is probed at a long
//! interval instead of hammered.
//!
//! Consumers observe two typed channels: [`ChainEvent`] for WebSocket
//! lifecycle (disconnect / reconnect with the missed block range) and
//! [`BlockEvent`] for new headers. Both are bounded broadcast channels;
//! a lagging block consumer skips the oldest events and the monitor's tier
//! poller compensates.

use alloy_primitives::Address;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::chain::{ChainKey, chain_params};
use crate::rpc::{AlloyRpc, BlockHeader, EvmRpc};
use crate::scheduler::after;
use futures_util::StreamExt;

/// One row of the endpoint table, typically produced from configuration.
#[derive(Debug, Clone)]
pub struct ChainEndpoint {
    pub key: ChainKey,
    pub rpc_url: Url,
    pub ws_url: Option<Url>,
    /// Override the static chain id (localhost forks).
    pub chain_id: Option<u64>,
    /// Override the static confirmation depth.
    pub required_confirmations: Option<u64>,
}

/// Resolved operating parameters for a registered key.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub key: ChainKey,
    pub chain_id: u64,
    pub required_confirmations: u64,
    pub block_time: Duration,
    pub stuck_min_age: Duration,
    pub aggregator: Address,
    pub block_gas_limit: u64,
    pub gas_adjustment: f64,
}

/// WebSocket lifecycle events.
#[derive(Debug, Clone, Copy)]
pub enum ChainEvent {
    WebsocketDisconnected {
        key: ChainKey,
    },
    /// The subscription is live again. `last_block` is the newest block seen
    /// before the drop; `current_block` the head at reconnect time, so the
    /// missed range is `[last_block + 1, current_block]`.
    WebsocketReconnected {
        key: ChainKey,
        last_block: u64,
        current_block: u64,
    },
}

/// A new block header on a registered chain.
#[derive(Debug, Clone, Copy)]
pub struct BlockEvent {
    pub key: ChainKey,
    pub header: BlockHeader,
}

/// Reconnection tuning for the per-key WebSocket pump.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Short-term attempts before the circuit opens.
    pub max_attempts: u32,
    /// Probe interval while the circuit is open.
    pub long_term_interval: Duration,
    /// Open duration after which the circuit closes for a fresh short-term
    /// attempt burst.
    pub reset_window: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            long_term_interval: Duration::from_secs(60),
            reset_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Circuit {
    Closed,
    Open { since_probe: u32 },
}

/// Per-key reconnection bookkeeping. Success/failure counters are retained
/// across circuit transitions for observability.
#[derive(Debug)]
pub struct ReconnectState {
    short_attempts: u32,
    circuit: Circuit,
    opened_at: Option<Instant>,
    pub successes: u64,
    pub failures: u64,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self {
            short_attempts: 0,
            circuit: Circuit::Closed,
            opened_at: None,
            successes: 0,
            failures: 0,
        }
    }
}

impl ReconnectState {
    /// Record a failed connection attempt and return the delay before the
    /// next one.
    pub fn next_delay(&mut self, policy: &ReconnectPolicy, now: Instant) -> Duration {
        self.failures += 1;
        match self.circuit {
            Circuit::Closed => {
                self.short_attempts += 1;
                if self.short_attempts >= policy.max_attempts {
                    self.circuit = Circuit::Open { since_probe: 0 };
                    self.opened_at = Some(now);
                    tracing::warn!(
                        attempts = self.short_attempts,
                        "websocket circuit opened, throttling reconnection"
                    );
                    policy.long_term_interval
                } else {
                    let exp = policy
                        .multiplier
                        .powi(self.short_attempts.saturating_sub(1) as i32);
                    let delay = policy.initial_delay.mul_f64(exp);
                    delay.min(policy.max_delay)
                }
            }
            Circuit::Open { since_probe } => {
                let elapsed = self
                    .opened_at
                    .map(|t| now.duration_since(t))
                    .unwrap_or_default();
                if elapsed >= policy.reset_window {
                    // Reset window elapsed: close for a fresh attempt burst.
                    self.circuit = Circuit::Closed;
                    self.opened_at = None;
                    self.short_attempts = 1;
                    policy.initial_delay
                } else {
                    self.circuit = Circuit::Open {
                        since_probe: since_probe + 1,
                    };
                    policy.long_term_interval
                }
            }
        }
    }

    /// Record a successful connection: the circuit closes.
    pub fn record_success(&mut self) {
        self.successes += 1;
        self.short_attempts = 0;
        self.circuit = Circuit::Closed;
        self.opened_at = None;
    }

    pub fn is_open(&self) -> bool {
        matches!(self.circuit, Circuit::Open { .. })
    }
}

struct ChainEntry {
    settings: ChainSettings,
    rpc: Arc<dyn EvmRpc>,
    last_block: AtomicU64,
    ws_refs: AtomicUsize,
    pump_active: AtomicUsize,
    ws_wake: Notify,
    reconnect: StdMutex<ReconnectState>,
}

/// Registry of chain providers and their WebSocket pumps.
pub struct ChainRegistry {
    entries: HashMap<ChainKey, Arc<ChainEntry>>,
    chain_events: broadcast::Sender<ChainEvent>,
    block_events: broadcast::Sender<BlockEvent>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

const CHAIN_EVENT_CAPACITY: usize = 64;
const BLOCK_EVENT_CAPACITY: usize = 256;

impl ChainRegistry {
    /// Build the registry from an endpoint table, wiring alloy providers.
    ///
    /// Keys with no static parameter row are rejected.
    pub fn from_endpoints(
        endpoints: Vec<ChainEndpoint>,
        policy: ReconnectPolicy,
        rpc_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, RegistryError> {
        let mut with_rpc = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let rpc: Arc<dyn EvmRpc> = Arc::new(AlloyRpc::new(
                endpoint.rpc_url.clone(),
                endpoint.ws_url.clone(),
                rpc_timeout,
            ));
            with_rpc.push((endpoint, rpc));
        }
        Self::with_rpcs(with_rpc, policy, cancel)
    }

    /// Build the registry with explicit RPC handles. Used by local mode and
    /// tests to inject fakes.
    pub fn with_rpcs(
        endpoints: Vec<(ChainEndpoint, Arc<dyn EvmRpc>)>,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> Result<Self, RegistryError> {
        let (chain_events, _) = broadcast::channel(CHAIN_EVENT_CAPACITY);
        let (block_events, _) = broadcast::channel(BLOCK_EVENT_CAPACITY);
        let mut entries = HashMap::new();
        for (endpoint, rpc) in endpoints {
            let params = chain_params(endpoint.key)
                .ok_or(RegistryError::UnsupportedChain(endpoint.key))?;
            let settings = ChainSettings {
                key: endpoint.key,
                chain_id: endpoint.chain_id.unwrap_or(params.chain_id),
                required_confirmations: endpoint
                    .required_confirmations
                    .unwrap_or(params.required_confirmations),
                block_time: params.block_time,
                stuck_min_age: params.stuck_min_age,
                aggregator: params.aggregator,
                block_gas_limit: params.block_gas_limit,
                gas_adjustment: params.gas_adjustment,
            };
            tracing::info!(key = %endpoint.key, chain_id = settings.chain_id, "registered chain");
            entries.insert(
                endpoint.key,
                Arc::new(ChainEntry {
                    settings,
                    rpc,
                    last_block: AtomicU64::new(0),
                    ws_refs: AtomicUsize::new(0),
                    pump_active: AtomicUsize::new(0),
                    ws_wake: Notify::new(),
                    reconnect: StdMutex::new(ReconnectState::default()),
                }),
            );
        }
        Ok(Self {
            entries,
            chain_events,
            block_events,
            policy,
            cancel,
            tracker: TaskTracker::new(),
        })
    }

    pub fn keys(&self) -> Vec<ChainKey> {
        self.entries.keys().copied().collect()
    }

    pub fn supports(&self, key: ChainKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn settings(&self, key: ChainKey) -> Option<&ChainSettings> {
        self.entries.get(&key).map(|e| &e.settings)
    }

    pub fn rpc(&self, key: ChainKey) -> Option<Arc<dyn EvmRpc>> {
        self.entries.get(&key).map(|e| Arc::clone(&e.rpc))
    }

    /// Newest block number observed on the subscription for `key`.
    pub fn last_block(&self, key: ChainKey) -> u64 {
        self.entries
            .get(&key)
            .map(|e| e.last_block.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn subscribe_chain_events(&self) -> broadcast::Receiver<ChainEvent> {
        self.chain_events.subscribe()
    }

    pub fn subscribe_block_events(&self) -> broadcast::Receiver<BlockEvent> {
        self.block_events.subscribe()
    }

    /// Reconnection statistics (successes, failures) for observability.
    pub fn reconnect_stats(&self, key: ChainKey) -> Option<(u64, u64)> {
        self.entries.get(&key).map(|e| {
            let state = e.reconnect.lock().expect("reconnect state lock");
            (state.successes, state.failures)
        })
    }

    /// Whether the WebSocket pump for `key` is currently running.
    pub fn ws_active(&self, key: ChainKey) -> bool {
        self.entries
            .get(&key)
            .map(|e| e.pump_active.load(Ordering::SeqCst) > 0)
            .unwrap_or(false)
    }

    /// Take a reference on the block subscription for `key`, starting the
    /// pump on the zero-to-one transition.
    pub fn acquire_blocks(&self, key: ChainKey) {
        let Some(entry) = self.entries.get(&key) else {
            return;
        };
        let previous = entry.ws_refs.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            self.spawn_pump(key, Arc::clone(entry));
        }
    }

    /// Drop a reference on the block subscription for `key`; the pump stops
    /// once no references remain.
    pub fn release_blocks(&self, key: ChainKey) {
        if let Some(entry) = self.entries.get(&key) {
            let previous = entry.ws_refs.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(previous > 0, "release without acquire");
            if previous == 1 {
                entry.ws_wake.notify_waiters();
            }
        }
    }

    fn spawn_pump(&self, key: ChainKey, entry: Arc<ChainEntry>) {
        let chain_events = self.chain_events.clone();
        let block_events = self.block_events.clone();
        let policy = self.policy;
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            entry.pump_active.fetch_add(1, Ordering::SeqCst);
            run_block_pump(key, entry.clone(), policy, chain_events, block_events, cancel).await;
            entry.pump_active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Wait for all pump tasks after cancellation.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for entry in self.entries.values() {
            entry.ws_wake.notify_waiters();
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Errors surfaced while building the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unsupported chain key: {0}")]
    UnsupportedChain(ChainKey),
}

async fn run_block_pump(
    key: ChainKey,
    entry: Arc<ChainEntry>,
    policy: ReconnectPolicy,
    chain_events: broadcast::Sender<ChainEvent>,
    block_events: broadcast::Sender<BlockEvent>,
    cancel: CancellationToken,
) {
    let mut connected_before = false;
    loop {
        if cancel.is_cancelled() || entry.ws_refs.load(Ordering::SeqCst) == 0 {
            tracing::debug!(%key, "block pump stopping");
            return;
        }
        match entry.rpc.subscribe_blocks().await {
            Ok(mut stream) => {
                {
                    let mut state = entry.reconnect.lock().expect("reconnect state lock");
                    state.record_success();
                }
                if connected_before {
                    let last_block = entry.last_block.load(Ordering::SeqCst);
                    let current_block = match entry.rpc.get_block_number().await {
                        Ok(head) => head,
                        Err(err) => {
                            tracing::warn!(%key, %err, "head fetch after reconnect failed");
                            last_block
                        }
                    };
                    tracing::info!(%key, last_block, current_block, "websocket reconnected");
                    let _ = chain_events.send(ChainEvent::WebsocketReconnected {
                        key,
                        last_block,
                        current_block,
                    });
                } else {
                    tracing::info!(%key, "websocket block subscription established");
                }
                connected_before = true;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = entry.ws_wake.notified() => {
                            if entry.ws_refs.load(Ordering::SeqCst) == 0 {
                                tracing::debug!(%key, "block pump released");
                                return;
                            }
                        }
                        header = stream.next() => {
                            match header {
                                Some(header) => {
                                    entry.last_block.store(header.number, Ordering::SeqCst);
                                    let _ = block_events.send(BlockEvent { key, header });
                                    if entry.ws_refs.load(Ordering::SeqCst) == 0 {
                                        tracing::debug!(%key, "block pump released");
                                        return;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                tracing::warn!(%key, "websocket block subscription dropped");
                let _ = chain_events.send(ChainEvent::WebsocketDisconnected { key });
            }
            Err(err) => {
                let delay = {
                    let mut state = entry.reconnect.lock().expect("reconnect state lock");
                    state.next_delay(&policy, Instant::now())
                };
                tracing::warn!(%key, %err, ?delay, "websocket connect failed, backing off");
                if !after(delay, &cancel).await {
                    return;
                }
            }
        }
    }
}
