//! Asset-withdrawal pipeline for EVM-compatible chains.
//!
//! The pipeline accepts withdrawal requests from a queue, signs them into
//! raw transactions (individually or fused into multicall batches when that
//! saves gas), broadcasts them, monitors on-chain inclusion to a per-chain
//! confirmation depth, and recovers failures routed through dead-letter
//! queues.
//!
//! # Data flow
//!
//! `tx-request-queue` → [`worker::SigningWorker`] → `signed-tx-queue` →
//! [`broadcaster::Broadcaster`] → `broadcast-tx-queue` →
//! [`monitor::TransactionMonitor`], with terminal state persisted through
//! [`store::RequestStore`]. Failures from any stage land on that stage's
//! DLQ and are consumed by [`recovery::RecoveryEngine`].
//!
//! # Modules
//!
//! - [`chain`] — chain/network keys, static chain parameters, token directory.
//! - [`registry`] — per-chain providers, WebSocket lifecycle, circuit breaker.
//! - [`rpc`] — the EVM JSON-RPC boundary trait and its alloy implementation.
//! - [`queue`] — the at-least-once message bus abstraction.
//! - [`store`] — persistent request/batch state and the atomic claim.
//! - [`nonce`] — per-signer monotonic nonce allocation.
//! - [`batcher`] — multicall aggregation, gas model, batch splitting.
//! - [`signer`] — the signer primitive over an alloy wallet.
//! - [`worker`] — the signing worker (validate → claim → sign → enqueue).
//! - [`broadcaster`] — raw transaction submission.
//! - [`monitor`] — receipt tracking, tier polling, stuck detection.
//! - [`recovery`] — DLQ classification, strategy dispatch, priority retries.
//! - [`scheduler`] — non-overlapping periodic scheduling primitives.
//! - [`shutdown`] / [`telemetry`] — process lifecycle and observability.

pub mod batcher;
pub mod broadcaster;
pub mod chain;
pub mod config;
pub mod monitor;
pub mod nonce;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod shutdown;
pub mod signer;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod worker;
