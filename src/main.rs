//! Pipeline entrypoint.
//!
//! Builds the dependency graph explicitly — configuration, telemetry, chain
//! registry, queue and store backings, then the worker, broadcaster,
//! monitor, and recovery loops — and runs everything until SIGTERM/SIGINT.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `RPC_URL_<CHAIN>[_TESTNET]` / `WS_URL_<CHAIN>[_TESTNET]` per chain
//! - `SIGNER_PRIVATE_KEY` for the withdrawal signer
//! - `OTEL_*` variables enable tracing export

use dotenvy::dotenv;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

use asset_withdrawer::batcher::MulticallBatcher;
use asset_withdrawer::broadcaster::Broadcaster;
use asset_withdrawer::config::Config;
use asset_withdrawer::monitor::TransactionMonitor;
use asset_withdrawer::nonce::NonceCache;
use asset_withdrawer::queue::{InMemoryQueue, MessageQueue};
use asset_withdrawer::recovery::{RecoveryEngine, strategy::RecoveryContext};
use asset_withdrawer::registry::ChainRegistry;
use asset_withdrawer::shutdown::ShutdownSignal;
use asset_withdrawer::signer::SignerCache;
use asset_withdrawer::store::{InMemoryStore, RequestStore};
use asset_withdrawer::telemetry::Telemetry;
use asset_withdrawer::worker::SigningWorker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::init();
    let config = Config::load();

    let shutdown = ShutdownSignal::try_new()?;
    let cancel = shutdown.token();

    let registry = Arc::new(ChainRegistry::from_endpoints(
        config.endpoints()?,
        config.reconnect_policy(),
        config.rpc_timeout(),
        cancel.clone(),
    )?);

    // The durable bus and relational store plug in behind these traits; the
    // in-process backings serve local deployments.
    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryQueue::new());
    let store: Arc<dyn RequestStore> = Arc::new(InMemoryStore::new());

    let nonces = NonceCache::new();
    let signers = Arc::new(SignerCache::new(config.signer_private_key.clone()));
    let batcher = Arc::new(MulticallBatcher::new(config.batcher_config()));

    let instance_id = config.instance_id();
    tracing::info!(%instance_id, chains = registry.keys().len(), "starting withdrawal pipeline");

    let tracker = TaskTracker::new();

    for index in 0..config.worker_count.max(1) {
        let worker = SigningWorker::new(
            config.worker_config(format!("{instance_id}-{index}")),
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&registry),
            nonces.clone(),
            Arc::clone(&signers),
            Arc::clone(&batcher),
        );
        let cancel = cancel.clone();
        tracker.spawn(async move { worker.run(cancel).await });
    }

    {
        let broadcaster = Broadcaster::new(
            config.broadcaster_config(),
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&registry),
        );
        let cancel = cancel.clone();
        tracker.spawn(async move { broadcaster.run(cancel).await });
    }

    {
        let monitor = Arc::new(TransactionMonitor::new(
            config.monitor_config(),
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::clone(&registry),
        ));
        let cancel = cancel.clone();
        tracker.spawn(async move { monitor.run(cancel).await });
    }

    {
        let engine = Arc::new(RecoveryEngine::new(RecoveryContext {
            queue: Arc::clone(&queue),
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            signers: Arc::clone(&signers),
            nonces: nonces.clone(),
            config: config.recovery_config(),
        }));
        let cancel = cancel.clone();
        tracker.spawn(async move { engine.run(cancel).await });
    }

    tracker.close();
    shutdown.recv().await;
    tracing::info!("shutdown signal received, draining");
    tracker.wait().await;
    registry.shutdown().await;
    tracing::info!("pipeline stopped");
    Ok(())
}
