//! Configuration for the withdrawal pipeline.
//!
//! Scalar tuning comes from CLI flags with environment fallbacks. Chain
//! endpoints are discovered from the environment per (chain, network) key:
//! `RPC_URL_POLYGON`, `RPC_URL_POLYGON_TESTNET`, `WS_URL_POLYGON`, and so
//! on — keys without an RPC URL are skipped with a warning. `.env` files are
//! loaded by the binary entrypoint before parsing.

use clap::Parser;
use std::env;
use std::time::Duration;
use url::Url;

use crate::batcher::BatcherConfig;
use crate::broadcaster::BroadcasterConfig;
use crate::chain::{ChainKey, Network};
use crate::monitor::MonitorConfig;
use crate::recovery::RecoveryConfig;
use crate::registry::{ChainEndpoint, ReconnectPolicy};
use crate::worker::WorkerConfig;

/// Pipeline configuration, parsed from CLI flags and environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "asset-withdrawer")]
#[command(about = "EVM asset-withdrawal pipeline: sign, broadcast, monitor, recover")]
pub struct Config {
    /// Identity used for atomic request claims. Random per process when
    /// unset.
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Private key for the withdrawal signer.
    #[arg(long, env = "SIGNER_PRIVATE_KEY", hide_env_values = true)]
    pub signer_private_key: String,

    /// Number of signing-worker tasks in this process.
    #[arg(long, env = "WORKER_COUNT", default_value_t = 2)]
    pub worker_count: usize,

    /// Enable multicall batch processing.
    #[arg(long, env = "BATCH_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub batch_enabled: bool,

    #[arg(long, env = "MIN_BATCH_SIZE", default_value_t = 3)]
    pub min_batch_size: usize,

    /// Minimum per-token group size to form a batch.
    #[arg(long, env = "BATCH_THRESHOLD", default_value_t = 3)]
    pub batch_threshold: usize,

    /// Required projected gas saving for batching, as a fraction.
    #[arg(long, env = "MIN_GAS_SAVINGS_PERCENT", default_value_t = 0.20)]
    pub min_gas_savings_percent: f64,

    /// Queue visibility timeout in seconds.
    #[arg(long, env = "VISIBILITY_TIMEOUT_SECS", default_value_t = 300)]
    pub visibility_timeout_secs: u64,

    /// Per-call RPC timeout in seconds.
    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value_t = 10)]
    pub rpc_timeout_secs: u64,

    /// Override the numeric chain id for every configured endpoint
    /// (single-chain deployments against forks).
    #[arg(long, env = "CHAIN_ID")]
    pub chain_id_override: Option<u64>,

    /// Override required confirmations for every configured endpoint.
    #[arg(long, env = "REQUIRED_CONFIRMATIONS")]
    pub required_confirmations_override: Option<u64>,

    // WebSocket reconnection tuning.
    #[arg(long, env = "WS_RECONNECT_INITIAL_MS", default_value_t = 1000)]
    pub ws_reconnect_initial_ms: u64,

    #[arg(long, env = "WS_RECONNECT_MULTIPLIER", default_value_t = 2.0)]
    pub ws_reconnect_multiplier: f64,

    #[arg(long, env = "WS_RECONNECT_MAX_DELAY_SECS", default_value_t = 30)]
    pub ws_reconnect_max_delay_secs: u64,

    #[arg(long, env = "WS_RECONNECT_MAX_ATTEMPTS", default_value_t = 5)]
    pub ws_reconnect_max_attempts: u32,

    #[arg(long, env = "WS_RECONNECT_LONG_TERM_SECS", default_value_t = 60)]
    pub ws_reconnect_long_term_secs: u64,

    #[arg(long, env = "WS_RECONNECT_RESET_SECS", default_value_t = 300)]
    pub ws_reconnect_reset_secs: u64,

    // Monitor tier tuning.
    #[arg(long, env = "MONITOR_FAST_INTERVAL_SECS", default_value_t = 300)]
    pub monitor_fast_interval_secs: u64,

    #[arg(long, env = "MONITOR_FAST_ACCELERATED_SECS", default_value_t = 60)]
    pub monitor_fast_accelerated_secs: u64,

    #[arg(long, env = "MONITOR_MEDIUM_INTERVAL_SECS", default_value_t = 1800)]
    pub monitor_medium_interval_secs: u64,

    #[arg(long, env = "MONITOR_FULL_INTERVAL_SECS", default_value_t = 7200)]
    pub monitor_full_interval_secs: u64,

    // Recovery tuning.
    #[arg(long, env = "RECOVERY_POLL_INTERVAL_SECS", default_value_t = 20)]
    pub recovery_poll_interval_secs: u64,

    #[arg(long, env = "RECOVERY_MAX_ATTEMPTS", default_value_t = 5)]
    pub recovery_max_attempts: u32,

    #[arg(long, env = "ENABLE_DUMMY_TX", default_value_t = false, action = clap::ArgAction::Set)]
    pub enable_dummy_tx: bool,

    #[arg(long, env = "RECOVERY_MAX_QUEUE_SIZE", default_value_t = 1000)]
    pub recovery_max_queue_size: usize,
}

/// Errors surfaced while resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid url in {var}: {source}")]
    InvalidUrl {
        var: String,
        #[source]
        source: url::ParseError,
    },
    #[error("no chain endpoints configured; set RPC_URL_<CHAIN>[_TESTNET]")]
    NoEndpoints,
}

fn env_suffix(key: &ChainKey) -> String {
    let chain = key.chain.to_string().to_ascii_uppercase();
    match key.network {
        Network::Mainnet => chain,
        Network::Testnet => format!("{chain}_TESTNET"),
        Network::Localhost => chain,
    }
}

impl Config {
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("worker-{:08x}", rand::random::<u32>()))
    }

    /// Discover configured chain endpoints from the environment.
    pub fn endpoints(&self) -> Result<Vec<ChainEndpoint>, ConfigError> {
        let mut endpoints = Vec::new();
        for key in ChainKey::variants() {
            let suffix = env_suffix(&key);
            let rpc_var = format!("RPC_URL_{suffix}");
            let Ok(rpc_raw) = env::var(&rpc_var) else {
                tracing::debug!(%key, "no RPC URL configured (skipped)");
                continue;
            };
            let rpc_url: Url = rpc_raw.parse().map_err(|source| ConfigError::InvalidUrl {
                var: rpc_var.clone(),
                source,
            })?;
            let ws_var = format!("WS_URL_{suffix}");
            let ws_url = match env::var(&ws_var) {
                Ok(ws_raw) => Some(ws_raw.parse().map_err(|source| ConfigError::InvalidUrl {
                    var: ws_var.clone(),
                    source,
                })?),
                Err(_) => None,
            };
            endpoints.push(ChainEndpoint {
                key,
                rpc_url,
                ws_url,
                chain_id: self.chain_id_override,
                required_confirmations: self.required_confirmations_override,
            });
        }
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        Ok(endpoints)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.ws_reconnect_initial_ms),
            multiplier: self.ws_reconnect_multiplier,
            max_delay: Duration::from_secs(self.ws_reconnect_max_delay_secs),
            max_attempts: self.ws_reconnect_max_attempts,
            long_term_interval: Duration::from_secs(self.ws_reconnect_long_term_secs),
            reset_window: Duration::from_secs(self.ws_reconnect_reset_secs),
        }
    }

    pub fn worker_config(&self, instance_id: String) -> WorkerConfig {
        WorkerConfig {
            instance_id,
            batch_enabled: self.batch_enabled,
            min_batch_size: self.min_batch_size,
            batch_threshold: self.batch_threshold,
            min_gas_savings_percent: self.min_gas_savings_percent,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            ..WorkerConfig::default()
        }
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig::default()
    }

    pub fn broadcaster_config(&self) -> BroadcasterConfig {
        BroadcasterConfig {
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            ..BroadcasterConfig::default()
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        let mut config = MonitorConfig {
            fast_interval: Duration::from_secs(self.monitor_fast_interval_secs),
            fast_interval_accelerated: Duration::from_secs(self.monitor_fast_accelerated_secs),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            ..MonitorConfig::default()
        };
        config.medium_tier.interval = Duration::from_secs(self.monitor_medium_interval_secs);
        config.full_tier.interval = Duration::from_secs(self.monitor_full_interval_secs);
        config
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            poll_interval: Duration::from_secs(self.recovery_poll_interval_secs),
            max_attempts: self.recovery_max_attempts,
            enable_dummy_tx: self.enable_dummy_tx,
            max_queue_size: self.recovery_max_queue_size,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            ..RecoveryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const TEST_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn parse_config(args: &[&str]) -> Config {
        let mut argv = vec!["asset-withdrawer", "--signer-private-key", TEST_KEY];
        argv.extend_from_slice(args);
        Config::parse_from(argv)
    }

    fn restore_env(key: &str, original: Option<String>) {
        if let Some(value) = original {
            // Safety: guarded by `ENV_LOCK`, so no concurrent environment
            // mutation occurs.
            unsafe { env::set_var(key, value) };
        } else {
            // Safety: guarded by `ENV_LOCK`, so no concurrent environment
            // mutation occurs.
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn endpoints_discovered_from_env() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let original_rpc = env::var("RPC_URL_POLYGON").ok();
        let original_ws = env::var("WS_URL_POLYGON").ok();
        // Safety: guarded by `ENV_LOCK`, so no concurrent environment
        // mutation occurs.
        unsafe {
            env::set_var("RPC_URL_POLYGON", "http://localhost:8545");
            env::set_var("WS_URL_POLYGON", "ws://localhost:8546");
        }

        let config = parse_config(&[]);
        let endpoints = config.endpoints().expect("endpoints resolve");
        let polygon = endpoints
            .iter()
            .find(|e| e.key.chain == Chain::Polygon && e.key.network == Network::Mainnet)
            .expect("polygon endpoint present");
        assert_eq!(polygon.rpc_url.as_str(), "http://localhost:8545/");
        assert!(polygon.ws_url.is_some());

        restore_env("RPC_URL_POLYGON", original_rpc);
        restore_env("WS_URL_POLYGON", original_ws);
    }

    #[test]
    fn endpoint_overrides_apply() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        let original = env::var("RPC_URL_LOCALHOST").ok();
        // Safety: guarded by `ENV_LOCK`, so no concurrent environment
        // mutation occurs.
        unsafe { env::set_var("RPC_URL_LOCALHOST", "http://localhost:8545") };

        let config = parse_config(&["--chain-id-override", "1337", "--required-confirmations-override", "3"]);
        let endpoints = config.endpoints().expect("endpoints resolve");
        let localhost = endpoints
            .iter()
            .find(|e| e.key.chain == Chain::Localhost)
            .expect("localhost endpoint present");
        assert_eq!(localhost.chain_id, Some(1337));
        assert_eq!(localhost.required_confirmations, Some(3));

        restore_env("RPC_URL_LOCALHOST", original);
    }

    #[test]
    fn tuning_flows_into_component_configs() {
        let config = parse_config(&[
            "--min-batch-size",
            "5",
            "--enable-dummy-tx",
            "true",
            "--visibility-timeout-secs",
            "120",
        ]);
        let worker = config.worker_config("w-1".into());
        assert_eq!(worker.min_batch_size, 5);
        assert_eq!(worker.visibility_timeout, Duration::from_secs(120));
        assert_eq!(worker.instance_id, "w-1");
        let recovery = config.recovery_config();
        assert!(recovery.enable_dummy_tx);
        let policy = config.reconnect_policy();
        assert_eq!(policy.max_attempts, 5);
    }
}
