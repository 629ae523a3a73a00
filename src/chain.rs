//! Chain and network definitions with per-chain operating parameters.
//!
//! A deployment target is identified by a two-level key: the [`Chain`]
//! (ethereum, polygon, bsc, localhost) and the [`Network`] (mainnet, testnet,
//! localhost). Static per-key parameters — numeric chain id, required
//! confirmation depth, nominal block time, stuck-transaction minimum age, and
//! the multicall aggregator address — live in a lazily initialized table.
//!
//! The module also carries the known-token directory: statically known ERC-20
//! deployments per (chain, network), used for decimal resolution when
//! normalizing withdrawal amounts.

use alloy_primitives::{Address, address};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// Supported EVM-compatible chains.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Ethereum (chain id 1 on mainnet).
    Ethereum,
    /// Polygon PoS (chain id 137 on mainnet).
    Polygon,
    /// BNB Smart Chain (chain id 56 on mainnet).
    Bsc,
    /// Local development node.
    Localhost,
}

impl Chain {
    /// Return all known [`Chain`] variants.
    pub fn variants() -> &'static [Chain] {
        &[Chain::Ethereum, Chain::Polygon, Chain::Bsc, Chain::Localhost]
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Chain::Ethereum => write!(f, "ethereum"),
            Chain::Polygon => write!(f, "polygon"),
            Chain::Bsc => write!(f, "bsc"),
            Chain::Localhost => write!(f, "localhost"),
        }
    }
}

impl FromStr for Chain {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" => Ok(Chain::Ethereum),
            "polygon" => Ok(Chain::Polygon),
            "bsc" => Ok(Chain::Bsc),
            "localhost" => Ok(Chain::Localhost),
            other => Err(ChainParseError::UnknownChain(other.to_string())),
        }
    }
}

/// Network environment within a chain.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    Mainnet,
    /// Public test network (Sepolia, Amoy, BSC testnet).
    Testnet,
    /// Local development network.
    Localhost,
}

impl Network {
    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[Network::Mainnet, Network::Testnet, Network::Localhost]
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Localhost => write!(f, "localhost"),
        }
    }
}

impl FromStr for Network {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "localhost" => Ok(Network::Localhost),
            other => Err(ChainParseError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Error parsing a chain or network identifier.
#[derive(Debug, thiserror::Error)]
pub enum ChainParseError {
    /// The chain name is not one of the supported chains.
    #[error("unknown chain: {0}")]
    UnknownChain(String),
    /// The network name is not one of the supported networks.
    #[error("unknown network: {0}")]
    UnknownNetwork(String),
    /// A combined key was not in `chain:network` form.
    #[error("invalid chain key: {0}, expected chain:network")]
    InvalidKey(String),
}

/// A fully qualified deployment target, e.g. `polygon:mainnet`.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKey {
    pub chain: Chain,
    pub network: Network,
}

impl ChainKey {
    pub fn new(chain: Chain, network: Network) -> Self {
        Self { chain, network }
    }

    /// Return every (chain, network) combination this build knows about.
    ///
    /// Localhost chain only pairs with the localhost network.
    pub fn variants() -> Vec<ChainKey> {
        let mut keys = Vec::new();
        for chain in Chain::variants() {
            match chain {
                Chain::Localhost => keys.push(ChainKey::new(*chain, Network::Localhost)),
                _ => {
                    keys.push(ChainKey::new(*chain, Network::Mainnet));
                    keys.push(ChainKey::new(*chain, Network::Testnet));
                }
            }
        }
        keys
    }
}

impl Display for ChainKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chain, self.network)
    }
}

impl FromStr for ChainKey {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chain, network) = s
            .split_once(':')
            .ok_or_else(|| ChainParseError::InvalidKey(s.to_string()))?;
        Ok(ChainKey::new(chain.parse()?, network.parse()?))
    }
}

/// The canonical Multicall3 deployment, identical across supported chains.
pub const MULTICALL3_ADDRESS: Address = address!("0xcA11bde05977b3631167028862bE2a173976CA11");

/// Static operating parameters for a (chain, network) pair.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Numeric EIP-155 chain id.
    pub chain_id: u64,
    /// Confirmation depth above which a transaction is deemed final.
    pub required_confirmations: u64,
    /// Nominal block interval.
    pub block_time: Duration,
    /// Minimum age before a pending transaction can be considered stuck.
    pub stuck_min_age: Duration,
    /// Multicall aggregator contract address.
    pub aggregator: Address,
    /// Block gas limit used for batch splitting.
    pub block_gas_limit: u64,
    /// Chain-specific multiplier applied to per-call gas estimates.
    pub gas_adjustment: f64,
}

static CHAIN_PARAMS: Lazy<HashMap<ChainKey, ChainParams>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert(
        ChainKey::new(Chain::Ethereum, Network::Mainnet),
        ChainParams {
            chain_id: 1,
            required_confirmations: 12,
            block_time: Duration::from_secs(12),
            stuck_min_age: Duration::from_secs(30 * 60),
            aggregator: MULTICALL3_ADDRESS,
            block_gas_limit: 30_000_000,
            gas_adjustment: 1.0,
        },
    );
    table.insert(
        ChainKey::new(Chain::Ethereum, Network::Testnet),
        ChainParams {
            chain_id: 11_155_111,
            required_confirmations: 12,
            block_time: Duration::from_secs(12),
            stuck_min_age: Duration::from_secs(30 * 60),
            aggregator: MULTICALL3_ADDRESS,
            block_gas_limit: 30_000_000,
            gas_adjustment: 1.0,
        },
    );
    table.insert(
        ChainKey::new(Chain::Polygon, Network::Mainnet),
        ChainParams {
            chain_id: 137,
            required_confirmations: 30,
            block_time: Duration::from_secs(2),
            stuck_min_age: Duration::from_secs(15 * 60),
            aggregator: MULTICALL3_ADDRESS,
            block_gas_limit: 30_000_000,
            // Polygon per-call costs run below the generic heuristic.
            gas_adjustment: 0.85,
        },
    );
    table.insert(
        ChainKey::new(Chain::Polygon, Network::Testnet),
        ChainParams {
            chain_id: 80_002,
            required_confirmations: 30,
            block_time: Duration::from_secs(2),
            stuck_min_age: Duration::from_secs(15 * 60),
            aggregator: MULTICALL3_ADDRESS,
            block_gas_limit: 30_000_000,
            gas_adjustment: 0.85,
        },
    );
    table.insert(
        ChainKey::new(Chain::Bsc, Network::Mainnet),
        ChainParams {
            chain_id: 56,
            required_confirmations: 15,
            block_time: Duration::from_secs(3),
            stuck_min_age: Duration::from_secs(450),
            aggregator: MULTICALL3_ADDRESS,
            block_gas_limit: 140_000_000,
            gas_adjustment: 1.0,
        },
    );
    table.insert(
        ChainKey::new(Chain::Bsc, Network::Testnet),
        ChainParams {
            chain_id: 97,
            required_confirmations: 15,
            block_time: Duration::from_secs(3),
            stuck_min_age: Duration::from_secs(450),
            aggregator: MULTICALL3_ADDRESS,
            block_gas_limit: 140_000_000,
            gas_adjustment: 1.0,
        },
    );
    table.insert(
        ChainKey::new(Chain::Localhost, Network::Localhost),
        ChainParams {
            chain_id: 31_337,
            required_confirmations: 1,
            block_time: Duration::from_secs(1),
            stuck_min_age: Duration::from_secs(15 * 60),
            aggregator: MULTICALL3_ADDRESS,
            block_gas_limit: 30_000_000,
            gas_adjustment: 1.0,
        },
    );
    table
});

/// Return the static parameters for a (chain, network) pair, if supported.
pub fn chain_params<K: Borrow<ChainKey>>(key: K) -> Option<&'static ChainParams> {
    CHAIN_PARAMS.get(key.borrow())
}

/// A statically known ERC-20 deployment.
#[derive(Debug, Clone)]
pub struct TokenDeployment {
    /// Token symbol, for logs only.
    pub symbol: &'static str,
    /// Token contract address.
    pub address: Address,
    /// Number of decimal places (e.g. 6 for USDC on Ethereum).
    pub decimals: u8,
}

static TOKEN_DIRECTORY: Lazy<HashMap<ChainKey, Vec<TokenDeployment>>> = Lazy::new(|| {
    let mut table: HashMap<ChainKey, Vec<TokenDeployment>> = HashMap::new();
    table.insert(
        ChainKey::new(Chain::Ethereum, Network::Mainnet),
        vec![
            TokenDeployment {
                symbol: "USDC",
                address: address!("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
                decimals: 6,
            },
            TokenDeployment {
                symbol: "USDT",
                address: address!("0xdAC17F958D2ee523a2206206994597C13D831ec7"),
                decimals: 6,
            },
        ],
    );
    table.insert(
        ChainKey::new(Chain::Polygon, Network::Mainnet),
        vec![
            TokenDeployment {
                symbol: "USDC",
                address: address!("0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359"),
                decimals: 6,
            },
            TokenDeployment {
                symbol: "USDT",
                address: address!("0xc2132D05D31c914a87C6611C10748AEb04B58e8F"),
                decimals: 6,
            },
        ],
    );
    table.insert(
        ChainKey::new(Chain::Bsc, Network::Mainnet),
        vec![
            TokenDeployment {
                symbol: "USDC",
                address: address!("0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d"),
                decimals: 18,
            },
            TokenDeployment {
                symbol: "USDT",
                address: address!("0x55d398326f99059fF775485246999027B3197955"),
                decimals: 18,
            },
        ],
    );
    table
});

/// Look up a known token deployment by contract address.
///
/// Returns `None` for tokens outside the static directory; callers fall back
/// to treating amounts as base units.
pub fn known_token(key: &ChainKey, token: &Address) -> Option<&'static TokenDeployment> {
    TOKEN_DIRECTORY
        .get(key)
        .and_then(|tokens| tokens.iter().find(|t| t.address == *token))
}
