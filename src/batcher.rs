//! Multicall batcher: groups token transfers into aggregate calls.
//!
//! Each member call encodes the standard ERC-20
//! `transferFrom(sender, recipient, amount)`; the batch itself is a
//! Multicall3 `aggregate3([{target, allowFailure, callData}])` call against
//! the chain's aggregator deployment. The batcher validates inputs,
//! normalizes amounts to base units via the token directory, estimates gas
//! (node estimate with a safety multiplier, falling back to a diminishing
//! per-call heuristic, preferring learned per-token observations), and
//! splits transfer sets into groups that fit the block gas limit.

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{SolCall, sol};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;

use crate::chain::{ChainKey, known_token};
use crate::registry::ChainSettings;
use crate::rpc::{EvmRpc, GasEstimateRequest};

sol! {
    /// Minimal ERC-20 surface used by the pipeline.
    interface IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function transferFrom(address from, address to, uint256 amount) external returns (bool);
    }

    /// Multicall3 aggregate interface.
    interface IMulticall3 {
        struct Call3 {
            address target;
            bool allowFailure;
            bytes callData;
        }

        struct Result {
            bool success;
            bytes returnData;
        }

        function aggregate3(Call3[] calldata calls) external payable returns (Result[] memory returnData);
    }
}

/// A transfer as it enters the batcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub transaction_id: String,
    pub token: Address,
    pub to: Address,
    /// Base-units integer string or decimal token string.
    pub amount: String,
}

/// A validated transfer with its amount in base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTransfer {
    pub transaction_id: String,
    pub token: Address,
    pub to: Address,
    pub amount: U256,
}

/// Decoded outcome of one call within an `aggregate3` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub success: bool,
    pub return_data: Vec<u8>,
}

/// Errors produced by batch validation and encoding.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("duplicate transaction id: {0}")]
    DuplicateTransactionId(String),
    #[error("amount is not a positive number: {0}")]
    InvalidAmount(String),
    /// A decimal token string needs the token's decimals, which the
    /// directory does not know.
    #[error("unknown decimals for token {0}")]
    UnknownTokenDecimals(Address),
    #[error("amount {amount} has more than {decimals} decimal places")]
    ExcessPrecision { amount: String, decimals: u8 },
    #[error("failed to decode aggregate result: {0}")]
    Decode(#[from] alloy_sol_types::Error),
}

/// Gas-model tuning for batch estimation and splitting.
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    /// Fixed batch overhead in the heuristic fallback.
    pub gas_overhead: u64,
    /// Per-call gas in the heuristic fallback, before diminishing.
    pub gas_per_call: u64,
    /// Safety multiplier applied to node estimates.
    pub estimate_multiplier: f64,
    /// Fraction of the block gas limit a batch may occupy.
    pub block_gas_margin: f64,
    /// Clamp for any single per-call estimate.
    pub per_call_cap: u64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            gas_overhead: 150_000,
            gas_per_call: 60_000,
            estimate_multiplier: 1.15,
            block_gas_margin: 0.75,
            per_call_cap: 300_000,
        }
    }
}

/// The multicall batcher. Learned per-token gas observations survive across
/// batches for the lifetime of the process.
pub struct MulticallBatcher {
    config: BatcherConfig,
    /// (chain key, token) → observed per-call gas from prior successful
    /// estimations.
    observations: DashMap<(ChainKey, Address), u64>,
}

impl MulticallBatcher {
    pub fn new(config: BatcherConfig) -> Self {
        Self {
            config,
            observations: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Reject duplicate transaction ids and non-positive amounts.
    ///
    /// Address well-formedness is enforced by the typed [`Address`] fields
    /// at parse time, before transfers reach the batcher.
    pub fn validate(&self, transfers: &[TransferRequest]) -> Result<(), BatchError> {
        let mut seen = HashSet::with_capacity(transfers.len());
        for transfer in transfers {
            if !seen.insert(transfer.transaction_id.as_str()) {
                return Err(BatchError::DuplicateTransactionId(
                    transfer.transaction_id.clone(),
                ));
            }
            normalize_probe(&transfer.amount)?;
        }
        Ok(())
    }

    /// Resolve a raw amount string into base units.
    ///
    /// A string containing a decimal point is a token amount scaled by the
    /// directory decimals; anything else is already base units.
    pub fn normalize_amount(
        &self,
        key: &ChainKey,
        token: &Address,
        raw: &str,
    ) -> Result<U256, BatchError> {
        if raw.contains('.') {
            let deployment =
                known_token(key, token).ok_or(BatchError::UnknownTokenDecimals(*token))?;
            scale_decimal(raw, deployment.decimals)
        } else {
            let value =
                U256::from_str(raw).map_err(|_| BatchError::InvalidAmount(raw.to_string()))?;
            if value.is_zero() {
                return Err(BatchError::InvalidAmount(raw.to_string()));
            }
            Ok(value)
        }
    }

    /// Encode the member calls: one `transferFrom(executor, to, amount)` per
    /// transfer, targeting each transfer's token contract.
    pub fn encode_calls(
        &self,
        executor: Address,
        transfers: &[NormalizedTransfer],
        allow_failure: bool,
    ) -> Vec<IMulticall3::Call3> {
        transfers
            .iter()
            .map(|transfer| {
                let call = IERC20::transferFromCall {
                    from: executor,
                    to: transfer.to,
                    amount: transfer.amount,
                };
                IMulticall3::Call3 {
                    target: transfer.token,
                    allowFailure: allow_failure,
                    callData: Bytes::from(call.abi_encode()),
                }
            })
            .collect()
    }

    /// Encode the outer `aggregate3` call. An empty call list yields the
    /// encoding of an empty array.
    pub fn encode_aggregate(&self, calls: Vec<IMulticall3::Call3>) -> Vec<u8> {
        IMulticall3::aggregate3Call { calls }.abi_encode()
    }

    /// Decode an `aggregate3` calldata blob back into its calls.
    pub fn decode_aggregate(&self, data: &[u8]) -> Result<Vec<IMulticall3::Call3>, BatchError> {
        let call = IMulticall3::aggregate3Call::abi_decode(data)?;
        Ok(call.calls)
    }

    /// Decode an `aggregate3` return blob into per-call outcomes, in call
    /// order.
    pub fn decode_aggregate_output(&self, data: &[u8]) -> Result<Vec<CallOutcome>, BatchError> {
        let results = IMulticall3::aggregate3Call::abi_decode_returns(data)?;
        Ok(results
            .into_iter()
            .map(|r| CallOutcome {
                success: r.success,
                return_data: r.returnData.to_vec(),
            })
            .collect())
    }

    /// Estimate gas for an aggregate call over `transfers`.
    ///
    /// Prefers the node estimate with the safety multiplier. On estimation
    /// failure, falls back to `overhead + perCall × n × diminishing(n)`,
    /// substituting a learned per-token observation where one exists. The
    /// result is adjusted by the chain factor and clamped per call.
    pub async fn estimate_batch_gas(
        &self,
        rpc: &dyn EvmRpc,
        settings: &ChainSettings,
        executor: Address,
        transfers: &[NormalizedTransfer],
        allow_failure: bool,
    ) -> u64 {
        let n = transfers.len() as u64;
        if n == 0 {
            return 0;
        }
        let calls = self.encode_calls(executor, transfers, allow_failure);
        let data = self.encode_aggregate(calls);
        let request = GasEstimateRequest {
            from: executor,
            to: settings.aggregator,
            value: U256::ZERO,
            data,
        };
        match rpc.estimate_gas(&request).await {
            Ok(estimate) => {
                let padded = ((estimate as f64) * self.config.estimate_multiplier).ceil() as u64;
                self.record_observation(settings.key, transfers, padded);
                padded
            }
            Err(err) => {
                tracing::debug!(key = %settings.key, %err, "gas estimation failed, using heuristic");
                self.heuristic_batch_gas(settings, transfers)
            }
        }
    }

    /// The heuristic fallback, exposed for splitting decisions.
    pub fn heuristic_batch_gas(
        &self,
        settings: &ChainSettings,
        transfers: &[NormalizedTransfer],
    ) -> u64 {
        let n = transfers.len() as u64;
        if n == 0 {
            return 0;
        }
        let per_call: u64 = transfers
            .iter()
            .map(|t| self.per_call_gas(settings, &t.token))
            .sum::<u64>()
            / n;
        let scaled = (per_call as f64) * (n as f64) * diminishing_factor(n);
        self.config.gas_overhead + scaled.ceil() as u64
    }

    /// Per-call gas for one token: learned observation if present, else the
    /// static heuristic, chain-adjusted and clamped.
    pub fn per_call_gas(&self, settings: &ChainSettings, token: &Address) -> u64 {
        let base = self
            .observations
            .get(&(settings.key, *token))
            .map(|o| *o.value())
            .unwrap_or(self.config.gas_per_call);
        let adjusted = ((base as f64) * settings.gas_adjustment).ceil() as u64;
        adjusted.min(self.config.per_call_cap)
    }

    fn record_observation(&self, key: ChainKey, transfers: &[NormalizedTransfer], total: u64) {
        let n = transfers.len() as u64;
        if n == 0 || total <= self.config.gas_overhead {
            return;
        }
        let per_call = (total - self.config.gas_overhead) / n;
        for transfer in transfers {
            self.observations.insert((key, transfer.token), per_call);
        }
    }

    /// Split transfers into batch groups that each fit within the safety
    /// margin of the block gas limit, preserving per-token grouping.
    pub fn split(
        &self,
        settings: &ChainSettings,
        transfers: Vec<NormalizedTransfer>,
    ) -> Vec<Vec<NormalizedTransfer>> {
        if transfers.is_empty() {
            return Vec::new();
        }
        let budget = (settings.block_gas_limit as f64 * self.config.block_gas_margin) as u64;
        let mut groups: Vec<Vec<NormalizedTransfer>> = Vec::new();
        // Stable grouping by token before chunking.
        let mut by_token: Vec<(Address, Vec<NormalizedTransfer>)> = Vec::new();
        for transfer in transfers {
            match by_token.iter_mut().find(|(token, _)| *token == transfer.token) {
                Some((_, group)) => group.push(transfer),
                None => by_token.push((transfer.token, vec![transfer])),
            }
        }
        for (token, group) in by_token {
            let per_call = self.per_call_gas(settings, &token).max(1);
            let capacity = (budget.saturating_sub(self.config.gas_overhead) / per_call).max(1);
            for chunk in group.chunks(capacity as usize) {
                groups.push(chunk.to_vec());
            }
        }
        groups
    }
}

/// Monotone non-increasing factor ≤ 1: per-call cost drops as the batch
/// grows, floored at 0.6.
pub fn diminishing_factor(n: u64) -> f64 {
    if n <= 1 {
        return 1.0;
    }
    (1.0 - 0.03 * ((n - 1) as f64)).max(0.6)
}

/// Cheap validation probe: positive base units or a positive decimal string.
fn normalize_probe(raw: &str) -> Result<(), BatchError> {
    if raw.contains('.') {
        let decimal =
            Decimal::from_str(raw).map_err(|_| BatchError::InvalidAmount(raw.to_string()))?;
        if decimal <= Decimal::ZERO {
            return Err(BatchError::InvalidAmount(raw.to_string()));
        }
        Ok(())
    } else {
        let value = U256::from_str(raw).map_err(|_| BatchError::InvalidAmount(raw.to_string()))?;
        if value.is_zero() {
            return Err(BatchError::InvalidAmount(raw.to_string()));
        }
        Ok(())
    }
}

/// Scale a decimal token string to base units.
fn scale_decimal(raw: &str, decimals: u8) -> Result<U256, BatchError> {
    let decimal = Decimal::from_str(raw).map_err(|_| BatchError::InvalidAmount(raw.to_string()))?;
    if decimal <= Decimal::ZERO {
        return Err(BatchError::InvalidAmount(raw.to_string()));
    }
    let scale = decimal.scale();
    if scale > decimals as u32 {
        return Err(BatchError::ExcessPrecision {
            amount: raw.to_string(),
            decimals,
        });
    }
    let mantissa = decimal.mantissa();
    if mantissa < 0 {
        return Err(BatchError::InvalidAmount(raw.to_string()));
    }
    let multiplier = U256::from(10u64).pow(U256::from(decimals as u32 - scale));
    Ok(U256::from(mantissa as u128) * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Chain, Network, chain_params};
    use alloy_primitives::address;

    fn settings() -> ChainSettings {
        let key = ChainKey::new(Chain::Polygon, Network::Mainnet);
        let params = chain_params(key).unwrap();
        ChainSettings {
            key,
            chain_id: params.chain_id,
            required_confirmations: params.required_confirmations,
            block_time: params.block_time,
            stuck_min_age: params.stuck_min_age,
            aggregator: params.aggregator,
            block_gas_limit: params.block_gas_limit,
            gas_adjustment: params.gas_adjustment,
        }
    }

    fn batcher() -> MulticallBatcher {
        MulticallBatcher::new(BatcherConfig::default())
    }

    fn usdt() -> Address {
        address!("0xc2132D05D31c914a87C6611C10748AEb04B58e8F")
    }

    fn transfer(id: &str, amount: u64) -> NormalizedTransfer {
        NormalizedTransfer {
            transaction_id: id.to_string(),
            token: usdt(),
            to: Address::repeat_byte(0x42),
            amount: U256::from(amount),
        }
    }

    #[test]
    fn validation_rejects_duplicates_and_bad_amounts() {
        let batcher = batcher();
        let duplicate = vec![
            TransferRequest {
                transaction_id: "t1".into(),
                token: usdt(),
                to: Address::repeat_byte(1),
                amount: "100".into(),
            },
            TransferRequest {
                transaction_id: "t1".into(),
                token: usdt(),
                to: Address::repeat_byte(2),
                amount: "200".into(),
            },
        ];
        assert!(matches!(
            batcher.validate(&duplicate),
            Err(BatchError::DuplicateTransactionId(_))
        ));

        for bad in ["0", "-5", "abc", "1.2.3", "0.0"] {
            let transfers = vec![TransferRequest {
                transaction_id: "t1".into(),
                token: usdt(),
                to: Address::repeat_byte(1),
                amount: bad.into(),
            }];
            assert!(batcher.validate(&transfers).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn normalization_detects_base_units_and_decimal_strings() {
        let batcher = batcher();
        let key = ChainKey::new(Chain::Polygon, Network::Mainnet);
        // Integer strings are base units as-is.
        assert_eq!(
            batcher.normalize_amount(&key, &usdt(), "1000000").unwrap(),
            U256::from(1_000_000u64)
        );
        // Decimal strings scale by directory decimals (USDT on polygon: 6).
        assert_eq!(
            batcher.normalize_amount(&key, &usdt(), "1.5").unwrap(),
            U256::from(1_500_000u64)
        );
        assert!(matches!(
            batcher.normalize_amount(&key, &usdt(), "1.1234567"),
            Err(BatchError::ExcessPrecision { .. })
        ));
        // Decimal string for an unknown token cannot be scaled.
        let unknown = Address::repeat_byte(0x99);
        assert!(matches!(
            batcher.normalize_amount(&key, &unknown, "1.5"),
            Err(BatchError::UnknownTokenDecimals(_))
        ));
        // Base units for an unknown token are fine.
        assert!(batcher.normalize_amount(&key, &unknown, "1500000").is_ok());
    }

    #[test]
    fn aggregate_decode_is_left_inverse_of_encode() {
        let batcher = batcher();
        let executor = Address::repeat_byte(0xaa);
        for n in [0usize, 1, 2, 17] {
            let transfers: Vec<NormalizedTransfer> = (0..n)
                .map(|i| transfer(&format!("t{i}"), 1000 + i as u64))
                .collect();
            let calls = batcher.encode_calls(executor, &transfers, true);
            let encoded = batcher.encode_aggregate(calls.clone());
            let decoded = batcher.decode_aggregate(&encoded).unwrap();
            assert_eq!(decoded.len(), n);
            for (original, roundtripped) in calls.iter().zip(decoded.iter()) {
                assert_eq!(original.target, roundtripped.target);
                assert_eq!(original.allowFailure, roundtripped.allowFailure);
                assert_eq!(original.callData, roundtripped.callData);
            }
        }
    }

    #[test]
    fn aggregate_output_decodes_in_call_order() {
        use alloy_sol_types::SolValue;
        let batcher = batcher();
        let results = vec![
            IMulticall3::Result {
                success: true,
                returnData: Bytes::from(vec![0x01]),
            },
            IMulticall3::Result {
                success: false,
                returnData: Bytes::new(),
            },
        ];
        let encoded = results.abi_encode();
        let outcomes = batcher.decode_aggregate_output(&encoded).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].return_data, vec![0x01]);
        assert!(!outcomes[1].success);
    }

    #[test]
    fn diminishing_factor_is_monotone_and_bounded() {
        let mut previous = diminishing_factor(1);
        assert_eq!(previous, 1.0);
        for n in 2..200 {
            let factor = diminishing_factor(n);
            assert!(factor <= previous);
            assert!(factor >= 0.6);
            previous = factor;
        }
    }

    #[tokio::test]
    async fn estimation_pads_node_estimate_and_learns() {
        use crate::rpc::testing::MockRpc;
        let batcher = batcher();
        let settings = settings();
        let rpc = MockRpc::new();
        rpc.set_gas_estimate(Ok(400_000));
        let transfers: Vec<NormalizedTransfer> =
            (0..4).map(|i| transfer(&format!("t{i}"), 100)).collect();
        let estimate = batcher
            .estimate_batch_gas(&rpc, &settings, Address::repeat_byte(0xaa), &transfers, true)
            .await;
        assert_eq!(estimate, 460_000);
        // Learned observation: (460000 - 150000) / 4 = 77500, chain-adjusted.
        let per_call = batcher.per_call_gas(&settings, &usdt());
        assert_eq!(per_call, ((77_500f64) * 0.85).ceil() as u64);
    }

    #[tokio::test]
    async fn estimation_falls_back_to_heuristic() {
        use crate::rpc::testing::MockRpc;
        let batcher = batcher();
        let settings = settings();
        let rpc = MockRpc::new();
        rpc.set_gas_estimate(Err("execution reverted"));
        let transfers: Vec<NormalizedTransfer> =
            (0..5).map(|i| transfer(&format!("t{i}"), 100)).collect();
        let estimate = batcher
            .estimate_batch_gas(&rpc, &settings, Address::repeat_byte(0xaa), &transfers, true)
            .await;
        let per_call = ((60_000f64) * 0.85).ceil() as u64;
        let expected =
            150_000 + ((per_call as f64) * 5.0 * diminishing_factor(5)).ceil() as u64;
        assert_eq!(estimate, expected);
    }

    #[test]
    fn split_respects_gas_budget_and_token_grouping() {
        let mut config = BatcherConfig::default();
        config.gas_per_call = 1_000_000;
        config.per_call_cap = 2_000_000;
        let batcher = MulticallBatcher::new(config);
        let mut settings = settings();
        settings.block_gas_limit = 10_000_000;
        settings.gas_adjustment = 1.0;
        // Budget 7.5M - 150k overhead over 1M per call → 7 per group.
        let other_token = Address::repeat_byte(0x77);
        let mut transfers: Vec<NormalizedTransfer> =
            (0..10).map(|i| transfer(&format!("a{i}"), 100)).collect();
        transfers.push(NormalizedTransfer {
            transaction_id: "b0".into(),
            token: other_token,
            to: Address::repeat_byte(0x42),
            amount: U256::from(1u64),
        });
        let groups = batcher.split(&settings, transfers);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 7);
        assert_eq!(groups[1].len(), 3);
        assert_eq!(groups[2].len(), 1);
        for group in &groups {
            let token = group[0].token;
            assert!(group.iter().all(|t| t.token == token));
        }
    }

    #[test]
    fn empty_input_yields_empty_encoding() {
        let batcher = batcher();
        assert!(batcher.split(&settings(), Vec::new()).is_empty());
        let encoded = batcher.encode_aggregate(Vec::new());
        let decoded = batcher.decode_aggregate(&encoded).unwrap();
        assert!(decoded.is_empty());
    }
}
