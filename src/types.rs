//! Domain entities and queue message bodies for the withdrawal pipeline.
//!
//! Entities mirror the persisted state layout: [`WithdrawalRequest`],
//! [`SignedTransaction`], [`BatchTransaction`], [`SentTransaction`]. Queue
//! messages ([`SignedTxMessage`], [`BroadcastResultMessage`]) are the JSON
//! bodies exchanged between the signing worker, broadcaster, and monitor.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::chain::{Chain, Network};

/// A millisecond-resolution Unix timestamp.
///
/// Serialized as a JSON number. Arithmetic helpers keep age computations out
/// of `SystemTime` plumbing at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnixMillis(pub u64);

impl UnixMillis {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Elapsed time since this timestamp, saturating at zero.
    pub fn elapsed(&self) -> Duration {
        let now = Self::now().0;
        Duration::from_millis(now.saturating_sub(self.0))
    }

    pub fn saturating_add(&self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }
}

impl Display for UnixMillis {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a withdrawal request.
///
/// Transitions follow `Pending → Validating → Signing → Signed →
/// Broadcasting → Confirming → Confirmed | Failed`. A request between
/// `Validating` and `Broadcasting` is owned by exactly one worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Validating,
    Signing,
    Signed,
    Broadcasting,
    Confirming,
    Confirmed,
    Failed,
}

impl RequestStatus {
    /// Whether the request has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Confirmed | RequestStatus::Failed)
    }
}

impl Display for RequestStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Validating => "VALIDATING",
            RequestStatus::Signing => "SIGNING",
            RequestStatus::Signed => "SIGNED",
            RequestStatus::Broadcasting => "BROADCASTING",
            RequestStatus::Confirming => "CONFIRMING",
            RequestStatus::Confirmed => "CONFIRMED",
            RequestStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Whether a request is signed on its own or as a multicall batch member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingMode {
    #[default]
    Single,
    Batch,
}

/// An asset-withdrawal request as submitted to the request queue and
/// persisted in the request store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    /// Unique request identity.
    pub request_id: String,
    /// Destination address, checksummed hex.
    pub to: String,
    /// Amount in base units or as a decimal token string.
    pub amount: String,
    /// Token contract address; `None` means the chain's native asset.
    #[serde(default)]
    pub token_address: Option<String>,
    pub chain: Chain,
    pub network: Network,
    #[serde(default = "default_status")]
    pub status: RequestStatus,
    #[serde(default)]
    pub try_count: u32,
    /// Instance id of the worker currently holding this request, if any.
    #[serde(default)]
    pub processing_instance_id: Option<String>,
    #[serde(default)]
    pub processing_mode: ProcessingMode,
    /// Batch this request belongs to while batched.
    #[serde(default)]
    pub batch_id: Option<String>,
    /// Human-readable failure reason for terminal failures.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default = "UnixMillis::now")]
    pub created_at: UnixMillis,
    #[serde(default = "UnixMillis::now")]
    pub updated_at: UnixMillis,
}

fn default_status() -> RequestStatus {
    RequestStatus::Pending
}

impl WithdrawalRequest {
    /// Construct a fresh pending request. Used by submitters and tests.
    pub fn new(
        request_id: impl Into<String>,
        to: impl Into<String>,
        amount: impl Into<String>,
        token_address: Option<String>,
        chain: Chain,
        network: Network,
    ) -> Self {
        let now = UnixMillis::now();
        Self {
            request_id: request_id.into(),
            to: to.into(),
            amount: amount.into(),
            token_address,
            chain,
            network,
            status: RequestStatus::Pending,
            try_count: 0,
            processing_instance_id: None,
            processing_mode: ProcessingMode::Single,
            batch_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Lowercase token fingerprint used to group transfers for batching.
    ///
    /// The native asset maps to the fixed fingerprint `"native"`.
    pub fn token_fingerprint(&self) -> String {
        self.token_address
            .as_deref()
            .map(|a| a.to_ascii_lowercase())
            .unwrap_or_else(|| "native".to_string())
    }
}

/// Lifecycle of a batch transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Signed,
    Broadcasted,
    Confirmed,
    Failed,
}

/// A multi-transfer batch aggregated into one multicall transaction.
///
/// While the batch is `Pending..Broadcasted` every member request carries
/// this batch's id. On `Failed` the batch dissolves: members revert to
/// `Pending` with `batch_id` cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTransaction {
    pub batch_id: String,
    /// Aggregator contract the batch call targets.
    pub aggregator: Address,
    /// Member request ids, at least one.
    pub member_request_ids: Vec<String>,
    /// Sum of member amounts in base units.
    pub total_amount: U256,
    /// Lowercase token fingerprint shared by every member.
    pub token_fingerprint: String,
    pub chain: Chain,
    pub network: Network,
    pub status: BatchStatus,
    #[serde(default)]
    pub tx_hash: Option<B256>,
    pub created_at: UnixMillis,
}

/// A signed raw transaction, immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub tx_hash: B256,
    /// Exactly one of `request_id` / `batch_id` is set.
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub chain_id: u64,
    #[serde(with = "hex_bytes")]
    pub raw_transaction: Vec<u8>,
    pub created_at: UnixMillis,
}

/// Record of a broadcast attempt, persisted by the broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentTransaction {
    pub tx_hash: B256,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub chain: Chain,
    pub network: Network,
    pub nonce: u64,
    pub max_fee_per_gas: u128,
    pub sent_at: UnixMillis,
    #[serde(default)]
    pub block_number: Option<u64>,
}

/// Discriminates single-request transactions from batch transactions on the
/// signed-tx queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignedTxKind {
    Single,
    Batch,
}

/// Body of a message on the signed-tx queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTxMessage {
    pub kind: SignedTxKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub tx_hash: B256,
    #[serde(with = "hex_bytes")]
    pub raw_transaction: Vec<u8>,
    pub nonce: u64,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub chain: Chain,
    pub chain_id: u64,
    pub network: Network,
    /// Request ids settled by this transaction: the single request, or every
    /// batch member.
    pub affected_request_ids: Vec<String>,
}

/// Transaction type tag on broadcast results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Single,
    Batch,
}

/// Outcome status on broadcast results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastStatus {
    Broadcasted,
    Failed,
}

/// Body of a message on the broadcast-tx queue, emitted by the broadcaster
/// and consumed by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResultMessage {
    /// Unique id of this broadcast attempt.
    pub id: String,
    pub transaction_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Hash as computed at signing time.
    pub original_transaction_hash: B256,
    /// Hash returned by the node, when the broadcast succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_transaction_hash: Option<B256>,
    pub status: BroadcastStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcasted_at: Option<UnixMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    pub chain: Chain,
    pub network: Network,
    pub nonce: u64,
    pub max_fee_per_gas: u128,
    pub metadata: BroadcastMetadata,
}

/// Auxiliary broadcast-result fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMetadata {
    /// Request ids affected by this transaction (all batch members).
    #[serde(default)]
    pub affected_requests: Vec<String>,
}

/// Serialize `Vec<u8>` as 0x-prefixed hex.
mod hex_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let stripped = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(stripped).map_err(serde::de::Error::custom)
    }
}
