//! The EVM JSON-RPC boundary.
//!
//! Every component reaches the chain through the [`EvmRpc`] trait, which
//! mirrors the node surface the pipeline consumes: transaction and receipt
//! lookup, head block number, block transaction listings, fee data, gas
//! estimation, raw broadcast, and a block-header subscription. The production
//! implementation [`AlloyRpc`] wraps an alloy provider; tests substitute
//! in-memory fakes.
//!
//! All calls are wrapped in a per-call timeout; an exceeded timeout surfaces
//! as a transient error.

use alloy_network::Ethereum;
use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy_rpc_types_eth::{BlockNumberOrTag, TransactionInput, TransactionRequest};
use alloy_consensus::Transaction as _;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::future::IntoFuture;
use std::time::Duration;
use url::Url;

/// Fee quote for building an EIP-1559 transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeData {
    /// Legacy gas price, for comparison against original fees.
    pub gas_price: u128,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl FeeData {
    /// Apply a multiplicative headroom factor to the EIP-1559 fields.
    pub fn with_headroom(&self, factor: f64) -> FeeData {
        let bump = |v: u128| -> u128 { ((v as f64) * factor).ceil() as u128 };
        FeeData {
            gas_price: self.gas_price,
            max_fee_per_gas: bump(self.max_fee_per_gas),
            max_priority_fee_per_gas: bump(self.max_priority_fee_per_gas),
        }
    }
}

/// Minimal view of a mempool or mined transaction.
#[derive(Debug, Clone, Copy)]
pub struct RpcTransaction {
    pub hash: B256,
    /// Set once the transaction is included in a block.
    pub block_number: Option<u64>,
    pub nonce: u64,
}

/// Minimal view of a transaction receipt.
#[derive(Debug, Clone, Copy)]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    /// `true` for an on-chain success, `false` for a revert.
    pub status: bool,
    pub gas_used: u64,
}

/// A new block header observed on the subscription channel.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
}

/// Stream of block headers from a WebSocket subscription.
pub type BlockStream = BoxStream<'static, BlockHeader>;

/// Parameters for a gas estimation call.
#[derive(Debug, Clone)]
pub struct GasEstimateRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

/// Errors surfaced by the RPC boundary.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Transport-level failure: connection refused, reset, DNS.
    #[error("transport error: {0}")]
    Transport(String),
    /// The per-call timeout elapsed.
    #[error("rpc call timed out after {0:?}")]
    Timeout(Duration),
    /// The node answered with a JSON-RPC error.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// The endpoint has no WebSocket URL configured.
    #[error("no websocket endpoint configured")]
    NoWebsocket,
}

impl RpcError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport(_) | RpcError::Timeout(_) => true,
            // Server-side errors are retryable; protocol rejections are not.
            RpcError::Rpc { code, .. } => *code == -32000 || *code <= -32603,
            RpcError::NoWebsocket => false,
        }
    }
}

/// The node surface consumed by the pipeline.
#[async_trait]
pub trait EvmRpc: Send + Sync {
    async fn get_transaction(&self, hash: B256) -> Result<Option<RpcTransaction>, RpcError>;
    async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<RpcReceipt>, RpcError>;
    async fn get_block_number(&self) -> Result<u64, RpcError>;
    /// Transaction hashes of the given block, or `None` if the block is
    /// unknown to the node.
    async fn get_block_tx_hashes(&self, number: u64) -> Result<Option<Vec<B256>>, RpcError>;
    async fn get_fee_data(&self) -> Result<FeeData, RpcError>;
    async fn estimate_gas(&self, request: &GasEstimateRequest) -> Result<u64, RpcError>;
    /// Confirmed-plus-pending transaction count, used to seed the nonce cache.
    async fn get_transaction_count(&self, address: Address) -> Result<u64, RpcError>;
    /// Submit a signed raw transaction, returning the hash the node computed.
    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError>;
    /// Open a block-header subscription over the WebSocket endpoint.
    async fn subscribe_blocks(&self) -> Result<BlockStream, RpcError>;
}

/// Production [`EvmRpc`] backed by alloy HTTP and WebSocket providers.
pub struct AlloyRpc {
    http: DynProvider<Ethereum>,
    ws_url: Option<Url>,
    call_timeout: Duration,
}

impl AlloyRpc {
    /// Connect an HTTP provider; the WebSocket connection is established
    /// lazily per subscription.
    pub fn new(rpc_url: Url, ws_url: Option<Url>, call_timeout: Duration) -> Self {
        let http = ProviderBuilder::new().connect_http(rpc_url).erased();
        Self {
            http,
            ws_url,
            call_timeout,
        }
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, RpcError>
    where
        F: IntoFuture<Output = Result<T, alloy_transport::TransportError>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(map_transport_error),
            Err(_) => Err(RpcError::Timeout(self.call_timeout)),
        }
    }
}

fn map_transport_error(err: alloy_transport::TransportError) -> RpcError {
    match err {
        alloy_transport::RpcError::ErrorResp(payload) => RpcError::Rpc {
            code: payload.code,
            message: payload.message.to_string(),
        },
        other => RpcError::Transport(other.to_string()),
    }
}

#[async_trait]
impl EvmRpc for AlloyRpc {
    async fn get_transaction(&self, hash: B256) -> Result<Option<RpcTransaction>, RpcError> {
        let tx = self.timed(self.http.get_transaction_by_hash(hash)).await?;
        Ok(tx.map(|tx| RpcTransaction {
            hash,
            block_number: tx.block_number,
            nonce: tx.inner.nonce(),
        }))
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<RpcReceipt>, RpcError> {
        let receipt = self.timed(self.http.get_transaction_receipt(hash)).await?;
        Ok(receipt.map(|r| RpcReceipt {
            transaction_hash: r.transaction_hash,
            block_number: r.block_number.unwrap_or_default(),
            status: r.status(),
            gas_used: r.gas_used,
        }))
    }

    async fn get_block_number(&self) -> Result<u64, RpcError> {
        self.timed(self.http.get_block_number()).await
    }

    async fn get_block_tx_hashes(&self, number: u64) -> Result<Option<Vec<B256>>, RpcError> {
        let block = self
            .timed(self.http.get_block_by_number(BlockNumberOrTag::Number(number)))
            .await?;
        Ok(block.map(|b| b.transactions.hashes().collect()))
    }

    async fn get_fee_data(&self) -> Result<FeeData, RpcError> {
        let gas_price = self.timed(self.http.get_gas_price()).await?;
        let eip1559 = self.timed(self.http.estimate_eip1559_fees()).await?;
        Ok(FeeData {
            gas_price,
            max_fee_per_gas: eip1559.max_fee_per_gas,
            max_priority_fee_per_gas: eip1559.max_priority_fee_per_gas,
        })
    }

    async fn estimate_gas(&self, request: &GasEstimateRequest) -> Result<u64, RpcError> {
        let tx = TransactionRequest {
            from: Some(request.from),
            to: Some(TxKind::Call(request.to)),
            value: Some(request.value),
            input: TransactionInput::new(Bytes::from(request.data.clone())),
            ..Default::default()
        };
        self.timed(self.http.estimate_gas(tx)).await
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        self.timed(self.http.get_transaction_count(address).pending())
            .await
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError> {
        let pending = self
            .timed(self.http.send_raw_transaction(raw))
            .await?;
        Ok(*pending.tx_hash())
    }

    async fn subscribe_blocks(&self) -> Result<BlockStream, RpcError> {
        let ws_url = self.ws_url.clone().ok_or(RpcError::NoWebsocket)?;
        let ws = ProviderBuilder::new()
            .connect_ws(WsConnect::new(ws_url.as_str()))
            .await
            .map_err(map_transport_error)?;
        let subscription = ws.subscribe_blocks().await.map_err(map_transport_error)?;
        // The provider must outlive the stream, so move it into the closure.
        let stream = subscription
            .into_stream()
            .map(move |header| {
                let _keepalive = &ws;
                BlockHeader {
                    number: header.number,
                    hash: header.hash,
                }
            })
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory [`EvmRpc`] used by unit tests across the crate.

    use super::*;
    use alloy_primitives::keccak256;
    use dashmap::DashMap;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    pub(crate) struct MockRpc {
        head: AtomicU64,
        counts: DashMap<Address, u64>,
        count_calls: AtomicUsize,
        receipts: DashMap<B256, RpcReceipt>,
        transactions: DashMap<B256, RpcTransaction>,
        blocks: DashMap<u64, Vec<B256>>,
        fee: StdMutex<FeeData>,
        gas_estimate: StdMutex<Result<u64, String>>,
        sent: StdMutex<Vec<Vec<u8>>>,
        send_results: StdMutex<VecDeque<Result<B256, RpcError>>>,
        block_feeds: StdMutex<VecDeque<tokio::sync::mpsc::UnboundedReceiver<BlockHeader>>>,
        subscribe_calls: AtomicUsize,
        receipt_errors: AtomicUsize,
    }

    impl MockRpc {
        pub(crate) fn new() -> Self {
            Self {
                head: AtomicU64::new(0),
                counts: DashMap::new(),
                count_calls: AtomicUsize::new(0),
                receipts: DashMap::new(),
                transactions: DashMap::new(),
                blocks: DashMap::new(),
                fee: StdMutex::new(FeeData {
                    gas_price: 30_000_000_000,
                    max_fee_per_gas: 30_000_000_000,
                    max_priority_fee_per_gas: 1_500_000_000,
                }),
                gas_estimate: StdMutex::new(Ok(60_000)),
                sent: StdMutex::new(Vec::new()),
                send_results: StdMutex::new(VecDeque::new()),
                block_feeds: StdMutex::new(VecDeque::new()),
                subscribe_calls: AtomicUsize::new(0),
                receipt_errors: AtomicUsize::new(0),
            }
        }

        /// Make the next `n` receipt lookups fail with a transport error.
        pub(crate) fn fail_receipts(&self, n: usize) {
            self.receipt_errors.store(n, Ordering::SeqCst);
        }

        pub(crate) fn set_head(&self, number: u64) {
            self.head.store(number, Ordering::SeqCst);
        }

        pub(crate) fn set_transaction_count(&self, address: Address, count: u64) {
            self.counts.insert(address, count);
        }

        pub(crate) fn transaction_count_calls(&self) -> usize {
            self.count_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn set_receipt(&self, receipt: RpcReceipt) {
            self.receipts.insert(receipt.transaction_hash, receipt);
        }

        pub(crate) fn clear_receipt(&self, hash: B256) {
            self.receipts.remove(&hash);
        }

        pub(crate) fn set_transaction(&self, tx: RpcTransaction) {
            self.transactions.insert(tx.hash, tx);
        }

        /// Record a mined block and advance the head to it.
        pub(crate) fn push_block(&self, number: u64, hashes: Vec<B256>) {
            self.blocks.insert(number, hashes);
            self.head.fetch_max(number, Ordering::SeqCst);
        }

        pub(crate) fn set_fee(&self, fee: FeeData) {
            *self.fee.lock().unwrap() = fee;
        }

        pub(crate) fn set_gas_estimate(&self, estimate: Result<u64, &str>) {
            *self.gas_estimate.lock().unwrap() = estimate.map_err(str::to_string);
        }

        /// Script the outcome of the next `send_raw_transaction` call. With
        /// no scripted outcome, sends succeed with `keccak256(raw)`.
        pub(crate) fn queue_send_result(&self, result: Result<B256, RpcError>) {
            self.send_results.lock().unwrap().push_back(result);
        }

        pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        /// Provide the receiver backing the next `subscribe_blocks` call.
        pub(crate) fn push_block_feed(
            &self,
            feed: tokio::sync::mpsc::UnboundedReceiver<BlockHeader>,
        ) {
            self.block_feeds.lock().unwrap().push_back(feed);
        }

        pub(crate) fn subscribe_calls(&self) -> usize {
            self.subscribe_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EvmRpc for MockRpc {
        async fn get_transaction(&self, hash: B256) -> Result<Option<RpcTransaction>, RpcError> {
            Ok(self.transactions.get(&hash).map(|t| *t.value()))
        }

        async fn get_transaction_receipt(
            &self,
            hash: B256,
        ) -> Result<Option<RpcReceipt>, RpcError> {
            let remaining = self.receipt_errors.load(Ordering::SeqCst);
            if remaining > 0 {
                self.receipt_errors.store(remaining - 1, Ordering::SeqCst);
                return Err(RpcError::Transport("connection reset".into()));
            }
            Ok(self.receipts.get(&hash).map(|r| *r.value()))
        }

        async fn get_block_number(&self) -> Result<u64, RpcError> {
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn get_block_tx_hashes(&self, number: u64) -> Result<Option<Vec<B256>>, RpcError> {
            Ok(self.blocks.get(&number).map(|b| b.value().clone()))
        }

        async fn get_fee_data(&self) -> Result<FeeData, RpcError> {
            Ok(*self.fee.lock().unwrap())
        }

        async fn estimate_gas(&self, _request: &GasEstimateRequest) -> Result<u64, RpcError> {
            self.gas_estimate
                .lock()
                .unwrap()
                .clone()
                .map_err(|message| RpcError::Rpc {
                    code: -32000,
                    message,
                })
        }

        async fn get_transaction_count(&self, address: Address) -> Result<u64, RpcError> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.counts.get(&address).map(|c| *c.value()).unwrap_or(0))
        }

        async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, RpcError> {
            let scripted = self.send_results.lock().unwrap().pop_front();
            if let Some(result) = scripted {
                if result.is_ok() {
                    self.sent.lock().unwrap().push(raw.to_vec());
                }
                return result;
            }
            self.sent.lock().unwrap().push(raw.to_vec());
            Ok(keccak256(raw))
        }

        async fn subscribe_blocks(&self) -> Result<BlockStream, RpcError> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let feed = self.block_feeds.lock().unwrap().pop_front();
            let Some(receiver) = feed else {
                return Err(RpcError::Transport("websocket unavailable".into()));
            };
            let stream = futures_util::stream::unfold(receiver, |mut rx| async move {
                rx.recv().await.map(|header| (header, rx))
            })
            .boxed();
            Ok(stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_headroom_rounds_up() {
        let fees = FeeData {
            gas_price: 10,
            max_fee_per_gas: 100,
            max_priority_fee_per_gas: 3,
        };
        let bumped = fees.with_headroom(1.5);
        assert_eq!(bumped.max_fee_per_gas, 150);
        assert_eq!(bumped.max_priority_fee_per_gas, 5);
        assert_eq!(bumped.gas_price, 10);
    }

    #[test]
    fn transient_classification() {
        assert!(RpcError::Transport("connection refused".into()).is_transient());
        assert!(RpcError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(
            RpcError::Rpc {
                code: -32000,
                message: "header not found".into()
            }
            .is_transient()
        );
        assert!(
            !RpcError::Rpc {
                code: -32602,
                message: "invalid params".into()
            }
            .is_transient()
        );
        assert!(!RpcError::NoWebsocket.is_transient());
    }
}
