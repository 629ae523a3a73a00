//! Per-signer monotonic nonce allocation.
//!
//! Nonces are allocated from a shared cache keyed by (signer address, chain,
//! network). The first allocation for a signer seeds the counter from the
//! node's confirmed-plus-pending transaction count; subsequent allocations
//! increment locally without touching the RPC. Each signer's counter is
//! guarded by its own async mutex, so two concurrent allocations against the
//! same signer always observe distinct, strictly increasing values.
//!
//! `reset` drops a signer's counter back to the unfetched state. It is used
//! only by the recovery engine on detected nonce divergence; the next
//! allocation re-seeds from the node, which includes mempool transactions
//! and so heals both too-low and too-high drift.

use alloy_primitives::Address;
use dashmap::DashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::chain::ChainKey;
use crate::rpc::{EvmRpc, RpcError};

/// Identity of a signing account on a specific (chain, network).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignerKey {
    pub address: Address,
    pub chain_key: ChainKey,
}

impl SignerKey {
    pub fn new(address: Address, chain_key: ChainKey) -> Self {
        Self { address, chain_key }
    }
}

impl Display for SignerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.address, self.chain_key)
    }
}

// Sentinel for a counter that has not been seeded from the node yet.
const UNFETCHED: u64 = u64::MAX;

/// Shared monotonic nonce allocator.
#[derive(Clone, Default)]
pub struct NonceCache {
    nonces: Arc<DashMap<SignerKey, Arc<Mutex<u64>>>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, signer: SignerKey) -> Arc<Mutex<u64>> {
        // Short dashmap lock to clone the Arc; never held across an await.
        let entry = self
            .nonces
            .entry(signer)
            .or_insert_with(|| Arc::new(Mutex::new(UNFETCHED)));
        Arc::clone(entry.value())
    }

    /// Allocate the next nonce for `signer`.
    ///
    /// Seeds from `rpc.get_transaction_count` (pending included) on first
    /// use, then increments locally.
    pub async fn increment_and_get(
        &self,
        rpc: &dyn EvmRpc,
        signer: SignerKey,
    ) -> Result<u64, RpcError> {
        let slot = self.slot(signer);
        let mut nonce = slot.lock().await;
        let next = if *nonce == UNFETCHED {
            tracing::trace!(%signer, "seeding nonce from node");
            rpc.get_transaction_count(signer.address).await?
        } else {
            *nonce + 1
        };
        *nonce = next;
        Ok(next)
    }

    /// Last allocated nonce for `signer`, if one has been allocated.
    pub async fn get(&self, signer: SignerKey) -> Option<u64> {
        let slot = self.nonces.get(&signer).map(|e| Arc::clone(e.value()))?;
        let nonce = slot.lock().await;
        if *nonce == UNFETCHED { None } else { Some(*nonce) }
    }

    /// Drop the counter back to the unfetched state so the next allocation
    /// re-seeds from the node.
    pub async fn reset(&self, signer: SignerKey) {
        if let Some(slot) = self.nonces.get(&signer).map(|e| Arc::clone(e.value())) {
            let mut nonce = slot.lock().await;
            *nonce = UNFETCHED;
            tracing::debug!(%signer, "nonce cache reset, will reseed on next allocation");
        }
    }
}
