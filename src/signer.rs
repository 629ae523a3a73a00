//! The signer primitive: structured input → signed raw transaction.
//!
//! Wraps a local private-key signer and produces EIP-1559 transaction
//! envelopes encoded per EIP-2718, ready for `eth_sendRawTransaction`.
//! Workers hold a [`SignerCache`] and lazily instantiate one signer per
//! (chain, network), reusing it across messages.

use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use alloy_signer_local::PrivateKeySigner;
use dashmap::DashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::chain::ChainKey;

/// Structured input to the signer primitive.
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// A signed transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    /// EIP-2718 encoded raw transaction bytes.
    pub raw: Vec<u8>,
    /// Transaction hash (keccak of the raw encoding).
    pub hash: B256,
    pub from: Address,
}

/// Errors from signer construction and signing.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("invalid signing key: {0}")]
    Key(String),
    #[error("signing failed: {0}")]
    Signing(#[from] alloy_signer::Error),
}

/// A single-key transaction signer.
#[derive(Debug, Clone)]
pub struct TransactionSigner {
    signer: PrivateKeySigner,
}

impl TransactionSigner {
    pub fn from_private_key(key: &str) -> Result<Self, SignerError> {
        let signer =
            PrivateKeySigner::from_str(key.trim()).map_err(|e| SignerError::Key(e.to_string()))?;
        Ok(Self { signer })
    }

    /// The signing account's address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Produce the signed EIP-1559 envelope for `request`.
    pub fn sign(&self, request: &SignRequest) -> Result<SignedEnvelope, SignerError> {
        let mut tx = TxEip1559 {
            chain_id: request.chain_id,
            nonce: request.nonce,
            gas_limit: request.gas_limit,
            max_fee_per_gas: request.max_fee_per_gas,
            max_priority_fee_per_gas: request.max_priority_fee_per_gas,
            to: TxKind::Call(request.to),
            value: request.value,
            access_list: Default::default(),
            input: Bytes::from(request.data.clone()),
        };
        let signature = self.signer.sign_transaction_sync(&mut tx)?;
        let signed = tx.into_signed(signature);
        let hash = *signed.hash();
        let envelope = TxEnvelope::from(signed);
        Ok(SignedEnvelope {
            raw: envelope.encoded_2718(),
            hash,
            from: self.signer.address(),
        })
    }
}

/// Lazily constructed signers, one per (chain, network).
pub struct SignerCache {
    private_key: String,
    signers: DashMap<ChainKey, Arc<TransactionSigner>>,
}

impl SignerCache {
    pub fn new(private_key: String) -> Self {
        Self {
            private_key,
            signers: DashMap::new(),
        }
    }

    /// The signer for `key`, constructing it on first use.
    pub fn signer_for(&self, key: ChainKey) -> Result<Arc<TransactionSigner>, SignerError> {
        if let Some(signer) = self.signers.get(&key) {
            return Ok(Arc::clone(signer.value()));
        }
        let signer = Arc::new(TransactionSigner::from_private_key(&self.private_key)?);
        tracing::debug!(%key, address = %signer.address(), "instantiated signer");
        self.signers.insert(key, Arc::clone(&signer));
        Ok(signer)
    }
}
