//! Persistent state boundary: requests, batches, signed and sent rows.
//!
//! The relational schema itself is an external collaborator; components see
//! only the [`RequestStore`] trait. Its contract carries the pipeline's
//! global ownership rule: the atomic claim in [`RequestStore::claim_request`]
//! and the guarded multi-row transition in [`RequestStore::form_batch`] are
//! each one transactional section, so at any time at most one worker
//! instance mutates a request through its signing stages.
//!
//! [`InMemoryStore`] implements the contract behind a single async mutex —
//! the mutex plays the role of the transaction — and is used for local mode
//! and tests.

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::chain::{Chain, Network};
use crate::types::{
    BatchStatus, BatchTransaction, ProcessingMode, RequestStatus, SentTransaction,
    SignedTransaction, UnixMillis, WithdrawalRequest,
};

/// Outcome of the atomic claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The request was `PENDING` and unowned; it is now `VALIDATING` and
    /// owned by the caller.
    Claimed,
    /// The caller already owns this request (redelivery to the same
    /// instance).
    AlreadyOwned,
    /// Another instance owns the request, or it is past claiming.
    NotOurs,
    /// No such request row.
    NotFound,
}

/// Parameters for forming a batch row.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch_id: String,
    pub aggregator: alloy_primitives::Address,
    pub member_request_ids: Vec<String>,
    pub total_amount: U256,
    pub token_fingerprint: String,
    pub chain: Chain,
    pub network: Network,
}

/// Outcome of guarded batch formation.
#[derive(Debug)]
pub enum BatchFormation {
    /// Every expected member was still `VALIDATING` and owned by the caller;
    /// the batch row exists and members moved to `SIGNING`.
    Formed(BatchTransaction),
    /// Fewer members matched than expected. Nothing was mutated. The caller
    /// falls back to single processing for the listed survivors.
    Aborted { still_owned: Vec<String> },
}

/// Errors surfaced by the store boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row not found: {0}")]
    NotFound(String),
    /// The row exists but is not in the state the operation requires.
    #[error("state conflict: {0}")]
    Conflict(String),
    /// Transient backing-store failure; the caller may retry.
    #[error("store error: {0}")]
    Io(String),
}

/// The persisted-state surface consumed by the pipeline.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a fresh request row. Used by submitters and tests.
    async fn insert_request(&self, request: WithdrawalRequest) -> Result<(), StoreError>;

    async fn get_request(&self, request_id: &str)
    -> Result<Option<WithdrawalRequest>, StoreError>;

    /// The atomic claim: in one transactional section, transition
    /// `PENDING`+unowned to `VALIDATING`+owned-by-caller.
    async fn claim_request(
        &self,
        request_id: &str,
        instance_id: &str,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Guarded `VALIDATING → SIGNING` for single-mode processing. Re-checks
    /// ownership inside the transaction; returns `false` when another
    /// instance took over, in which case nothing was mutated.
    async fn begin_single_signing(
        &self,
        request_id: &str,
        instance_id: &str,
    ) -> Result<bool, StoreError>;

    /// Guarded batch formation over all members in one transaction.
    async fn form_batch(
        &self,
        batch: NewBatch,
        instance_id: &str,
    ) -> Result<BatchFormation, StoreError>;

    /// Dissolve a batch: batch row to `FAILED`, members back to `PENDING`
    /// with `batch_id` cleared, ownership released, error recorded.
    async fn dissolve_batch(&self, batch_id: &str, error: &str) -> Result<(), StoreError>;

    /// Release a single-mode request back to `PENDING` after a signing
    /// failure, clearing ownership and recording the error.
    async fn release_request(&self, request_id: &str, error: &str) -> Result<(), StoreError>;

    /// Terminal failure with a human-readable reason.
    async fn mark_request_failed(&self, request_id: &str, error: &str) -> Result<(), StoreError>;

    /// Record the immutable signed row and move the linked request or batch
    /// (and its members) to `SIGNED`.
    async fn mark_signed(&self, signed: SignedTransaction) -> Result<(), StoreError>;

    async fn update_request_status(
        &self,
        request_id: &str,
        status: RequestStatus,
    ) -> Result<(), StoreError>;

    /// Bulk status update; returns the number of rows changed.
    async fn update_requests_status(
        &self,
        request_ids: &[String],
        status: RequestStatus,
    ) -> Result<usize, StoreError>;

    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        tx_hash: Option<B256>,
    ) -> Result<(), StoreError>;

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchTransaction>, StoreError>;

    async fn get_signed(&self, tx_hash: B256) -> Result<Option<SignedTransaction>, StoreError>;

    /// Persist a broadcast attempt.
    async fn record_sent(&self, sent: SentTransaction) -> Result<(), StoreError>;
}

#[derive(Default)]
struct StoreState {
    requests: HashMap<String, WithdrawalRequest>,
    batches: HashMap<String, BatchTransaction>,
    signed: HashMap<B256, SignedTransaction>,
    sent: HashMap<B256, SentTransaction>,
}

/// In-process [`RequestStore`] guarded by one mutex per the §5 model: the
/// critical section is the transaction.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a request, for assertions in tests.
    pub async fn snapshot(&self, request_id: &str) -> Option<WithdrawalRequest> {
        self.state.lock().await.requests.get(request_id).cloned()
    }

    /// All batch rows, for assertions in tests.
    pub async fn batches(&self) -> Vec<BatchTransaction> {
        self.state.lock().await.batches.values().cloned().collect()
    }

    pub async fn sent_rows(&self) -> Vec<SentTransaction> {
        self.state.lock().await.sent.values().cloned().collect()
    }
}

fn touch(request: &mut WithdrawalRequest) {
    request.updated_at = UnixMillis::now();
}

#[async_trait]
impl RequestStore for InMemoryStore {
    async fn insert_request(&self, request: WithdrawalRequest) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.requests.insert(request.request_id.clone(), request);
        Ok(())
    }

    async fn get_request(
        &self,
        request_id: &str,
    ) -> Result<Option<WithdrawalRequest>, StoreError> {
        Ok(self.state.lock().await.requests.get(request_id).cloned())
    }

    async fn claim_request(
        &self,
        request_id: &str,
        instance_id: &str,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(request) = state.requests.get_mut(request_id) else {
            return Ok(ClaimOutcome::NotFound);
        };
        if request.status == RequestStatus::Pending && request.processing_instance_id.is_none() {
            request.status = RequestStatus::Validating;
            request.processing_instance_id = Some(instance_id.to_string());
            touch(request);
            Ok(ClaimOutcome::Claimed)
        } else if request.processing_instance_id.as_deref() == Some(instance_id) {
            Ok(ClaimOutcome::AlreadyOwned)
        } else {
            Ok(ClaimOutcome::NotOurs)
        }
    }

    async fn begin_single_signing(
        &self,
        request_id: &str,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(request) = state.requests.get_mut(request_id) else {
            return Err(StoreError::NotFound(request_id.to_string()));
        };
        if request.status != RequestStatus::Validating
            || request.processing_instance_id.as_deref() != Some(instance_id)
        {
            return Ok(false);
        }
        request.status = RequestStatus::Signing;
        request.try_count += 1;
        request.processing_mode = ProcessingMode::Single;
        touch(request);
        Ok(true)
    }

    async fn form_batch(
        &self,
        batch: NewBatch,
        instance_id: &str,
    ) -> Result<BatchFormation, StoreError> {
        let mut state = self.state.lock().await;
        let still_owned: Vec<String> = batch
            .member_request_ids
            .iter()
            .filter(|id| {
                state.requests.get(*id).is_some_and(|r| {
                    r.status == RequestStatus::Validating
                        && r.processing_instance_id.as_deref() == Some(instance_id)
                })
            })
            .cloned()
            .collect();
        if still_owned.len() != batch.member_request_ids.len() {
            return Ok(BatchFormation::Aborted { still_owned });
        }
        let row = BatchTransaction {
            batch_id: batch.batch_id.clone(),
            aggregator: batch.aggregator,
            member_request_ids: batch.member_request_ids.clone(),
            total_amount: batch.total_amount,
            token_fingerprint: batch.token_fingerprint,
            chain: batch.chain,
            network: batch.network,
            status: BatchStatus::Pending,
            tx_hash: None,
            created_at: UnixMillis::now(),
        };
        state.batches.insert(batch.batch_id.clone(), row.clone());
        for id in &batch.member_request_ids {
            let request = state
                .requests
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            request.status = RequestStatus::Signing;
            request.try_count += 1;
            request.batch_id = Some(batch.batch_id.clone());
            request.processing_mode = ProcessingMode::Batch;
            touch(request);
        }
        Ok(BatchFormation::Formed(row))
    }

    async fn dissolve_batch(&self, batch_id: &str, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(batch) = state.batches.get_mut(batch_id) else {
            return Err(StoreError::NotFound(batch_id.to_string()));
        };
        batch.status = BatchStatus::Failed;
        let members = batch.member_request_ids.clone();
        for id in &members {
            if let Some(request) = state.requests.get_mut(id) {
                request.status = RequestStatus::Pending;
                request.batch_id = None;
                request.processing_mode = ProcessingMode::Single;
                request.processing_instance_id = None;
                request.error = Some(error.to_string());
                touch(request);
            }
        }
        Ok(())
    }

    async fn release_request(&self, request_id: &str, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(request) = state.requests.get_mut(request_id) else {
            return Err(StoreError::NotFound(request_id.to_string()));
        };
        request.status = RequestStatus::Pending;
        request.processing_instance_id = None;
        request.error = Some(error.to_string());
        touch(request);
        Ok(())
    }

    async fn mark_request_failed(&self, request_id: &str, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(request) = state.requests.get_mut(request_id) else {
            return Err(StoreError::NotFound(request_id.to_string()));
        };
        request.status = RequestStatus::Failed;
        request.processing_instance_id = None;
        request.error = Some(error.to_string());
        touch(request);
        Ok(())
    }

    async fn mark_signed(&self, signed: SignedTransaction) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(batch_id) = signed.batch_id.clone() {
            let batch = state
                .batches
                .get_mut(&batch_id)
                .ok_or_else(|| StoreError::NotFound(batch_id.clone()))?;
            batch.status = BatchStatus::Signed;
            batch.tx_hash = Some(signed.tx_hash);
            let members = batch.member_request_ids.clone();
            for id in &members {
                if let Some(request) = state.requests.get_mut(id) {
                    request.status = RequestStatus::Signed;
                    touch(request);
                }
            }
        } else if let Some(request_id) = signed.request_id.clone() {
            let request = state
                .requests
                .get_mut(&request_id)
                .ok_or_else(|| StoreError::NotFound(request_id.clone()))?;
            request.status = RequestStatus::Signed;
            touch(request);
        }
        state.signed.insert(signed.tx_hash, signed);
        Ok(())
    }

    async fn update_request_status(
        &self,
        request_id: &str,
        status: RequestStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(request) = state.requests.get_mut(request_id) else {
            return Err(StoreError::NotFound(request_id.to_string()));
        };
        request.status = status;
        if status.is_terminal() {
            request.processing_instance_id = None;
        }
        touch(request);
        Ok(())
    }

    async fn update_requests_status(
        &self,
        request_ids: &[String],
        status: RequestStatus,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for id in request_ids {
            if let Some(request) = state.requests.get_mut(id) {
                request.status = status;
                if status.is_terminal() {
                    request.processing_instance_id = None;
                }
                touch(request);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn update_batch_status(
        &self,
        batch_id: &str,
        status: BatchStatus,
        tx_hash: Option<B256>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let Some(batch) = state.batches.get_mut(batch_id) else {
            return Err(StoreError::NotFound(batch_id.to_string()));
        };
        batch.status = status;
        if tx_hash.is_some() {
            batch.tx_hash = tx_hash;
        }
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchTransaction>, StoreError> {
        Ok(self.state.lock().await.batches.get(batch_id).cloned())
    }

    async fn get_signed(&self, tx_hash: B256) -> Result<Option<SignedTransaction>, StoreError> {
        Ok(self.state.lock().await.signed.get(&tx_hash).cloned())
    }

    async fn record_sent(&self, sent: SentTransaction) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.sent.insert(sent.tx_hash, sent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MULTICALL3_ADDRESS;

    fn request(id: &str) -> WithdrawalRequest {
        WithdrawalRequest::new(
            id,
            "0x742d35Cc6634C0532925a3b844Bc454e4438fAEd",
            "1000",
            Some("0xc2132D05D31c914a87C6611C10748AEb04B58e8F".to_string()),
            Chain::Polygon,
            Network::Mainnet,
        )
    }

    fn new_batch(ids: &[&str]) -> NewBatch {
        NewBatch {
            batch_id: "b1".into(),
            aggregator: MULTICALL3_ADDRESS,
            member_request_ids: ids.iter().map(|s| s.to_string()).collect(),
            total_amount: U256::from(3000u64),
            token_fingerprint: "0xc2132d05d31c914a87c6611c10748aeb04b58e8f".into(),
            chain: Chain::Polygon,
            network: Network::Mainnet,
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryStore::new();
        store.insert_request(request("r1")).await.unwrap();
        assert_eq!(
            store.claim_request("r1", "worker-a").await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim_request("r1", "worker-b").await.unwrap(),
            ClaimOutcome::NotOurs
        );
        assert_eq!(
            store.claim_request("r1", "worker-a").await.unwrap(),
            ClaimOutcome::AlreadyOwned
        );
        assert_eq!(
            store.claim_request("missing", "worker-a").await.unwrap(),
            ClaimOutcome::NotFound
        );
        let snapshot = store.snapshot("r1").await.unwrap();
        assert_eq!(snapshot.status, RequestStatus::Validating);
        assert_eq!(snapshot.processing_instance_id.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn single_signing_rechecks_ownership() {
        let store = InMemoryStore::new();
        store.insert_request(request("r1")).await.unwrap();
        store.claim_request("r1", "worker-a").await.unwrap();
        assert!(!store.begin_single_signing("r1", "worker-b").await.unwrap());
        assert!(store.begin_single_signing("r1", "worker-a").await.unwrap());
        let snapshot = store.snapshot("r1").await.unwrap();
        assert_eq!(snapshot.status, RequestStatus::Signing);
        assert_eq!(snapshot.try_count, 1);
    }

    #[tokio::test]
    async fn batch_forms_when_all_members_held() {
        let store = InMemoryStore::new();
        for id in ["r1", "r2", "r3"] {
            store.insert_request(request(id)).await.unwrap();
            store.claim_request(id, "worker-a").await.unwrap();
        }
        let formed = store
            .form_batch(new_batch(&["r1", "r2", "r3"]), "worker-a")
            .await
            .unwrap();
        let BatchFormation::Formed(batch) = formed else {
            panic!("expected formation");
        };
        assert_eq!(batch.status, BatchStatus::Pending);
        for id in ["r1", "r2", "r3"] {
            let snapshot = store.snapshot(id).await.unwrap();
            assert_eq!(snapshot.status, RequestStatus::Signing);
            assert_eq!(snapshot.batch_id.as_deref(), Some("b1"));
            assert_eq!(snapshot.processing_mode, ProcessingMode::Batch);
            assert_eq!(snapshot.try_count, 1);
        }
    }

    #[tokio::test]
    async fn batch_aborts_when_member_stolen() {
        let store = InMemoryStore::new();
        for id in ["r1", "r2", "r3"] {
            store.insert_request(request(id)).await.unwrap();
            store.claim_request(id, "worker-a").await.unwrap();
        }
        // Another instance takes r2 over between validate and formation.
        store
            .state
            .lock()
            .await
            .requests
            .get_mut("r2")
            .unwrap()
            .processing_instance_id = Some("worker-b".to_string());
        let outcome = store
            .form_batch(new_batch(&["r1", "r2", "r3"]), "worker-a")
            .await
            .unwrap();
        let BatchFormation::Aborted { still_owned } = outcome else {
            panic!("expected abort");
        };
        assert_eq!(still_owned, vec!["r1".to_string(), "r3".to_string()]);
        assert!(store.batches().await.is_empty());
        // Survivors keep their claim, nothing was mutated.
        let snapshot = store.snapshot("r1").await.unwrap();
        assert_eq!(snapshot.status, RequestStatus::Validating);
        assert_eq!(snapshot.try_count, 0);
        assert!(snapshot.batch_id.is_none());
    }

    #[tokio::test]
    async fn dissolve_clears_membership() {
        let store = InMemoryStore::new();
        for id in ["r1", "r2"] {
            store.insert_request(request(id)).await.unwrap();
            store.claim_request(id, "worker-a").await.unwrap();
        }
        store
            .form_batch(new_batch(&["r1", "r2"]), "worker-a")
            .await
            .unwrap();
        store.dissolve_batch("b1", "signing failed").await.unwrap();
        let batch = store.get_batch("b1").await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        for id in ["r1", "r2"] {
            let snapshot = store.snapshot(id).await.unwrap();
            assert_eq!(snapshot.status, RequestStatus::Pending);
            assert!(snapshot.batch_id.is_none());
            assert!(snapshot.processing_instance_id.is_none());
            assert_eq!(snapshot.processing_mode, ProcessingMode::Single);
            assert_eq!(snapshot.error.as_deref(), Some("signing failed"));
        }
    }
}
