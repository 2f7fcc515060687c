//! Links core chain payout requests back to their relay jobs
//!
//! A request can be observed before the settlement that emitted it is
//! recorded, while the job is still `ready`. Such requests are parked in a
//! retry queue and the cursor moves on, so one unsettled job never holds back
//! the payouts behind it. The queue itself lives in memory; only the block
//! before its oldest request is checkpointed. After a restart that range is
//! polled again once to rebuild the queue, which costs a rescan of blocks
//! whose other requests are already linked and get skipped.

use super::Worker;
use crate::attestation::{fetch_with_policy, AttestationClient};
use crate::chain::EventSource;
use crate::error::RelayerResult;
use crate::events::PayoutRequest;
use crate::job::{JobStatus, Transition};
use crate::retry::RetryPolicy;
use crate::store::{apply_transition, Store, PAYOUT_RETRY_STREAM, PAYOUT_STREAM};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

enum Link {
    Linked,
    Skipped,
    /// The settlement that emitted the request is not recorded yet
    Deferred,
}

pub struct PayoutWatcher {
    core_chain_id: u16,
    /// Core chain id on the attestation network
    attestation_chain_id: u16,
    payout_emitter: String,
    start_block: u64,
    source: Arc<dyn EventSource<PayoutRequest>>,
    store: Arc<dyn Store>,
    attestations: Arc<dyn AttestationClient>,
    retry: RetryPolicy,
    interval: Duration,
    /// Requests whose job had not been settled yet
    deferred: Mutex<Vec<PayoutRequest>>,
    restored: AtomicBool,
}

impl PayoutWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        attestation_chain_id: u16,
        payout_emitter: String,
        start_block: u64,
        source: Arc<dyn EventSource<PayoutRequest>>,
        store: Arc<dyn Store>,
        attestations: Arc<dyn AttestationClient>,
        retry: RetryPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            core_chain_id: source.chain_id(),
            attestation_chain_id,
            payout_emitter,
            start_block,
            source,
            store,
            attestations,
            retry,
            interval,
            deferred: Mutex::new(Vec::new()),
            restored: AtomicBool::new(false),
        }
    }

    async fn cursor(&self) -> RelayerResult<u64> {
        Ok(self
            .store
            .get_checkpoint(self.core_chain_id, PAYOUT_STREAM)
            .await?
            .unwrap_or_else(|| self.start_block.saturating_sub(1)))
    }

    async fn link(&self, request: &PayoutRequest) -> RelayerResult<Link> {
        let job = match self.store.find(request.source_chain_id, request.source_nonce).await? {
            Some(job) => job,
            None => {
                debug!(
                    source_chain_id = request.source_chain_id,
                    nonce = request.source_nonce,
                    "Payout request without a known job"
                );
                return Ok(Link::Skipped);
            }
        };

        match job.status {
            JobStatus::AwaitingPayout => {}
            JobStatus::Ready => return Ok(Link::Deferred),
            status => {
                debug!(
                    source_chain_id = job.source_chain_id,
                    nonce = job.nonce,
                    %status,
                    "Payout request for a job not awaiting payout"
                );
                return Ok(Link::Skipped);
            }
        }

        let attestation = fetch_with_policy(
            self.attestations.as_ref(),
            &self.retry,
            &self.payout_emitter,
            self.attestation_chain_id,
            request.sequence,
        )
        .await?;

        let linked = Transition::payout_linked(
            request.payout_chain_id,
            request.payout_address.clone(),
            request.sequence,
            attestation,
        );
        if apply_transition(self.store.as_ref(), &job, &linked).await? {
            info!(
                source_chain_id = job.source_chain_id,
                nonce = job.nonce,
                payout_chain_id = request.payout_chain_id,
                "Payout linked"
            );
        }
        Ok(Link::Linked)
    }

    /// Rebuild the retry queue of an earlier run from its checkpoint
    async fn restore_deferred(&self) -> RelayerResult<Vec<PayoutRequest>> {
        let cursor = self.cursor().await?;
        let mut from = match self.store.get_checkpoint(self.core_chain_id, PAYOUT_RETRY_STREAM).await? {
            Some(from) if from < cursor => from,
            _ => return Ok(Vec::new()),
        };

        let mut parked = Vec::new();
        while from < cursor {
            let batch = self.source.poll(from).await?;
            for request in batch.events.iter().filter(|r| r.block_number <= cursor) {
                if let Link::Deferred = self.link(request).await? {
                    parked.push(request.clone());
                }
            }
            if batch.next_cursor <= from {
                break;
            }
            from = batch.next_cursor;
        }

        if !parked.is_empty() {
            info!(count = parked.len(), "Restored deferred payout requests");
        }
        Ok(parked)
    }

    /// Retry parked requests, keeping those still waiting for their settlement
    async fn retry_deferred(&self) -> RelayerResult<Vec<PayoutRequest>> {
        let mut parked = std::mem::take(&mut *self.deferred.lock().await);
        if !self.restored.load(Ordering::Relaxed) {
            parked.extend(self.restore_deferred().await?);
            self.restored.store(true, Ordering::Relaxed);
        }

        let mut still_deferred = Vec::new();
        for request in parked {
            match self.link(&request).await {
                Ok(Link::Linked) | Ok(Link::Skipped) => {}
                Ok(Link::Deferred) => still_deferred.push(request),
                Err(e) => {
                    warn!(
                        source_chain_id = request.source_chain_id,
                        nonce = request.source_nonce,
                        "Deferred payout request failed, will retry: {}", e
                    );
                    still_deferred.push(request);
                }
            }
        }
        Ok(still_deferred)
    }

    /// Checkpoint the range the retry queue still covers
    async fn save_deferred(&self, deferred: Vec<PayoutRequest>) -> RelayerResult<()> {
        let floor = match deferred.iter().map(|r| r.block_number).min() {
            Some(block) => block.saturating_sub(1),
            None => self.cursor().await?,
        };
        *self.deferred.lock().await = deferred;
        self.store
            .save_checkpoint(self.core_chain_id, PAYOUT_RETRY_STREAM, floor)
            .await
    }

    async fn poll_requests(&self, deferred: &mut Vec<PayoutRequest>) -> RelayerResult<()> {
        let cursor = self.cursor().await?;
        let batch = self.source.poll(cursor).await?;

        for request in &batch.events {
            match self.link(request).await {
                Ok(Link::Linked) | Ok(Link::Skipped) => {}
                Ok(Link::Deferred) => {
                    debug!(
                        source_chain_id = request.source_chain_id,
                        nonce = request.source_nonce,
                        "Settlement not recorded yet, deferring payout request"
                    );
                    if !deferred.contains(request) {
                        deferred.push(request.clone());
                    }
                }
                Err(e) => {
                    // never move past the block of an unhandled request
                    self.advance(cursor, request.block_number.saturating_sub(1)).await?;
                    return Err(e);
                }
            }
        }

        self.advance(cursor, batch.next_cursor).await
    }

    async fn advance(&self, cursor: u64, next: u64) -> RelayerResult<()> {
        if next > cursor {
            self.store
                .save_checkpoint(self.core_chain_id, PAYOUT_STREAM, next)
                .await?;
            crate::metrics::record_cursor(self.core_chain_id, PAYOUT_STREAM, next);
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for PayoutWatcher {
    fn name(&self) -> String {
        "payout-watcher".to_string()
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> RelayerResult<()> {
        let mut deferred = self.retry_deferred().await?;
        let result = self.poll_requests(&mut deferred).await;
        self.save_deferred(deferred).await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayerError;
    use crate::job::fixtures::relay_event;
    use crate::job::{CallKind, RelayJob};
    use crate::store::{CheckpointStore, JobRepository, MemoryStore};
    use crate::workers::testing::*;

    fn request(nonce: u64, block_number: u64) -> PayoutRequest {
        PayoutRequest {
            source_chain_id: POLYGON,
            source_nonce: nonce,
            sequence: 500 + nonce,
            call_type: 1,
            payout_chain_id: ARBITRUM,
            payout_address: "0x00000000000000000000000000000000000000b0".to_string(),
            block_number,
            tx_id: format!("0x{:064x}", block_number),
        }
    }

    async fn job_in(store: &MemoryStore, nonce: u64, settled: bool) {
        let job = RelayJob::from_event(&relay_event(POLYGON, nonce, nonce, 1), CallKind::Withdraw, 1.0, Some(vec![1]));
        store.insert(&job).await.unwrap();
        if settled {
            store
                .transition(POLYGON, nonce, &Transition::settled(CallKind::Withdraw, "0xcore".into(), 0.2, 1.0))
                .await
                .unwrap();
        }
    }

    fn watcher(
        source: Arc<ScriptedSource<PayoutRequest>>,
        store: Arc<MemoryStore>,
        attestations: impl AttestationClient + 'static,
    ) -> PayoutWatcher {
        PayoutWatcher::new(
            CORE,
            "0x00000000000000000000000000000000000000c0".to_string(),
            0,
            source,
            store,
            Arc::new(attestations),
            RetryPolicy::none(),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_links_awaiting_job() {
        let store = Arc::new(MemoryStore::new());
        job_in(&store, 1, true).await;
        let source = Arc::new(ScriptedSource::new(CORE));
        source.push(10, request(1, 10));

        watcher(source, store.clone(), attestations_available()).run_once().await.unwrap();

        let job = store.find(POLYGON, 1).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::PayoutPending);
        assert_eq!(job.payout_chain_id, Some(ARBITRUM));
        assert_eq!(job.payout_sequence, Some(501));
        assert_eq!(job.payout_attestation, Some(vec![0xaa, 501u64 as u8]));
        assert_eq!(store.get_checkpoint(CORE, PAYOUT_STREAM).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_unknown_job_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(ScriptedSource::new(CORE));
        source.push(10, request(9, 10));

        watcher(source, store.clone(), attestations_available()).run_once().await.unwrap();
        assert_eq!(store.get_checkpoint(CORE, PAYOUT_STREAM).await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_attestation_failure_holds_cursor() {
        let store = Arc::new(MemoryStore::new());
        job_in(&store, 1, true).await;
        job_in(&store, 2, true).await;
        let source = Arc::new(ScriptedSource::new(CORE));
        source.push(10, request(1, 10));
        source.push(12, request(2, 12));

        let mut client = crate::attestation::MockAttestationClient::new();
        client.expect_fetch().returning(|_, chain_id, sequence| {
            if sequence == 501 {
                Ok(vec![1])
            } else {
                Err(RelayerError::AttestationPending { chain_id, sequence })
            }
        });

        assert!(watcher(source, store.clone(), client).run_once().await.is_err());
        assert_eq!(
            store.find(POLYGON, 1).await.unwrap().unwrap().status,
            JobStatus::PayoutPending
        );
        assert_eq!(
            store.find(POLYGON, 2).await.unwrap().unwrap().status,
            JobStatus::AwaitingPayout
        );
        assert_eq!(store.get_checkpoint(CORE, PAYOUT_STREAM).await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn test_request_ahead_of_settlement_is_deferred() {
        let store = Arc::new(MemoryStore::new());
        job_in(&store, 1, false).await;
        let source = Arc::new(ScriptedSource::new(CORE));
        source.push(10, request(1, 10));

        let watcher = watcher(source, store.clone(), attestations_available());
        watcher.run_once().await.unwrap();
        assert_eq!(
            store.find(POLYGON, 1).await.unwrap().unwrap().status,
            JobStatus::Ready
        );
        assert_eq!(store.get_checkpoint(CORE, PAYOUT_STREAM).await.unwrap(), Some(10));

        store
            .transition(POLYGON, 1, &Transition::settled(CallKind::Withdraw, "0xcore".into(), 0.2, 1.0))
            .await
            .unwrap();
        watcher.run_once().await.unwrap();
        assert_eq!(
            store.find(POLYGON, 1).await.unwrap().unwrap().status,
            JobStatus::PayoutPending
        );
    }

    #[tokio::test]
    async fn test_deferred_request_does_not_block_later_ones() {
        let store = Arc::new(MemoryStore::new());
        job_in(&store, 1, false).await;
        job_in(&store, 2, true).await;
        let source = Arc::new(ScriptedSource::new(CORE));
        source.push(10, request(1, 10));
        source.push(12, request(2, 12));

        let watcher = watcher(source, store.clone(), attestations_available());
        for _ in 0..3 {
            watcher.run_once().await.unwrap();
        }

        assert_eq!(
            store.find(POLYGON, 2).await.unwrap().unwrap().status,
            JobStatus::PayoutPending
        );
        assert_eq!(
            store.find(POLYGON, 1).await.unwrap().unwrap().status,
            JobStatus::Ready
        );
        assert_eq!(store.get_checkpoint(CORE, PAYOUT_STREAM).await.unwrap(), Some(12));
        assert_eq!(watcher.deferred.lock().await.len(), 1);
        assert_eq!(store.get_checkpoint(CORE, PAYOUT_RETRY_STREAM).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_deferred_request_survives_restart() {
        let store = Arc::new(MemoryStore::new());
        job_in(&store, 1, false).await;
        job_in(&store, 2, true).await;
        let source = Arc::new(ScriptedSource::new(CORE));
        source.push(10, request(1, 10));
        source.push(12, request(2, 12));

        watcher(source.clone(), store.clone(), attestations_available())
            .run_once()
            .await
            .unwrap();
        assert_eq!(store.get_checkpoint(CORE, PAYOUT_STREAM).await.unwrap(), Some(12));

        store
            .transition(POLYGON, 1, &Transition::settled(CallKind::Withdraw, "0xcore".into(), 0.2, 1.0))
            .await
            .unwrap();
        watcher(source, store.clone(), attestations_available())
            .run_once()
            .await
            .unwrap();

        for nonce in [1, 2] {
            assert_eq!(
                store.find(POLYGON, nonce).await.unwrap().unwrap().status,
                JobStatus::PayoutPending
            );
        }
        assert_eq!(store.get_checkpoint(CORE, PAYOUT_RETRY_STREAM).await.unwrap(), Some(12));
    }
}
