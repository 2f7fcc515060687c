//! Source chain watcher
//!
//! Turns relay events into jobs. The cursor only moves once every event of
//! a batch is durably recorded, so a failed cycle re-reads the same range and
//! relies on identity dedup to skip what was already stored.

use super::Worker;
use crate::attestation::{fetch_with_policy, AttestationClient};
use crate::chain::EventSource;
use crate::error::RelayerResult;
use crate::events::RelayEvent;
use crate::fees::FeeEstimator;
use crate::job::{CallKind, RelayJob};
use crate::retry::RetryPolicy;
use crate::store::{Store, RELAY_STREAM};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct ChainWatcher {
    chain_id: u16,
    /// Chain id of this chain on the attestation network
    attestation_chain_id: u16,
    start_block: u64,
    source: Arc<dyn EventSource<RelayEvent>>,
    store: Arc<dyn Store>,
    attestations: Arc<dyn AttestationClient>,
    estimator: Arc<FeeEstimator>,
    interval: Duration,
}

impl ChainWatcher {
    pub fn new(
        attestation_chain_id: u16,
        start_block: u64,
        source: Arc<dyn EventSource<RelayEvent>>,
        store: Arc<dyn Store>,
        attestations: Arc<dyn AttestationClient>,
        estimator: Arc<FeeEstimator>,
        interval: Duration,
    ) -> Self {
        Self {
            chain_id: source.chain_id(),
            attestation_chain_id,
            start_block,
            source,
            store,
            attestations,
            estimator,
            interval,
        }
    }

    /// Last block known to be fully recorded.
    ///
    /// Without a checkpoint the highest recorded job block is scanned again,
    /// since a crash may have left it partially recorded.
    async fn cursor(&self) -> RelayerResult<u64> {
        if let Some(cursor) = self.store.get_checkpoint(self.chain_id, RELAY_STREAM).await? {
            return Ok(cursor);
        }
        if let Some(block) = self.store.latest_block(self.chain_id).await? {
            info!(chain_id = self.chain_id, "No checkpoint, resuming from job block {}", block);
            return Ok(block.saturating_sub(1));
        }
        Ok(self.start_block.saturating_sub(1))
    }

    async fn record(&self, event: &RelayEvent) -> RelayerResult<()> {
        if self.store.find(event.source_chain_id, event.nonce).await?.is_some() {
            debug!(
                chain_id = self.chain_id,
                nonce = event.nonce,
                "Event already recorded"
            );
            return Ok(());
        }

        let call_kind = match CallKind::classify(event.app_id, event.call_type) {
            Ok(kind) => kind,
            Err(e) => {
                error!(
                    chain_id = self.chain_id,
                    nonce = event.nonce,
                    tx = %event.source_tx_id,
                    "Skipping event: {}", e
                );
                crate::metrics::record_unknown_call_kind(self.chain_id);
                return Ok(());
            }
        };

        let fee_value = self
            .estimator
            .value_of(event.source_chain_id, event.fee_amount)
            .await?;

        let attestation = match fetch_with_policy(
            self.attestations.as_ref(),
            &RetryPolicy::none(),
            &event.emitter,
            self.attestation_chain_id,
            event.sequence,
        )
        .await
        {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(
                    chain_id = self.chain_id,
                    sequence = event.sequence,
                    "Attestation deferred to sweep: {}", e
                );
                None
            }
        };

        let job = RelayJob::from_event(event, call_kind, fee_value, attestation);
        if self.store.insert(&job).await? {
            info!(
                chain_id = self.chain_id,
                nonce = job.nonce,
                sequence = job.sequence,
                call_kind = %call_kind,
                status = %job.status,
                "Relay job recorded"
            );
            crate::metrics::record_event_ingested(self.chain_id, call_kind);
        } else {
            debug!(chain_id = self.chain_id, nonce = job.nonce, "Event already recorded");
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for ChainWatcher {
    fn name(&self) -> String {
        format!("watcher-{}", self.chain_id)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> RelayerResult<()> {
        let cursor = self.cursor().await?;
        let batch = self.source.poll(cursor).await?;

        for event in &batch.events {
            self.record(event).await?;
        }

        if batch.next_cursor > cursor {
            self.store
                .save_checkpoint(self.chain_id, RELAY_STREAM, batch.next_cursor)
                .await?;
            crate::metrics::record_cursor(self.chain_id, RELAY_STREAM, batch.next_cursor);
            debug!(
                chain_id = self.chain_id,
                "Recorded {} events up to block {}",
                batch.events.len(),
                batch.next_cursor
            );
        }
        Ok(())
    }
}
