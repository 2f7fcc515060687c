//! Re-drives jobs still waiting for their attestation

use super::Worker;
use crate::attestation::{fetch_with_policy, AttestationClient};
use crate::error::{RelayerError, RelayerResult};
use crate::job::{JobStatus, Transition};
use crate::retry::RetryPolicy;
use crate::store::{apply_transition, JobFilter, Store};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One per source chain. Jobs are visited oldest first and never time out.
pub struct AttestationSweep {
    chain_id: u16,
    attestation_chain_id: u16,
    store: Arc<dyn Store>,
    attestations: Arc<dyn AttestationClient>,
    retry: RetryPolicy,
    batch_size: usize,
    interval: Duration,
}

impl AttestationSweep {
    pub fn new(
        chain_id: u16,
        attestation_chain_id: u16,
        store: Arc<dyn Store>,
        attestations: Arc<dyn AttestationClient>,
        retry: RetryPolicy,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        Self {
            chain_id,
            attestation_chain_id,
            store,
            attestations,
            retry,
            batch_size,
            interval,
        }
    }
}

#[async_trait]
impl Worker for AttestationSweep {
    fn name(&self) -> String {
        format!("sweep-{}", self.chain_id)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> RelayerResult<()> {
        let filter = JobFilter::new(JobStatus::AwaitingAttestation, self.batch_size).source(self.chain_id);
        let jobs = self.store.find_by_status(&filter).await?;

        for job in jobs {
            let result = fetch_with_policy(
                self.attestations.as_ref(),
                &self.retry,
                &job.emitter,
                self.attestation_chain_id,
                job.sequence,
            )
            .await;

            match result {
                Ok(attestation) => {
                    if apply_transition(self.store.as_ref(), &job, &Transition::attested(attestation)).await? {
                        info!(
                            chain_id = self.chain_id,
                            nonce = job.nonce,
                            sequence = job.sequence,
                            "Attestation obtained, job ready"
                        );
                    }
                }
                Err(RelayerError::AttestationPending { .. }) => {
                    debug!(
                        chain_id = self.chain_id,
                        sequence = job.sequence,
                        "Attestation not yet available"
                    );
                }
                // network down, the rest of the batch would fail the same way
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
