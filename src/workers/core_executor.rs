//! Settles ready jobs on the core chain
//!
//! The fee offered with each settlement is the value the user paid, converted
//! into the core gas token. While a `(source chain, call kind)` pair has never
//! been settled there is no history to price it, so the first settlement
//! offers the bootstrap allowance instead. The same applies once when the
//! core reports a result variant that has never been sampled.

use super::{reconcile, SignerGate, Worker};
use crate::error::{ErrorClass, RelayerError, RelayerResult};
use crate::fees::FeeEstimator;
use crate::job::{GasRole, GasUsageSample, JobStatus, RelayJob, Transition, FEE_DECLINED_REASON};
use crate::store::{apply_transition, JobFilter, SampleQuery, Store};
use crate::tx::{AccountRotator, SignerLease, SubmissionOutcome, SubmitRequest, Submitter, TxLookup};

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct CoreExecutor {
    core_chain_id: u16,
    store: Arc<dyn Store>,
    submitter: Arc<dyn Submitter>,
    estimator: Arc<FeeEstimator>,
    signers: SignerGate,
    /// Unlimited fee allowance in core gas token units
    bootstrap_allowance: u128,
    batch_size: usize,
    interval: Duration,
}

impl CoreExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        submitter: Arc<dyn Submitter>,
        rotator: Arc<AccountRotator>,
        estimator: Arc<FeeEstimator>,
        min_balance: u128,
        bootstrap_allowance: u128,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        let core_chain_id = submitter.chain_id();
        Self {
            core_chain_id,
            signers: SignerGate {
                chain_id: core_chain_id,
                rotator,
                submitter: submitter.clone(),
                estimator: estimator.clone(),
                min_balance,
            },
            store,
            submitter,
            estimator,
            bootstrap_allowance,
            batch_size,
            interval,
        }
    }

    async fn settle(&self, job: &RelayJob) -> RelayerResult<()> {
        // a broadcast from an earlier cycle is resolved before anything is resubmitted
        match reconcile(self.submitter.as_ref(), job).await? {
            Some(TxLookup::Mined(outcome)) => return self.conclude(job, outcome).await,
            Some(TxLookup::Reverted(reason)) => return self.reject(job, reason).await,
            Some(TxLookup::Pending) => return Ok(()),
            Some(TxLookup::Dropped) | None => {}
        }

        let attestation = job.attestation.clone().ok_or_else(|| {
            RelayerError::Internal(format!(
                "ready job {}/{} has no attestation",
                job.source_chain_id, job.nonce
            ))
        })?;
        let lease = self.signers.acquire().await?;

        let bootstrap = !self
            .store
            .has_samples(&SampleQuery::settlement(job.source_chain_id, job.call_kind))
            .await?;
        let fee_budget = if bootstrap {
            info!(
                source_chain_id = job.source_chain_id,
                call_kind = %job.call_kind,
                "No settlement history, offering bootstrap allowance"
            );
            self.bootstrap_allowance
        } else {
            self.estimator
                .amount_of(self.core_chain_id, job.relay_fee_requested)
                .await?
        };

        let mut request = SubmitRequest {
            call_kind: job.call_kind,
            attestation,
            fee_budget,
        };
        let Some(mut outcome) = self.submit(job, &request, &lease).await? else {
            return Ok(());
        };

        if !outcome.executed && !bootstrap && self.unseen_variant(job, outcome.variant).await? {
            info!(
                source_chain_id = job.source_chain_id,
                nonce = job.nonce,
                variant = ?outcome.variant,
                "Fee declined for an unsampled variant, retrying with bootstrap allowance"
            );
            request.fee_budget = self.bootstrap_allowance;
            outcome = match self.submit(job, &request, &lease).await? {
                Some(outcome) => outcome,
                None => return Ok(()),
            };
        }
        drop(lease);

        self.conclude(job, outcome).await
    }

    /// Record a mined settlement: a declined fee fails the job, an executed
    /// call writes its gas sample and settles it
    async fn conclude(&self, job: &RelayJob, outcome: SubmissionOutcome) -> RelayerResult<()> {
        if !outcome.executed {
            warn!(
                source_chain_id = job.source_chain_id,
                nonce = job.nonce,
                tx = %outcome.tx_id,
                "Core declined the offered fee"
            );
            crate::metrics::record_submission_result(self.core_chain_id, GasRole::Settlement, "declined");
            apply_transition(
                self.store.as_ref(),
                job,
                &Transition::settlement_failed(FEE_DECLINED_REASON, Some(outcome.tx_id)),
            )
            .await?;
            return Ok(());
        }

        self.record_sample(job, &outcome).await?;
        let core_cost = self.estimator.value_of(self.core_chain_id, outcome.cost).await?;
        let settled = Transition::settled(
            job.call_kind,
            outcome.tx_id.clone(),
            core_cost,
            job.relay_fee_requested,
        );
        if apply_transition(self.store.as_ref(), job, &settled).await? {
            info!(
                source_chain_id = job.source_chain_id,
                nonce = job.nonce,
                tx = %outcome.tx_id,
                status = %settled.to,
                "Settled on core chain"
            );
        }
        crate::metrics::record_submission_result(self.core_chain_id, GasRole::Settlement, "executed");
        Ok(())
    }

    /// Submit once. A business rejection fails the job and yields `None`.
    async fn submit(
        &self,
        job: &RelayJob,
        request: &SubmitRequest,
        lease: &SignerLease,
    ) -> RelayerResult<Option<SubmissionOutcome>> {
        match self.submitter.submit(request, lease.wallet()).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(RelayerError::Rejected { reason, .. }) => {
                self.reject(job, reason).await?;
                Ok(None)
            }
            Err(RelayerError::Unconfirmed { chain_id, tx_id }) => {
                self.store
                    .set_pending_tx(job.source_chain_id, job.nonce, job.status, &tx_id)
                    .await?;
                Err(RelayerError::Unconfirmed { chain_id, tx_id })
            }
            Err(e) => Err(e),
        }
    }

    async fn reject(&self, job: &RelayJob, reason: String) -> RelayerResult<()> {
        warn!(
            source_chain_id = job.source_chain_id,
            nonce = job.nonce,
            "Settlement rejected: {}", reason
        );
        crate::metrics::record_submission_result(self.core_chain_id, GasRole::Settlement, "rejected");
        apply_transition(
            self.store.as_ref(),
            job,
            &Transition::settlement_failed(reason, None),
        )
        .await?;
        Ok(())
    }

    async fn unseen_variant(&self, job: &RelayJob, variant: Option<u32>) -> RelayerResult<bool> {
        let Some(variant) = variant.filter(|_| job.call_kind.tracks_variant()) else {
            return Ok(false);
        };
        let query = SampleQuery::settlement(job.source_chain_id, job.call_kind).with_variant(Some(variant));
        Ok(!self.store.has_samples(&query).await?)
    }

    async fn record_sample(&self, job: &RelayJob, outcome: &SubmissionOutcome) -> RelayerResult<()> {
        self.store
            .record(&GasUsageSample {
                source_chain_id: job.source_chain_id,
                destination_chain_id: self.core_chain_id,
                call_kind: job.call_kind,
                variant: outcome.variant,
                nonce: job.nonce,
                gas_used: outcome.gas_used,
                role: GasRole::Settlement,
                created_at: Utc::now(),
            })
            .await?;
        crate::metrics::record_gas_sample(GasRole::Settlement, job.call_kind);
        Ok(())
    }
}

#[async_trait]
impl Worker for CoreExecutor {
    fn name(&self) -> String {
        "core-executor".to_string()
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> RelayerResult<()> {
        let jobs = self
            .store
            .find_by_status(&JobFilter::new(JobStatus::Ready, self.batch_size))
            .await?;

        for job in jobs {
            if let Err(e) = self.settle(&job).await {
                if matches!(e, RelayerError::SignerPoolClosed) {
                    return Err(e);
                }
                match e.class() {
                    ErrorClass::InsufficientBalance => warn!(
                        source_chain_id = job.source_chain_id,
                        nonce = job.nonce,
                        "Job left ready: {}", e
                    ),
                    _ => warn!(
                        source_chain_id = job.source_chain_id,
                        nonce = job.nonce,
                        "Settlement attempt failed, will retry: {}", e
                    ),
                }
            }
        }
        Ok(())
    }
}
