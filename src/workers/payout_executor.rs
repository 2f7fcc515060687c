//! Delivers payouts on one destination chain

use super::{reconcile, SignerGate, Worker};
use crate::error::{RelayerError, RelayerResult};
use crate::fees::FeeEstimator;
use crate::job::{GasRole, GasUsageSample, JobStatus, RelayJob, Transition};
use crate::store::{apply_transition, JobFilter, Store};
use crate::tx::{AccountRotator, SubmissionOutcome, SubmitRequest, Submitter, TxLookup};

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct PayoutExecutor {
    chain_id: u16,
    store: Arc<dyn Store>,
    submitter: Arc<dyn Submitter>,
    estimator: Arc<FeeEstimator>,
    signers: SignerGate,
    batch_size: usize,
    interval: Duration,
}

impl PayoutExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        submitter: Arc<dyn Submitter>,
        rotator: Arc<AccountRotator>,
        estimator: Arc<FeeEstimator>,
        min_balance: u128,
        batch_size: usize,
        interval: Duration,
    ) -> Self {
        let chain_id = submitter.chain_id();
        Self {
            chain_id,
            signers: SignerGate {
                chain_id,
                rotator,
                submitter: submitter.clone(),
                estimator: estimator.clone(),
                min_balance,
            },
            store,
            submitter,
            estimator,
            batch_size,
            interval,
        }
    }

    async fn pay_out(&self, job: &RelayJob) -> RelayerResult<()> {
        let fee_budget = self
            .estimator
            .amount_of(self.chain_id, job.payout_budget_value())
            .await?;

        match reconcile(self.submitter.as_ref(), job).await? {
            Some(TxLookup::Mined(outcome)) => return self.conclude(job, outcome, fee_budget).await,
            Some(TxLookup::Reverted(reason)) => return self.reject(job, reason).await,
            Some(TxLookup::Pending) => return Ok(()),
            Some(TxLookup::Dropped) | None => {}
        }

        let attestation = job.payout_attestation.clone().ok_or_else(|| {
            RelayerError::Internal(format!(
                "payout job {}/{} has no payout attestation",
                job.source_chain_id, job.nonce
            ))
        })?;

        let lease = self.signers.acquire().await?;
        let request = SubmitRequest {
            call_kind: job.call_kind,
            attestation,
            fee_budget,
        };
        let outcome = match self.submitter.submit(&request, lease.wallet()).await {
            Ok(outcome) => outcome,
            Err(RelayerError::Rejected { reason, .. }) => return self.reject(job, reason).await,
            Err(RelayerError::Unconfirmed { chain_id, tx_id }) => {
                self.store
                    .set_pending_tx(job.source_chain_id, job.nonce, job.status, &tx_id)
                    .await?;
                return Err(RelayerError::Unconfirmed { chain_id, tx_id });
            }
            Err(e) => return Err(e),
        };
        drop(lease);

        self.conclude(job, outcome, fee_budget).await
    }

    async fn conclude(&self, job: &RelayJob, outcome: SubmissionOutcome, fee_budget: u128) -> RelayerResult<()> {
        self.store
            .record(&GasUsageSample {
                source_chain_id: job.source_chain_id,
                destination_chain_id: self.chain_id,
                call_kind: job.call_kind,
                variant: None,
                nonce: job.nonce,
                gas_used: outcome.gas_used,
                role: GasRole::Payout,
                created_at: Utc::now(),
            })
            .await?;
        crate::metrics::record_gas_sample(GasRole::Payout, job.call_kind);

        if outcome.cost > fee_budget {
            warn!(
                chain_id = self.chain_id,
                source_chain_id = job.source_chain_id,
                nonce = job.nonce,
                "Payout cost {} exceeded the remaining fee budget {}",
                outcome.cost,
                fee_budget
            );
            crate::metrics::record_payout_shortfall(self.chain_id);
        }

        let payout_cost = self.estimator.value_of(self.chain_id, outcome.cost).await?;
        if apply_transition(
            self.store.as_ref(),
            job,
            &Transition::paid_out(outcome.tx_id.clone(), payout_cost),
        )
        .await?
        {
            info!(
                chain_id = self.chain_id,
                source_chain_id = job.source_chain_id,
                nonce = job.nonce,
                tx = %outcome.tx_id,
                "Payout delivered"
            );
        }
        crate::metrics::record_submission_result(self.chain_id, GasRole::Payout, "executed");
        Ok(())
    }

    async fn reject(&self, job: &RelayJob, reason: String) -> RelayerResult<()> {
        warn!(
            chain_id = self.chain_id,
            source_chain_id = job.source_chain_id,
            nonce = job.nonce,
            "Payout rejected: {}", reason
        );
        crate::metrics::record_submission_result(self.chain_id, GasRole::Payout, "rejected");
        apply_transition(self.store.as_ref(), job, &Transition::payout_failed(reason)).await?;
        Ok(())
    }
}

#[async_trait]
impl Worker for PayoutExecutor {
    fn name(&self) -> String {
        format!("payout-executor-{}", self.chain_id)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> RelayerResult<()> {
        let filter = JobFilter::new(JobStatus::PayoutPending, self.batch_size).payout(self.chain_id);
        let jobs = self.store.find_by_status(&filter).await?;

        for job in jobs {
            if let Err(e) = self.pay_out(&job).await {
                if matches!(e, RelayerError::SignerPoolClosed) {
                    return Err(e);
                }
                warn!(
                    chain_id = self.chain_id,
                    source_chain_id = job.source_chain_id,
                    nonce = job.nonce,
                    "Payout attempt failed, will retry: {}", e
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::fixtures::relay_event;
    use crate::job::CallKind;
    use crate::store::{GasLedger, JobRepository, MemoryStore, SampleQuery};
    use crate::tx::MockSubmitter;
    use crate::workers::testing::*;

    fn executor(store: Arc<MemoryStore>, submitter: MockSubmitter) -> PayoutExecutor {
        PayoutExecutor::new(
            store.clone(),
            Arc::new(submitter),
            rotator(),
            estimator(store),
            1_000,
            10,
            Duration::from_millis(10),
        )
    }

    /// Withdraw job linked to a payout on `payout_chain_id`, with 1 USD
    /// settled and 0.2 USD spent on the core chain
    async fn pending_job(store: &MemoryStore, nonce: u64, payout_chain_id: u16) {
        let job = RelayJob::from_event(&relay_event(POLYGON, nonce, nonce, 1), CallKind::Withdraw, 1.0, Some(vec![1]));
        store.insert(&job).await.unwrap();
        store
            .transition(POLYGON, nonce, &Transition::settled(CallKind::Withdraw, "0xcore".into(), 0.2, 1.0))
            .await
            .unwrap();
        store
            .transition(
                POLYGON,
                nonce,
                &Transition::payout_linked(payout_chain_id, "0xb0".into(), 900 + nonce, vec![0xbb]),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_payout_success() {
        let store = Arc::new(MemoryStore::new());
        pending_job(&store, 1, ARBITRUM).await;

        let mut submitter = funded_submitter(ARBITRUM);
        // 0.8 USD left at 2000 USD per eth
        submitter
            .expect_submit()
            .withf(|request, _| request.fee_budget.abs_diff(400_000_000_000_000) <= 1 && request.attestation == vec![0xbb])
            .times(1)
            .returning(|_, _| {
                Ok(crate::tx::SubmissionOutcome {
                    tx_id: "0xpayout".to_string(),
                    gas_used: 100_000,
                    cost: 100_000_000_000_000,
                    executed: true,
                    variant: None,
                })
            });

        executor(store.clone(), submitter).run_once().await.unwrap();

        let job = store.find(POLYGON, 1).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.payout_tx_id.as_deref(), Some("0xpayout"));
        assert!((job.payout_cost.unwrap() - 0.2).abs() < 1e-9);
        assert!(store
            .has_samples(&SampleQuery::payout(POLYGON, ARBITRUM, CallKind::Withdraw))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_only_own_chain_jobs() {
        let store = Arc::new(MemoryStore::new());
        pending_job(&store, 1, POLYGON).await;

        let mut submitter = funded_submitter(ARBITRUM);
        submitter.expect_submit().never();

        executor(store.clone(), submitter).run_once().await.unwrap();
        assert_eq!(
            store.find(POLYGON, 1).await.unwrap().unwrap().status,
            JobStatus::PayoutPending
        );
    }

    #[tokio::test]
    async fn test_rejected_payout_fails_job() {
        let store = Arc::new(MemoryStore::new());
        pending_job(&store, 1, ARBITRUM).await;

        let mut submitter = funded_submitter(ARBITRUM);
        submitter.expect_submit().times(1).returning(|_, _| {
            Err(RelayerError::Rejected {
                chain_id: ARBITRUM,
                reason: "already paid".to_string(),
            })
        });

        executor(store.clone(), submitter).run_once().await.unwrap();

        let job = store.find(POLYGON, 1).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("already paid"));
        assert_eq!(store.sample_count().await, 0);
    }

    #[tokio::test]
    async fn test_shortfall_still_completes() {
        let store = Arc::new(MemoryStore::new());
        pending_job(&store, 1, ARBITRUM).await;

        let mut submitter = funded_submitter(ARBITRUM);
        submitter.expect_submit().times(1).returning(|_, _| {
            Ok(crate::tx::SubmissionOutcome {
                tx_id: "0xexpensive".to_string(),
                gas_used: 300_000,
                cost: 1_000_000_000_000_000,
                executed: true,
                variant: None,
            })
        });

        executor(store.clone(), submitter).run_once().await.unwrap();
        let job = store.find(POLYGON, 1).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert!(job.payout_cost.unwrap() > job.payout_budget_value());
    }

    #[tokio::test]
    async fn test_timed_out_payout_is_reconciled() {
        let store = Arc::new(MemoryStore::new());
        pending_job(&store, 1, ARBITRUM).await;

        let mut submitter = funded_submitter(ARBITRUM);
        submitter.expect_submit().times(1).returning(|_, _| {
            Err(RelayerError::Unconfirmed {
                chain_id: ARBITRUM,
                tx_id: "0xslowpayout".to_string(),
            })
        });
        submitter.expect_lookup().times(1).returning(|tx_id| {
            Ok(TxLookup::Mined(crate::tx::SubmissionOutcome {
                tx_id: tx_id.to_string(),
                gas_used: 100_000,
                cost: 100_000_000_000_000,
                executed: true,
                variant: None,
            }))
        });
        let executor = executor(store.clone(), submitter);

        executor.run_once().await.unwrap();
        assert_eq!(
            store.find(POLYGON, 1).await.unwrap().unwrap().pending_tx_id.as_deref(),
            Some("0xslowpayout")
        );

        executor.run_once().await.unwrap();
        let job = store.find(POLYGON, 1).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.payout_tx_id.as_deref(), Some("0xslowpayout"));
        assert_eq!(store.sample_count().await, 1);
    }
}
