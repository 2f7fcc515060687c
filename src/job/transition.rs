//! Relay job state machine
//!
//! ```text
//! awaiting_attestation -> ready
//! ready                -> success | awaiting_payout | failed
//! awaiting_payout      -> payout_pending
//! payout_pending       -> success | failed
//! ```
//!
//! Every update is a compare-and-set on the current status. Repositories call
//! [`Transition::validate`] before touching storage, so an edge outside the
//! graph never reaches the store.

use super::{CallKind, JobStatus, RelayJob};
use crate::error::{RelayerError, RelayerResult};

use chrono::Utc;

/// Whether `from -> to` is an edge of the job state machine
pub fn is_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (AwaitingAttestation, Ready)
            | (Ready, Success)
            | (Ready, AwaitingPayout)
            | (Ready, Failed)
            | (AwaitingPayout, PayoutPending)
            | (PayoutPending, Success)
            | (PayoutPending, Failed)
    )
}

/// Fields written together with a status change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub attestation: Option<Vec<u8>>,
    pub relay_fee_settled: Option<f64>,
    pub core_cost: Option<f64>,
    pub core_tx_id: Option<String>,
    pub payout_chain_id: Option<u16>,
    pub payout_address: Option<String>,
    pub payout_sequence: Option<u64>,
    pub payout_attestation: Option<Vec<u8>>,
    pub payout_tx_id: Option<String>,
    pub payout_cost: Option<f64>,
    pub failure_reason: Option<String>,
}

impl JobPatch {
    /// Apply the set fields onto a job; unset fields keep their value
    pub fn apply(&self, job: &mut RelayJob) {
        fn set<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *target = Some(v.clone());
            }
        }

        set(&mut job.attestation, &self.attestation);
        set(&mut job.relay_fee_settled, &self.relay_fee_settled);
        set(&mut job.core_cost, &self.core_cost);
        set(&mut job.core_tx_id, &self.core_tx_id);
        set(&mut job.payout_chain_id, &self.payout_chain_id);
        set(&mut job.payout_address, &self.payout_address);
        set(&mut job.payout_sequence, &self.payout_sequence);
        set(&mut job.payout_attestation, &self.payout_attestation);
        set(&mut job.payout_tx_id, &self.payout_tx_id);
        set(&mut job.payout_cost, &self.payout_cost);
        set(&mut job.failure_reason, &self.failure_reason);
    }
}

/// A conditional status update: `set status = to where status = from`
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub patch: JobPatch,
}

impl Transition {
    pub fn new(from: JobStatus, to: JobStatus, patch: JobPatch) -> Self {
        Self { from, to, patch }
    }

    /// Attestation obtained for a job that was waiting on it
    pub fn attested(attestation: Vec<u8>) -> Self {
        Self::new(
            JobStatus::AwaitingAttestation,
            JobStatus::Ready,
            JobPatch {
                attestation: Some(attestation),
                ..Default::default()
            },
        )
    }

    /// Settlement executed on the core chain
    pub fn settled(call_kind: CallKind, core_tx_id: String, core_cost: f64, fee_settled: f64) -> Self {
        let to = if call_kind.produces_payout() {
            JobStatus::AwaitingPayout
        } else {
            JobStatus::Success
        };
        Self::new(
            JobStatus::Ready,
            to,
            JobPatch {
                core_tx_id: Some(core_tx_id),
                core_cost: Some(core_cost),
                relay_fee_settled: Some(fee_settled),
                ..Default::default()
            },
        )
    }

    /// Settlement rejected or declined
    pub fn settlement_failed(reason: impl Into<String>, core_tx_id: Option<String>) -> Self {
        Self::new(
            JobStatus::Ready,
            JobStatus::Failed,
            JobPatch {
                failure_reason: Some(reason.into()),
                core_tx_id,
                ..Default::default()
            },
        )
    }

    /// Payout request observed on the core chain and its attestation fetched
    pub fn payout_linked(
        payout_chain_id: u16,
        payout_address: String,
        payout_sequence: u64,
        payout_attestation: Vec<u8>,
    ) -> Self {
        Self::new(
            JobStatus::AwaitingPayout,
            JobStatus::PayoutPending,
            JobPatch {
                payout_chain_id: Some(payout_chain_id),
                payout_address: Some(payout_address),
                payout_sequence: Some(payout_sequence),
                payout_attestation: Some(payout_attestation),
                ..Default::default()
            },
        )
    }

    pub fn paid_out(payout_tx_id: String, payout_cost: f64) -> Self {
        Self::new(
            JobStatus::PayoutPending,
            JobStatus::Success,
            JobPatch {
                payout_tx_id: Some(payout_tx_id),
                payout_cost: Some(payout_cost),
                ..Default::default()
            },
        )
    }

    pub fn payout_failed(reason: impl Into<String>) -> Self {
        Self::new(
            JobStatus::PayoutPending,
            JobStatus::Failed,
            JobPatch {
                failure_reason: Some(reason.into()),
                ..Default::default()
            },
        )
    }

    /// Reject transitions that are not edges of the state machine
    pub fn validate(&self) -> RelayerResult<()> {
        if is_allowed(self.from, self.to) {
            Ok(())
        } else {
            Err(RelayerError::InvalidStateTransition {
                from: self.from.to_string(),
                to: self.to.to_string(),
            })
        }
    }

    /// Apply to an in-memory job if its status matches `from`.
    /// Returns whether the job changed.
    pub fn apply(&self, job: &mut RelayJob) -> bool {
        if job.status != self.from {
            return false;
        }
        self.patch.apply(job);
        job.pending_tx_id = None;
        job.status = self.to;
        let now = Utc::now();
        job.updated_at = now;
        if self.to.is_terminal() {
            job.completed_at = Some(now);
        }
        true
    }
}
