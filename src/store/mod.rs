//! Durable store for relay jobs, gas samples and watcher checkpoints
//!
//! Workers coordinate only through these repositories. Status changes go
//! through [`JobRepository::transition`], which validates the edge and
//! applies it as a compare-and-set on the stored status.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::RelayerResult;
use crate::job::{CallKind, GasRole, GasUsageSample, JobStatus, RelayJob, Transition};

use async_trait::async_trait;
use std::collections::HashMap;

/// Checkpoint stream of a chain's relay event watcher
pub const RELAY_STREAM: &str = "relay";
/// Checkpoint stream of the core chain's payout request watcher
pub const PAYOUT_STREAM: &str = "payout";
/// Block before the oldest payout request still waiting for its settlement
pub const PAYOUT_RETRY_STREAM: &str = "payout_retry";

/// Status-filtered job query, oldest first.
///
/// Block heights only order jobs of one chain. A filter pinned to a source
/// chain is ordered by block; otherwise jobs are ordered by event time.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: JobStatus,
    pub source_chain_id: Option<u16>,
    pub payout_chain_id: Option<u16>,
    pub limit: usize,
}

impl JobFilter {
    pub fn new(status: JobStatus, limit: usize) -> Self {
        Self {
            status,
            source_chain_id: None,
            payout_chain_id: None,
            limit,
        }
    }

    pub fn source(mut self, chain_id: u16) -> Self {
        self.source_chain_id = Some(chain_id);
        self
    }

    pub fn payout(mut self, chain_id: u16) -> Self {
        self.payout_chain_id = Some(chain_id);
        self
    }

    pub fn orders_by_block(&self) -> bool {
        self.source_chain_id.is_some()
    }

    pub fn matches(&self, job: &RelayJob) -> bool {
        job.status == self.status
            && self.source_chain_id.map_or(true, |c| job.source_chain_id == c)
            && self.payout_chain_id.map_or(true, |c| job.payout_chain_id == Some(c))
    }
}

/// Key of a gas sample lookup.
///
/// `destination_chain_id` and `variant` only narrow the query when set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleQuery {
    pub role: GasRole,
    pub source_chain_id: u16,
    pub destination_chain_id: Option<u16>,
    pub call_kind: CallKind,
    pub variant: Option<u32>,
}

impl SampleQuery {
    pub fn settlement(source_chain_id: u16, call_kind: CallKind) -> Self {
        Self {
            role: GasRole::Settlement,
            source_chain_id,
            destination_chain_id: None,
            call_kind,
            variant: None,
        }
    }

    pub fn payout(source_chain_id: u16, destination_chain_id: u16, call_kind: CallKind) -> Self {
        Self {
            role: GasRole::Payout,
            source_chain_id,
            destination_chain_id: Some(destination_chain_id),
            call_kind,
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: Option<u32>) -> Self {
        self.variant = variant;
        self
    }

    pub fn matches(&self, sample: &GasUsageSample) -> bool {
        sample.role == self.role
            && sample.source_chain_id == self.source_chain_id
            && sample.call_kind == self.call_kind
            && self
                .destination_chain_id
                .map_or(true, |d| sample.destination_chain_id == d)
            && self.variant.map_or(true, |v| sample.variant == Some(v))
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new job. Returns `false` if `(source_chain_id, nonce)` is
    /// already recorded.
    async fn insert(&self, job: &RelayJob) -> RelayerResult<bool>;

    async fn find(&self, source_chain_id: u16, nonce: u64) -> RelayerResult<Option<RelayJob>>;

    async fn find_by_status(&self, filter: &JobFilter) -> RelayerResult<Vec<RelayJob>>;

    /// Apply a transition if the stored status still equals
    /// `transition.from`. Returns whether a row changed; a lost race is
    /// `Ok(false)`. A `(from, to)` pair that is not an edge of the state
    /// machine is an `InvalidStateTransition` error, checked before the store
    /// is touched.
    async fn transition(
        &self,
        source_chain_id: u16,
        nonce: u64,
        transition: &Transition,
    ) -> RelayerResult<bool>;

    /// Remember the broadcast transaction of the job's current leg while its
    /// receipt is outstanding. Only written if the job is still in `status`.
    async fn set_pending_tx(
        &self,
        source_chain_id: u16,
        nonce: u64,
        status: JobStatus,
        tx_id: &str,
    ) -> RelayerResult<bool>;

    /// Highest block number among a chain's recorded jobs
    async fn latest_block(&self, source_chain_id: u16) -> RelayerResult<Option<u64>>;

    /// Jobs whose settlement was declined for an insufficient fee, newest first
    async fn list_unrelayed(
        &self,
        source_chain_id: Option<u16>,
        call_kind: Option<CallKind>,
        limit: Option<usize>,
    ) -> RelayerResult<Vec<RelayJob>>;

    async fn find_by_sequence(
        &self,
        source_chain_id: u16,
        sequence: u64,
    ) -> RelayerResult<Option<RelayJob>>;

    async fn status_counts(&self) -> RelayerResult<HashMap<JobStatus, u64>>;
}

#[async_trait]
pub trait GasLedger: Send + Sync {
    async fn record(&self, sample: &GasUsageSample) -> RelayerResult<()>;

    async fn has_samples(&self, query: &SampleQuery) -> RelayerResult<bool>;

    /// Most recent samples by source nonce, newest first
    async fn recent(&self, query: &SampleQuery, limit: usize) -> RelayerResult<Vec<GasUsageSample>>;

    /// Sample with the highest gas used
    async fn max_sample(&self, query: &SampleQuery) -> RelayerResult<Option<GasUsageSample>>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, chain_id: u16, stream: &str) -> RelayerResult<Option<u64>>;

    async fn save_checkpoint(&self, chain_id: u16, stream: &str, block_number: u64) -> RelayerResult<()>;

    async fn health_check(&self) -> RelayerResult<()>;
}

/// Everything a worker needs from persistence
pub trait Store: JobRepository + GasLedger + CheckpointStore {}

impl<T: JobRepository + GasLedger + CheckpointStore> Store for T {}

/// Move the job and report a lost race at debug level
pub async fn apply_transition<S: JobRepository + ?Sized>(
    store: &S,
    job: &RelayJob,
    transition: &Transition,
) -> RelayerResult<bool> {
    let changed = store
        .transition(job.source_chain_id, job.nonce, transition)
        .await?;
    if changed {
        crate::metrics::record_transition(transition.to);
    } else {
        tracing::debug!(
            source_chain_id = job.source_chain_id,
            nonce = job.nonce,
            from = %transition.from,
            to = %transition.to,
            "Transition skipped, job no longer in expected state"
        );
    }
    Ok(changed)
}
