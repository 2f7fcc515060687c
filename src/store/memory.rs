//! In-memory store
//!
//! Backs tests and local runs. Jobs live in a DashMap keyed by identity, so
//! each compare-and-set holds the entry lock for the duration of the update.

use super::{CheckpointStore, GasLedger, JobFilter, JobRepository, SampleQuery};
use crate::error::RelayerResult;
use crate::job::{CallKind, GasUsageSample, JobStatus, RelayJob, Transition, FEE_DECLINED_REASON};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStore {
    jobs: DashMap<(u16, u64), RelayJob>,
    samples: RwLock<Vec<GasUsageSample>>,
    checkpoints: DashMap<(u16, String), u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded samples; used by scenario tests
    pub async fn sample_count(&self) -> usize {
        self.samples.read().await.len()
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert(&self, job: &RelayJob) -> RelayerResult<bool> {
        match self.jobs.entry((job.source_chain_id, job.nonce)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(true)
            }
        }
    }

    async fn find(&self, source_chain_id: u16, nonce: u64) -> RelayerResult<Option<RelayJob>> {
        Ok(self.jobs.get(&(source_chain_id, nonce)).map(|j| j.clone()))
    }

    async fn find_by_status(&self, filter: &JobFilter) -> RelayerResult<Vec<RelayJob>> {
        let mut jobs: Vec<RelayJob> = self
            .jobs
            .iter()
            .filter(|j| filter.matches(j.value()))
            .map(|j| j.value().clone())
            .collect();
        if filter.orders_by_block() {
            jobs.sort_by_key(|j| (j.block_number, j.nonce));
        } else {
            jobs.sort_by_key(|j| (j.created_at, j.source_chain_id, j.nonce));
        }
        jobs.truncate(filter.limit);
        Ok(jobs)
    }

    async fn transition(
        &self,
        source_chain_id: u16,
        nonce: u64,
        transition: &Transition,
    ) -> RelayerResult<bool> {
        transition.validate()?;
        Ok(self
            .jobs
            .get_mut(&(source_chain_id, nonce))
            .map(|mut job| transition.apply(&mut job))
            .unwrap_or(false))
    }

    async fn set_pending_tx(
        &self,
        source_chain_id: u16,
        nonce: u64,
        status: JobStatus,
        tx_id: &str,
    ) -> RelayerResult<bool> {
        Ok(match self.jobs.get_mut(&(source_chain_id, nonce)) {
            Some(mut job) if job.status == status => {
                job.pending_tx_id = Some(tx_id.to_string());
                job.updated_at = chrono::Utc::now();
                true
            }
            _ => false,
        })
    }

    async fn latest_block(&self, source_chain_id: u16) -> RelayerResult<Option<u64>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.source_chain_id == source_chain_id)
            .map(|j| j.block_number)
            .max())
    }

    async fn list_unrelayed(
        &self,
        source_chain_id: Option<u16>,
        call_kind: Option<CallKind>,
        limit: Option<usize>,
    ) -> RelayerResult<Vec<RelayJob>> {
        let mut jobs: Vec<RelayJob> = self
            .jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Failed
                    && j.failure_reason.as_deref() == Some(FEE_DECLINED_REASON)
                    && source_chain_id.map_or(true, |c| j.source_chain_id == c)
                    && call_kind.map_or(true, |k| j.call_kind == k)
            })
            .map(|j| j.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.block_number.cmp(&a.block_number));
        if let Some(limit) = limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn find_by_sequence(
        &self,
        source_chain_id: u16,
        sequence: u64,
    ) -> RelayerResult<Option<RelayJob>> {
        Ok(self
            .jobs
            .iter()
            .find(|j| j.source_chain_id == source_chain_id && j.sequence == sequence)
            .map(|j| j.value().clone()))
    }

    async fn status_counts(&self) -> RelayerResult<HashMap<JobStatus, u64>> {
        let mut counts = HashMap::new();
        for job in self.jobs.iter() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl GasLedger for MemoryStore {
    async fn record(&self, sample: &GasUsageSample) -> RelayerResult<()> {
        self.samples.write().await.push(sample.clone());
        Ok(())
    }

    async fn has_samples(&self, query: &SampleQuery) -> RelayerResult<bool> {
        Ok(self.samples.read().await.iter().any(|s| query.matches(s)))
    }

    async fn recent(&self, query: &SampleQuery, limit: usize) -> RelayerResult<Vec<GasUsageSample>> {
        let mut matching: Vec<GasUsageSample> = self
            .samples
            .read()
            .await
            .iter()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.nonce.cmp(&a.nonce));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn max_sample(&self, query: &SampleQuery) -> RelayerResult<Option<GasUsageSample>> {
        Ok(self
            .samples
            .read()
            .await
            .iter()
            .filter(|s| query.matches(s))
            .max_by_key(|s| s.gas_used)
            .cloned())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get_checkpoint(&self, chain_id: u16, stream: &str) -> RelayerResult<Option<u64>> {
        Ok(self
            .checkpoints
            .get(&(chain_id, stream.to_string()))
            .map(|c| *c))
    }

    async fn save_checkpoint(&self, chain_id: u16, stream: &str, block_number: u64) -> RelayerResult<()> {
        self.checkpoints
            .insert((chain_id, stream.to_string()), block_number);
        Ok(())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}
