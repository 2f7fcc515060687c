//! PostgreSQL store

use super::{CheckpointStore, GasLedger, JobFilter, JobRepository, SampleQuery};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::job::{CallKind, GasUsageSample, JobStatus, RelayJob, Transition, FEE_DECLINED_REASON};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info};

const JOB_COLUMNS: &str = r#"
    id, source_chain_id, nonce, sequence, emitter, call_kind, status, source_tx_id,
    block_number, attestation, relay_fee_amount, relay_fee_requested, relay_fee_settled,
    core_cost, payout_cost, core_tx_id, payout_chain_id, payout_address, payout_sequence,
    payout_attestation, payout_tx_id, pending_tx_id, failure_reason, created_at, updated_at,
    completed_at
"#;

const SAMPLE_FILTER: &str = r#"
    role = $1 AND source_chain_id = $2 AND call_kind = $3
    AND ($4::INTEGER IS NULL OR destination_chain_id = $4)
    AND ($5::BIGINT IS NULL OR variant = $5)
"#;

/// Store backed by PostgreSQL
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables and indexes if missing
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relay_jobs (
                id UUID PRIMARY KEY,
                source_chain_id INTEGER NOT NULL,
                nonce BIGINT NOT NULL,
                sequence BIGINT NOT NULL,
                emitter VARCHAR(66) NOT NULL,
                call_kind VARCHAR(32) NOT NULL,
                status VARCHAR(32) NOT NULL,
                source_tx_id VARCHAR(66) NOT NULL,
                block_number BIGINT NOT NULL,
                attestation BYTEA,
                relay_fee_amount TEXT NOT NULL,
                relay_fee_requested DOUBLE PRECISION NOT NULL,
                relay_fee_settled DOUBLE PRECISION,
                core_cost DOUBLE PRECISION,
                payout_cost DOUBLE PRECISION,
                core_tx_id VARCHAR(66),
                payout_chain_id INTEGER,
                payout_address VARCHAR(130),
                payout_sequence BIGINT,
                payout_attestation BYTEA,
                payout_tx_id VARCHAR(66),
                pending_tx_id VARCHAR(66),
                failure_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                UNIQUE (source_chain_id, nonce)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("ALTER TABLE relay_jobs ADD COLUMN IF NOT EXISTS pending_tx_id VARCHAR(66)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_status_block
            ON relay_jobs (status, block_number)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_status_created
            ON relay_jobs (status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_sequence
            ON relay_jobs (source_chain_id, sequence)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gas_samples (
                id BIGSERIAL PRIMARY KEY,
                role VARCHAR(16) NOT NULL,
                source_chain_id INTEGER NOT NULL,
                destination_chain_id INTEGER NOT NULL,
                call_kind VARCHAR(32) NOT NULL,
                variant BIGINT,
                nonce BIGINT NOT NULL,
                gas_used BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_samples_key
            ON gas_samples (role, source_chain_id, call_kind, nonce DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                chain_id INTEGER NOT NULL,
                stream VARCHAR(16) NOT NULL,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain_id, stream)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> RelayerResult<RelayJob> {
    let call_kind: String = row.try_get("call_kind")?;
    let status: String = row.try_get("status")?;
    let fee_amount: String = row.try_get("relay_fee_amount")?;

    Ok(RelayJob {
        id: row.try_get("id")?,
        source_chain_id: row.try_get::<i32, _>("source_chain_id")? as u16,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        emitter: row.try_get("emitter")?,
        call_kind: call_kind.parse()?,
        status: status.parse()?,
        source_tx_id: row.try_get("source_tx_id")?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        attestation: row.try_get("attestation")?,
        relay_fee_amount: fee_amount
            .parse()
            .map_err(|e| RelayerError::Store(format!("relay_fee_amount {}: {}", fee_amount, e)))?,
        relay_fee_requested: row.try_get("relay_fee_requested")?,
        relay_fee_settled: row.try_get("relay_fee_settled")?,
        core_cost: row.try_get("core_cost")?,
        payout_cost: row.try_get("payout_cost")?,
        core_tx_id: row.try_get("core_tx_id")?,
        payout_chain_id: row
            .try_get::<Option<i32>, _>("payout_chain_id")?
            .map(|c| c as u16),
        payout_address: row.try_get("payout_address")?,
        payout_sequence: row
            .try_get::<Option<i64>, _>("payout_sequence")?
            .map(|s| s as u64),
        payout_attestation: row.try_get("payout_attestation")?,
        payout_tx_id: row.try_get("payout_tx_id")?,
        pending_tx_id: row.try_get("pending_tx_id")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn sample_from_row(row: &PgRow) -> RelayerResult<GasUsageSample> {
    let call_kind: String = row.try_get("call_kind")?;
    let role: String = row.try_get("role")?;

    Ok(GasUsageSample {
        source_chain_id: row.try_get::<i32, _>("source_chain_id")? as u16,
        destination_chain_id: row.try_get::<i32, _>("destination_chain_id")? as u16,
        call_kind: call_kind.parse()?,
        variant: row.try_get::<Option<i64>, _>("variant")?.map(|v| v as u32),
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        gas_used: row.try_get::<i64, _>("gas_used")? as u64,
        role: role.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl JobRepository for PgStore {
    async fn insert(&self, job: &RelayJob) -> RelayerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO relay_jobs
                (id, source_chain_id, nonce, sequence, emitter, call_kind, status, source_tx_id,
                 block_number, attestation, relay_fee_amount, relay_fee_requested,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (source_chain_id, nonce) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.source_chain_id as i32)
        .bind(job.nonce as i64)
        .bind(job.sequence as i64)
        .bind(&job.emitter)
        .bind(job.call_kind.as_str())
        .bind(job.status.as_str())
        .bind(&job.source_tx_id)
        .bind(job.block_number as i64)
        .bind(&job.attestation)
        .bind(job.relay_fee_amount.to_string())
        .bind(job.relay_fee_requested)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, source_chain_id: u16, nonce: u64) -> RelayerResult<Option<RelayJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM relay_jobs WHERE source_chain_id = $1 AND nonce = $2",
            JOB_COLUMNS
        ))
        .bind(source_chain_id as i32)
        .bind(nonce as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_by_status(&self, filter: &JobFilter) -> RelayerResult<Vec<RelayJob>> {
        let order = if filter.orders_by_block() {
            "block_number ASC, nonce ASC"
        } else {
            "created_at ASC, source_chain_id ASC, nonce ASC"
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM relay_jobs
            WHERE status = $1
              AND ($2::INTEGER IS NULL OR source_chain_id = $2)
              AND ($3::INTEGER IS NULL OR payout_chain_id = $3)
            ORDER BY {}
            LIMIT $4
            "#,
            JOB_COLUMNS, order
        ))
        .bind(filter.status.as_str())
        .bind(filter.source_chain_id.map(|c| c as i32))
        .bind(filter.payout_chain_id.map(|c| c as i32))
        .bind(filter.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn transition(
        &self,
        source_chain_id: u16,
        nonce: u64,
        transition: &Transition,
    ) -> RelayerResult<bool> {
        transition.validate()?;
        let patch = &transition.patch;

        let result = sqlx::query(
            r#"
            UPDATE relay_jobs SET
                status = $1,
                attestation = COALESCE($2, attestation),
                relay_fee_settled = COALESCE($3, relay_fee_settled),
                core_cost = COALESCE($4, core_cost),
                core_tx_id = COALESCE($5, core_tx_id),
                payout_chain_id = COALESCE($6, payout_chain_id),
                payout_address = COALESCE($7, payout_address),
                payout_sequence = COALESCE($8, payout_sequence),
                payout_attestation = COALESCE($9, payout_attestation),
                payout_tx_id = COALESCE($10, payout_tx_id),
                payout_cost = COALESCE($11, payout_cost),
                failure_reason = COALESCE($12, failure_reason),
                pending_tx_id = NULL,
                updated_at = NOW(),
                completed_at = CASE WHEN $13 THEN NOW() ELSE completed_at END
            WHERE source_chain_id = $14 AND nonce = $15 AND status = $16
            "#,
        )
        .bind(transition.to.as_str())
        .bind(&patch.attestation)
        .bind(patch.relay_fee_settled)
        .bind(patch.core_cost)
        .bind(&patch.core_tx_id)
        .bind(patch.payout_chain_id.map(|c| c as i32))
        .bind(&patch.payout_address)
        .bind(patch.payout_sequence.map(|s| s as i64))
        .bind(&patch.payout_attestation)
        .bind(&patch.payout_tx_id)
        .bind(patch.payout_cost)
        .bind(&patch.failure_reason)
        .bind(transition.to.is_terminal())
        .bind(source_chain_id as i32)
        .bind(nonce as i64)
        .bind(transition.from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_pending_tx(
        &self,
        source_chain_id: u16,
        nonce: u64,
        status: JobStatus,
        tx_id: &str,
    ) -> RelayerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE relay_jobs SET pending_tx_id = $1, updated_at = NOW()
            WHERE source_chain_id = $2 AND nonce = $3 AND status = $4
            "#,
        )
        .bind(tx_id)
        .bind(source_chain_id as i32)
        .bind(nonce as i64)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn latest_block(&self, source_chain_id: u16) -> RelayerResult<Option<u64>> {
        let row = sqlx::query(
            "SELECT MAX(block_number) AS block_number FROM relay_jobs WHERE source_chain_id = $1",
        )
        .bind(source_chain_id as i32)
        .fetch_one(&self.pool)
        .await?;

        Ok(row
            .try_get::<Option<i64>, _>("block_number")?
            .map(|b| b as u64))
    }

    async fn list_unrelayed(
        &self,
        source_chain_id: Option<u16>,
        call_kind: Option<CallKind>,
        limit: Option<usize>,
    ) -> RelayerResult<Vec<RelayJob>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM relay_jobs
            WHERE status = $1 AND failure_reason = $2
              AND ($3::INTEGER IS NULL OR source_chain_id = $3)
              AND ($4::VARCHAR IS NULL OR call_kind = $4)
            ORDER BY block_number DESC
            LIMIT $5
            "#,
            JOB_COLUMNS
        ))
        .bind(JobStatus::Failed.as_str())
        .bind(FEE_DECLINED_REASON)
        .bind(source_chain_id.map(|c| c as i32))
        .bind(call_kind.map(|k| k.as_str()))
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn find_by_sequence(
        &self,
        source_chain_id: u16,
        sequence: u64,
    ) -> RelayerResult<Option<RelayJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM relay_jobs WHERE source_chain_id = $1 AND sequence = $2 LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(source_chain_id as i32)
        .bind(sequence as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn status_counts(&self) -> RelayerResult<HashMap<JobStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM relay_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            counts.insert(status.parse()?, row.try_get::<i64, _>("count")? as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl GasLedger for PgStore {
    async fn record(&self, sample: &GasUsageSample) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO gas_samples
                (role, source_chain_id, destination_chain_id, call_kind, variant, nonce, gas_used, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(sample.role.as_str())
        .bind(sample.source_chain_id as i32)
        .bind(sample.destination_chain_id as i32)
        .bind(sample.call_kind.as_str())
        .bind(sample.variant.map(|v| v as i64))
        .bind(sample.nonce as i64)
        .bind(sample.gas_used as i64)
        .bind(sample.created_at)
        .execute(&self.pool)
        .await?;

        debug!(
            role = sample.role.as_str(),
            source_chain_id = sample.source_chain_id,
            call_kind = %sample.call_kind,
            gas_used = sample.gas_used,
            "Recorded gas sample"
        );
        Ok(())
    }

    async fn has_samples(&self, query: &SampleQuery) -> RelayerResult<bool> {
        let row = sqlx::query(&format!(
            "SELECT EXISTS (SELECT 1 FROM gas_samples WHERE {}) AS present",
            SAMPLE_FILTER
        ))
        .bind(query.role.as_str())
        .bind(query.source_chain_id as i32)
        .bind(query.call_kind.as_str())
        .bind(query.destination_chain_id.map(|d| d as i32))
        .bind(query.variant.map(|v| v as i64))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("present")?)
    }

    async fn recent(&self, query: &SampleQuery, limit: usize) -> RelayerResult<Vec<GasUsageSample>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM gas_samples WHERE {} ORDER BY nonce DESC LIMIT $6",
            SAMPLE_FILTER
        ))
        .bind(query.role.as_str())
        .bind(query.source_chain_id as i32)
        .bind(query.call_kind.as_str())
        .bind(query.destination_chain_id.map(|d| d as i32))
        .bind(query.variant.map(|v| v as i64))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(sample_from_row).collect()
    }

    async fn max_sample(&self, query: &SampleQuery) -> RelayerResult<Option<GasUsageSample>> {
        let row = sqlx::query(&format!(
            "SELECT * FROM gas_samples WHERE {} ORDER BY gas_used DESC LIMIT 1",
            SAMPLE_FILTER
        ))
        .bind(query.role.as_str())
        .bind(query.source_chain_id as i32)
        .bind(query.call_kind.as_str())
        .bind(query.destination_chain_id.map(|d| d as i32))
        .bind(query.variant.map(|v| v as i64))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(sample_from_row).transpose()
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn get_checkpoint(&self, chain_id: u16, stream: &str) -> RelayerResult<Option<u64>> {
        let row = sqlx::query(
            "SELECT block_number FROM chain_checkpoints WHERE chain_id = $1 AND stream = $2",
        )
        .bind(chain_id as i32)
        .bind(stream)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get::<i64, _>("block_number").map(|b| b as u64))
            .transpose()
            .map_err(RelayerError::from)
    }

    async fn save_checkpoint(&self, chain_id: u16, stream: &str, block_number: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (chain_id, stream, block_number, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (chain_id, stream)
            DO UPDATE SET block_number = $3, updated_at = NOW()
            "#,
        )
        .bind(chain_id as i32)
        .bind(stream)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved {} checkpoint for chain {}: block {}", stream, chain_id, block_number);
        Ok(())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
