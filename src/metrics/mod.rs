//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and watcher cursors
//! - Job ingestion and state transitions
//! - Settlement and payout submissions
//! - Signer balances and price feed values

use crate::error::{RelayerError, RelayerResult};
use crate::job::{CallKind, GasRole, JobStatus};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "xchain_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "xchain_relayer_chain_block_height",
        "Latest observed block height per chain",
        &["chain_id"]
    ).unwrap();

    pub static ref WATCHER_CURSOR: GaugeVec = register_gauge_vec!(
        "xchain_relayer_watcher_cursor",
        "Last block fully recorded by a watcher",
        &["chain_id", "stream"]
    ).unwrap();

    // Ingestion metrics
    pub static ref EVENTS_INGESTED: CounterVec = register_counter_vec!(
        "xchain_relayer_events_ingested_total",
        "Relay events recorded as new jobs",
        &["chain_id", "call_kind"]
    ).unwrap();

    pub static ref UNKNOWN_CALL_KINDS: CounterVec = register_counter_vec!(
        "xchain_relayer_unknown_call_kinds_total",
        "Relay events skipped for an unknown (app_id, call_type) pair",
        &["chain_id"]
    ).unwrap();

    pub static ref ATTESTATION_FETCHES: CounterVec = register_counter_vec!(
        "xchain_relayer_attestation_fetches_total",
        "Attestation fetch outcomes",
        &["outcome"]
    ).unwrap();

    // Job metrics
    pub static ref JOB_TRANSITIONS: CounterVec = register_counter_vec!(
        "xchain_relayer_job_transitions_total",
        "Applied job status transitions by target status",
        &["status"]
    ).unwrap();

    pub static ref JOBS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "xchain_relayer_jobs",
        "Jobs currently in each status",
        &["status"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "xchain_relayer_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref SUBMISSION_RESULTS: CounterVec = register_counter_vec!(
        "xchain_relayer_submission_results_total",
        "Settlement and payout results",
        &["chain_id", "role", "result"]
    ).unwrap();

    pub static ref GAS_SAMPLES: CounterVec = register_counter_vec!(
        "xchain_relayer_gas_samples_total",
        "Gas usage samples recorded",
        &["role", "call_kind"]
    ).unwrap();

    pub static ref PAYOUT_SHORTFALLS: CounterVec = register_counter_vec!(
        "xchain_relayer_payout_shortfalls_total",
        "Payouts whose cost exceeded the remaining fee budget",
        &["chain_id"]
    ).unwrap();

    // Wallet metrics
    pub static ref SIGNER_BALANCE: GaugeVec = register_gauge_vec!(
        "xchain_relayer_signer_balance",
        "Signer balance in whole gas tokens",
        &["chain_id", "signer"]
    ).unwrap();

    pub static ref INSUFFICIENT_BALANCE: CounterVec = register_counter_vec!(
        "xchain_relayer_insufficient_balance_total",
        "Submissions skipped for a low signer balance",
        &["chain_id"]
    ).unwrap();

    pub static ref TOKEN_PRICE: GaugeVec = register_gauge_vec!(
        "xchain_relayer_token_price_usd",
        "Last fetched gas token price",
        &["symbol"]
    ).unwrap();

    // Worker metrics
    pub static ref WORKER_ERRORS: CounterVec = register_counter_vec!(
        "xchain_relayer_worker_errors_total",
        "Failed worker cycles",
        &["worker"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "xchain_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "xchain_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u16, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_chain_head(chain_id: u16, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_cursor(chain_id: u16, stream: &str, block_number: u64) {
    WATCHER_CURSOR
        .with_label_values(&[&chain_id.to_string(), stream])
        .set(block_number as f64);
}

pub fn record_event_ingested(chain_id: u16, call_kind: CallKind) {
    EVENTS_INGESTED
        .with_label_values(&[&chain_id.to_string(), call_kind.as_str()])
        .inc();
}

pub fn record_unknown_call_kind(chain_id: u16) {
    UNKNOWN_CALL_KINDS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_attestation_fetch<T>(result: &RelayerResult<T>) {
    let outcome = match result {
        Ok(_) => "obtained",
        Err(RelayerError::AttestationPending { .. }) => "pending",
        Err(_) => "unreachable",
    };
    ATTESTATION_FETCHES.with_label_values(&[outcome]).inc();
}

pub fn record_transition(status: JobStatus) {
    JOB_TRANSITIONS.with_label_values(&[status.as_str()]).inc();
}

pub fn set_job_counts(counts: &HashMap<JobStatus, u64>) {
    for status in JobStatus::ALL {
        JOBS_BY_STATUS
            .with_label_values(&[status.as_str()])
            .set(counts.get(&status).copied().unwrap_or(0) as f64);
    }
}

pub fn record_tx_submitted(chain_id: u16) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_submission_result(chain_id: u16, role: GasRole, result: &str) {
    SUBMISSION_RESULTS
        .with_label_values(&[&chain_id.to_string(), role.as_str(), result])
        .inc();
}

pub fn record_gas_sample(role: GasRole, call_kind: CallKind) {
    GAS_SAMPLES
        .with_label_values(&[role.as_str(), call_kind.as_str()])
        .inc();
}

pub fn record_payout_shortfall(chain_id: u16) {
    PAYOUT_SHORTFALLS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_signer_balance(chain_id: u16, signer: usize, balance: f64) {
    SIGNER_BALANCE
        .with_label_values(&[&chain_id.to_string(), &signer.to_string()])
        .set(balance);
}

pub fn record_insufficient_balance(chain_id: u16) {
    INSUFFICIENT_BALANCE
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn set_token_price(symbol: &str, price: f64) {
    TOKEN_PRICE.with_label_values(&[symbol]).set(price);
}

pub fn record_worker_error(worker: &str) {
    WORKER_ERRORS.with_label_values(&[worker]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
