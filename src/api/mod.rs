//! HTTP API for health checks, job queries and fee quotes

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::{ErrorClass, RelayerError, RelayerResult};
use crate::fees::{FeeEstimator, FeeQuery, FeeQuote};
use crate::job::{CallKind, JobStatus, RelayJob};
use crate::store::Store;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Default page size for unrelayed job listings
const DEFAULT_UNRELAYED_LIMIT: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub estimator: Arc<FeeEstimator>,
    /// Absent when the API runs without chain connections
    pub chains: Option<Arc<ChainManager>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        estimator: Arc<FeeEstimator>,
        chains: Option<Arc<ChainManager>>,
    ) -> Self {
        Self {
            store,
            estimator,
            chains,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/jobs/unrelayed", get(list_unrelayed))
        .route("/jobs/by-sequence", get(job_by_sequence))
        .route("/fees/estimate", get(estimate_fee))
        .route("/fees/estimate-max", get(estimate_max_fee))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server: {}", e)))
}

/// Relayer error rendered as a JSON body
pub struct ApiError(RelayerError);

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match (&self.0, self.0.class()) {
            (RelayerError::ChainNotFound { .. }, _) => StatusCode::BAD_REQUEST,
            (_, ErrorClass::Transient) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("API request failed: {}", self.0);
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Readiness check - store and chain connections
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health_check().await.is_ok();

    let details: Vec<ChainHealth> = match &state.chains {
        Some(chains) => chains
            .health_check()
            .await
            .into_iter()
            .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
            .collect(),
        None => Vec::new(),
    };
    let chains = details.iter().all(|c| c.healthy);
    let ready = database && chains;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            chains,
            details,
        }),
    )
}

/// Job counts per status
async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let counts = state.store.status_counts().await?;
    crate::metrics::set_job_counts(&counts);

    let jobs = JobStatus::ALL
        .into_iter()
        .map(|s| (s.as_str(), counts.get(&s).copied().unwrap_or(0)))
        .collect();
    let connected_chains = state
        .chains
        .as_ref()
        .map(|c| {
            let mut ids = c.connected_chains();
            ids.sort_unstable();
            ids
        })
        .unwrap_or_default();

    Ok(Json(StatsResponse {
        jobs,
        connected_chains,
    }))
}

#[derive(Debug, Deserialize)]
struct UnrelayedParams {
    source_chain_id: Option<u16>,
    call_kind: Option<CallKind>,
    limit: Option<usize>,
}

/// Jobs the core chain declined for an insufficient fee, newest first
async fn list_unrelayed(
    State(state): State<AppState>,
    Query(params): Query<UnrelayedParams>,
) -> Result<Json<Vec<RelayJob>>, ApiError> {
    let jobs = state
        .store
        .list_unrelayed(
            params.source_chain_id,
            params.call_kind,
            Some(params.limit.unwrap_or(DEFAULT_UNRELAYED_LIMIT)),
        )
        .await?;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
struct SequenceParams {
    source_chain_id: u16,
    sequence: u64,
}

async fn job_by_sequence(
    State(state): State<AppState>,
    Query(params): Query<SequenceParams>,
) -> Result<Response, ApiError> {
    let job = state
        .store
        .find_by_sequence(params.source_chain_id, params.sequence)
        .await?;

    Ok(match job {
        Some(job) => Json(job).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!(
                    "no job for sequence {} on chain {}",
                    params.sequence, params.source_chain_id
                ),
            }),
        )
            .into_response(),
    })
}

#[derive(Debug, Deserialize)]
struct FeeParams {
    source_chain_id: u16,
    /// Defaults to the core chain, which is where non-payout calls end
    destination_chain_id: Option<u16>,
    call_kind: CallKind,
    variant: Option<u32>,
}

impl FeeParams {
    fn query(&self, core_chain_id: u16) -> FeeQuery {
        FeeQuery {
            source_chain_id: self.source_chain_id,
            destination_chain_id: self.destination_chain_id.unwrap_or(core_chain_id),
            call_kind: self.call_kind,
            variant: self.variant,
        }
    }
}

async fn estimate_fee(
    State(state): State<AppState>,
    Query(params): Query<FeeParams>,
) -> Result<Json<FeeQuote>, ApiError> {
    let query = params.query(state.estimator.core_chain_id());
    Ok(Json(state.estimator.estimate(&query).await?))
}

async fn estimate_max_fee(
    State(state): State<AppState>,
    Query(params): Query<FeeParams>,
) -> Result<Json<FeeQuote>, ApiError> {
    let query = params.query(state.estimator.core_chain_id());
    Ok(Json(state.estimator.estimate_max(&query).await?))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u16,
    healthy: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    jobs: BTreeMap<&'static str, u64>,
    connected_chains: Vec<u16>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::{MockGasPriceSource, MockPriceFeed, TokenInfo};
    use crate::job::fixtures::relay_event;
    use crate::job::{GasRole, GasUsageSample, Transition, FEE_DECLINED_REASON};
    use crate::store::{GasLedger, JobRepository, MemoryStore};

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::HashMap;
    use tower::ServiceExt;

    const CORE: u16 = 0;
    const POLYGON: u16 = 5;

    fn state(store: Arc<MemoryStore>) -> AppState {
        let mut prices = MockPriceFeed::new();
        prices.expect_price().returning(|symbol| Ok(if symbol == "sui" { 1.0 } else { 0.5 }));
        let mut gas = MockGasPriceSource::new();
        gas.expect_gas_price().returning(|_| Ok(1_000));

        let tokens = HashMap::from([
            (CORE, TokenInfo::new("sui", 9)),
            (POLYGON, TokenInfo::new("matic", 18)),
        ]);
        let estimator = FeeEstimator::new(store.clone(), Arc::new(prices), Arc::new(gas), tokens, CORE, 10);
        AppState::new(store, Arc::new(estimator), None)
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn declined_job(store: &MemoryStore, nonce: u64, call_type: u8) {
        let kind = CallKind::classify(1, call_type).unwrap();
        let job = RelayJob::from_event(&relay_event(POLYGON, nonce, nonce, call_type), kind, 1.0, Some(vec![1]));
        store.insert(&job).await.unwrap();
        store
            .transition(POLYGON, nonce, &Transition::settlement_failed(FEE_DECLINED_REASON, None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get(state(Arc::new(MemoryStore::new())), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_without_chains() {
        let (status, body) = get(state(Arc::new(MemoryStore::new())), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_unrelayed_filters() {
        let store = Arc::new(MemoryStore::new());
        declined_job(&store, 1, 0).await;
        declined_job(&store, 2, 3).await;
        declined_job(&store, 3, 0).await;

        let (status, body) = get(state(store.clone()), "/jobs/unrelayed?source_chain_id=5&call_kind=supply").await;
        assert_eq!(status, StatusCode::OK);
        let nonces: Vec<u64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|j| j["nonce"].as_u64().unwrap())
            .collect();
        assert_eq!(nonces, vec![3, 1]);

        let (_, limited) = get(state(store), "/jobs/unrelayed?limit=1").await;
        assert_eq!(limited.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unrelayed_rejects_unknown_call_kind() {
        let (status, _) = get(state(Arc::new(MemoryStore::new())), "/jobs/unrelayed?call_kind=swap").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_job_by_sequence() {
        let store = Arc::new(MemoryStore::new());
        let job = RelayJob::from_event(&relay_event(POLYGON, 4, 40, 0), CallKind::Supply, 1.0, None);
        store.insert(&job).await.unwrap();

        let (status, body) = get(state(store.clone()), "/jobs/by-sequence?source_chain_id=5&sequence=40").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nonce"], 4);
        assert_eq!(body["status"], "awaiting_attestation");

        let (status, _) = get(state(store), "/jobs/by-sequence?source_chain_id=5&sequence=41").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fee_estimates() {
        let store = Arc::new(MemoryStore::new());
        for (nonce, gas_used) in [(1, 1_000_000), (2, 3_000_000)] {
            store
                .record(&GasUsageSample {
                    source_chain_id: POLYGON,
                    destination_chain_id: CORE,
                    call_kind: CallKind::Supply,
                    variant: None,
                    nonce,
                    gas_used,
                    role: GasRole::Settlement,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let (status, body) = get(state(store.clone()), "/fees/estimate?source_chain_id=5&call_kind=supply").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settlement_gas"], 2_000_000);
        // 2e6 gas * 1000 = 2 sui = 2 USD = 4 matic
        assert_eq!(body["amount"], "4000000000000000000");

        let (_, max) = get(state(store), "/fees/estimate-max?source_chain_id=5&call_kind=supply").await;
        assert_eq!(max["settlement_gas"], 3_000_000);
    }

    #[tokio::test]
    async fn test_fee_estimate_unknown_chain() {
        let store = Arc::new(MemoryStore::new());
        store
            .record(&GasUsageSample {
                source_chain_id: 77,
                destination_chain_id: CORE,
                call_kind: CallKind::Repay,
                variant: None,
                nonce: 1,
                gas_used: 10,
                role: GasRole::Settlement,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let (status, body) = get(state(store), "/fees/estimate?source_chain_id=77&call_kind=repay").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("77"));
    }

    #[tokio::test]
    async fn test_stats_counts_every_status() {
        let store = Arc::new(MemoryStore::new());
        declined_job(&store, 1, 0).await;
        let job = RelayJob::from_event(&relay_event(POLYGON, 2, 2, 0), CallKind::Supply, 1.0, None);
        store.insert(&job).await.unwrap();

        let (status, body) = get(state(store), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"]["failed"], 1);
        assert_eq!(body["jobs"]["awaiting_attestation"], 1);
        assert_eq!(body["jobs"]["dropped"], 0);
    }
}
