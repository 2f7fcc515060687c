//! xchain-relayer - cross-chain relay orchestration
//!
//! Watches source chain portals for relay events, obtains their attestations,
//! settles them on the core chain and delivers the resulting payouts to
//! their destination chains.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod attestation;
mod chain;
mod config;
mod error;
mod events;
mod fees;
mod job;
mod metrics;
mod retry;
mod store;
mod tx;
mod workers;

use attestation::{AttestationClient, GuardianClient};
use chain::{ChainManager, EvmEventSource};
use config::{ChainConfig, Settings, StoreBackend};
use fees::{FeeEstimator, TickerPriceFeed, TokenInfo};
use metrics::MetricsServer;
use retry::RetryPolicy;
use store::{GasLedger, MemoryStore, PgStore, Store};
use tx::{AccountRotator, EvmSubmitter, SubmitMethod};
use workers::{
    AttestationSweep, ChainWatcher, CoreExecutor, PayoutExecutor, PayoutWatcher, Shutdown, Worker,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting xchain-relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (instance {})",
        settings.enabled_chains().len(),
        settings.relayer.instance_id
    );

    let (store, ledger) = open_store(&settings).await?;

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings)?);
    info!("Chain connections initialized");

    let prices = Arc::new(TickerPriceFeed::new(&settings.price_feed)?);
    let estimator = Arc::new(FeeEstimator::new(
        ledger,
        prices,
        chain_manager.clone(),
        fees::token_table(&settings),
        settings.core.chain_id,
        settings.fees.sample_window,
    ));
    let attestations: Arc<dyn AttestationClient> = Arc::new(GuardianClient::new(&settings.attestation)?);
    let rotator = Arc::new(AccountRotator::from_env(&settings.wallet.private_key_envs)?);

    let workers = build_workers(
        &settings,
        &chain_manager,
        &store,
        &estimator,
        &attestations,
        &rotator,
    )?;
    info!("{} workers configured", workers.len());

    let shutdown = Shutdown::new();
    let mut handles: Vec<JoinHandle<()>> = workers
        .into_iter()
        .map(|worker| tokio::spawn(workers::run_worker(worker, shutdown.clone())))
        .collect();

    // Start API server
    handles.push(tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState::new(store.clone(), estimator.clone(), Some(chain_manager.clone()));
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    }));

    // Start metrics server
    if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }));
    }

    // Health check loop
    handles.push(tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let health = chain_manager.health_check().await;
                let mut healthy = true;
                for (chain_id, ok) in health {
                    if !ok {
                        warn!("Chain {} health check failed", chain_id);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                    healthy = false;
                }
                match store.status_counts().await {
                    Ok(counts) => metrics::set_job_counts(&counts),
                    Err(e) => warn!("Failed to count jobs: {}", e),
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    }));

    info!("xchain-relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await?;

    info!("Shutdown signal received, stopping...");

    shutdown.trigger().await;
    rotator.close();

    // Abort background tasks
    for handle in handles {
        handle.abort();
    }

    info!("xchain-relayer stopped");
    Ok(())
}

/// Open the configured store, returning it both as the job store and as the
/// gas ledger the estimator reads
async fn open_store(settings: &Settings) -> Result<(Arc<dyn Store>, Arc<dyn GasLedger>)> {
    match settings.database.backend {
        StoreBackend::Postgres => {
            let pg = Arc::new(PgStore::new(&settings.database).await?);
            info!("Database connection established");

            pg.run_migrations().await?;
            info!("Database migrations complete");
            Ok((pg.clone(), pg))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; jobs are lost on restart");
            let memory = Arc::new(MemoryStore::new());
            Ok((memory.clone(), memory))
        }
    }
}

/// One watcher and sweep per source chain, the core executor and payout
/// watcher, and one payout executor per payout chain
fn build_workers(
    settings: &Settings,
    chain_manager: &Arc<ChainManager>,
    store: &Arc<dyn Store>,
    estimator: &Arc<FeeEstimator>,
    attestations: &Arc<dyn AttestationClient>,
    rotator: &Arc<AccountRotator>,
) -> Result<Vec<Arc<dyn Worker>>> {
    let relayer = &settings.relayer;
    let retry = RetryPolicy::from_config(&relayer.retry);
    let mut workers: Vec<Arc<dyn Worker>> = Vec::new();

    for chain in settings.source_chains() {
        let provider = chain_manager.get_provider(chain.chain_id)?;
        let portal = chain.portal_address.as_deref().context("portal address")?;
        let emitter = chain
            .emitter_address
            .as_deref()
            .with_context(|| format!("Chain {} has no emitter address", chain.name))?;

        let source = Arc::new(EvmEventSource::new(provider, portal, emitter)?);
        workers.push(Arc::new(ChainWatcher::new(
            chain.attestation_chain_id,
            chain.start_block,
            source,
            store.clone(),
            attestations.clone(),
            estimator.clone(),
            relayer.poll_interval(),
        )));
        workers.push(Arc::new(AttestationSweep::new(
            chain.chain_id,
            chain.attestation_chain_id,
            store.clone(),
            attestations.clone(),
            retry.clone(),
            relayer.batch_size,
            relayer.sweep_interval(),
        )));
    }

    let core = settings
        .get_chain_by_id(settings.core.chain_id)
        .with_context(|| format!("Core chain {} is not configured", settings.core.chain_id))?;
    let core_provider = chain_manager.get_provider(core.chain_id)?;

    let settlement = Arc::new(EvmSubmitter::new(
        core_provider.clone(),
        &settings.core.contract_address,
        SubmitMethod::Settlement,
        relayer.receipt_timeout(),
    )?);
    workers.push(Arc::new(CoreExecutor::new(
        store.clone(),
        settlement,
        rotator.clone(),
        estimator.clone(),
        min_balance(core),
        u128::from(settings.fees.bootstrap_allowance),
        relayer.batch_size,
        relayer.executor_interval(),
    )));

    let requests = Arc::new(EvmEventSource::new(
        core_provider,
        &settings.core.contract_address,
        &settings.core.payout_emitter,
    )?);
    workers.push(Arc::new(PayoutWatcher::new(
        core.attestation_chain_id,
        settings.core.payout_emitter.clone(),
        core.start_block,
        requests,
        store.clone(),
        attestations.clone(),
        retry,
        relayer.poll_interval(),
    )));

    for chain in settings.payout_chains() {
        let pool = chain.pool_address.as_deref().context("pool address")?;
        let submitter = Arc::new(EvmSubmitter::new(
            chain_manager.get_provider(chain.chain_id)?,
            pool,
            SubmitMethod::Payout,
            relayer.receipt_timeout(),
        )?);
        workers.push(Arc::new(PayoutExecutor::new(
            store.clone(),
            submitter,
            rotator.clone(),
            estimator.clone(),
            min_balance(chain),
            relayer.batch_size,
            relayer.executor_interval(),
        )));
    }

    Ok(workers)
}

/// Configured minimum signer balance in the chain's smallest gas token unit
fn min_balance(chain: &ChainConfig) -> u128 {
    TokenInfo::new(chain.gas_token.clone(), chain.gas_token_decimals).units(chain.min_signer_balance)
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,xchain_relayer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        res = ctrl_c => res,
        res = terminate => res,
    }
}
