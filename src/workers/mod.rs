//! Long-running relay workers
//!
//! Each worker owns one role on one chain and runs as its own tokio task:
//! poll, handle what was found, sleep, repeat. Workers share nothing but the
//! store, the fee estimator and the signer pool.

pub mod core_executor;
pub mod payout_executor;
pub mod payout_watcher;
pub mod sweep;
pub mod watcher;

#[cfg(test)]
mod scenarios;

pub use core_executor::CoreExecutor;
pub use payout_executor::PayoutExecutor;
pub use payout_watcher::PayoutWatcher;
pub use sweep::AttestationSweep;
pub use watcher::ChainWatcher;

use crate::error::{RelayerError, RelayerResult};
use crate::fees::FeeEstimator;
use crate::job::RelayJob;
use crate::tx::{AccountRotator, SignerLease, Submitter, TxLookup};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> String;

    /// Pause between cycles, also applied after a failed cycle
    fn interval(&self) -> Duration;

    /// One poll cycle
    async fn run_once(&self) -> RelayerResult<()>;
}

/// Shutdown flag shared by every worker task
#[derive(Clone, Default)]
pub struct Shutdown(Arc<RwLock<bool>>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trigger(&self) {
        *self.0.write().await = true;
    }

    pub async fn is_triggered(&self) -> bool {
        *self.0.read().await
    }
}

/// Drive a worker until shutdown. A failed cycle is logged and retried
/// after the worker's interval; it never ends the loop.
pub async fn run_worker(worker: Arc<dyn Worker>, shutdown: Shutdown) {
    let name = worker.name();
    info!("{} started", name);

    loop {
        if shutdown.is_triggered().await {
            break;
        }

        if let Err(e) = worker.run_once().await {
            if e.should_alert() {
                error!(worker = %name, "Cycle failed: {}", e);
            } else {
                warn!(worker = %name, "Cycle failed: {}", e);
            }
            crate::metrics::record_worker_error(&name);
        }

        tokio::time::sleep(worker.interval()).await;
    }

    info!("{} stopped", name);
}

/// Look up the job's unconfirmed broadcast, if it has one. `None` means
/// nothing is in flight.
pub(crate) async fn reconcile(submitter: &dyn Submitter, job: &RelayJob) -> RelayerResult<Option<TxLookup>> {
    let Some(tx_id) = job.pending_tx_id.as_deref() else {
        return Ok(None);
    };

    let lookup = submitter.lookup(tx_id).await?;
    match &lookup {
        TxLookup::Pending => info!(
            source_chain_id = job.source_chain_id,
            nonce = job.nonce,
            tx = tx_id,
            "Previous submission still pending"
        ),
        TxLookup::Dropped => warn!(
            source_chain_id = job.source_chain_id,
            nonce = job.nonce,
            tx = tx_id,
            "Previous submission was dropped, resubmitting"
        ),
        TxLookup::Mined(_) | TxLookup::Reverted(_) => info!(
            source_chain_id = job.source_chain_id,
            nonce = job.nonce,
            tx = tx_id,
            "Previous submission confirmed"
        ),
    }
    Ok(Some(lookup))
}

/// Signer access shared by the executors: lease the next identity and make
/// sure it can pay for a submission
pub(crate) struct SignerGate {
    pub chain_id: u16,
    pub rotator: Arc<AccountRotator>,
    pub submitter: Arc<dyn Submitter>,
    pub estimator: Arc<FeeEstimator>,
    /// Minimum balance in the chain's smallest gas token unit
    pub min_balance: u128,
}

impl SignerGate {
    /// Lease a signer, failing with [`RelayerError::InsufficientBalance`] when
    /// it holds less than the configured minimum
    pub async fn acquire(&self) -> RelayerResult<SignerLease> {
        let lease = self.rotator.acquire().await?;
        let balance = self.submitter.balance(lease.address()).await?;

        if let Ok(token) = self.estimator.token(self.chain_id) {
            let whole = balance as f64 / 10f64.powi(token.decimals as i32);
            crate::metrics::record_signer_balance(self.chain_id, lease.index(), whole);
        }

        if balance < self.min_balance {
            crate::metrics::record_insufficient_balance(self.chain_id);
            return Err(RelayerError::InsufficientBalance {
                chain_id: self.chain_id,
                have: balance.to_string(),
                need: self.min_balance.to_string(),
            });
        }
        Ok(lease)
    }
}
