//! Round-robin signer rotation
//!
//! Every executor in the process shares one [`AccountRotator`]. Identities
//! are handed out in turn from an atomic counter, and a [`SignerLease`] holds
//! the identity's lock so two submissions never sign with the same account
//! at the same time.

use crate::error::{RelayerError, RelayerResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

pub struct AccountRotator {
    signers: Vec<Arc<Mutex<LocalWallet>>>,
    addresses: Vec<Address>,
    counter: AtomicUsize,
    closed: AtomicBool,
}

impl AccountRotator {
    pub fn new(wallets: Vec<LocalWallet>) -> RelayerResult<Self> {
        if wallets.is_empty() {
            return Err(RelayerError::Wallet("signer pool is empty".to_string()));
        }

        let addresses = wallets.iter().map(|w| w.address()).collect();
        Ok(Self {
            signers: wallets.into_iter().map(|w| Arc::new(Mutex::new(w))).collect(),
            addresses,
            counter: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Load private keys from the named environment variables
    pub fn from_env(vars: &[String]) -> RelayerResult<Self> {
        let mut wallets = Vec::with_capacity(vars.len());
        for var in vars {
            let key = std::env::var(var)
                .map_err(|_| RelayerError::Wallet(format!("{} is not set", var)))?;
            let wallet = key
                .trim()
                .parse::<LocalWallet>()
                .map_err(|e| RelayerError::Wallet(format!("Invalid private key in {}: {}", var, e)))?;
            wallets.push(wallet);
        }

        let rotator = Self::new(wallets)?;
        info!("Signer pool loaded: {:?}", rotator.addresses);
        Ok(rotator)
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// Index of the next identity in turn
    pub fn next_index(&self) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % self.signers.len()
    }

    /// Lease the next identity, waiting while another submission holds it
    pub async fn acquire(&self) -> RelayerResult<SignerLease> {
        if self.is_closed() {
            return Err(RelayerError::SignerPoolClosed);
        }

        let index = self.next_index();
        let guard = self.signers[index].clone().lock_owned().await;
        if self.is_closed() {
            return Err(RelayerError::SignerPoolClosed);
        }

        Ok(SignerLease { index, guard })
    }

    /// Refuse further leases; outstanding leases stay valid until dropped
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        info!("Signer pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Exclusive use of one signing identity
pub struct SignerLease {
    index: usize,
    guard: OwnedMutexGuard<LocalWallet>,
}

impl SignerLease {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.guard
    }

    pub fn address(&self) -> Address {
        self.guard.address()
    }
}

#[cfg(test)]
pub(crate) fn test_wallets(count: usize) -> Vec<LocalWallet> {
    (1..=count)
        .map(|i| format!("{:064x}", i).parse::<LocalWallet>().unwrap())
        .collect()
}
