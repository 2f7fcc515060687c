//! Chain module - handles multi-chain connections and event polling
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Confirmation-aware log polling for relay and payout events
//! - Gas price lookups for fee estimation

pub mod listener;
pub mod provider;

pub use listener::{EventBatch, EventSource, EvmEventSource};
pub use provider::{ChainProvider, GasPrice};

use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};
use crate::fees::GasPriceSource;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::info;

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by relay chain ID
    providers: DashMap<u16, Arc<ChainProvider>>,
}

impl ChainManager {
    /// Create a provider for every enabled chain
    pub fn new(settings: &Settings) -> RelayerResult<Self> {
        let providers = DashMap::new();

        for (_, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );
            let provider = ChainProvider::new(chain_config.clone())?;
            providers.insert(chain_config.chain_id, Arc::new(provider));
        }

        Ok(Self { providers })
    }

    /// Get provider for a specific chain
    pub fn get_provider(&self, chain_id: u16) -> RelayerResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u16, bool)> {
        let providers: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();

        join_all(providers.into_iter().map(|provider| async move {
            let healthy = provider.health_check().await;
            crate::metrics::record_chain_health(provider.chain_id(), healthy);
            if healthy {
                crate::metrics::record_chain_head(provider.chain_id(), provider.last_block());
            }
            (provider.chain_id(), healthy)
        }))
        .await
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u16> {
        self.providers.iter().map(|e| *e.key()).collect()
    }
}

#[async_trait]
impl GasPriceSource for ChainManager {
    async fn gas_price(&self, chain_id: u16) -> RelayerResult<u128> {
        let price = self.get_provider(chain_id)?.get_gas_price().await?.ceiling();
        u128::try_from(price).map_err(|e| RelayerError::ChainConnection {
            chain_id,
            message: format!("gas price out of range: {}", e),
        })
    }
}
