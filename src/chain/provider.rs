//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    config: ChainConfig,
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
    last_block: AtomicU64,
}

impl ChainProvider {
    pub fn new(config: ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: AtomicU64::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        if self.http_providers.len() > 1 {
            warn!("Chain {} failover to provider {}", self.config.chain_id, next);
        }
    }

    fn connection_error(&self, message: impl ToString) -> RelayerError {
        RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.to_string(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    self.last_block.store(block_num, Ordering::Relaxed);
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Last head observed by [`Self::get_block_number`]
    pub fn last_block(&self) -> u64 {
        self.last_block.load(Ordering::Relaxed)
    }

    /// Latest block number that has the configured confirmation depth
    pub async fn confirmed_head(&self) -> RelayerResult<u64> {
        let head = self.get_block_number().await?;
        Ok(head.saturating_sub(self.config.confirmation_blocks))
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get logs"))
    }

    /// Timestamp of a block, in seconds
    pub async fn block_timestamp(&self, block_number: u64) -> RelayerResult<u64> {
        let block = self
            .http()
            .get_block(block_number)
            .await
            .map_err(|e| self.connection_error(e))?
            .ok_or_else(|| self.connection_error(format!("block {} not found", block_number)))?;
        Ok(block.timestamp.as_u64())
    }

    pub async fn get_balance(&self, address: Address) -> RelayerResult<U256> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_balance(address, None).await {
                Ok(balance) => return Ok(balance),
                Err(e) => {
                    warn!("Failed to get balance on chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get balance"))
    }

    /// Pending nonce of an account
    pub async fn get_nonce(&self, address: Address) -> RelayerResult<U256> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Estimate gas for a transaction. A revert is a rejection of the call
    /// itself and carries the node's reason.
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.http().estimate_gas(tx, None).await.map_err(|e| {
            let message = e.to_string();
            if message.contains("revert") {
                RelayerError::Rejected {
                    chain_id: self.config.chain_id,
                    reason: revert_reason(&message),
                }
            } else {
                self.connection_error(message)
            }
        })
    }

    /// Broadcast a signed transaction
    pub async fn send_raw(&self, raw: Bytes) -> RelayerResult<H256> {
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| classify_send_error(self.config.chain_id, e.to_string()))?;
        Ok(pending.tx_hash())
    }

    /// Poll for a receipt until it appears
    pub async fn wait_for_receipt(&self, tx_hash: H256) -> RelayerResult<TransactionReceipt> {
        loop {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to get receipt {:?} on chain {}: {}", tx_hash, self.config.chain_id, e);
                    self.failover();
                }
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    /// Receipt of a transaction, `None` while it is not mined
    pub async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<TransactionReceipt>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    warn!("Failed to get receipt {:?} on chain {}: {}", tx_hash, self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get receipt"))
    }

    /// Transaction by hash, `None` if the node does not know it
    pub async fn get_transaction(&self, tx_hash: H256) -> RelayerResult<Option<Transaction>> {
        self.http()
            .get_transaction(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| self.connection_error(e))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.connection_error(e))?
            .ok_or_else(|| self.connection_error("No latest block"))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| self.connection_error("No base fee in block"))?;

        let priority_fee = U256::from(2_000_000_000u64);
        let max_fee = base_fee * 2 + priority_fee;

        Ok((std::cmp::min(max_fee, self.max_gas_price()), priority_fee))
    }

    /// Configured gas price ceiling in wei
    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    /// Relay chain id
    pub fn chain_id(&self) -> u16 {
        self.config.chain_id
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Highest per-gas price the transaction may pay
    pub fn ceiling(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }
}

fn revert_reason(message: &str) -> String {
    message
        .split_once("execution reverted:")
        .map(|(_, reason)| {
            let reason = reason.split(", data:").next().unwrap_or(reason);
            reason.trim().trim_end_matches(')').to_string()
        })
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| message.to_string())
}

fn classify_send_error(chain_id: u16, message: String) -> RelayerError {
    if message.contains("insufficient funds") {
        RelayerError::InsufficientBalance {
            chain_id,
            have: "unknown".to_string(),
            need: "unknown".to_string(),
        }
    } else if message.contains("nonce too low") || message.contains("already known") {
        RelayerError::Transaction { chain_id, message }
    } else {
        RelayerError::ChainConnection { chain_id, message }
    }
}
