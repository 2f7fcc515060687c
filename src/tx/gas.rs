//! Gas limit and price buffering for outgoing transactions

use crate::chain::{ChainProvider, GasPrice};
use crate::error::RelayerResult;

use ethers::types::U256;
use tracing::debug;

/// Pads node estimates so submissions survive small fluctuations
#[derive(Debug, Clone)]
pub struct GasOracle {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasOracle {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    pub fn buffered_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Current chain gas price plus buffer, never above the configured ceiling
    pub async fn gas_price(&self, provider: &ChainProvider) -> RelayerResult<GasPrice> {
        let buffered = self.buffer_price(provider.get_gas_price().await?, provider.max_gas_price());
        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    fn buffer_price(&self, price: GasPrice, ceiling: U256) -> GasPrice {
        let pad = |value: U256| {
            std::cmp::min(value + value * self.gas_price_buffer_percent / 100, ceiling)
        };

        match price {
            GasPrice::Legacy(price) => GasPrice::Legacy(pad(price)),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: pad(max_fee_per_gas),
                max_priority_fee_per_gas: pad(max_priority_fee_per_gas),
            },
        }
    }

    /// Worst-case cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        gas_limit * gas_price.ceiling()
    }
}

impl Default for GasOracle {
    fn default() -> Self {
        Self::new()
    }
}
