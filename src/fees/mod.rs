//! Fee valuation
//!
//! Prices gas tokens against a common unit (USD) and converts raw token
//! amounts to and from that unit. The estimator in [`estimator`] builds relay
//! fee quotes from the gas ledger on top of these conversions.

pub mod estimator;

pub use estimator::{FeeEstimator, FeeQuery, FeeQuote};

use crate::config::{PriceFeedConfig, Settings};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// USD price of one whole token
    async fn price(&self, symbol: &str) -> RelayerResult<f64>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GasPriceSource: Send + Sync {
    /// Current gas price in the chain's smallest gas token unit
    async fn gas_price(&self, chain_id: u16) -> RelayerResult<u128>;
}

/// Gas token of a chain
#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u32,
}

impl TokenInfo {
    pub fn new(symbol: impl Into<String>, decimals: u32) -> Self {
        Self {
            symbol: symbol.into(),
            decimals,
        }
    }

    /// Value of `amount` smallest units at `price` per whole token
    pub fn value_of(&self, amount: u128, price: f64) -> f64 {
        amount as f64 * price / 10f64.powi(self.decimals as i32)
    }

    /// Smallest units worth `value` at `price` per whole token
    pub fn amount_of(&self, value: f64, price: f64) -> u128 {
        if price <= 0.0 || value <= 0.0 {
            return 0;
        }
        (value / price * 10f64.powi(self.decimals as i32)) as u128
    }

    /// Smallest units in `whole` tokens
    pub fn units(&self, whole: f64) -> u128 {
        (whole * 10f64.powi(self.decimals as i32)) as u128
    }
}

/// Gas tokens of every enabled chain, keyed by relay chain id
pub fn token_table(settings: &Settings) -> HashMap<u16, TokenInfo> {
    settings
        .enabled_chains()
        .into_iter()
        .map(|(_, chain)| {
            (
                chain.chain_id,
                TokenInfo::new(chain.gas_token.clone(), chain.gas_token_decimals),
            )
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    code: String,
    data: Option<TickerData>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    price: String,
}

/// Exchange ticker price feed with a TTL cache
pub struct TickerPriceFeed {
    client: reqwest::Client,
    base_url: String,
    quote: String,
    ttl: Duration,
    cache: DashMap<String, (f64, Instant)>,
}

impl TickerPriceFeed {
    pub fn new(config: &PriceFeedConfig) -> RelayerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RelayerError::Config(format!("price feed client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            quote: config.quote.to_uppercase(),
            ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: DashMap::new(),
        })
    }

    fn pair(&self, symbol: &str) -> String {
        format!("{}-{}", symbol.to_uppercase(), self.quote)
    }

    fn cached(&self, pair: &str) -> Option<f64> {
        self.cache
            .get(pair)
            .filter(|entry| entry.1.elapsed() < self.ttl)
            .map(|entry| entry.0)
    }

    async fn fetch(&self, symbol: &str, pair: &str) -> RelayerResult<f64> {
        let feed_error = |message: String| RelayerError::PriceFeed {
            symbol: symbol.to_string(),
            message,
        };

        let url = format!("{}/api/v1/market/orderbook/level1?symbol={}", self.base_url, pair);
        let response: TickerResponse = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| feed_error(e.to_string()))?
            .error_for_status()
            .map_err(|e| feed_error(e.to_string()))?
            .json()
            .await
            .map_err(|e| feed_error(e.to_string()))?;

        let data = response
            .data
            .ok_or_else(|| feed_error(format!("no ticker for {} (code {})", pair, response.code)))?;
        let price: f64 = data
            .price
            .parse()
            .map_err(|_| feed_error(format!("malformed price {}", data.price)))?;
        if !(price.is_finite() && price > 0.0) {
            return Err(feed_error(format!("non-positive price {}", price)));
        }
        Ok(price)
    }
}

#[async_trait]
impl PriceFeed for TickerPriceFeed {
    async fn price(&self, symbol: &str) -> RelayerResult<f64> {
        let pair = self.pair(symbol);
        if let Some(price) = self.cached(&pair) {
            return Ok(price);
        }

        let price = self.fetch(symbol, &pair).await?;
        debug!("Price of {}: {}", pair, price);
        self.cache.insert(pair, (price, Instant::now()));
        crate::metrics::set_token_price(symbol, price);
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(ttl_secs: u64) -> TickerPriceFeed {
        TickerPriceFeed::new(&PriceFeedConfig {
            base_url: "https://ticker.example.com/".into(),
            quote: "usdt".into(),
            cache_ttl_secs: ttl_secs,
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_value_and_amount_conversions() {
        let eth = TokenInfo::new("eth", 18);
        let value = eth.value_of(2_000_000_000_000_000, 1_500.0);
        assert!((value - 3.0).abs() < 1e-9);
        assert_eq!(eth.amount_of(3.0, 1_500.0), 2_000_000_000_000_000);
        assert_eq!(eth.amount_of(3.0, 0.0), 0);

        let sui = TokenInfo::new("sui", 9);
        assert_eq!(sui.units(1.0), 1_000_000_000);
        assert!((sui.value_of(500_000_000, 0.8) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_ticker_pair_and_cache_ttl() {
        let fresh = feed(60);
        assert_eq!(fresh.pair("matic"), "MATIC-USDT");
        assert_eq!(fresh.cached("MATIC-USDT"), None);
        fresh.cache.insert("MATIC-USDT".into(), (0.7, Instant::now()));
        assert_eq!(fresh.cached("MATIC-USDT"), Some(0.7));

        let expired = feed(0);
        expired.cache.insert("ETH-USDT".into(), (1_800.0, Instant::now()));
        assert_eq!(expired.cached("ETH-USDT"), None);
    }

    #[tokio::test]
    async fn test_cached_price_skips_network() {
        let feed = feed(60);
        feed.cache.insert("SUI-USDT".into(), (0.9, Instant::now()));
        assert_eq!(feed.price("sui").await.unwrap(), 0.9);
    }
}
