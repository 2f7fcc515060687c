//! Relay fee estimation from historical gas usage

use super::{GasPriceSource, PriceFeed, TokenInfo};
use crate::error::{RelayerError, RelayerResult};
use crate::job::{CallKind, GasUsageSample};
use crate::store::{GasLedger, SampleQuery};

use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;

/// Key of a fee estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeQuery {
    pub source_chain_id: u16,
    pub destination_chain_id: u16,
    pub call_kind: CallKind,
    /// Result variant; only narrows variant-tracked call kinds
    pub variant: Option<u32>,
}

/// A relay fee in the source chain's fee token
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeQuote {
    #[serde(serialize_with = "as_string")]
    pub amount: u128,
    /// Value in the common unit
    pub value: f64,
    pub settlement_gas: u64,
    pub payout_gas: u64,
}

impl FeeQuote {
    pub fn zero() -> Self {
        Self {
            amount: 0,
            value: 0.0,
            settlement_gas: 0,
            payout_gas: 0,
        }
    }
}

fn as_string<S: Serializer>(value: &u128, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&value.to_string())
}

pub struct FeeEstimator {
    ledger: Arc<dyn GasLedger>,
    prices: Arc<dyn PriceFeed>,
    gas_prices: Arc<dyn GasPriceSource>,
    tokens: HashMap<u16, TokenInfo>,
    core_chain_id: u16,
    sample_window: usize,
}

impl FeeEstimator {
    pub fn new(
        ledger: Arc<dyn GasLedger>,
        prices: Arc<dyn PriceFeed>,
        gas_prices: Arc<dyn GasPriceSource>,
        tokens: HashMap<u16, TokenInfo>,
        core_chain_id: u16,
        sample_window: usize,
    ) -> Self {
        Self {
            ledger,
            prices,
            gas_prices,
            tokens,
            core_chain_id,
            sample_window: sample_window.max(1),
        }
    }

    pub fn core_chain_id(&self) -> u16 {
        self.core_chain_id
    }

    pub fn token(&self, chain_id: u16) -> RelayerResult<&TokenInfo> {
        self.tokens
            .get(&chain_id)
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// Value of a raw amount of the chain's gas token
    pub async fn value_of(&self, chain_id: u16, amount: u128) -> RelayerResult<f64> {
        let token = self.token(chain_id)?;
        let price = self.prices.price(&token.symbol).await?;
        Ok(token.value_of(amount, price))
    }

    /// Raw amount of the chain's gas token worth `value`
    pub async fn amount_of(&self, chain_id: u16, value: f64) -> RelayerResult<u128> {
        let token = self.token(chain_id)?;
        let price = self.prices.price(&token.symbol).await?;
        Ok(token.amount_of(value, price))
    }

    /// Moving average of the most recent samples for the query.
    /// Zero when the settlement leg has never been sampled.
    pub async fn estimate(&self, query: &FeeQuery) -> RelayerResult<FeeQuote> {
        let variant = query.variant.filter(|_| query.call_kind.tracks_variant());
        let settlement = self
            .ledger
            .recent(
                &SampleQuery::settlement(query.source_chain_id, query.call_kind).with_variant(variant),
                self.sample_window,
            )
            .await?;
        if settlement.is_empty() {
            return Ok(FeeQuote::zero());
        }

        let payout_gas = if query.call_kind.produces_payout() {
            let payout = self
                .ledger
                .recent(&self.payout_query(query), self.sample_window)
                .await?;
            average_gas(&payout)
        } else {
            0
        };

        self.quote(query, average_gas(&settlement), payout_gas).await
    }

    /// Upper bound from the single highest-gas samples
    pub async fn estimate_max(&self, query: &FeeQuery) -> RelayerResult<FeeQuote> {
        let settlement = self
            .ledger
            .max_sample(&SampleQuery::settlement(query.source_chain_id, query.call_kind))
            .await?;
        let Some(settlement) = settlement else {
            return Ok(FeeQuote::zero());
        };

        let payout_gas = if query.call_kind.produces_payout() {
            self.ledger
                .max_sample(&self.payout_query(query))
                .await?
                .map(|s| s.gas_used)
                .unwrap_or(0)
        } else {
            0
        };

        self.quote(query, settlement.gas_used, payout_gas).await
    }

    fn payout_query(&self, query: &FeeQuery) -> SampleQuery {
        SampleQuery::payout(
            query.source_chain_id,
            query.destination_chain_id,
            query.call_kind,
        )
    }

    async fn quote(&self, query: &FeeQuery, settlement_gas: u64, payout_gas: u64) -> RelayerResult<FeeQuote> {
        let core_price = self.gas_prices.gas_price(self.core_chain_id).await?;
        let mut value = self
            .value_of(self.core_chain_id, settlement_gas as u128 * core_price)
            .await?;

        if payout_gas > 0 {
            let dst_price = self.gas_prices.gas_price(query.destination_chain_id).await?;
            value += self
                .value_of(query.destination_chain_id, payout_gas as u128 * dst_price)
                .await?;
        }

        let amount = self.amount_of(query.source_chain_id, value).await?;
        Ok(FeeQuote {
            amount,
            value,
            settlement_gas,
            payout_gas,
        })
    }
}

fn average_gas(samples: &[GasUsageSample]) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let total: u128 = samples.iter().map(|s| s.gas_used as u128).sum();
    (total / samples.len() as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::{MockGasPriceSource, MockPriceFeed};
    use crate::job::GasRole;
    use crate::store::MemoryStore;
    use chrono::Utc;

    const CORE: u16 = 0;
    const POLYGON: u16 = 5;
    const ARBITRUM: u16 = 23;

    fn sample(
        role: GasRole,
        destination_chain_id: u16,
        call_kind: CallKind,
        variant: Option<u32>,
        nonce: u64,
        gas_used: u64,
    ) -> GasUsageSample {
        GasUsageSample {
            source_chain_id: POLYGON,
            destination_chain_id,
            call_kind,
            variant,
            nonce,
            gas_used,
            role,
            created_at: Utc::now(),
        }
    }

    fn estimator(ledger: Arc<MemoryStore>) -> FeeEstimator {
        let mut prices = MockPriceFeed::new();
        prices.expect_price().returning(|symbol| {
            Ok(match symbol {
                "sui" => 1.0,
                "matic" => 0.5,
                _ => 2_000.0,
            })
        });
        let mut gas = MockGasPriceSource::new();
        gas.expect_gas_price().returning(|chain_id| {
            Ok(if chain_id == CORE { 1_000 } else { 1_000_000_000 })
        });

        let tokens = HashMap::from([
            (CORE, TokenInfo::new("sui", 9)),
            (POLYGON, TokenInfo::new("matic", 18)),
            (ARBITRUM, TokenInfo::new("eth", 18)),
        ]);
        FeeEstimator::new(ledger, Arc::new(prices), Arc::new(gas), tokens, CORE, 10)
    }

    fn query(call_kind: CallKind, variant: Option<u32>) -> FeeQuery {
        FeeQuery {
            source_chain_id: POLYGON,
            destination_chain_id: ARBITRUM,
            call_kind,
            variant,
        }
    }

    #[tokio::test]
    async fn test_zero_without_samples() {
        let estimator = estimator(Arc::new(MemoryStore::new()));
        let quote = estimator.estimate(&query(CallKind::Supply, None)).await.unwrap();
        assert_eq!(quote, FeeQuote::zero());
        assert_eq!(
            estimator.estimate_max(&query(CallKind::Supply, None)).await.unwrap().amount,
            0
        );
    }

    #[tokio::test]
    async fn test_settlement_average_over_window() {
        let ledger = Arc::new(MemoryStore::new());
        // the oldest sample falls outside the window of ten
        ledger
            .record(&sample(GasRole::Settlement, CORE, CallKind::Supply, None, 0, 9_000_000))
            .await
            .unwrap();
        for nonce in 1..=10 {
            ledger
                .record(&sample(GasRole::Settlement, CORE, CallKind::Supply, None, nonce, 1_000_000))
                .await
                .unwrap();
        }

        let quote = estimator(ledger).estimate(&query(CallKind::Supply, None)).await.unwrap();
        assert_eq!(quote.settlement_gas, 1_000_000);
        assert_eq!(quote.payout_gas, 0);
        // 1e6 gas * 1000 mist = 1 sui = 1 USD = 2 matic
        assert!((quote.value - 1.0).abs() < 1e-9);
        assert_eq!(quote.amount, 2_000_000_000_000_000_000);
    }

    #[tokio::test]
    async fn test_payout_leg_and_variant_filter() {
        let ledger = Arc::new(MemoryStore::new());
        ledger
            .record(&sample(GasRole::Settlement, CORE, CallKind::Borrow, Some(2), 1, 1_000_000))
            .await
            .unwrap();
        ledger
            .record(&sample(GasRole::Settlement, CORE, CallKind::Borrow, Some(3), 2, 3_000_000))
            .await
            .unwrap();
        ledger
            .record(&sample(GasRole::Payout, ARBITRUM, CallKind::Borrow, None, 1, 100_000))
            .await
            .unwrap();

        let estimator = estimator(ledger);
        let v2 = estimator.estimate(&query(CallKind::Borrow, Some(2))).await.unwrap();
        assert_eq!(v2.settlement_gas, 1_000_000);
        assert_eq!(v2.payout_gas, 100_000);
        // 1 USD settlement + 1e5 * 1 gwei = 1e-4 eth = 0.2 USD payout
        assert!((v2.value - 1.2).abs() < 1e-9);

        let v3 = estimator.estimate(&query(CallKind::Borrow, Some(3))).await.unwrap();
        assert!(v3.amount > v2.amount);

        let unknown = estimator.estimate(&query(CallKind::Borrow, Some(7))).await.unwrap();
        assert_eq!(unknown.amount, 0);

        let max = estimator.estimate_max(&query(CallKind::Borrow, Some(2))).await.unwrap();
        assert_eq!(max.settlement_gas, 3_000_000);
        assert_eq!(max.payout_gas, 100_000);
    }

    #[tokio::test]
    async fn test_estimate_monotonic_in_gas() {
        let low = Arc::new(MemoryStore::new());
        let high = Arc::new(MemoryStore::new());
        low.record(&sample(GasRole::Settlement, CORE, CallKind::Repay, None, 1, 500_000))
            .await
            .unwrap();
        high.record(&sample(GasRole::Settlement, CORE, CallKind::Repay, None, 1, 800_000))
            .await
            .unwrap();

        let low_quote = estimator(low).estimate(&query(CallKind::Repay, None)).await.unwrap();
        let high_quote = estimator(high).estimate(&query(CallKind::Repay, None)).await.unwrap();
        assert!(high_quote.amount > low_quote.amount);
    }
}
