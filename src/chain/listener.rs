//! Confirmation-aware log polling
//!
//! An [`EventSource`] returns the events recorded after a cursor together
//! with the cursor to persist once they are handled. Ranges never extend past
//! the chain head minus its confirmation depth and are capped at the chain's
//! `max_block_range`.

use super::ChainProvider;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{self, topics, PayoutRequest, RelayEvent};

use async_trait::async_trait;
use ethers::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Events found in one polled block range
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch<E> {
    /// Ordered by block and log index
    pub events: Vec<E>,
    /// Last block covered by this batch
    pub next_cursor: u64,
}

impl<E> EventBatch<E> {
    pub fn empty(cursor: u64) -> Self {
        Self {
            events: Vec::new(),
            next_cursor: cursor,
        }
    }
}

#[async_trait]
pub trait EventSource<E>: Send + Sync {
    fn chain_id(&self) -> u16;

    /// Fetch events in blocks after `cursor`
    async fn poll(&self, cursor: u64) -> RelayerResult<EventBatch<E>>;
}

/// Polls one contract's logs over JSON-RPC
pub struct EvmEventSource {
    provider: Arc<ChainProvider>,
    address: Address,
    /// Attestation emitter recorded on relay events
    emitter: String,
}

impl EvmEventSource {
    pub fn new(provider: Arc<ChainProvider>, address: &str, emitter: &str) -> RelayerResult<Self> {
        let address: Address = address
            .parse()
            .map_err(|e| RelayerError::Config(format!("Invalid contract address {}: {}", address, e)))?;

        Ok(Self {
            provider,
            address,
            emitter: emitter.to_string(),
        })
    }

    /// Block range after `cursor` that is safe to read
    async fn next_range(&self, cursor: u64) -> RelayerResult<Option<(u64, u64)>> {
        let confirmed = self.provider.confirmed_head().await?;
        Ok(block_range(
            cursor,
            confirmed,
            self.provider.config().max_block_range,
        ))
    }

    async fn fetch_logs(&self, from: u64, to: u64, topic: H256) -> RelayerResult<Vec<Log>> {
        let filter = Filter::new()
            .address(self.address)
            .topic0(topic)
            .from_block(from)
            .to_block(to);

        let mut logs = self.provider.get_logs(&filter).await?;
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        debug!(
            "Chain {}: {} logs in blocks {} to {}",
            self.provider.chain_id(),
            logs.len(),
            from,
            to
        );
        Ok(logs)
    }
}

/// `(cursor, min(confirmed, cursor + max_range)]`, or `None` when nothing new
/// is confirmed
pub fn block_range(cursor: u64, confirmed: u64, max_range: u64) -> Option<(u64, u64)> {
    if confirmed <= cursor {
        return None;
    }
    let from = cursor + 1;
    let to = confirmed.min(cursor.saturating_add(max_range.max(1)));
    Some((from, to))
}

#[async_trait]
impl EventSource<RelayEvent> for EvmEventSource {
    fn chain_id(&self) -> u16 {
        self.provider.chain_id()
    }

    async fn poll(&self, cursor: u64) -> RelayerResult<EventBatch<RelayEvent>> {
        let Some((from, to)) = self.next_range(cursor).await? else {
            return Ok(EventBatch::empty(cursor));
        };

        let chain_id = self.provider.chain_id();
        let mut timestamps: HashMap<u64, u64> = HashMap::new();
        let mut batch = EventBatch::empty(to);

        for log in self.fetch_logs(from, to, *topics::RELAY_EVENT).await? {
            let block = log.block_number.map(|b| b.as_u64()).unwrap_or(to);
            let timestamp = match timestamps.get(&block) {
                Some(ts) => *ts,
                None => {
                    let ts = self.provider.block_timestamp(block).await?;
                    timestamps.insert(block, ts);
                    ts
                }
            };

            match events::decode_relay_event(chain_id, &self.emitter, &log, timestamp) {
                Ok(event) => batch.events.push(event),
                Err(e) => error!(chain_id, "Skipping undecodable relay log {:?}: {}", log.transaction_hash, e),
            }
        }

        Ok(batch)
    }
}

#[async_trait]
impl EventSource<PayoutRequest> for EvmEventSource {
    fn chain_id(&self) -> u16 {
        self.provider.chain_id()
    }

    async fn poll(&self, cursor: u64) -> RelayerResult<EventBatch<PayoutRequest>> {
        let Some((from, to)) = self.next_range(cursor).await? else {
            return Ok(EventBatch::empty(cursor));
        };

        let mut batch = EventBatch::empty(to);
        for log in self.fetch_logs(from, to, *topics::PAYOUT_REQUEST).await? {
            match events::decode_payout_request(&log) {
                Ok(request) => batch.events.push(request),
                Err(e) => error!(
                    chain_id = self.provider.chain_id(),
                    "Skipping undecodable payout log {:?}: {}",
                    log.transaction_hash,
                    e
                ),
            }
        }

        Ok(batch)
    }
}
