//! Contract event types and parsing
//!
//! Defines the events the relayer consumes: relay requests emitted by source
//! chain portals, payout requests and settlement reports emitted by the core
//! contract.

use crate::error::{RelayerError, RelayerResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use serde::{Deserialize, Serialize};

/// A user call emitted by a source chain portal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEvent {
    pub source_chain_id: u16,
    pub nonce: u64,
    pub sequence: u64,
    pub app_id: u16,
    pub call_type: u8,
    /// Emitter whose attestation covers this message
    pub emitter: String,
    pub payload: Vec<u8>,
    pub fee_amount: u128,
    pub block_number: u64,
    pub timestamp: u64,
    pub source_tx_id: String,
}

/// A payout request emitted by the core contract during settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub source_chain_id: u16,
    pub source_nonce: u64,
    /// Sequence of the payout attestation on the core emitter
    pub sequence: u64,
    pub call_type: u8,
    pub payout_chain_id: u16,
    pub payout_address: String,
    pub block_number: u64,
    pub tx_id: String,
}

/// Execution report the core contract logs for each settlement call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementReport {
    pub source_chain_id: u16,
    pub nonce: u64,
    pub executed: bool,
    pub variant: u32,
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use lazy_static::lazy_static;
    use sha3::{Digest, Keccak256};

    pub const RELAY_EVENT_SIGNATURE: &str = "RelayEvent(uint64,uint64,uint256,uint16,uint8,bytes)";
    pub const PAYOUT_REQUEST_SIGNATURE: &str = "PayoutRequest(uint16,uint64,uint64,uint8,uint16,bytes)";
    pub const RELAY_EXECUTED_SIGNATURE: &str = "RelayExecuted(uint16,uint64,bool,uint32)";

    pub fn keccak(signature: &str) -> H256 {
        H256::from_slice(&Keccak256::digest(signature.as_bytes()))
    }

    lazy_static! {
        pub static ref RELAY_EVENT: H256 = keccak(RELAY_EVENT_SIGNATURE);
        pub static ref PAYOUT_REQUEST: H256 = keccak(PAYOUT_REQUEST_SIGNATURE);
        pub static ref RELAY_EXECUTED: H256 = keccak(RELAY_EXECUTED_SIGNATURE);
    }
}

/// Parse a portal log into a [`RelayEvent`]
pub fn decode_relay_event(
    source_chain_id: u16,
    emitter: &str,
    log: &Log,
    timestamp: u64,
) -> RelayerResult<RelayEvent> {
    expect_topic(log, *topics::RELAY_EVENT)?;
    let tokens = abi::decode(
        &[
            ParamType::Uint(64),
            ParamType::Uint(64),
            ParamType::Uint(256),
            ParamType::Uint(16),
            ParamType::Uint(8),
            ParamType::Bytes,
        ],
        &log.data,
    )
    .map_err(|e| RelayerError::EventParsing(format!("RelayEvent: {}", e)))?;

    Ok(RelayEvent {
        source_chain_id,
        sequence: to_u64(uint_at(&tokens, 0)?)?,
        nonce: to_u64(uint_at(&tokens, 1)?)?,
        fee_amount: u128::try_from(uint_at(&tokens, 2)?)
            .map_err(|e| RelayerError::EventParsing(format!("fee amount: {}", e)))?,
        app_id: to_u64(uint_at(&tokens, 3)?)? as u16,
        call_type: to_u64(uint_at(&tokens, 4)?)? as u8,
        emitter: emitter.to_string(),
        payload: bytes_at(&tokens, 5)?,
        block_number: block_number(log),
        timestamp,
        source_tx_id: tx_hash(log),
    })
}

/// Parse a core contract log into a [`PayoutRequest`]
pub fn decode_payout_request(log: &Log) -> RelayerResult<PayoutRequest> {
    expect_topic(log, *topics::PAYOUT_REQUEST)?;
    let tokens = abi::decode(
        &[
            ParamType::Uint(16),
            ParamType::Uint(64),
            ParamType::Uint(64),
            ParamType::Uint(8),
            ParamType::Uint(16),
            ParamType::Bytes,
        ],
        &log.data,
    )
    .map_err(|e| RelayerError::EventParsing(format!("PayoutRequest: {}", e)))?;

    Ok(PayoutRequest {
        source_chain_id: to_u64(uint_at(&tokens, 0)?)? as u16,
        source_nonce: to_u64(uint_at(&tokens, 1)?)?,
        sequence: to_u64(uint_at(&tokens, 2)?)?,
        call_type: to_u64(uint_at(&tokens, 3)?)? as u8,
        payout_chain_id: to_u64(uint_at(&tokens, 4)?)? as u16,
        payout_address: format!("0x{}", hex::encode(bytes_at(&tokens, 5)?)),
        block_number: block_number(log),
        tx_id: tx_hash(log),
    })
}

/// Find the settlement report emitted by `contract` among receipt logs
pub fn find_settlement_report(logs: &[Log], contract: Address) -> Option<SettlementReport> {
    logs.iter()
        .filter(|log| log.address == contract)
        .filter(|log| log.topics.first() == Some(&*topics::RELAY_EXECUTED))
        .find_map(|log| {
            let tokens = abi::decode(
                &[
                    ParamType::Uint(16),
                    ParamType::Uint(64),
                    ParamType::Bool,
                    ParamType::Uint(32),
                ],
                &log.data,
            )
            .ok()?;
            Some(SettlementReport {
                source_chain_id: tokens.first()?.clone().into_uint()?.low_u64() as u16,
                nonce: tokens.get(1)?.clone().into_uint()?.low_u64(),
                executed: tokens.get(2)?.clone().into_bool()?,
                variant: tokens.get(3)?.clone().into_uint()?.low_u32(),
            })
        })
}

fn expect_topic(log: &Log, topic: H256) -> RelayerResult<()> {
    match log.topics.first() {
        Some(t) if *t == topic => Ok(()),
        other => Err(RelayerError::EventParsing(format!(
            "unexpected topic {:?}",
            other
        ))),
    }
}

fn uint_at(tokens: &[Token], index: usize) -> RelayerResult<U256> {
    tokens
        .get(index)
        .cloned()
        .and_then(Token::into_uint)
        .ok_or_else(|| RelayerError::EventParsing(format!("missing uint at {}", index)))
}

fn bytes_at(tokens: &[Token], index: usize) -> RelayerResult<Vec<u8>> {
    tokens
        .get(index)
        .cloned()
        .and_then(Token::into_bytes)
        .ok_or_else(|| RelayerError::EventParsing(format!("missing bytes at {}", index)))
}

fn to_u64(value: U256) -> RelayerResult<u64> {
    u64::try_from(value).map_err(|e| RelayerError::EventParsing(e.to_string()))
}

fn block_number(log: &Log) -> u64 {
    log.block_number.map(|b| b.as_u64()).unwrap_or(0)
}

fn tx_hash(log: &Log) -> String {
    format!("{:?}", log.transaction_hash.unwrap_or_default())
}
