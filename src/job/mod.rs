//! Relay job model
//!
//! A relay job tracks one cross-chain user call from observation on its
//! source chain through settlement on the core chain and, for calls that move
//! funds out, the payout on the destination chain.

pub mod transition;

pub use transition::{JobPatch, Transition};

use crate::error::{RelayerError, RelayerResult};
use crate::events::RelayEvent;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Failure reason recorded when the core chain accepted the call but declined
/// to execute it because the offered fee did not cover its cost. Jobs failed
/// with this reason are the ones users may relay themselves.
pub const FEE_DECLINED_REASON: &str = "relay fee declined";

/// Business operation carried by a cross-chain call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Binding,
    Unbinding,
    Supply,
    Withdraw,
    Borrow,
    Repay,
    Liquidate,
    AsCollateral,
    CancelAsCollateral,
}

impl CallKind {
    pub const ALL: [CallKind; 9] = [
        CallKind::Binding,
        CallKind::Unbinding,
        CallKind::Supply,
        CallKind::Withdraw,
        CallKind::Borrow,
        CallKind::Repay,
        CallKind::Liquidate,
        CallKind::AsCollateral,
        CallKind::CancelAsCollateral,
    ];

    /// Look up the call kind for an `(app_id, call_type)` pair.
    ///
    /// Unknown pairs are an error; callers must never fall back to a guess.
    pub fn classify(app_id: u16, call_type: u8) -> RelayerResult<Self> {
        let kind = match (app_id, call_type) {
            (0, 0) => CallKind::Binding,
            (0, 1) => CallKind::Unbinding,
            (1, 0) => CallKind::Supply,
            (1, 1) => CallKind::Withdraw,
            (1, 2) => CallKind::Borrow,
            (1, 3) => CallKind::Repay,
            (1, 4) => CallKind::Liquidate,
            (1, 5) => CallKind::AsCollateral,
            (1, 6) => CallKind::CancelAsCollateral,
            _ => return Err(RelayerError::UnknownCallKind { app_id, call_type }),
        };
        Ok(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Binding => "binding",
            CallKind::Unbinding => "unbinding",
            CallKind::Supply => "supply",
            CallKind::Withdraw => "withdraw",
            CallKind::Borrow => "borrow",
            CallKind::Repay => "repay",
            CallKind::Liquidate => "liquidate",
            CallKind::AsCollateral => "as_collateral",
            CallKind::CancelAsCollateral => "cancel_as_collateral",
        }
    }

    /// Whether settlement emits a payout request for a destination chain
    pub fn produces_payout(&self) -> bool {
        matches!(self, CallKind::Withdraw | CallKind::Borrow)
    }

    /// Whether settlement cost depends on the result variant (number of
    /// price feeds consulted), so fee estimates are kept per variant
    pub fn tracks_variant(&self) -> bool {
        matches!(
            self,
            CallKind::Withdraw | CallKind::Borrow | CallKind::CancelAsCollateral
        )
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallKind {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CallKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RelayerError::Internal(format!("unknown call kind: {}", s)))
    }
}

/// Relay job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    AwaitingAttestation,
    Ready,
    AwaitingPayout,
    PayoutPending,
    Success,
    Failed,
    /// Superseded record; no worker produces or consumes it
    Dropped,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::AwaitingAttestation,
        JobStatus::Ready,
        JobStatus::AwaitingPayout,
        JobStatus::PayoutPending,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::Dropped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::AwaitingAttestation => "awaiting_attestation",
            JobStatus::Ready => "ready",
            JobStatus::AwaitingPayout => "awaiting_payout",
            JobStatus::PayoutPending => "payout_pending",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Dropped => "dropped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Dropped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| RelayerError::Internal(format!("unknown job status: {}", s)))
    }
}

/// Per-message unit of work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayJob {
    pub id: Uuid,
    pub source_chain_id: u16,
    pub nonce: u64,
    pub sequence: u64,
    pub emitter: String,
    pub call_kind: CallKind,
    pub status: JobStatus,
    pub source_tx_id: String,
    pub block_number: u64,
    #[serde(serialize_with = "serialize_opt_hex")]
    pub attestation: Option<Vec<u8>>,
    /// Raw fee amount paid on the source chain, in its fee token units
    #[serde(serialize_with = "serialize_u128")]
    pub relay_fee_amount: u128,
    /// Value of the requested fee in the common unit at observation time
    pub relay_fee_requested: f64,
    pub relay_fee_settled: Option<f64>,
    pub core_cost: Option<f64>,
    pub payout_cost: Option<f64>,
    pub core_tx_id: Option<String>,
    pub payout_chain_id: Option<u16>,
    pub payout_address: Option<String>,
    pub payout_sequence: Option<u64>,
    #[serde(serialize_with = "serialize_opt_hex")]
    pub payout_attestation: Option<Vec<u8>>,
    pub payout_tx_id: Option<String>,
    /// Broadcast transaction of the current leg whose receipt was not seen
    /// yet; cleared by every status change
    pub pending_tx_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RelayJob {
    /// Build a fresh job from a source chain event. With an attestation in
    /// hand the job is immediately `ready`.
    pub fn from_event(
        event: &RelayEvent,
        call_kind: CallKind,
        relay_fee_requested: f64,
        attestation: Option<Vec<u8>>,
    ) -> Self {
        let now = Utc::now();
        let created_at = Utc
            .timestamp_opt(event.timestamp as i64, 0)
            .single()
            .filter(|_| event.timestamp > 0)
            .unwrap_or(now);
        let status = if attestation.is_some() {
            JobStatus::Ready
        } else {
            JobStatus::AwaitingAttestation
        };

        Self {
            id: Uuid::new_v4(),
            source_chain_id: event.source_chain_id,
            nonce: event.nonce,
            sequence: event.sequence,
            emitter: event.emitter.clone(),
            call_kind,
            status,
            source_tx_id: event.source_tx_id.clone(),
            block_number: event.block_number,
            attestation,
            relay_fee_amount: event.fee_amount,
            relay_fee_requested,
            relay_fee_settled: None,
            core_cost: None,
            payout_cost: None,
            core_tx_id: None,
            payout_chain_id: None,
            payout_address: None,
            payout_sequence: None,
            payout_attestation: None,
            payout_tx_id: None,
            pending_tx_id: None,
            failure_reason: None,
            created_at,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Fee value still available for the payout leg
    pub fn payout_budget_value(&self) -> f64 {
        let earned = self.relay_fee_settled.unwrap_or(self.relay_fee_requested);
        (earned - self.core_cost.unwrap_or(0.0)).max(0.0)
    }
}

/// Which leg of a relay a gas sample was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasRole {
    Settlement,
    Payout,
}

impl GasRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GasRole::Settlement => "settlement",
            GasRole::Payout => "payout",
        }
    }
}

impl FromStr for GasRole {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "settlement" => Ok(GasRole::Settlement),
            "payout" => Ok(GasRole::Payout),
            other => Err(RelayerError::Internal(format!("unknown gas role: {}", other))),
        }
    }
}

/// Gas used by one executed settlement or payout
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasUsageSample {
    pub source_chain_id: u16,
    pub destination_chain_id: u16,
    pub call_kind: CallKind,
    pub variant: Option<u32>,
    pub nonce: u64,
    pub gas_used: u64,
    pub role: GasRole,
    pub created_at: DateTime<Utc>,
}

fn serialize_opt_hex<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(b) => s.serialize_some(&format!("0x{}", hex::encode(b))),
        None => s.serialize_none(),
    }
}

fn serialize_u128<S: Serializer>(value: &u128, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&value.to_string())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn relay_event(source_chain_id: u16, nonce: u64, sequence: u64, call_type: u8) -> RelayEvent {
        RelayEvent {
            source_chain_id,
            nonce,
            sequence,
            app_id: 1,
            call_type,
            emitter: "0x00000000000000000000000000000000000000a2".to_string(),
            payload: vec![1, call_type],
            fee_amount: 2_000_000_000_000_000,
            block_number: 100 + nonce,
            timestamp: 1_700_000_000,
            source_tx_id: format!("0x{:064x}", nonce),
        }
    }
}
