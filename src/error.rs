//! Error types for the relay orchestration engine

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u16, message: String },

    #[error("Transaction error on chain {chain_id}: {message}")]
    Transaction { chain_id: u16, message: String },

    #[error("Call rejected on chain {chain_id}: {reason}")]
    Rejected { chain_id: u16, reason: String },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Unknown call kind for app {app_id} call type {call_type}")]
    UnknownCallKind { app_id: u16, call_type: u8 },

    #[error("Attestation for sequence {sequence} on chain {chain_id} not yet available")]
    AttestationPending { chain_id: u16, sequence: u64 },

    #[error("Attestation network unreachable: {0}")]
    AttestationUnreachable(String),

    #[error("Price feed error for {symbol}: {message}")]
    PriceFeed { symbol: String, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Transaction {tx_id} on chain {chain_id} was broadcast but not confirmed in time")]
    Unconfirmed { chain_id: u16, tx_id: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u16 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Insufficient balance on chain {chain_id}: have {have}, need {need}")]
    InsufficientBalance {
        chain_id: u16,
        have: String,
        need: String,
    },

    #[error("Signer pool is closed")]
    SignerPoolClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a worker reacts to an error raised while processing one job or event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried on the next poll cycle, never written to the job
    Transient,
    /// Terminal; the job is failed with the reason verbatim
    BusinessRejection,
    /// Unknown call kind; the event is skipped
    Classification,
    /// Signer cannot cover the worst-case cost; the job stays where it is
    InsufficientBalance,
}

impl RelayerError {
    /// Classify the error for worker handling
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayerError::Rejected { .. } => ErrorClass::BusinessRejection,
            RelayerError::UnknownCallKind { .. } => ErrorClass::Classification,
            RelayerError::InsufficientBalance { .. } => ErrorClass::InsufficientBalance,
            _ => ErrorClass::Transient,
        }
    }

    /// Check if error is worth retrying inside a single cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::AttestationUnreachable(_)
                | RelayerError::PriceFeed { .. }
                | RelayerError::Database(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientBalance { .. }
                | RelayerError::UnknownCallKind { .. }
                | RelayerError::Wallet(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
