//! Transaction submission to settlement and payout contracts

use super::gas::GasOracle;
use crate::chain::{ChainProvider, GasPrice};
use crate::error::{RelayerError, RelayerResult};
use crate::events;
use crate::job::CallKind;
use crate::retry::with_timeout;

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A signed attestation to deliver, with the fee the relayer may charge
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub call_kind: CallKind,
    pub attestation: Vec<u8>,
    /// Fee allowance in the target chain's gas token
    pub fee_budget: u128,
}

/// Result of a mined submission
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    pub tx_id: String,
    pub gas_used: u64,
    /// Paid gas cost in the chain's smallest gas token unit
    pub cost: u128,
    /// `false` when the contract accepted the call but declined to execute
    /// it for an insufficient fee
    pub executed: bool,
    /// Result shape reported by the contract, e.g. the number of price feeds
    pub variant: Option<u32>,
}

/// State of a broadcast transaction looked up by id
#[derive(Debug, Clone, PartialEq)]
pub enum TxLookup {
    Mined(SubmissionOutcome),
    /// Mined but reverted, with the chain's reason
    Reverted(String),
    /// Known to the node, not mined yet
    Pending,
    /// Unknown to the node; it will not be mined
    Dropped,
}

/// Delivers attestations to one chain.
///
/// A reverted call is returned as [`RelayerError::Rejected`] carrying the
/// chain's reason.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Submitter: Send + Sync {
    fn chain_id(&self) -> u16;

    /// Broadcast and wait for the receipt. A broadcast whose receipt does not
    /// arrive in time fails with [`RelayerError::Unconfirmed`] carrying its id.
    async fn submit(&self, request: &SubmitRequest, signer: &LocalWallet) -> RelayerResult<SubmissionOutcome>;

    /// Current state of a previously broadcast transaction
    async fn lookup(&self, tx_id: &str) -> RelayerResult<TxLookup>;

    /// Native balance in the smallest gas token unit
    async fn balance(&self, address: Address) -> RelayerResult<u128>;
}

/// Contract entry point a submitter calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMethod {
    /// `relay(bytes attestation, uint256 relayFee)` on the core contract
    Settlement,
    /// `receivePayout(bytes attestation)` on a destination pool
    Payout,
}

impl SubmitMethod {
    pub fn signature(&self) -> &'static str {
        match self {
            SubmitMethod::Settlement => "relay(bytes,uint256)",
            SubmitMethod::Payout => "receivePayout(bytes)",
        }
    }

    pub fn encode(&self, request: &SubmitRequest) -> Vec<u8> {
        let selector = &Keccak256::digest(self.signature().as_bytes())[..4];
        let args = match self {
            SubmitMethod::Settlement => vec![
                Token::Bytes(request.attestation.clone()),
                Token::Uint(U256::from(request.fee_budget)),
            ],
            SubmitMethod::Payout => vec![Token::Bytes(request.attestation.clone())],
        };

        let mut data = selector.to_vec();
        data.extend(abi::encode(&args));
        data
    }
}

/// Submitter for EVM chains
pub struct EvmSubmitter {
    provider: Arc<ChainProvider>,
    contract: Address,
    method: SubmitMethod,
    gas: GasOracle,
    receipt_timeout: Duration,
}

impl EvmSubmitter {
    pub fn new(
        provider: Arc<ChainProvider>,
        contract: &str,
        method: SubmitMethod,
        receipt_timeout: Duration,
    ) -> RelayerResult<Self> {
        let contract: Address = contract
            .parse()
            .map_err(|e| RelayerError::Config(format!("Invalid contract address {}: {}", contract, e)))?;

        Ok(Self {
            provider,
            contract,
            method,
            gas: GasOracle::new(),
            receipt_timeout,
        })
    }

    fn build_tx(&self, from: Address, data: Vec<u8>, nonce: U256, gas_price: &GasPrice) -> TypedTransaction {
        let chain_id = self.provider.config().network_id;
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(from)
                .to(self.contract)
                .data(data)
                .nonce(nonce)
                .gas_price(*price)
                .chain_id(chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(self.contract)
                .data(data)
                .nonce(nonce)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(chain_id)
                .into(),
        }
    }

    /// Read gas, cost and the settlement report off a successful receipt
    fn outcome(
        &self,
        tx_id: String,
        receipt: &TransactionReceipt,
        fallback_price: U256,
    ) -> RelayerResult<SubmissionOutcome> {
        let chain_id = self.provider.chain_id();
        let gas_used = receipt
            .gas_used
            .ok_or_else(|| self.transaction_error("receipt without gas used"))?;
        let effective_price = receipt.effective_gas_price.unwrap_or(fallback_price);
        let cost = u128::try_from(gas_used * effective_price)
            .map_err(|e| self.transaction_error(format!("cost out of range: {}", e)))?;

        let (executed, variant) = match self.method {
            SubmitMethod::Settlement => {
                let report = events::find_settlement_report(&receipt.logs, self.contract)
                    .ok_or_else(|| self.transaction_error(format!("no settlement report in {}", tx_id)))?;
                (report.executed, Some(report.variant))
            }
            SubmitMethod::Payout => (true, None),
        };

        if !executed {
            warn!(chain_id, "Call in {} was not executed", tx_id);
        }

        Ok(SubmissionOutcome {
            tx_id,
            gas_used: gas_used.low_u64(),
            cost,
            executed,
            variant,
        })
    }

    fn transaction_error(&self, message: impl ToString) -> RelayerError {
        RelayerError::Transaction {
            chain_id: self.provider.chain_id(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Submitter for EvmSubmitter {
    fn chain_id(&self) -> u16 {
        self.provider.chain_id()
    }

    async fn submit(&self, request: &SubmitRequest, signer: &LocalWallet) -> RelayerResult<SubmissionOutcome> {
        let chain_id = self.provider.chain_id();
        let wallet = signer.clone().with_chain_id(self.provider.config().network_id);
        let from = wallet.address();

        let nonce = self.provider.get_nonce(from).await?;
        let gas_price = self.gas.gas_price(&self.provider).await?;
        let mut tx = self.build_tx(from, self.method.encode(request), nonce, &gas_price);

        let gas_limit = self.gas.buffered_limit(self.provider.estimate_gas(&tx).await?);
        tx.set_gas(gas_limit);

        let worst_case = GasOracle::calculate_cost(gas_limit, &gas_price);
        if self.method == SubmitMethod::Payout && worst_case > U256::from(request.fee_budget) {
            debug!(
                chain_id,
                "Payout may cost up to {} against a budget of {}", worst_case, request.fee_budget
            );
        }

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let tx_hash = self.provider.send_raw(tx.rlp_signed(&signature)).await?;
        info!(chain_id, "Transaction sent: {:?} ({:?})", tx_hash, self.method);
        crate::metrics::record_tx_submitted(chain_id);

        let tx_id = format!("{:?}", tx_hash);
        let receipt = with_timeout(
            self.receipt_timeout,
            "transaction receipt",
            self.provider.wait_for_receipt(tx_hash),
        )
        .await
        .map_err(|e| match e {
            RelayerError::Timeout { .. } => RelayerError::Unconfirmed {
                chain_id,
                tx_id: tx_id.clone(),
            },
            other => other,
        })?;

        if receipt.status != Some(U64::from(1)) {
            return Err(RelayerError::Rejected {
                chain_id,
                reason: format!("execution reverted in {}", tx_id),
            });
        }
        self.outcome(tx_id, &receipt, gas_price.ceiling())
    }

    async fn lookup(&self, tx_id: &str) -> RelayerResult<TxLookup> {
        let tx_hash: H256 = tx_id
            .parse()
            .map_err(|e| self.transaction_error(format!("invalid tx id {}: {}", tx_id, e)))?;

        let Some(receipt) = self.provider.get_receipt(tx_hash).await? else {
            return Ok(match self.provider.get_transaction(tx_hash).await? {
                Some(_) => TxLookup::Pending,
                None => TxLookup::Dropped,
            });
        };
        if receipt.status != Some(U64::from(1)) {
            return Ok(TxLookup::Reverted(format!("execution reverted in {}", tx_id)));
        }

        let fallback_price = match receipt.effective_gas_price {
            Some(price) => price,
            None => self
                .provider
                .get_transaction(tx_hash)
                .await?
                .and_then(|tx| tx.gas_price)
                .unwrap_or_default(),
        };
        self.outcome(tx_id.to_string(), &receipt, fallback_price)
            .map(TxLookup::Mined)
    }

    async fn balance(&self, address: Address) -> RelayerResult<u128> {
        let balance = self.provider.get_balance(address).await?;
        Ok(u128::try_from(balance).unwrap_or(u128::MAX))
    }
}
