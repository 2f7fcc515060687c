//! Transaction submission with signer rotation and gas buffering

mod gas;
mod rotator;
mod sender;

pub use gas::GasOracle;
pub use rotator::{AccountRotator, SignerLease};
pub use sender::{EvmSubmitter, SubmissionOutcome, SubmitMethod, SubmitRequest, Submitter, TxLookup};

#[cfg(test)]
pub(crate) use rotator::test_wallets;
#[cfg(test)]
pub use sender::MockSubmitter;
