//! Ledger client.
//!
//! Reads (`eth_blockNumber`, `eth_getLogs`, `eth_call`) and confirmed
//! transaction writes against the contracts the operator talks to. The
//! engine only sees the [`LedgerClient`] trait:
//! - `evm`: JSON-RPC node with locally signed legacy transactions
//! - `mock`: in-memory ledger for tests and development

use std::time::Duration;

use async_trait::async_trait;
use obsidian_chain::{Address, H256};
use thiserror::Error;

use crate::request::RequestId;

pub mod contracts;
pub mod evm;
pub mod mock;
pub mod rpc;

pub use evm::EvmLedger;
pub use mock::{LedgerCall, MockLedger};
pub use rpc::{JsonRpcClient, RpcError};

/// Errors from ledger operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A read (block number, logs, view call) failed.
    #[error("ledger read failed: {0}")]
    Read(String),

    /// A transaction could not be built, signed or submitted.
    #[error("ledger write failed: {0}")]
    Write(String),

    /// The transaction was mined but reverted.
    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: H256 },

    /// No receipt within the confirmation timeout.
    #[error("transaction {tx_hash} not confirmed after {waited:?}")]
    Timeout { tx_hash: H256, waited: Duration },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Log or return data did not match the expected ABI shape.
    #[error("ledger decode error: {0}")]
    Decode(String),
}

impl From<obsidian_chain::ChainError> for LedgerError {
    fn from(err: obsidian_chain::ChainError) -> Self {
        LedgerError::Decode(err.to_string())
    }
}

/// A mined, successful transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
}

/// Decoded `CreateInstanceRequested` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequestedEvent {
    pub request_id: RequestId,
    pub requester: Address,
    pub timestamp: u64,
    pub block_number: u64,
    pub log_index: u64,
}

/// Operator details submitted to the delegation manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorDetails {
    pub earnings_receiver: Address,
    pub delegation_approver: Address,
    pub staker_opt_out_window_blocks: u32,
}

impl OperatorDetails {
    /// Self-receiving operator with no delegation approver and no opt-out window.
    pub fn for_operator(operator: Address) -> Self {
        Self {
            earnings_receiver: operator,
            delegation_approver: Address::ZERO,
            staker_opt_out_window_blocks: 0,
        }
    }
}

/// Signed registration payload for the stake registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureWithSaltAndExpiry {
    /// 65-byte `r || s || v`.
    pub signature: Vec<u8>,
    pub salt: H256,
    /// Unix seconds.
    pub expiry: u64,
}

/// Ledger API used by the operator.
///
/// Every write returns only once the transaction is mined successfully.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Address transactions are sent from.
    fn operator(&self) -> Address;

    /// Latest block number.
    async fn block_number(&self) -> Result<u64, LedgerError>;

    /// `CreateInstanceRequested` events in `[from, to]`, in log order.
    async fn instance_requests(&self, from: u64, to: u64)
        -> Result<Vec<InstanceRequestedEvent>, LedgerError>;

    /// AVS directory view call computing the registration digest.
    async fn registration_digest(
        &self,
        operator: Address,
        avs: Address,
        salt: H256,
        expiry: u64,
    ) -> Result<H256, LedgerError>;

    async fn register_as_operator(
        &self,
        details: &OperatorDetails,
        metadata_uri: &str,
    ) -> Result<TxReceipt, LedgerError>;

    async fn register_operator_with_signature(
        &self,
        signature: &SignatureWithSaltAndExpiry,
        operator: Address,
    ) -> Result<TxReceipt, LedgerError>;

    /// Records a provisioned instance for `requester`.
    async fn register_instance(
        &self,
        requester: Address,
        request_id: RequestId,
    ) -> Result<TxReceipt, LedgerError>;

    /// Records a provisioning failure for `request_id`.
    async fn report_error(&self, request_id: RequestId, message: &str) -> Result<TxReceipt, LedgerError>;

    /// Service manager `createInstance()`.
    async fn create_instance(&self) -> Result<TxReceipt, LedgerError>;

    /// Service manager `terminateInstance(uint256)`.
    async fn terminate_instance(&self, instance_id: u64) -> Result<TxReceipt, LedgerError>;
}
