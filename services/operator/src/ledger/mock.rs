//! In-memory ledger for testing and development.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use obsidian_chain::{keccak256, Address, H256};
use tracing::info;

use super::{
    InstanceRequestedEvent, LedgerClient, LedgerError, OperatorDetails, SignatureWithSaltAndExpiry,
    TxReceipt,
};
use crate::request::RequestId;

/// A confirmed write observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    RegisterAsOperator {
        earnings_receiver: Address,
    },
    RegisterOperatorWithSignature {
        operator: Address,
        signature: Vec<u8>,
        salt: H256,
        expiry: u64,
    },
    RegisterInstance {
        requester: Address,
        request_id: RequestId,
    },
    ReportError {
        request_id: RequestId,
        message: String,
    },
    CreateInstance,
    TerminateInstance {
        instance_id: u64,
    },
}

impl LedgerCall {
    pub fn is_register_instance(&self) -> bool {
        matches!(self, LedgerCall::RegisterInstance { .. })
    }

    pub fn is_report_error(&self) -> bool {
        matches!(self, LedgerCall::ReportError { .. })
    }
}

/// Mock ledger that records confirmed writes and serves scripted events.
pub struct MockLedger {
    operator: Address,
    head: AtomicU64,
    events: Mutex<Vec<InstanceRequestedEvent>>,
    calls: Mutex<Vec<LedgerCall>>,
    write_attempts: AtomicU64,
    fail_reads: AtomicBool,
    fail_register_as_operator: AtomicBool,
    fail_signature_registration: AtomicBool,
    fail_digest: AtomicBool,
    register_instance_failures: AtomicU32,
    report_error_failures: AtomicU32,
}

impl MockLedger {
    pub fn new(operator: Address) -> Self {
        Self {
            operator,
            head: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            write_attempts: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_register_as_operator: AtomicBool::new(false),
            fail_signature_registration: AtomicBool::new(false),
            fail_digest: AtomicBool::new(false),
            register_instance_failures: AtomicU32::new(0),
            report_error_failures: AtomicU32::new(0),
        }
    }

    /// Mines a block containing one `CreateInstanceRequested` event and
    /// returns its number.
    pub fn emit(&self, request_id: u64, requester: Address, timestamp: u64) -> u64 {
        let block = self.head.fetch_add(1, Ordering::SeqCst) + 1;
        self.push_event(InstanceRequestedEvent {
            request_id: RequestId::new(request_id),
            requester,
            timestamp,
            block_number: block,
            log_index: 0,
        });
        block
    }

    /// Adds an event as-is. The head is not moved.
    pub fn push_event(&self, event: InstanceRequestedEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn set_head(&self, block: u64) {
        self.head.store(block, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_register_as_operator(&self, fail: bool) {
        self.fail_register_as_operator.store(fail, Ordering::SeqCst);
    }

    pub fn fail_signature_registration(&self, fail: bool) {
        self.fail_signature_registration.store(fail, Ordering::SeqCst);
    }

    pub fn fail_digest(&self, fail: bool) {
        self.fail_digest.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` `registerInstance` submissions.
    pub fn fail_register_instance(&self, n: u32) {
        self.register_instance_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `reportError` submissions.
    pub fn fail_report_error(&self, n: u32) {
        self.report_error_failures.store(n, Ordering::SeqCst);
    }

    /// Confirmed writes, in order.
    pub fn calls(&self) -> Vec<LedgerCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn register_instance_calls(&self) -> Vec<LedgerCall> {
        self.calls()
            .into_iter()
            .filter(LedgerCall::is_register_instance)
            .collect()
    }

    pub fn report_error_calls(&self) -> Vec<LedgerCall> {
        self.calls()
            .into_iter()
            .filter(LedgerCall::is_report_error)
            .collect()
    }

    /// Submissions attempted, including failed ones.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// The digest the mock AVS directory returns.
    pub fn expected_digest(operator: Address, avs: Address, salt: H256, expiry: u64) -> H256 {
        let mut preimage = Vec::with_capacity(20 + 20 + 32 + 8);
        preimage.extend_from_slice(operator.as_bytes());
        preimage.extend_from_slice(avs.as_bytes());
        preimage.extend_from_slice(salt.as_bytes());
        preimage.extend_from_slice(&expiry.to_be_bytes());
        H256::from(keccak256(preimage))
    }

    fn confirm(&self, call: LedgerCall) -> TxReceipt {
        info!(call = ?call, "[MOCK] Transaction confirmed");
        let tx_hash = H256::from(keccak256(format!("{call:?}:{}", self.write_attempts()).as_bytes()));
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        TxReceipt {
            tx_hash,
            block_number: self.head.load(Ordering::SeqCst),
        }
    }

    fn attempt(&self) {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<(), LedgerError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LedgerError::Read("connection refused".into()));
        }
        Ok(())
    }
}

/// Decrements `counter` if positive; true when this call should fail.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl LedgerClient for MockLedger {
    fn operator(&self) -> Address {
        self.operator
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.check_reads()?;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn instance_requests(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<InstanceRequestedEvent>, LedgerError> {
        self.check_reads()?;
        let mut events: Vec<_> = self
            .events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.block_number >= from && e.block_number <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn registration_digest(
        &self,
        operator: Address,
        avs: Address,
        salt: H256,
        expiry: u64,
    ) -> Result<H256, LedgerError> {
        self.check_reads()?;
        if self.fail_digest.load(Ordering::SeqCst) {
            return Err(LedgerError::Read("execution reverted".into()));
        }
        Ok(Self::expected_digest(operator, avs, salt, expiry))
    }

    async fn register_as_operator(
        &self,
        details: &OperatorDetails,
        _metadata_uri: &str,
    ) -> Result<TxReceipt, LedgerError> {
        self.attempt();
        if self.fail_register_as_operator.load(Ordering::SeqCst) {
            return Err(LedgerError::Write(
                "registerAsOperator: operator has already registered".into(),
            ));
        }
        Ok(self.confirm(LedgerCall::RegisterAsOperator {
            earnings_receiver: details.earnings_receiver,
        }))
    }

    async fn register_operator_with_signature(
        &self,
        signature: &SignatureWithSaltAndExpiry,
        operator: Address,
    ) -> Result<TxReceipt, LedgerError> {
        self.attempt();
        if self.fail_signature_registration.load(Ordering::SeqCst) {
            return Err(LedgerError::Write(
                "registerOperatorWithSignature: execution reverted".into(),
            ));
        }
        Ok(self.confirm(LedgerCall::RegisterOperatorWithSignature {
            operator,
            signature: signature.signature.clone(),
            salt: signature.salt,
            expiry: signature.expiry,
        }))
    }

    async fn register_instance(
        &self,
        requester: Address,
        request_id: RequestId,
    ) -> Result<TxReceipt, LedgerError> {
        self.attempt();
        if take_failure(&self.register_instance_failures) {
            return Err(LedgerError::Write("registerInstance: nonce too low".into()));
        }
        Ok(self.confirm(LedgerCall::RegisterInstance {
            requester,
            request_id,
        }))
    }

    async fn report_error(&self, request_id: RequestId, message: &str) -> Result<TxReceipt, LedgerError> {
        self.attempt();
        if take_failure(&self.report_error_failures) {
            return Err(LedgerError::Write("reportError: nonce too low".into()));
        }
        Ok(self.confirm(LedgerCall::ReportError {
            request_id,
            message: message.to_string(),
        }))
    }

    async fn create_instance(&self) -> Result<TxReceipt, LedgerError> {
        self.attempt();
        Ok(self.confirm(LedgerCall::CreateInstance))
    }

    async fn terminate_instance(&self, instance_id: u64) -> Result<TxReceipt, LedgerError> {
        self.attempt();
        Ok(self.confirm(LedgerCall::TerminateInstance { instance_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requester() -> Address {
        Address::from([0xab; 20])
    }

    #[tokio::test]
    async fn test_emit_moves_head_and_filters_by_range() {
        let ledger = MockLedger::new(Address::ZERO);
        let b1 = ledger.emit(1, requester(), 100);
        let b2 = ledger.emit(2, requester(), 101);
        assert_eq!((b1, b2), (1, 2));
        assert_eq!(ledger.block_number().await.unwrap(), 2);

        let events = ledger.instance_requests(2, 2).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id, RequestId::new(2));
    }

    #[tokio::test]
    async fn test_failure_budget_is_consumed() {
        let ledger = MockLedger::new(Address::ZERO);
        ledger.fail_register_instance(1);

        assert!(ledger.register_instance(requester(), RequestId::new(7)).await.is_err());
        assert!(ledger.register_instance(requester(), RequestId::new(7)).await.is_ok());
        assert_eq!(ledger.write_attempts(), 2);
        assert_eq!(ledger.register_instance_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_reads() {
        let ledger = MockLedger::new(Address::ZERO);
        ledger.fail_reads(true);
        assert!(matches!(ledger.block_number().await, Err(LedgerError::Read(_))));
    }
}
