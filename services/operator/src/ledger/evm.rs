//! JSON-RPC ledger client with locally signed transactions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use obsidian_chain::tx::LegacyTransaction;
use obsidian_chain::{abi, Address, OperatorSigner, H256};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::contracts::{self, RpcLog};
use super::rpc::{parse_quantity, parse_u64_quantity, JsonRpcClient};
use super::{
    InstanceRequestedEvent, LedgerClient, LedgerError, OperatorDetails, SignatureWithSaltAndExpiry,
    TxReceipt,
};
use crate::config::{ContractAddresses, LedgerConfig};
use crate::request::RequestId;

/// Headroom applied on top of `eth_estimateGas`, in percent.
const GAS_HEADROOM_PERCENT: u64 = 20;

/// Upper bound on any single JSON-RPC round trip.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: H256,
    block_number: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Ledger client for an EVM node.
pub struct EvmLedger {
    rpc: JsonRpcClient,
    signer: Arc<OperatorSigner>,
    chain_id: u64,
    contracts: ContractAddresses,
    /// Held from nonce fetch to broadcast so concurrent writes get distinct nonces.
    nonce_lock: Mutex<()>,
    confirmation_timeout: Duration,
    receipt_poll_interval: Duration,
}

impl EvmLedger {
    pub fn new(config: &LedgerConfig, signer: Arc<OperatorSigner>) -> Result<Self, LedgerError> {
        let rpc = JsonRpcClient::new(&config.rpc_url, RPC_TIMEOUT)?;
        Ok(Self {
            rpc,
            signer,
            chain_id: config.chain_id,
            contracts: config.contracts,
            nonce_lock: Mutex::new(()),
            confirmation_timeout: config.confirmation_timeout,
            receipt_poll_interval: config.receipt_poll_interval,
        })
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, LedgerError> {
        let result: String = self
            .rpc
            .request(
                "eth_call",
                json!([{ "to": to, "data": hex_data(&data) }, "latest"]),
            )
            .await
            .map_err(|e| LedgerError::Read(e.to_string()))?;
        contracts::decode_hex(&result)
    }

    /// Signs and broadcasts a call to `to`, then waits for its receipt.
    #[instrument(skip(self, to, data))]
    async fn send_transaction(
        &self,
        label: &'static str,
        to: Address,
        data: Vec<u8>,
    ) -> Result<TxReceipt, LedgerError> {
        let from = self.signer.address();

        let tx_hash = {
            let _nonce = self.nonce_lock.lock().await;

            let nonce: String = self
                .rpc
                .request("eth_getTransactionCount", json!([from, "pending"]))
                .await
                .map_err(|e| LedgerError::Write(format!("{label}: nonce lookup failed: {e}")))?;
            let gas_price: String = self
                .rpc
                .request("eth_gasPrice", json!([]))
                .await
                .map_err(|e| LedgerError::Write(format!("{label}: gas price lookup failed: {e}")))?;
            let estimate: String = self
                .rpc
                .request(
                    "eth_estimateGas",
                    json!([{ "from": from, "to": to, "data": hex_data(&data) }]),
                )
                .await
                .map_err(|e| LedgerError::Write(format!("{label}: {e}")))?;

            let estimate = parse_u64_quantity(&estimate)?;
            let tx = LegacyTransaction {
                nonce: parse_u64_quantity(&nonce)?,
                gas_price: parse_quantity(&gas_price)?,
                gas_limit: estimate.saturating_mul(100 + GAS_HEADROOM_PERCENT) / 100,
                to,
                value: 0,
                data,
                chain_id: self.chain_id,
            };
            let (raw, local_hash) = tx
                .sign(&self.signer)
                .map_err(|e| LedgerError::Write(format!("{label}: signing failed: {e}")))?;

            let submitted: H256 = self
                .rpc
                .request("eth_sendRawTransaction", json!([hex_data(&raw)]))
                .await
                .map_err(|e| LedgerError::Write(format!("{label}: {e}")))?;
            if submitted != local_hash {
                warn!(local = %local_hash, node = %submitted, "Node returned unexpected transaction hash");
            }
            debug!(tx_hash = %submitted, nonce = tx.nonce, gas_limit = tx.gas_limit, "Transaction submitted");
            submitted
        };

        let receipt = self.wait_for_receipt(tx_hash).await?;
        info!(label, tx_hash = %receipt.tx_hash, block = receipt.block_number, "Transaction confirmed");
        Ok(receipt)
    }

    async fn wait_for_receipt(&self, tx_hash: H256) -> Result<TxReceipt, LedgerError> {
        let poll = async {
            loop {
                match self
                    .rpc
                    .request::<Option<RpcReceipt>>("eth_getTransactionReceipt", json!([tx_hash]))
                    .await
                {
                    Ok(Some(receipt)) if receipt.block_number.is_some() => return receipt,
                    Ok(_) => {}
                    Err(e) => debug!(tx_hash = %tx_hash, error = %e, "Receipt poll failed"),
                }
                tokio::time::sleep(self.receipt_poll_interval).await;
            }
        };

        let receipt = tokio::time::timeout(self.confirmation_timeout, poll)
            .await
            .map_err(|_| LedgerError::Timeout {
                tx_hash,
                waited: self.confirmation_timeout,
            })?;

        if receipt.status.as_deref() == Some("0x0") {
            return Err(LedgerError::Reverted {
                tx_hash: receipt.transaction_hash,
            });
        }
        let block_number = match receipt.block_number.as_deref() {
            Some(block) => parse_u64_quantity(block)?,
            None => 0,
        };
        Ok(TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number,
        })
    }
}

#[async_trait]
impl LedgerClient for EvmLedger {
    fn operator(&self) -> Address {
        self.signer.address()
    }

    async fn block_number(&self) -> Result<u64, LedgerError> {
        let head: String = self
            .rpc
            .request("eth_blockNumber", json!([]))
            .await
            .map_err(|e| LedgerError::Read(e.to_string()))?;
        Ok(parse_u64_quantity(&head)?)
    }

    async fn instance_requests(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<InstanceRequestedEvent>, LedgerError> {
        let filter = json!({
            "fromBlock": format!("{from:#x}"),
            "toBlock": format!("{to:#x}"),
            "address": self.contracts.service_manager,
            "topics": [contracts::instance_requested_topic()],
        });
        let logs: Vec<RpcLog> = self
            .rpc
            .request("eth_getLogs", json!([filter]))
            .await
            .map_err(|e| LedgerError::Read(e.to_string()))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|log| !log.removed) {
            match contracts::decode_instance_requested(log) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    block = ?log.block_number,
                    error = %e,
                    "Skipping undecodable CreateInstanceRequested log"
                ),
            }
        }
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
        let data = contracts::registration_digest(operator, avs, salt, expiry);
        let output = self.call(self.contracts.avs_directory, data).await?;
        Ok(H256::from(abi::word_at(&output, 0)?))
    }

    async fn register_as_operator(
        &self,
        details: &OperatorDetails,
        metadata_uri: &str,
    ) -> Result<TxReceipt, LedgerError> {
        self.send_transaction(
            "registerAsOperator",
            self.contracts.delegation_manager,
            contracts::register_as_operator(details, metadata_uri),
        )
        .await
    }

    async fn register_operator_with_signature(
        &self,
        signature: &SignatureWithSaltAndExpiry,
        operator: Address,
    ) -> Result<TxReceipt, LedgerError> {
        self.send_transaction(
            "registerOperatorWithSignature",
            self.contracts.stake_registry,
            contracts::register_operator_with_signature(signature, operator),
        )
        .await
    }

    async fn register_instance(
        &self,
        requester: Address,
        request_id: RequestId,
    ) -> Result<TxReceipt, LedgerError> {
        self.send_transaction(
            "registerInstance",
            self.contracts.service_manager,
            contracts::register_instance(requester, request_id),
        )
        .await
    }

    async fn report_error(&self, request_id: RequestId, message: &str) -> Result<TxReceipt, LedgerError> {
        self.send_transaction(
            "reportError",
            self.contracts.service_manager,
            contracts::report_error(request_id, message),
        )
        .await
    }

    async fn create_instance(&self) -> Result<TxReceipt, LedgerError> {
        self.send_transaction(
            "createInstance",
            self.contracts.service_manager,
            contracts::create_instance(),
        )
        .await
    }

    async fn terminate_instance(&self, instance_id: u64) -> Result<TxReceipt, LedgerError> {
        self.send_transaction(
            "terminateInstance",
            self.contracts.service_manager,
            contracts::terminate_instance(instance_id),
        )
        .await
    }
}

fn hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_data() {
        assert_eq!(hex_data(&[]), "0x");
        assert_eq!(hex_data(&[0xde, 0xad]), "0xdead");
    }

    #[test]
    fn test_receipt_parsing() {
        let raw = r#"{
            "transactionHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "0x2a",
            "status": "0x1"
        }"#;
        let receipt: RpcReceipt = serde_json::from_str(raw).unwrap();
        assert_eq!(receipt.block_number.as_deref(), Some("0x2a"));
        assert_eq!(receipt.status.as_deref(), Some("0x1"));
    }
}
