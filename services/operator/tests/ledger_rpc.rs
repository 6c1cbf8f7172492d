//! EVM ledger client against a stubbed JSON-RPC node.

use std::sync::Arc;
use std::time::Duration;

use obsidian_chain::{Address, OperatorSigner, H256};
use obsidian_operator::config::{ContractAddresses, LedgerConfig, Secret};
use obsidian_operator::ledger::contracts::instance_requested_topic;
use obsidian_operator::ledger::{EvmLedger, LedgerClient, LedgerError};
use obsidian_operator::request::RequestId;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const OPERATOR_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const SERVICE_MANAGER: &str = "0x4444444444444444444444444444444444444444";
const TX_HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

fn ledger_config(server: &MockServer) -> LedgerConfig {
    LedgerConfig {
        rpc_url: server.uri(),
        chain_id: 31337,
        private_key: Secret::new(OPERATOR_KEY),
        contracts: ContractAddresses {
            delegation_manager: Address::from([0x11; 20]),
            avs_directory: Address::from([0x22; 20]),
            stake_registry: Address::from([0x33; 20]),
            service_manager: Address::parse(SERVICE_MANAGER).unwrap(),
        },
        start_block: None,
        max_block_range: 1000,
        poll_interval: Duration::from_millis(100),
        confirmation_timeout: Duration::from_millis(500),
        receipt_poll_interval: Duration::from_millis(10),
    }
}

fn ledger(server: &MockServer) -> EvmLedger {
    let signer = Arc::new(OperatorSigner::from_hex(OPERATOR_KEY).unwrap());
    EvmLedger::new(&ledger_config(server), signer).unwrap()
}

async fn mount_rpc(server: &MockServer, rpc_method: &str, result: Value) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": rpc_method })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": result,
        })))
        .mount(server)
        .await;
}

async fn mount_submission(server: &MockServer) {
    mount_rpc(server, "eth_getTransactionCount", json!("0x3")).await;
    mount_rpc(server, "eth_gasPrice", json!("0x3b9aca00")).await;
    mount_rpc(server, "eth_estimateGas", json!("0x5208")).await;
    mount_rpc(server, "eth_sendRawTransaction", json!(TX_HASH)).await;
}

fn word(value: u64) -> String {
    format!("{value:064x}")
}

#[tokio::test]
async fn test_block_number() {
    let server = MockServer::start().await;
    mount_rpc(&server, "eth_blockNumber", json!("0x2a")).await;

    assert_eq!(ledger(&server).block_number().await.unwrap(), 42);
}

#[tokio::test]
async fn test_instance_requests_decodes_and_orders_logs() {
    let server = MockServer::start().await;
    let topic0 = instance_requested_topic().to_string();
    let requester_topic = format!("0x{}abc0000000000000000000000000000000000abc", "0".repeat(24));

    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "eth_getLogs",
            "params": [{
                "fromBlock": "0x1",
                "toBlock": "0xa",
                "address": SERVICE_MANAGER,
                "topics": [topic0],
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": [
                {
                    "address": SERVICE_MANAGER,
                    "topics": [topic0, requester_topic],
                    "data": format!("0x{}{}", word(9), word(1_700_000_100)),
                    "blockNumber": "0x6",
                    "logIndex": "0x0",
                    "removed": false
                },
                {
                    "address": SERVICE_MANAGER,
                    "topics": [topic0, requester_topic],
                    "data": format!("0x{}{}", word(8), word(1_700_000_050)),
                    "blockNumber": "0x5",
                    "logIndex": "0x1",
                    "removed": true
                },
                {
                    "address": SERVICE_MANAGER,
                    "topics": [topic0, requester_topic],
                    "data": format!("0x{}{}", word(7), word(1_700_000_000)),
                    "blockNumber": "0x5",
                    "logIndex": "0x0",
                    "removed": false
                },
                {
                    "address": SERVICE_MANAGER,
                    "topics": [topic0],
                    "data": "0xdead",
                    "blockNumber": "0x7",
                    "logIndex": "0x0"
                }
            ],
        })))
        .mount(&server)
        .await;

    let events = ledger(&server).instance_requests(1, 10).await.unwrap();
    let seen: Vec<(u64, u64, u64)> = events
        .iter()
        .map(|e| (e.request_id.get(), e.timestamp, e.block_number))
        .collect();
    assert_eq!(seen, vec![(7, 1_700_000_000, 5), (9, 1_700_000_100, 6)]);
    assert_eq!(
        events[0].requester,
        Address::parse("0xabc0000000000000000000000000000000000abc").unwrap()
    );
}

#[tokio::test]
async fn test_register_instance_waits_for_receipt() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    mount_rpc(
        &server,
        "eth_getTransactionReceipt",
        json!({ "transactionHash": TX_HASH, "blockNumber": "0x10", "status": "0x1" }),
    )
    .await;

    let requester = Address::from([0xab; 20]);
    let receipt = ledger(&server)
        .register_instance(requester, RequestId::new(7))
        .await
        .unwrap();
    assert_eq!(receipt.tx_hash, H256::parse(TX_HASH).unwrap());
    assert_eq!(receipt.block_number, 16);

    let requests = server.received_requests().await.unwrap();
    let raw_tx = requests
        .iter()
        .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
        .find(|body| body["method"] == "eth_sendRawTransaction")
        .unwrap();
    let raw = raw_tx["params"][0].as_str().unwrap();
    assert!(raw.starts_with("0x"));
    assert!(raw.len() > 2);
}

#[tokio::test]
async fn test_reverted_transaction() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    mount_rpc(
        &server,
        "eth_getTransactionReceipt",
        json!({ "transactionHash": TX_HASH, "blockNumber": "0x10", "status": "0x0" }),
    )
    .await;

    let err = ledger(&server)
        .report_error(RequestId::new(42), "QuotaExceeded")
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Reverted { .. }));
}

#[tokio::test]
async fn test_unmined_transaction_times_out() {
    let server = MockServer::start().await;
    mount_submission(&server).await;
    mount_rpc(&server, "eth_getTransactionReceipt", Value::Null).await;

    let err = ledger(&server).create_instance().await.unwrap_err();
    assert!(matches!(err, LedgerError::Timeout { .. }));
}

#[tokio::test]
async fn test_estimate_failure_is_write_error() {
    let server = MockServer::start().await;
    mount_rpc(&server, "eth_getTransactionCount", json!("0x0")).await;
    mount_rpc(&server, "eth_gasPrice", json!("0x1")).await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "eth_estimateGas" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": 3, "message": "execution reverted: not the operator" },
        })))
        .mount(&server)
        .await;

    let err = ledger(&server).terminate_instance(3).await.unwrap_err();
    match err {
        LedgerError::Write(message) => {
            assert!(message.contains("terminateInstance"));
            assert!(message.contains("not the operator"));
        }
        other => panic!("expected write error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_registration_digest_reads_first_word() {
    let server = MockServer::start().await;
    let digest = format!("0x{}", "ab".repeat(32));
    mount_rpc(&server, "eth_call", json!(digest)).await;

    let ledger = ledger(&server);
    let result = ledger
        .registration_digest(
            ledger.operator(),
            Address::parse(SERVICE_MANAGER).unwrap(),
            H256::from([0x01; 32]),
            1_900_000_000,
        )
        .await
        .unwrap();
    assert_eq!(result, H256::from([0xab; 32]));
}
