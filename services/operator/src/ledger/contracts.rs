//! Contract call encoding and event decoding.

use obsidian_chain::abi::{self, Token};
use obsidian_chain::{event_topic, Address, H256};
use serde::Deserialize;

use super::{InstanceRequestedEvent, LedgerError, OperatorDetails, SignatureWithSaltAndExpiry};
use crate::ledger::rpc::parse_u64_quantity;
use crate::request::RequestId;

pub const REGISTER_AS_OPERATOR: &str = "registerAsOperator((address,address,uint32),string)";
pub const REGISTRATION_DIGEST: &str =
    "calculateOperatorAVSRegistrationDigestHash(address,address,bytes32,uint256)";
pub const REGISTER_OPERATOR_WITH_SIGNATURE: &str =
    "registerOperatorWithSignature((bytes,bytes32,uint256),address)";
pub const REGISTER_INSTANCE: &str = "registerInstance(address,uint256)";
pub const REPORT_ERROR: &str = "reportError(uint256,string)";
pub const CREATE_INSTANCE: &str = "createInstance()";
pub const TERMINATE_INSTANCE: &str = "terminateInstance(uint256)";

pub const CREATE_INSTANCE_REQUESTED: &str = "CreateInstanceRequested(address,uint256,uint256)";

/// Topic0 of `CreateInstanceRequested`.
pub fn instance_requested_topic() -> H256 {
    event_topic(CREATE_INSTANCE_REQUESTED)
}

pub fn register_as_operator(details: &OperatorDetails, metadata_uri: &str) -> Vec<u8> {
    abi::encode_call(
        REGISTER_AS_OPERATOR,
        &[
            Token::Tuple(vec![
                Token::Address(details.earnings_receiver),
                Token::Address(details.delegation_approver),
                Token::Uint(details.staker_opt_out_window_blocks.into()),
            ]),
            Token::String(metadata_uri.to_string()),
        ],
    )
}

pub fn registration_digest(operator: Address, avs: Address, salt: H256, expiry: u64) -> Vec<u8> {
    abi::encode_call(
        REGISTRATION_DIGEST,
        &[
            Token::Address(operator),
            Token::Address(avs),
            Token::FixedBytes32(salt),
            Token::Uint(expiry.into()),
        ],
    )
}

pub fn register_operator_with_signature(
    signature: &SignatureWithSaltAndExpiry,
    operator: Address,
) -> Vec<u8> {
    abi::encode_call(
        REGISTER_OPERATOR_WITH_SIGNATURE,
        &[
            Token::Tuple(vec![
                Token::Bytes(signature.signature.clone()),
                Token::FixedBytes32(signature.salt),
                Token::Uint(signature.expiry.into()),
            ]),
            Token::Address(operator),
        ],
    )
}

pub fn register_instance(requester: Address, request_id: RequestId) -> Vec<u8> {
    abi::encode_call(
        REGISTER_INSTANCE,
        &[Token::Address(requester), Token::Uint(request_id.get().into())],
    )
}

pub fn report_error(request_id: RequestId, message: &str) -> Vec<u8> {
    abi::encode_call(
        REPORT_ERROR,
        &[Token::Uint(request_id.get().into()), Token::String(message.to_string())],
    )
}

pub fn create_instance() -> Vec<u8> {
    abi::encode_call(CREATE_INSTANCE, &[])
}

pub fn terminate_instance(instance_id: u64) -> Vec<u8> {
    abi::encode_call(TERMINATE_INSTANCE, &[Token::Uint(instance_id.into())])
}

/// A log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: String,
    pub block_number: Option<String>,
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

/// Decodes a `CreateInstanceRequested` log.
///
/// With the requester indexed it arrives in topic 1 and the data holds
/// `(requestId, timestamp)`; otherwise all three fields are in the data.
pub fn decode_instance_requested(log: &RpcLog) -> Result<InstanceRequestedEvent, LedgerError> {
    let topic0 = log
        .topics
        .first()
        .ok_or_else(|| LedgerError::Decode("log has no topics".to_string()))?;
    if *topic0 != instance_requested_topic() {
        return Err(LedgerError::Decode(format!("unexpected event topic {topic0}")));
    }

    let data = decode_hex(&log.data)?;
    let (requester, first_data_word) = match log.topics.get(1) {
        Some(topic) => (abi::decode_address(topic.as_bytes())?, 0),
        None => (abi::decode_address(&abi::word_at(&data, 0)?)?, 1),
    };
    let request_id = abi::decode_uint(&abi::word_at(&data, first_data_word)?)?;
    let timestamp = abi::decode_uint(&abi::word_at(&data, first_data_word + 1)?)?;

    let request_id = u64::try_from(request_id)
        .map_err(|_| LedgerError::Decode(format!("request id {request_id} exceeds u64")))?;
    let timestamp = u64::try_from(timestamp)
        .map_err(|_| LedgerError::Decode(format!("timestamp {timestamp} exceeds u64")))?;

    Ok(InstanceRequestedEvent {
        request_id: RequestId::new(request_id),
        requester,
        timestamp,
        block_number: quantity_or_zero(log.block_number.as_deref())?,
        log_index: quantity_or_zero(log.log_index.as_deref())?,
    })
}

/// Decodes a `0x`-prefixed hex payload.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, LedgerError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits).map_err(|e| LedgerError::Decode(format!("invalid hex payload: {e}")))
}

fn quantity_or_zero(value: Option<&str>) -> Result<u64, LedgerError> {
    match value {
        Some(v) => Ok(parse_u64_quantity(v)?),
        None => Ok(0),
    }
}
