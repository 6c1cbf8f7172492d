//! Legacy (EIP-155) transactions.
//!
//! The operator only submits plain contract calls with zero value, so the
//! legacy envelope is sufficient and accepted by every EVM node.

use crate::error::ChainError;
use crate::hash::keccak256;
use crate::signer::OperatorSigner;
use crate::types::{Address, H256};

/// An unsigned legacy transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTransaction {
    fn base_fields(&self) -> Vec<Vec<u8>> {
        vec![
            rlp_uint(self.nonce as u128),
            rlp_uint(self.gas_price),
            rlp_uint(self.gas_limit as u128),
            rlp_bytes(self.to.as_bytes()),
            rlp_uint(self.value),
            rlp_bytes(&self.data),
        ]
    }

    /// RLP payload hashed for signing: the six fields plus `chainId, 0, 0`.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut fields = self.base_fields();
        fields.push(rlp_uint(self.chain_id as u128));
        fields.push(rlp_uint(0));
        fields.push(rlp_uint(0));
        rlp_list(&fields)
    }

    /// Keccak-256 of the signing payload.
    pub fn signing_hash(&self) -> H256 {
        H256::from(keccak256(self.signing_payload()))
    }

    /// Signs and returns the raw transaction bytes ready for
    /// `eth_sendRawTransaction`, plus the transaction hash.
    pub fn sign(&self, signer: &OperatorSigner) -> Result<(Vec<u8>, H256), ChainError> {
        let signature = signer.sign_digest(&self.signing_hash())?;
        let v = self.chain_id as u128 * 2 + 35 + signature.recovery_id as u128;

        let mut fields = self.base_fields();
        fields.push(rlp_uint(v));
        fields.push(rlp_uint_bytes(&signature.r));
        fields.push(rlp_uint_bytes(&signature.s));
        let raw = rlp_list(&fields);
        let hash = H256::from(keccak256(&raw));
        Ok((raw, hash))
    }
}

fn rlp_length_prefix(len: usize, short_base: u8, long_base: u8) -> Vec<u8> {
    if len < 56 {
        vec![short_base + len as u8]
    } else {
        let len_bytes = trim_leading_zeros(&(len as u64).to_be_bytes());
        let mut out = vec![long_base + len_bytes.len() as u8];
        out.extend_from_slice(&len_bytes);
        out
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

fn rlp_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        return bytes.to_vec();
    }
    let mut out = rlp_length_prefix(bytes.len(), 0x80, 0xb7);
    out.extend_from_slice(bytes);
    out
}

fn rlp_uint(value: u128) -> Vec<u8> {
    rlp_uint_bytes(&value.to_be_bytes())
}

/// Big-endian integer bytes, minimally encoded.
fn rlp_uint_bytes(be: &[u8]) -> Vec<u8> {
    rlp_bytes(&trim_leading_zeros(be))
}

fn rlp_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(Vec::len).sum();
    let mut out = rlp_length_prefix(payload_len, 0xc0, 0xf7);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}
