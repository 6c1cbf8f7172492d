//! Keccak-256 helpers.

use sha3::{Digest, Keccak256};

use crate::types::H256;

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// The 4-byte selector of a canonical function signature,
/// e.g. `registerInstance(address,uint256)`.
pub fn function_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// The topic0 of a canonical event signature.
pub fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}
