//! Operator signing identity.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;

use crate::error::ChainError;
use crate::hash::keccak256;
use crate::types::{Address, H256};

/// A secp256k1 signature with its recovery id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    /// 0 or 1.
    pub recovery_id: u8,
}

impl RecoverableSignature {
    /// The 65-byte `r || s || v` form with `v` in {27, 28}, as accepted by
    /// `ecrecover`-based contract signature checks.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = 27 + self.recovery_id;
        out
    }

    /// Recovers the signer address for a prehashed message.
    pub fn recover(&self, digest: &H256) -> Result<Address, ChainError> {
        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&self.r);
        rs[32..].copy_from_slice(&self.s);
        let signature =
            Signature::from_slice(&rs).map_err(|e| ChainError::Signing(e.to_string()))?;
        let recovery_id = RecoveryId::from_byte(self.recovery_id)
            .ok_or_else(|| ChainError::Signing(format!("bad recovery id {}", self.recovery_id)))?;
        let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recovery_id)
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        Ok(address_of(&key))
    }
}

/// The operator's private key and derived address.
///
/// Read-only after construction; safe to share behind an `Arc`.
pub struct OperatorSigner {
    key: SigningKey,
    address: Address,
}

impl OperatorSigner {
    /// Builds a signer from a 32-byte hex private key (with or without `0x`).
    pub fn from_hex(private_key: &str) -> Result<Self, ChainError> {
        let trimmed = private_key.trim();
        let stripped = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(stripped)?;
        if bytes.len() != 32 {
            return Err(ChainError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let key = SigningKey::from_slice(&bytes).map_err(|e| ChainError::InvalidKey(e.to_string()))?;
        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    /// The operator address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs a 32-byte digest directly, without any message prefix.
    pub fn sign_digest(&self, digest: &H256) -> Result<RecoverableSignature, ChainError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|e| ChainError::Signing(e.to_string()))?;
        let (r, s) = signature.split_bytes();
        Ok(RecoverableSignature {
            r: r.into(),
            s: s.into(),
            recovery_id: recovery_id.to_byte(),
        })
    }
}

impl std::fmt::Debug for OperatorSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn address_of(key: &VerifyingKey) -> Address {
    let point = key.as_affine().to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_word(&hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    // First well-known development account of local EVM test nodes.
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    #[test]
    fn test_address_derivation() {
        let signer = OperatorSigner::from_hex(DEV_KEY).unwrap();
        assert_eq!(signer.address().to_string(), DEV_ADDRESS);
    }

    #[test]
    fn test_sign_and_recover() {
        let signer = OperatorSigner::from_hex(DEV_KEY).unwrap();
        let digest = H256::from(keccak256(b"operator registration"));
        let sig = signer.sign_digest(&digest).unwrap();

        assert_eq!(sig.recover(&digest).unwrap(), signer.address());
        let bytes = sig.to_bytes();
        assert!(bytes[64] == 27 || bytes[64] == 28);
    }

    #[test]
    fn test_signature_is_deterministic() {
        let signer = OperatorSigner::from_hex(DEV_KEY).unwrap();
        let digest = H256::from([0x42; 32]);
        assert_eq!(signer.sign_digest(&digest).unwrap(), signer.sign_digest(&digest).unwrap());
    }

    #[test]
    fn test_rejects_short_key() {
        let err = OperatorSigner::from_hex("0x1234").unwrap_err();
        assert!(matches!(err, ChainError::InvalidLength { expected: 32, actual: 2 }));
    }

    #[test]
    fn test_rejects_zero_key() {
        let zero = "0".repeat(64);
        assert!(matches!(
            OperatorSigner::from_hex(&zero).unwrap_err(),
            ChainError::InvalidKey(_)
        ));
    }

    #[test]
    fn test_debug_hides_key() {
        let signer = OperatorSigner::from_hex(DEV_KEY).unwrap();
        let debug = format!("{signer:?}");
        assert!(!debug.contains("ac0974"));
    }
}
