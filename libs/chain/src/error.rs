//! Error types for chain primitives.

use thiserror::Error;

/// Errors produced while parsing, encoding or signing chain data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The input is not valid hexadecimal.
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    /// The decoded value has the wrong byte length.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The private key is not a valid secp256k1 scalar.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    /// Signing failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// ABI data could not be decoded.
    #[error("abi decode error: {0}")]
    Decode(String),
}

impl ChainError {
    /// Returns true if this error came from malformed input rather than signing.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            ChainError::InvalidHex(_) | ChainError::InvalidLength { .. } | ChainError::Decode(_)
        )
    }
}

impl From<hex::FromHexError> for ChainError {
    fn from(err: hex::FromHexError) -> Self {
        ChainError::InvalidHex(err.to_string())
    }
}
