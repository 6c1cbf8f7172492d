//! # obsidian-chain
//!
//! EVM primitives used by the Obsidian operator to talk to the ledger.
//!
//! ## Scope
//!
//! - Typed 20-byte addresses and 32-byte hashes with strict hex parsing
//! - Keccak-256 hashing, function selectors and event topics
//! - Solidity ABI encoding for the call shapes the operator submits
//! - Legacy (EIP-155) transaction encoding and signing
//! - The operator's secp256k1 signing identity
//!
//! Nothing here performs I/O; the JSON-RPC transport lives in the operator
//! service.

pub mod abi;
mod error;
mod hash;
mod signer;
pub mod tx;
mod types;

pub use error::ChainError;
pub use hash::{event_topic, function_selector, keccak256};
pub use signer::{OperatorSigner, RecoverableSignature};
pub use types::{Address, H256};
