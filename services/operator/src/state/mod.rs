//! Local state persistence for the operator.
//!
//! SQLite-backed storage for:
//! - The monitor's block cursor
//! - The request log (`request_id -> status`), consulted before every
//!   provisioning attempt
//! - The write-back outbox of ledger writes still owed
//!
//! The store lets the operator resume after a restart without reprocessing
//! resolved requests or losing owed write-backs.

mod store;

pub use store::{
    Claim, Observation, OutboxEntry, RequestRecord, StateStore, StateStoreError, WriteBack,
};
