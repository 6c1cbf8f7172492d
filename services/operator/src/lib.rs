//! Obsidian Operator Library
//!
//! The operator bridges the ledger and an OpenStack cloud. It watches the
//! service manager contract for `CreateInstanceRequested` events, provisions
//! one server per request and writes the outcome back to the ledger with
//! `registerInstance` or `reportError`.
//!
//! ## Architecture
//!
//! ```text
//! EventMonitor ──queue──▶ ReconcilerPool ──▶ ReconciliationEngine
//!      │                                        │         │
//!      ▼                                        ▼         ▼
//!  StateStore ◀──────────── OutboxRelay    CloudProvisioner  LedgerClient
//! ```
//!
//! Registration with the restaking core runs once before any of this starts.
//!
//! ## Modules
//!
//! - `cloud`: OpenStack client, token cache and idempotent provisioning
//! - `ledger`: JSON-RPC ledger client and contract encodings
//! - `state`: Local SQLite request log, block cursor and outbox
//! - `runtime`: Spawns and stops the long-running loops

pub mod cloud;
pub mod config;
pub mod ledger;
pub mod registration;
pub mod request;
pub mod runtime;
pub mod state;

// Internal modules exposed for integration tests
pub mod engine;
pub mod monitor;
pub mod outbox;
pub mod periodic;
pub mod sweep;

// Re-export commonly used types
pub use cloud::{CloudClient, CloudError, CloudProvisioner, MockCloud};
pub use config::Config;
pub use engine::{ReconcileOutcome, ReconcilerPool, ReconciliationEngine};
pub use ledger::{LedgerClient, LedgerError, MockLedger};
pub use request::{InstanceRequest, RequestId};
pub use runtime::{Components, OperatorRuntime, RuntimeSettings};
pub use state::StateStore;
