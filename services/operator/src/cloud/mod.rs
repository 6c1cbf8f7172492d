//! Cloud resource client.
//!
//! The cloud side is abstracted behind [`CloudClient`] so the engine can be
//! driven against an in-memory double:
//! - `openstack`: Keystone + Nova over HTTP
//! - `mock`: in-memory client for tests and development
//!
//! [`CloudProvisioner`] layers token caching, per-call timeouts and
//! name-based idempotency on top of any client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::request::RequestId;

pub mod mock;
pub mod openstack;
mod provisioner;
mod token;

pub use mock::MockCloud;
pub use openstack::OpenStackClient;
pub use provisioner::{CloudProvisioner, InstanceDefaults};
pub use token::TokenCache;

/// Errors from cloud operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// Credentials rejected or token no longer valid.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The provider refused the create call (quota, capacity, bad reference).
    ///
    /// Displays as the provider's own message so it can be reported verbatim.
    #[error("{0}")]
    Provision(String),

    /// The call did not complete in time.
    #[error("cloud call timed out after {0:?}")]
    Timeout(Duration),

    /// Network-level failure.
    #[error("cloud transport error: {0}")]
    Transport(String),

    /// The provider answered with something unexpected.
    #[error("unexpected cloud response: {0}")]
    Decode(String),
}

impl CloudError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CloudError::Auth(_))
    }
}

/// A cached credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    /// Whether the token is expired, or will be within `skew`.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::zero());
        self.expires_at - skew <= now
    }
}

/// Everything needed to create one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub image_ref: String,
    pub flavor_ref: String,
    pub network_id: String,
}

/// A server as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudServer {
    pub id: String,
    pub name: String,
}

/// A server created (or found) on behalf of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedInstance {
    pub cloud_instance_id: String,
    pub name: String,
    /// Back-reference; `None` for standing-capacity instances.
    pub request_id: Option<RequestId>,
    pub created_at: DateTime<Utc>,
    /// True when an existing server with the same name was reused.
    pub reused: bool,
}

/// Provider API.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Exchange the configured credentials for a token.
    async fn authenticate(&self) -> Result<AuthToken, CloudError>;

    /// Create a server.
    async fn create_server(&self, token: &str, spec: &InstanceSpec)
        -> Result<CloudServer, CloudError>;

    /// Look up a server by exact name.
    async fn find_server(&self, token: &str, name: &str) -> Result<Option<CloudServer>, CloudError>;

    /// List servers whose name starts with `prefix`.
    async fn list_servers(&self, token: &str, prefix: &str) -> Result<Vec<CloudServer>, CloudError>;

    /// Delete a server by id. Deleting a server that no longer exists is not an error.
    async fn delete_server(&self, token: &str, id: &str) -> Result<(), CloudError>;
}
