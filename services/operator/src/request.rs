//! Instance requests as observed from the ledger.

use chrono::{DateTime, Utc};
use obsidian_chain::Address;
use obsidian_reconcile::RequestStatus;
use serde::{Deserialize, Serialize};

/// Prefix of every cloud instance name derived from a request id.
pub const INSTANCE_NAME_PREFIX: &str = "Instance-";

/// Ledger-assigned request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Deterministic cloud instance name, `Instance-<id>`.
    ///
    /// The name is the cloud-side idempotency key: provisioning looks it up
    /// before creating anything.
    pub fn instance_name(&self) -> String {
        format!("{INSTANCE_NAME_PREFIX}{}", self.0)
    }

    /// Inverse of [`RequestId::instance_name`].
    pub fn from_instance_name(name: &str) -> Option<Self> {
        let suffix = name.strip_prefix(INSTANCE_NAME_PREFIX)?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok().map(Self)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A request to create a compute instance on behalf of a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub request_id: RequestId,
    pub requester: Address,
    /// Unix seconds, as emitted by the contract.
    pub timestamp: u64,
    pub status: RequestStatus,
}

impl InstanceRequest {
    /// A freshly observed request.
    pub fn observed(request_id: RequestId, requester: Address, timestamp: u64) -> Self {
        Self {
            request_id,
            requester,
            timestamp,
            status: RequestStatus::Pending,
        }
    }

    /// The request timestamp as a UTC datetime, if representable.
    pub fn requested_at(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.timestamp)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_instance_name() {
        assert_eq!(RequestId::new(7).instance_name(), "Instance-7");
    }

    #[rstest]
    #[case("Instance-42", Some(42))]
    #[case("Instance-0", Some(0))]
    #[case("Instance-", None)]
    #[case("Instance-+1", None)]
    #[case("Instance-standing-01hv4z2wqx", None)]
    #[case("Instance-99999999999999999999", None)]
    #[case("web-1", None)]
    fn test_from_instance_name(#[case] name: &str, #[case] expected: Option<u64>) {
        assert_eq!(
            RequestId::from_instance_name(name),
            expected.map(RequestId::new)
        );
    }

    #[test]
    fn test_observed_is_pending() {
        let req = InstanceRequest::observed(RequestId::new(7), Address::ZERO, 1_700_000_000);
        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(
            req.requested_at().unwrap().to_rfc3339(),
            "2023-11-14T22:13:20+00:00"
        );
    }
}
