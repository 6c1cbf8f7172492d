//! Reconciliation primitives.
//!
//! This library provides helpers for reconciling ledger requests against an
//! external resource provider. Key concepts:
//!
//! - **Request**: a ledger-recorded demand for a resource, keyed by request id.
//! - **Resolution**: the terminal outcome written back to the ledger.
//! - **Checkpoint**: how far the event stream has been consumed.
//!
//! # Invariants
//!
//! - Status transitions only move forward; terminal states are final
//! - A request that reached `Provisioning` must end `Registered` or `Failed`
//! - Checkpoints are monotonic

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A status transition that the state machine does not allow.
    #[error("invalid transition for request {request_id}: {from} -> {to}")]
    InvalidTransition {
        request_id: u64,
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Unknown status string.
    #[error("unknown request status: {0}")]
    UnknownStatus(String),
}

/// Lifecycle of an instance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Observed, not yet claimed by a worker.
    Pending,

    /// Claimed; cloud provisioning and write-back are in progress.
    Provisioning,

    /// Success recorded on the ledger.
    Registered,

    /// Failure recorded on the ledger.
    Failed,
}

impl RequestStatus {
    /// Returns true for `Registered` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Registered | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Provisioning -> Provisioning` is allowed so a request interrupted by a
    /// restart can be claimed again.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Provisioning)
                | (Self::Provisioning, Self::Provisioning)
                | (Self::Provisioning, Self::Registered)
                | (Self::Provisioning, Self::Failed)
        )
    }

    /// Validated transition.
    pub fn transition(
        self,
        request_id: u64,
        next: RequestStatus,
    ) -> Result<RequestStatus, ReconcileError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ReconcileError::InvalidTransition {
                request_id,
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Registered => "registered",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "provisioning" => Ok(Self::Provisioning),
            "registered" => Ok(Self::Registered),
            "failed" => Ok(Self::Failed),
            other => Err(ReconcileError::UnknownStatus(other.to_string())),
        }
    }
}

/// Checkpoint for the ledger event stream.
///
/// Tracks the last fully processed block for at-least-once consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCheckpoint {
    /// Last block whose events have all been enqueued.
    pub last_block: u64,

    /// Timestamp of last checkpoint update.
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl BlockCheckpoint {
    /// Create a new checkpoint.
    pub fn new(last_block: u64) -> Self {
        Self {
            last_block,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Next inclusive block range to scan, capped at `max_range` blocks.
    ///
    /// Returns `None` when the checkpoint is already at `head`.
    pub fn next_range(&self, head: u64, max_range: u64) -> Option<(u64, u64)> {
        if head <= self.last_block {
            return None;
        }
        let from = self.last_block + 1;
        let to = head.min(from + max_range.max(1) - 1);
        Some((from, to))
    }

    /// Advance the checkpoint to a new block.
    pub fn advance(&mut self, block: u64) {
        if block > self.last_block {
            self.last_block = block;
            self.updated_at = chrono::Utc::now();
        }
    }
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
///
/// `attempt` is 1-based; 0 is treated as 1.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map(|d| d.min(max))
        .unwrap_or(max)
}

/// Default monitor poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default cadence of the standing-capacity task.
pub const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Default retry count before failures escalate to error level.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Upper bound for write-back retry backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);
