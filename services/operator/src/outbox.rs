//! Write-back outbox relay.
//!
//! Retries ledger writes that failed during reconciliation. Entries are
//! kept until the write confirms; repeated failures only raise the log
//! level and stretch the backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use obsidian_reconcile::{backoff_delay, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::ledger::{LedgerClient, LedgerError, TxReceipt};
use crate::state::{OutboxEntry, StateStore, StateStoreError, WriteBack};

/// Entries retried per pass.
const BATCH_SIZE: usize = 32;

/// Result of one outbox pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub completed: usize,
    pub rescheduled: usize,
}

/// When a write that failed now should be retried after `delay`.
pub(crate) fn next_attempt_at(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()
}

/// Periodically retries owed ledger writes.
pub struct OutboxRelay {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<StateStore>,
    interval: Duration,
}

impl OutboxRelay {
    pub fn new(ledger: Arc<dyn LedgerClient>, store: Arc<StateStore>, interval: Duration) -> Self {
        Self {
            ledger,
            store,
            interval,
        }
    }

    /// Run the relay until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting outbox relay");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.drain_once().await {
                        Ok(stats) if stats.completed > 0 || stats.rescheduled > 0 => info!(
                            completed = stats.completed,
                            rescheduled = stats.rescheduled,
                            "Outbox pass complete"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Outbox pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Outbox relay shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Retries every entry that is due now.
    pub async fn drain_once(&self) -> Result<DrainStats, StateStoreError> {
        let mut stats = DrainStats::default();

        for entry in self.store.due_outbox(Utc::now(), BATCH_SIZE)? {
            match self.submit(&entry).await {
                Ok(receipt) => {
                    self.store.complete_outbox(&entry)?;
                    info!(
                        request_id = %entry.request_id,
                        kind = entry.write.kind(),
                        attempts = entry.attempts + 1,
                        tx_hash = %receipt.tx_hash,
                        "Deferred write-back confirmed"
                    );
                    stats.completed += 1;
                }
                Err(e) => {
                    let attempts = entry.attempts.saturating_add(1);
                    let delay = backoff_delay(attempts, self.interval, DEFAULT_MAX_BACKOFF);
                    self.store.reschedule_outbox(
                        entry.id,
                        attempts,
                        next_attempt_at(delay),
                        &e.to_string(),
                    )?;

                    if attempts > DEFAULT_MAX_RETRIES {
                        error!(
                            request_id = %entry.request_id,
                            kind = entry.write.kind(),
                            attempts,
                            retry_in_secs = delay.as_secs(),
                            error = %e,
                            "Deferred write-back keeps failing"
                        );
                    } else {
                        warn!(
                            request_id = %entry.request_id,
                            kind = entry.write.kind(),
                            attempts,
                            retry_in_secs = delay.as_secs(),
                            error = %e,
                            "Deferred write-back failed"
                        );
                    }
                    stats.rescheduled += 1;
                }
            }
        }

        Ok(stats)
    }

    async fn submit(&self, entry: &OutboxEntry) -> Result<TxReceipt, LedgerError> {
        match &entry.write {
            WriteBack::RegisterInstance { requester } => {
                self.ledger
                    .register_instance(*requester, entry.request_id)
                    .await
            }
            WriteBack::ReportError { message } => {
                self.ledger.report_error(entry.request_id, message).await
            }
        }
    }
}
