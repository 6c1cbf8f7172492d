//! Ledger event monitor.
//!
//! Polls `CreateInstanceRequested` logs from a persisted block cursor,
//! records each request in the local log and hands new work to the
//! reconciler queue. The monitor never talks to the cloud and never waits
//! for provisioning.

use std::sync::Arc;
use std::time::Duration;

use obsidian_reconcile::{
    BlockCheckpoint, RequestStatus, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::ledger::{InstanceRequestedEvent, LedgerClient, LedgerError};
use crate::request::InstanceRequest;
use crate::state::{Observation, StateStore, StateStoreError};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error("reconciler queue closed")]
    QueueClosed,
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Cursor after the poll.
    pub cursor: u64,
    pub events: usize,
    pub enqueued: usize,
}

/// Watches the ledger for instance requests.
pub struct EventMonitor {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<StateStore>,
    queue: mpsc::Sender<InstanceRequest>,
    poll_interval: Duration,
    max_block_range: u64,
    start_block: Option<u64>,
}

impl EventMonitor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<StateStore>,
        queue: mpsc::Sender<InstanceRequest>,
        poll_interval: Duration,
        max_block_range: u64,
        start_block: Option<u64>,
    ) -> Self {
        Self {
            ledger,
            store,
            queue,
            poll_interval,
            max_block_range,
            start_block,
        }
    }

    /// Run the monitor until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_block_range = self.max_block_range,
            "Starting event monitor"
        );

        match self.recover_unresolved().await {
            Ok(0) => {}
            Ok(count) => info!(count, "Re-enqueued unresolved requests"),
            Err(e) => error!(error = %e, "Failed to recover unresolved requests"),
        }

        let mut failures = RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW);
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(stats) => {
                            failures.clear("poll");
                            if stats.events > 0 {
                                info!(
                                    cursor = stats.cursor,
                                    events = stats.events,
                                    enqueued = stats.enqueued,
                                    "Processed instance requests"
                                );
                            }
                        }
                        Err(MonitorError::QueueClosed) => {
                            info!("Reconciler queue closed, stopping event monitor");
                            break;
                        }
                        Err(e) => {
                            if failures.record_failure("poll") {
                                error!(error = %e, "Event poll failed repeatedly");
                            } else {
                                warn!(error = %e, "Event poll failed");
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Event monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Scans from the cursor up to the current head.
    ///
    /// The cursor is persisted after each range, once all of its requests are
    /// recorded and enqueued, so a crash rescans at most one range.
    pub async fn poll_once(&self) -> Result<PollStats, MonitorError> {
        let head = self.ledger.block_number().await?;
        let mut checkpoint = BlockCheckpoint::new(self.cursor(head)?);
        let mut stats = PollStats {
            cursor: checkpoint.last_block,
            ..PollStats::default()
        };

        while let Some((from, to)) = checkpoint.next_range(head, self.max_block_range) {
            let events = self.ledger.instance_requests(from, to).await?;
            debug!(from, to, events = events.len(), "Scanned block range");

            stats.events += events.len();
            for event in events {
                if self.observe(event).await? {
                    stats.enqueued += 1;
                }
            }

            self.store.set_last_block(to)?;
            checkpoint.advance(to);
            stats.cursor = to;
        }

        Ok(stats)
    }

    /// Records one event and enqueues it unless it is already past `Pending`.
    ///
    /// Returns whether the request was enqueued.
    pub async fn observe(&self, event: InstanceRequestedEvent) -> Result<bool, MonitorError> {
        let request = InstanceRequest::observed(event.request_id, event.requester, event.timestamp);

        match self.store.record_observed(&request)? {
            Observation::New => {
                info!(
                    request_id = %request.request_id,
                    requester = %request.requester,
                    timestamp = request.timestamp,
                    block = event.block_number,
                    "New instance request"
                );
            }
            Observation::Existing(RequestStatus::Pending) => {
                debug!(request_id = %request.request_id, "Request seen again while pending");
            }
            Observation::Existing(status) => {
                debug!(
                    request_id = %request.request_id,
                    status = %status,
                    "Ignoring duplicate event"
                );
                return Ok(false);
            }
        }

        self.queue
            .send(request)
            .await
            .map_err(|_| MonitorError::QueueClosed)?;
        Ok(true)
    }

    /// Re-enqueues every request the log still holds as unresolved.
    pub async fn recover_unresolved(&self) -> Result<usize, MonitorError> {
        let records = self.store.unresolved()?;
        let count = records.len();
        for record in records {
            debug!(
                request_id = %record.request_id,
                status = %record.status,
                "Recovering unresolved request"
            );
            self.queue
                .send(record.to_request())
                .await
                .map_err(|_| MonitorError::QueueClosed)?;
        }
        Ok(count)
    }

    /// Persisted cursor, initialized on first start.
    fn cursor(&self, head: u64) -> Result<u64, MonitorError> {
        if let Some(block) = self.store.last_block()? {
            return Ok(block);
        }
        let initial = match self.start_block {
            Some(start) => start.saturating_sub(1),
            None => head,
        };
        info!(cursor = initial, head, "Initializing block cursor");
        self.store.set_last_block(initial)?;
        Ok(initial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockLedger;
    use crate::request::RequestId;
    use obsidian_chain::Address;

    fn requester() -> Address {
        Address::from([0xab; 20])
    }

    fn monitor(
        ledger: Arc<MockLedger>,
        store: Arc<StateStore>,
        start_block: Option<u64>,
    ) -> (EventMonitor, mpsc::Receiver<InstanceRequest>) {
        let (tx, rx) = mpsc::channel(16);
        let monitor = EventMonitor::new(ledger, store, tx, Duration::from_millis(10), 2, start_block);
        (monitor, rx)
    }

    #[tokio::test]
    async fn test_first_start_begins_at_head() {
        let ledger = Arc::new(MockLedger::new(Address::ZERO));
        ledger.emit(1, requester(), 100);
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let (monitor, mut rx) = monitor(ledger.clone(), store.clone(), None);

        let stats = monitor.poll_once().await.unwrap();
        assert_eq!(stats.events, 0);
        assert_eq!(store.last_block().unwrap(), Some(1));

        ledger.emit(2, requester(), 101);
        let stats = monitor.poll_once().await.unwrap();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(rx.recv().await.unwrap().request_id, RequestId::new(2));
    }

    #[tokio::test]
    async fn test_start_block_scans_history_in_ranges() {
        let ledger = Arc::new(MockLedger::new(Address::ZERO));
        for id in 1..=5 {
            ledger.emit(id, requester(), 100 + id);
        }
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let (monitor, mut rx) = monitor(ledger, store.clone(), Some(1));

        let stats = monitor.poll_once().await.unwrap();
        assert_eq!(stats.events, 5);
        assert_eq!(stats.cursor, 5);
        assert_eq!(store.last_block().unwrap(), Some(5));

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(rx.recv().await.unwrap().request_id.get());
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_duplicate_resolved_event_not_enqueued() {
        let ledger = Arc::new(MockLedger::new(Address::ZERO));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let (monitor, mut rx) = monitor(ledger, store.clone(), None);

        let event = InstanceRequestedEvent {
            request_id: RequestId::new(7),
            requester: requester(),
            timestamp: 1,
            block_number: 1,
            log_index: 0,
        };
        assert!(monitor.observe(event.clone()).await.unwrap());
        rx.recv().await.unwrap();

        store.claim(RequestId::new(7)).unwrap();
        assert!(!monitor.observe(event).await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_failure_keeps_cursor() {
        let ledger = Arc::new(MockLedger::new(Address::ZERO));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        store.set_last_block(3).unwrap();
        ledger.set_head(10);
        ledger.fail_reads(true);
        let (monitor, _rx) = monitor(ledger, store.clone(), None);

        assert!(matches!(monitor.poll_once().await, Err(MonitorError::Ledger(_))));
        assert_eq!(store.last_block().unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_recover_unresolved() {
        let ledger = Arc::new(MockLedger::new(Address::ZERO));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        for id in [1, 2, 3] {
            store
                .record_observed(&InstanceRequest::observed(RequestId::new(id), requester(), 0))
                .unwrap();
        }
        store.claim(RequestId::new(2)).unwrap();
        store.claim(RequestId::new(3)).unwrap();
        store
            .resolve(RequestId::new(3), RequestStatus::Registered, None)
            .unwrap();
        let (monitor, mut rx) = monitor(ledger, store, None);

        assert_eq!(monitor.recover_unresolved().await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap().request_id, RequestId::new(1));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.request_id, RequestId::new(2));
        assert_eq!(second.status, RequestStatus::Provisioning);
    }
}
