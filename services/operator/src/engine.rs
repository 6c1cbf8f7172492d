//! Reconciliation engine.
//!
//! Drives one instance request through
//! claim → provision → write-back, and runs a bounded pool of such
//! reconciliations fed by the event monitor.
//!
//! # Guarantees
//!
//! - A request is claimed in the local log before any cloud call
//! - The cloud instance name is derived from the request id and looked up
//!   before creating, so retries never create a second server
//! - Every claimed request ends with a confirmed `registerInstance` or
//!   `reportError`, or with that write queued in the outbox

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use obsidian_reconcile::{backoff_delay, RequestStatus, DEFAULT_MAX_BACKOFF};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::cloud::CloudProvisioner;
use crate::ledger::LedgerClient;
use crate::outbox::next_attempt_at;
use crate::request::{InstanceRequest, RequestId};
use crate::state::{Claim, RequestRecord, StateStore, StateStoreError, WriteBack};

/// How a reconciliation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Instance provisioned and registered on the ledger.
    Registered { cloud_instance_id: String },
    /// Provisioning failed and the failure was reported on the ledger.
    Failed { reason: String },
    /// The ledger write failed and was queued for retry.
    WriteBackPending { kind: &'static str },
    /// Nothing to do: already resolved, already in flight, owed by the
    /// outbox, or shutting down.
    Skipped,
}

/// Reconciles individual requests.
pub struct ReconciliationEngine {
    ledger: Arc<dyn LedgerClient>,
    provisioner: Arc<CloudProvisioner>,
    store: Arc<StateStore>,
    /// First delay before an outbox retry.
    retry_base: Duration,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        provisioner: Arc<CloudProvisioner>,
        store: Arc<StateStore>,
        retry_base: Duration,
    ) -> Self {
        Self {
            ledger,
            provisioner,
            store,
            retry_base,
        }
    }

    /// Reconciles one request.
    ///
    /// Cloud and ledger failures are handled here and reflected in the
    /// outcome; only local store failures are returned as errors.
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn reconcile(&self, request: &InstanceRequest) -> Result<ReconcileOutcome, StateStoreError> {
        let request_id = request.request_id;

        let record = match self.store.claim(request_id)? {
            Claim::Claimed(record) => record,
            Claim::Resolved(status) => {
                debug!(status = %status, "Request already resolved");
                return Ok(ReconcileOutcome::Skipped);
            }
            Claim::Deferred => {
                debug!("Write-back owed by the outbox");
                return Ok(ReconcileOutcome::Skipped);
            }
        };

        let name = request_id.instance_name();
        info!(name = %name, requester = %record.requester, "Provisioning instance");

        match self.provisioner.ensure_instance(&name, request_id).await {
            Ok(instance) => {
                self.store
                    .set_cloud_instance(request_id, &instance.cloud_instance_id)?;
                self.write_success(&record, instance.cloud_instance_id).await
            }
            Err(e) => {
                warn!(error = %e, name = %name, "Provisioning failed");
                self.write_failure(request_id, &e.to_string()).await
            }
        }
    }

    async fn write_success(
        &self,
        record: &RequestRecord,
        cloud_instance_id: String,
    ) -> Result<ReconcileOutcome, StateStoreError> {
        let request_id = record.request_id;

        match self
            .ledger
            .register_instance(record.requester, request_id)
            .await
        {
            Ok(receipt) => {
                self.store.resolve(request_id, RequestStatus::Registered, None)?;
                info!(
                    cloud_instance_id = %cloud_instance_id,
                    tx_hash = %receipt.tx_hash,
                    "Instance registered"
                );
                Ok(ReconcileOutcome::Registered { cloud_instance_id })
            }
            Err(e) => {
                error!(
                    error = %e,
                    cloud_instance_id = %cloud_instance_id,
                    "Instance provisioned but unregistered"
                );
                let write = WriteBack::RegisterInstance {
                    requester: record.requester,
                };
                self.defer(request_id, write, &e.to_string())
            }
        }
    }

    async fn write_failure(
        &self,
        request_id: RequestId,
        reason: &str,
    ) -> Result<ReconcileOutcome, StateStoreError> {
        match self.ledger.report_error(request_id, reason).await {
            Ok(receipt) => {
                self.store
                    .resolve(request_id, RequestStatus::Failed, Some(reason))?;
                info!(reason = %reason, tx_hash = %receipt.tx_hash, "Failure reported");
                Ok(ReconcileOutcome::Failed {
                    reason: reason.to_string(),
                })
            }
            Err(e) => {
                error!(error = %e, reason = %reason, "Failed to report provisioning error");
                self.store.set_last_error(request_id, reason)?;
                let write = WriteBack::ReportError {
                    message: reason.to_string(),
                };
                self.defer(request_id, write, &e.to_string())
            }
        }
    }

    /// Hands a failed write to the outbox.
    fn defer(
        &self,
        request_id: RequestId,
        write: WriteBack,
        error: &str,
    ) -> Result<ReconcileOutcome, StateStoreError> {
        let delay = backoff_delay(1, self.retry_base, DEFAULT_MAX_BACKOFF);
        self.store
            .enqueue_outbox(request_id, &write, error, next_attempt_at(delay))?;
        Ok(ReconcileOutcome::WriteBackPending { kind: write.kind() })
    }
}

/// Bounded pool of reconciliations.
///
/// Each request runs on its own task; at most `max_concurrent` run at once.
/// A request already being reconciled by this process is not started twice.
pub struct ReconcilerPool {
    engine: Arc<ReconciliationEngine>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<RequestId>>>,
}

impl ReconcilerPool {
    pub fn new(engine: Arc<ReconciliationEngine>, max_concurrent: usize) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Consume the queue until shutdown, then drain running reconciliations.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut queue: mpsc::Receiver<InstanceRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            max_concurrent = self.permits.available_permits(),
            "Starting reconciler pool"
        );
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                received = queue.recv() => {
                    let Some(request) = received else {
                        info!("Reconciler queue closed");
                        break;
                    };
                    self.dispatch(&mut tasks, request, shutdown.clone());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler pool shutting down");
                        break;
                    }
                }
            }
        }

        // Stop accepting: the monitor sees a closed queue.
        drop(queue);

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Draining in-flight reconciliations");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        info!("Reconciler pool stopped");
    }

    fn dispatch(
        &self,
        tasks: &mut JoinSet<ReconcileOutcome>,
        request: InstanceRequest,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let request_id = request.request_id;
        let newly_tracked = self
            .in_flight
            .lock()
            .map(|mut set| set.insert(request_id))
            .unwrap_or(true);
        if !newly_tracked {
            debug!(request_id = %request_id, "Request already in flight");
            return;
        }

        let engine = Arc::clone(&self.engine);
        let permits = Arc::clone(&self.permits);
        let in_flight = Arc::clone(&self.in_flight);

        tasks.spawn(
            async move {
                let outcome = tokio::select! {
                    permit = permits.acquire_owned() => match permit {
                        Ok(_permit) => match engine.reconcile(&request).await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                error!(error = %e, "Reconciliation aborted by state store error");
                                ReconcileOutcome::Skipped
                            }
                        },
                        Err(_) => ReconcileOutcome::Skipped,
                    },
                    _ = wait_for_shutdown(&mut shutdown) => {
                        debug!("Shutdown before reconciliation started");
                        ReconcileOutcome::Skipped
                    }
                };

                if let Ok(mut set) = in_flight.lock() {
                    set.remove(&request_id);
                }
                debug!(outcome = ?outcome, "Reconciliation finished");
                outcome
            }
            .instrument(tracing::info_span!("reconcile_task", request_id = %request_id)),
        );
    }
}

/// Resolves once shutdown is signaled (or the sender is gone).
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn log_join(joined: Result<ReconcileOutcome, tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Reconciliation task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{InstanceDefaults, MockCloud};
    use crate::ledger::{LedgerCall, MockLedger};
    use chrono::Utc;
    use obsidian_chain::Address;

    struct Harness {
        cloud: Arc<MockCloud>,
        ledger: Arc<MockLedger>,
        store: Arc<StateStore>,
        engine: Arc<ReconciliationEngine>,
    }

    fn harness() -> Harness {
        let cloud = Arc::new(MockCloud::new());
        let ledger = Arc::new(MockLedger::new(Address::ZERO));
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let defaults = InstanceDefaults {
            image_ref: "img".into(),
            flavor_ref: "flv".into(),
            network_id: "net".into(),
        };
        let provisioner = Arc::new(CloudProvisioner::new(
            cloud.clone(),
            defaults,
            Duration::from_secs(5),
        ));
        let engine = Arc::new(ReconciliationEngine::new(
            ledger.clone(),
            provisioner,
            store.clone(),
            Duration::from_secs(1),
        ));
        Harness {
            cloud,
            ledger,
            store,
            engine,
        }
    }

    fn observe(store: &StateStore, id: u64) -> InstanceRequest {
        let request = InstanceRequest::observed(RequestId::new(id), Address::from([0xab; 20]), 0);
        store.record_observed(&request).unwrap();
        request
    }

    #[tokio::test]
    async fn test_success_registers_once() {
        let h = harness();
        let request = observe(&h.store, 7);

        let outcome = h.engine.reconcile(&request).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Registered {
                cloud_instance_id: "i-001".into()
            }
        );
        assert_eq!(
            h.ledger.calls(),
            vec![LedgerCall::RegisterInstance {
                requester: Address::from([0xab; 20]),
                request_id: RequestId::new(7),
            }]
        );

        // A duplicate dispatch is a no-op.
        assert_eq!(h.engine.reconcile(&request).await.unwrap(), ReconcileOutcome::Skipped);
        assert_eq!(h.cloud.create_calls(), 1);
        assert_eq!(h.ledger.register_instance_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_provision_failure_reports_error() {
        let h = harness();
        h.cloud.fail_creates_with(Some("QuotaExceeded"));
        let request = observe(&h.store, 42);

        let outcome = h.engine.reconcile(&request).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Failed {
                reason: "QuotaExceeded".into()
            }
        );
        assert_eq!(
            h.ledger.report_error_calls(),
            vec![LedgerCall::ReportError {
                request_id: RequestId::new(42),
                message: "QuotaExceeded".into(),
            }]
        );
        assert!(h.ledger.register_instance_calls().is_empty());
    }

    #[tokio::test]
    async fn test_registration_write_failure_goes_to_outbox() {
        let h = harness();
        h.ledger.fail_register_instance(1);
        let request = observe(&h.store, 8);

        let outcome = h.engine.reconcile(&request).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::WriteBackPending {
                kind: "register_instance"
            }
        );
        assert_eq!(h.store.outbox_len().unwrap(), 1);
        let record = h.store.get_request(RequestId::new(8)).unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Provisioning);
        assert_eq!(record.cloud_instance_id.as_deref(), Some("i-001"));
    }

    #[tokio::test]
    async fn test_auth_rejection_reports_error() {
        let h = harness();
        h.cloud.reject_auth(true);
        let request = observe(&h.store, 11);

        let outcome = h.engine.reconcile(&request).await.unwrap();
        let ReconcileOutcome::Failed { reason } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(reason.contains("auth"), "unexpected reason: {reason}");

        assert_eq!(
            h.ledger.report_error_calls(),
            vec![LedgerCall::ReportError {
                request_id: RequestId::new(11),
                message: reason.clone(),
            }]
        );
        assert!(h.ledger.register_instance_calls().is_empty());
        assert_eq!(h.cloud.create_calls(), 0);

        let record = h.store.get_request(RequestId::new(11)).unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some(reason.as_str()));
    }

    #[tokio::test]
    async fn test_unreported_failure_goes_to_outbox() {
        let h = harness();
        h.cloud.fail_creates_with(Some("QuotaExceeded"));
        h.ledger.fail_report_error(1);
        let request = observe(&h.store, 12);

        let outcome = h.engine.reconcile(&request).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::WriteBackPending {
                kind: "report_error"
            }
        );

        let record = h.store.get_request(RequestId::new(12)).unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Provisioning);
        assert_eq!(record.last_error.as_deref(), Some("QuotaExceeded"));

        let entries = h.store.due_outbox(Utc::now() + chrono::Duration::hours(1), 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].write,
            WriteBack::ReportError {
                message: "QuotaExceeded".into()
            }
        );
        assert!(h.ledger.register_instance_calls().is_empty());
    }

    #[tokio::test]
    async fn test_request_owed_by_outbox_is_skipped() {
        let h = harness();
        h.ledger.fail_register_instance(1);
        let request = observe(&h.store, 13);
        h.engine.reconcile(&request).await.unwrap();

        assert_eq!(h.engine.reconcile(&request).await.unwrap(), ReconcileOutcome::Skipped);
        assert_eq!(h.cloud.create_calls(), 1);
        assert_eq!(h.ledger.write_attempts(), 1);
    }

    #[tokio::test]
    async fn test_pool_skips_duplicates_in_flight() {
        let h = harness();
        h.cloud.delay_create("Instance-5", Duration::from_millis(100));
        let request = observe(&h.store, 5);

        let pool = ReconcilerPool::new(h.engine.clone(), 4);
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(request.clone()).await.unwrap();
        tx.send(request).await.unwrap();
        drop(tx);

        pool.run(rx, shutdown_rx).await;
        drop(shutdown_tx);

        assert_eq!(h.cloud.create_calls(), 1);
        assert_eq!(h.ledger.register_instance_calls().len(), 1);
    }
}
