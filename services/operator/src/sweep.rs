//! Orphan sweep.
//!
//! Compares cloud servers named `Instance-<requestId>` with the request log.
//! A server is orphaned when its request is unknown locally or ended
//! `Failed` on the ledger. Orphans are only reported.

use std::sync::Arc;
use std::time::Duration;

use obsidian_reconcile::RequestStatus;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::cloud::{CloudError, CloudProvisioner};
use crate::request::{RequestId, INSTANCE_NAME_PREFIX};
use crate::state::{StateStore, StateStoreError};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    State(#[from] StateStoreError),
}

/// A cloud server with no live request behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedInstance {
    pub cloud_instance_id: String,
    pub name: String,
    pub request_id: RequestId,
    /// Local status, `None` when the request was never observed.
    pub status: Option<RequestStatus>,
}

/// Periodic orphan detection.
pub struct OrphanSweep {
    provisioner: Arc<CloudProvisioner>,
    store: Arc<StateStore>,
    interval: Duration,
}

impl OrphanSweep {
    pub fn new(provisioner: Arc<CloudProvisioner>, store: Arc<StateStore>, interval: Duration) -> Self {
        Self {
            provisioner,
            store,
            interval,
        }
    }

    /// Run the sweep until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting orphan sweep");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(orphans) if !orphans.is_empty() => {
                            warn!(count = orphans.len(), "Orphaned cloud instances found");
                        }
                        Ok(_) => debug!("No orphaned cloud instances"),
                        Err(e) => error!(error = %e, "Orphan sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Orphan sweep shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over the cloud's request-derived servers.
    pub async fn sweep_once(&self) -> Result<Vec<OrphanedInstance>, SweepError> {
        let servers = self.provisioner.list_instances(INSTANCE_NAME_PREFIX).await?;
        let mut orphans = Vec::new();

        for server in servers {
            let Some(request_id) = RequestId::from_instance_name(&server.name) else {
                continue;
            };

            let status = self.store.get_request(request_id)?.map(|r| r.status);
            if matches!(status, None | Some(RequestStatus::Failed)) {
                warn!(
                    name = %server.name,
                    cloud_instance_id = %server.id,
                    request_id = %request_id,
                    status = ?status,
                    "Orphaned cloud instance"
                );
                orphans.push(OrphanedInstance {
                    cloud_instance_id: server.id,
                    name: server.name,
                    request_id,
                    status,
                });
            }
        }

        Ok(orphans)
    }
}
