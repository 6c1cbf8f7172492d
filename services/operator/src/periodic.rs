//! Standing-capacity task.
//!
//! Provisions one cloud instance per interval, independent of ledger
//! requests. Nothing is written back to the ledger.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};
use ulid::Ulid;

use crate::cloud::{CloudError, CloudProvisioner, ProvisionedInstance};
use crate::request::INSTANCE_NAME_PREFIX;

/// Name of a standing instance, `Instance-standing-<ulid>`.
///
/// Never parses as a request-derived name.
pub fn standing_instance_name(id: Ulid) -> String {
    format!("{INSTANCE_NAME_PREFIX}standing-{}", id.to_string().to_lowercase())
}

/// Periodic provisioning task.
pub struct PeriodicInstanceTask {
    provisioner: Arc<CloudProvisioner>,
    interval: Duration,
}

impl PeriodicInstanceTask {
    pub fn new(provisioner: Arc<CloudProvisioner>, interval: Duration) -> Self {
        Self {
            provisioner,
            interval,
        }
    }

    /// Run the task until shutdown is signaled. The first instance is
    /// created one interval after start.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting periodic instance task");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.fire_once().await {
                        error!(error = %e, "Periodic instance creation failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Periodic instance task shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Creates one standing instance.
    pub async fn fire_once(&self) -> Result<ProvisionedInstance, CloudError> {
        let name = standing_instance_name(Ulid::new());
        let instance = self.provisioner.create_standing_instance(&name).await?;
        info!(
            name = %instance.name,
            cloud_instance_id = %instance.cloud_instance_id,
            "Standing instance created"
        );
        Ok(instance)
    }
}
