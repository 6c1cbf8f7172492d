//! Operator runtime.
//!
//! Wires the long-running loops together and owns their shutdown:
//! - event monitor → bounded queue → reconciler pool
//! - write-back outbox relay
//! - standing-capacity task (optional)
//! - orphan sweep (optional)
//!
//! All loops watch the same shutdown channel. [`OperatorRuntime::shutdown`]
//! signals it and waits for every loop to finish, so in-flight
//! reconciliations complete before the process exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use obsidian_chain::OperatorSigner;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, Instrument};

use crate::cloud::{CloudProvisioner, InstanceDefaults, OpenStackClient};
use crate::config::Config;
use crate::engine::{ReconcilerPool, ReconciliationEngine};
use crate::ledger::{EvmLedger, LedgerClient};
use crate::monitor::EventMonitor;
use crate::outbox::OutboxRelay;
use crate::periodic::PeriodicInstanceTask;
use crate::state::StateStore;
use crate::sweep::OrphanSweep;

/// Capacity of the monitor → pool queue.
const QUEUE_CAPACITY: usize = 256;

/// Loop cadences and limits.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub max_block_range: u64,
    pub start_block: Option<u64>,
    pub max_concurrent_reconciles: usize,
    pub outbox_interval: Duration,
    pub periodic_interval: Option<Duration>,
    pub sweep_interval: Option<Duration>,
}

impl From<&Config> for RuntimeSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.ledger.poll_interval,
            max_block_range: config.ledger.max_block_range,
            start_block: config.ledger.start_block,
            max_concurrent_reconciles: config.max_concurrent_reconciles,
            outbox_interval: config.outbox_interval,
            periodic_interval: config.periodic_interval,
            sweep_interval: config.sweep_interval,
        }
    }
}

/// The shared clients every loop is built from.
#[derive(Clone)]
pub struct Components {
    pub ledger: Arc<dyn LedgerClient>,
    pub provisioner: Arc<CloudProvisioner>,
    pub store: Arc<StateStore>,
}

impl Components {
    /// Production clients: EVM JSON-RPC ledger, OpenStack cloud and the
    /// on-disk request log under `data_dir`.
    pub fn from_config(config: &Config, signer: Arc<OperatorSigner>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory {}", config.data_dir.display())
        })?;
        let store = StateStore::open(config.state_path()).with_context(|| {
            format!("Failed to open request log {}", config.state_path().display())
        })?;

        let ledger = EvmLedger::new(&config.ledger, signer)
            .context("Failed to build ledger client")?;
        let cloud = OpenStackClient::new(config.cloud.clone())
            .context("Failed to build OpenStack client")?;
        let provisioner = CloudProvisioner::new(
            Arc::new(cloud),
            InstanceDefaults::from(&config.cloud),
            config.cloud.request_timeout,
        );

        Ok(Self {
            ledger: Arc::new(ledger),
            provisioner: Arc::new(provisioner),
            store: Arc::new(store),
        })
    }
}

/// Handle on the running loops.
pub struct OperatorRuntime {
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<&'static str>,
}

impl OperatorRuntime {
    /// Spawns every loop. Must be called inside a Tokio runtime.
    pub fn start(components: Components, settings: RuntimeSettings) -> Self {
        let Components {
            ledger,
            provisioner,
            store,
        } = components;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut tasks = JoinSet::new();

        let monitor = EventMonitor::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            queue_tx,
            settings.poll_interval,
            settings.max_block_range,
            settings.start_block,
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(
            async move {
                monitor.run(shutdown).await;
                "monitor"
            }
            .instrument(tracing::info_span!("monitor")),
        );

        let engine = Arc::new(ReconciliationEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&provisioner),
            Arc::clone(&store),
            settings.outbox_interval,
        ));
        let pool = ReconcilerPool::new(engine, settings.max_concurrent_reconciles);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(
            async move {
                pool.run(queue_rx, shutdown).await;
                "reconciler"
            }
            .instrument(tracing::info_span!("reconciler")),
        );

        let relay = OutboxRelay::new(
            Arc::clone(&ledger),
            Arc::clone(&store),
            settings.outbox_interval,
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(
            async move {
                relay.run(shutdown).await;
                "outbox"
            }
            .instrument(tracing::info_span!("outbox")),
        );

        match settings.periodic_interval {
            Some(interval) => {
                let task = PeriodicInstanceTask::new(Arc::clone(&provisioner), interval);
                let shutdown = shutdown_rx.clone();
                tasks.spawn(
                    async move {
                        task.run(shutdown).await;
                        "periodic"
                    }
                    .instrument(tracing::info_span!("periodic")),
                );
            }
            None => info!("Periodic instance task disabled"),
        }

        match settings.sweep_interval {
            Some(interval) => {
                let sweep = OrphanSweep::new(provisioner, store, interval);
                let shutdown = shutdown_rx;
                tasks.spawn(
                    async move {
                        sweep.run(shutdown).await;
                        "sweep"
                    }
                    .instrument(tracing::info_span!("sweep")),
                );
            }
            None => info!("Orphan sweep disabled"),
        }

        info!(tasks = tasks.len(), "Operator runtime started");
        Self { shutdown_tx, tasks }
    }

    /// Waits until any loop exits on its own and returns its name.
    ///
    /// Pending forever while every loop is healthy.
    pub async fn stopped(&mut self) -> Option<&'static str> {
        match self.tasks.join_next().await {
            Some(Ok(name)) => Some(name),
            Some(Err(e)) => {
                error!(error = %e, "Operator task panicked");
                Some("unknown")
            }
            None => std::future::pending().await,
        }
    }

    /// Signals shutdown and waits for every loop to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        info!(tasks = self.tasks.len(), "Waiting for operator tasks to stop");

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(name) => info!(task = name, "Task stopped"),
                Err(e) => error!(error = %e, "Operator task panicked"),
            }
        }
        info!("Operator runtime stopped");
    }
}
