//! Obsidian Operator
//!
//! Bridges ledger instance requests to OpenStack compute.
//!
//! ## Commands
//!
//! - `run` (default): register the operator, then watch the ledger and
//!   reconcile requests until interrupted
//! - `register`: run the registration sequence only
//! - `create-instance`: submit a `createInstance()` transaction
//! - `terminate-instance <ID>`: submit `terminateInstance(ID)`, optionally
//!   deleting the matching cloud server

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use obsidian_chain::OperatorSigner;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use obsidian_operator::config::Config;
use obsidian_operator::registration::RegistrationFlow;
use obsidian_operator::request::RequestId;
use obsidian_operator::runtime::{Components, OperatorRuntime, RuntimeSettings};

/// Operator bridge between the ledger and OpenStack compute.
#[derive(Debug, Parser)]
#[command(name = "operator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register, then reconcile instance requests until interrupted.
    Run {
        /// Skip the startup registration sequence (operator already registered).
        #[arg(long, env = "OBSIDIAN_SKIP_REGISTRATION")]
        skip_registration: bool,
    },

    /// Register the operator with the restaking core and the AVS.
    Register,

    /// Submit a `createInstance()` transaction to the service manager.
    CreateInstance,

    /// Submit a `terminateInstance(id)` transaction to the service manager.
    TerminateInstance {
        /// On-chain instance id.
        id: u64,

        /// Also delete the cloud server named `Instance-<id>`.
        #[arg(long)]
        cloud: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let signer = Arc::new(
        OperatorSigner::from_hex(config.ledger.private_key.expose())
            .context("PRIVATE_KEY is not a valid secp256k1 key")?,
    );
    info!(
        operator = %signer.address(),
        chain_id = config.ledger.chain_id,
        rpc_url = %config.ledger.rpc_url,
        service_manager = %config.ledger.contracts.service_manager,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    let command = cli.command.unwrap_or(Commands::Run {
        skip_registration: false,
    });
    let components = Components::from_config(&config, Arc::clone(&signer))?;

    match command {
        Commands::Run { skip_registration } => {
            if skip_registration {
                info!("Skipping operator registration");
            } else {
                register(&config, &components, signer).await?;
            }
            run(&config, components).await
        }
        Commands::Register => register(&config, &components, signer).await,
        Commands::CreateInstance => {
            let receipt = components
                .ledger
                .create_instance()
                .await
                .context("createInstance failed")?;
            info!(
                tx_hash = %receipt.tx_hash,
                block = receipt.block_number,
                "createInstance confirmed"
            );
            Ok(())
        }
        Commands::TerminateInstance { id, cloud } => {
            let receipt = components
                .ledger
                .terminate_instance(id)
                .await
                .with_context(|| format!("terminateInstance({id}) failed"))?;
            info!(
                instance_id = id,
                tx_hash = %receipt.tx_hash,
                block = receipt.block_number,
                "terminateInstance confirmed"
            );

            if cloud {
                let name = RequestId::new(id).instance_name();
                match components.provisioner.terminate_instance(&name).await? {
                    Some(cloud_instance_id) => {
                        info!(name = %name, cloud_instance_id = %cloud_instance_id, "Cloud instance deleted")
                    }
                    None => warn!(name = %name, "No cloud instance found"),
                }
            }
            Ok(())
        }
    }
}

async fn register(config: &Config, components: &Components, signer: Arc<OperatorSigner>) -> Result<()> {
    let flow = RegistrationFlow::new(
        Arc::clone(&components.ledger),
        signer,
        config.ledger.contracts.service_manager,
    );
    flow.register_operator()
        .await
        .context("Operator registration failed")
}

async fn run(config: &Config, components: Components) -> Result<()> {
    info!("Starting Obsidian operator");

    let mut runtime = OperatorRuntime::start(components, RuntimeSettings::from(config));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        task = runtime.stopped() => {
            if let Some(task) = task {
                error!(task, "Operator task exited unexpectedly");
            }
        }
    }

    runtime.shutdown().await;
    info!("Operator shutdown complete");
    Ok(())
}
