//! Configuration for the operator.
//!
//! Everything is read once at startup from environment variables. Contract
//! addresses may also come from the deployment JSON files written by the
//! contract deploy scripts; explicit environment overrides win.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use obsidian_chain::Address;
use obsidian_reconcile::{DEFAULT_PERIODIC_INTERVAL, DEFAULT_POLL_INTERVAL};
use serde::Deserialize;

/// A secret string that never prints its value.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Addresses of the contracts the operator talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractAddresses {
    /// Delegation manager (operator registration with the restaking core).
    pub delegation_manager: Address,
    /// AVS directory (registration digest computation).
    pub avs_directory: Address,
    /// ECDSA stake registry (signed operator registration).
    pub stake_registry: Address,
    /// Service manager (instance requests and write-backs).
    pub service_manager: Address,
}

#[derive(Debug, Deserialize)]
struct DeploymentFile {
    addresses: HashMap<String, Address>,
}

impl DeploymentFile {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read deployment file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid deployment file {}", path.display()))
    }

    fn address(&self, key: &str, path: &Path) -> Result<Address> {
        self.addresses
            .get(key)
            .copied()
            .with_context(|| format!("Deployment file {} has no address `{key}`", path.display()))
    }
}

/// Ledger-side configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: String,

    /// EIP-155 chain id.
    pub chain_id: u64,

    /// Operator private key (hex).
    pub private_key: Secret,

    pub contracts: ContractAddresses,

    /// First block to scan when no cursor is persisted. `None` starts at the head.
    pub start_block: Option<u64>,

    /// Maximum blocks per log query.
    pub max_block_range: u64,

    /// Interval between event polls.
    pub poll_interval: Duration,

    /// Upper bound on waiting for a transaction receipt.
    pub confirmation_timeout: Duration,

    /// Interval between receipt polls.
    pub receipt_poll_interval: Duration,
}

/// Cloud-side configuration.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Keystone v3 endpoint, e.g. `http://keystone:5000/v3`.
    pub auth_url: String,

    /// Nova endpoint, e.g. `http://nova:8774/v2.1`.
    pub compute_url: String,

    pub username: String,
    pub password: Secret,
    pub project_id: String,
    pub domain_id: String,

    pub image_ref: String,
    pub flavor_ref: String,
    pub network_id: String,

    /// Upper bound on any single cloud call.
    pub request_timeout: Duration,
}

/// Operator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ledger: LedgerConfig,

    pub cloud: CloudConfig,

    /// Data directory for the local request log.
    pub data_dir: PathBuf,

    /// Maximum reconciliations in flight.
    pub max_concurrent_reconciles: usize,

    /// Cadence of the standing-capacity task. `None` disables it.
    pub periodic_interval: Option<Duration>,

    /// Interval between write-back outbox passes.
    pub outbox_interval: Duration,

    /// Interval between orphan sweeps. `None` disables it.
    pub sweep_interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let chain_id: u64 = env.parse("OBSIDIAN_CHAIN_ID")?.unwrap_or(31337);
        let deployments_dir = env
            .get("OBSIDIAN_DEPLOYMENTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("contracts/deployments"));
        let contracts = resolve_contracts(&env, &deployments_dir, chain_id)?;

        let ledger = LedgerConfig {
            rpc_url: env
                .get("OBSIDIAN_RPC_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8545".to_string()),
            chain_id,
            private_key: Secret::new(
                env.get("PRIVATE_KEY")
                    .context("Missing operator key. Set PRIVATE_KEY.")?,
            ),
            contracts,
            start_block: env.parse("OBSIDIAN_START_BLOCK")?,
            max_block_range: env
                .parse("OBSIDIAN_MAX_BLOCK_RANGE")?
                .unwrap_or(1000u64)
                .max(1),
            poll_interval: env
                .parse::<u64>("OBSIDIAN_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL)
                .max(Duration::from_millis(100)),
            confirmation_timeout: Duration::from_secs(
                env.parse("OBSIDIAN_CONFIRMATION_TIMEOUT_SECS")?
                    .unwrap_or(120),
            ),
            receipt_poll_interval: Duration::from_millis(
                env.parse::<u64>("OBSIDIAN_RECEIPT_POLL_MS")?
                    .unwrap_or(1000)
                    .max(50),
            ),
        };

        let cloud = CloudConfig {
            auth_url: env
                .get("OS_AUTH_URL")
                .unwrap_or_else(|| "http://openstack-keystone-url/v3".to_string()),
            compute_url: env
                .get("OS_COMPUTE_URL")
                .unwrap_or_else(|| "http://openstack-nova-url/v2.1".to_string()),
            username: env.require("OS_USERNAME")?,
            password: Secret::new(env.require("OS_PASSWORD")?),
            project_id: env.require("OS_PROJECT_ID")?,
            domain_id: env.require("OS_DOMAIN_ID")?,
            image_ref: env.require("OS_IMAGE_REF")?,
            flavor_ref: env.require("OS_FLAVOR_REF")?,
            network_id: env.require("OS_NETWORK_ID")?,
            request_timeout: Duration::from_secs(
                env.parse("OBSIDIAN_CLOUD_TIMEOUT_SECS")?.unwrap_or(30),
            ),
        };

        let periodic_secs: u64 = env
            .parse("OBSIDIAN_PERIODIC_INTERVAL_SECS")?
            .unwrap_or(DEFAULT_PERIODIC_INTERVAL.as_secs());
        let sweep_secs: u64 = env.parse("OBSIDIAN_SWEEP_INTERVAL_SECS")?.unwrap_or(1800);

        Ok(Self {
            ledger,
            cloud,
            data_dir: env
                .get("OBSIDIAN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/obsidian")),
            max_concurrent_reconciles: env
                .parse("OBSIDIAN_MAX_CONCURRENT_RECONCILES")?
                .unwrap_or(16usize)
                .max(1),
            periodic_interval: (periodic_secs > 0).then(|| Duration::from_secs(periodic_secs)),
            outbox_interval: Duration::from_secs(
                env.parse::<u64>("OBSIDIAN_OUTBOX_INTERVAL_SECS")?
                    .unwrap_or(15)
                    .max(1),
            ),
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            log_level: env
                .get("OBSIDIAN_LOG_LEVEL")
                .unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Path of the SQLite request log.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("operator.db")
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .with_context(|| format!("Missing required setting {key}."))
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.get(key)
            .map(|v| v.trim().parse::<T>())
            .transpose()
            .with_context(|| format!("{key} has an invalid value."))
    }

    fn address(&self, key: &str) -> Result<Option<Address>> {
        self.get(key)
            .map(|v| Address::parse(v.trim()))
            .transpose()
            .with_context(|| format!("{key} must be a 20-byte hex address."))
    }
}

fn resolve_contracts<F>(env: &Env<'_, F>, deployments_dir: &Path, chain_id: u64) -> Result<ContractAddresses>
where
    F: Fn(&str) -> Option<String>,
{
    let delegation_manager = env.address("OBSIDIAN_DELEGATION_MANAGER")?;
    let avs_directory = env.address("OBSIDIAN_AVS_DIRECTORY")?;
    let stake_registry = env.address("OBSIDIAN_STAKE_REGISTRY")?;
    let service_manager = env.address("OBSIDIAN_SERVICE_MANAGER")?;

    let core_path = deployments_dir.join("core").join(format!("{chain_id}.json"));
    let avs_path = deployments_dir
        .join("obsidian")
        .join(format!("{chain_id}.json"));

    let delegation_manager = match delegation_manager {
        Some(addr) => addr,
        None => DeploymentFile::load(&core_path)?.address("delegation", &core_path)?,
    };
    let avs_directory = match avs_directory {
        Some(addr) => addr,
        None => DeploymentFile::load(&core_path)?.address("avsDirectory", &core_path)?,
    };
    let stake_registry = match stake_registry {
        Some(addr) => addr,
        None => DeploymentFile::load(&avs_path)?.address("stakeRegistry", &avs_path)?,
    };
    let service_manager = match service_manager {
        Some(addr) => addr,
        None => {
            DeploymentFile::load(&avs_path)?.address("obsidianServiceManager", &avs_path)?
        }
    };

    Ok(ContractAddresses {
        delegation_manager,
        avs_directory,
        stake_registry,
        service_manager,
    })
}
