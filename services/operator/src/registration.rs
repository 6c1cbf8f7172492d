//! One-time operator registration.
//!
//! Runs at startup, before any event processing:
//! 1. Register with the delegation manager (best effort; an already
//!    registered operator reverts here)
//! 2. Ask the AVS directory for the registration digest
//! 3. Sign the digest with the operator key
//! 4. Submit the signature to the stake registry

use std::sync::Arc;

use obsidian_chain::{Address, OperatorSigner, H256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::ledger::{LedgerClient, LedgerError, OperatorDetails, SignatureWithSaltAndExpiry};

/// Lifetime of the registration signature.
pub const SIGNATURE_TTL_SECS: u64 = 3600;

/// Registration failures. All of them abort startup.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to compute registration digest: {0}")]
    Digest(#[source] LedgerError),

    #[error("failed to sign registration digest: {0}")]
    Signing(#[from] obsidian_chain::ChainError),

    #[error("stake registry rejected operator: {0}")]
    Registry(#[source] LedgerError),
}

/// Registers the operator with the restaking contracts.
pub struct RegistrationFlow {
    ledger: Arc<dyn LedgerClient>,
    signer: Arc<OperatorSigner>,
    /// Service manager the operator registers for.
    avs: Address,
}

impl RegistrationFlow {
    pub fn new(ledger: Arc<dyn LedgerClient>, signer: Arc<OperatorSigner>, avs: Address) -> Self {
        Self { ledger, signer, avs }
    }

    /// Runs the registration sequence.
    #[instrument(skip(self), fields(operator = %self.signer.address()))]
    pub async fn register_operator(&self) -> Result<(), RegistrationError> {
        let operator = self.signer.address();
        info!("Registering operator");

        let details = OperatorDetails::for_operator(operator);
        match self.ledger.register_as_operator(&details, "").await {
            Ok(receipt) => info!(
                tx_hash = %receipt.tx_hash,
                "Operator registered with delegation manager"
            ),
            Err(e) => warn!(error = %e, "Delegation manager registration failed, continuing"),
        }

        let salt = H256::from(rand::random::<[u8; 32]>());
        let expiry = unix_now() + SIGNATURE_TTL_SECS;

        let digest = self
            .ledger
            .registration_digest(operator, self.avs, salt, expiry)
            .await
            .map_err(RegistrationError::Digest)?;
        debug!(digest = %digest, expiry, "Registration digest computed");

        let signature = self.signer.sign_digest(&digest)?;
        let payload = SignatureWithSaltAndExpiry {
            signature: signature.to_bytes().to_vec(),
            salt,
            expiry,
        };

        let receipt = self
            .ledger
            .register_operator_with_signature(&payload, operator)
            .await
            .map_err(RegistrationError::Registry)?;
        info!(tx_hash = %receipt.tx_hash, "Operator registered with stake registry");
        Ok(())
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
