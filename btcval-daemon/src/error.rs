use btcval_eots::{Bip340PubKey, EotsError};
use btcval_keystore::KeystoreError;
use thiserror::Error;

use crate::chain::ChainError;
use crate::store::StoreError;
use crate::types::{CommissionError, ValidatorStatus};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid commission rate {0}")]
    InvalidCommission(#[from] CommissionError),

    #[error("invalid key name {0:?}")]
    InvalidKeyName(String),

    #[error("validator {0} not found")]
    NotFound(Bip340PubKey),

    #[error("validator {0} already exists")]
    AlreadyExists(Bip340PubKey),

    #[error("validator {btc_pk}: cannot move from {from} to {to}")]
    InvalidTransition {
        btc_pk: Bip340PubKey,
        from: ValidatorStatus,
        to: ValidatorStatus,
    },

    #[error("validator {btc_pk}: {reason}")]
    HeightInvariant { btc_pk: Bip340PubKey, reason: String },

    #[error("validator {btc_pk} already voted up to height {last_voted}, refusing height {height}")]
    AlreadyVoted {
        btc_pk: Bip340PubKey,
        height: u64,
        last_voted: u64,
    },

    #[error("validator {btc_pk}: height {height} is above last committed height {committed}")]
    HeightNotCommitted {
        btc_pk: Bip340PubKey,
        height: u64,
        committed: u64,
    },

    #[error("validator {0} is slashed")]
    Slashed(Bip340PubKey),

    #[error("validator {0} is not running")]
    NotRunning(Bip340PubKey),

    #[error("key store error ({context}): {source}")]
    KeyStore {
        context: String,
        #[source]
        source: KeystoreError,
    },

    #[error("validator {btc_pk}: store error: {source}")]
    Store {
        btc_pk: Bip340PubKey,
        #[source]
        source: StoreError,
    },

    #[error("failed to load validators: {0}")]
    LoadStore(#[source] StoreError),

    #[error("validator {btc_pk}: {operation} failed: {source}")]
    Chain {
        operation: &'static str,
        btc_pk: Bip340PubKey,
        #[source]
        source: ChainError,
    },

    #[error(transparent)]
    Eots(#[from] EotsError),

    /// Extraction succeeded but the key is neither the local key nor its
    /// negation. Local key material or the chain's evidence is corrupt.
    #[error("validator {btc_pk}: extracted key {extracted} matches neither the local key nor its negation")]
    ExtractionMismatch {
        btc_pk: Bip340PubKey,
        extracted: String,
    },

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("validator manager is stopped")]
    ManagerStopped,
}

impl ValidatorError {
    pub(crate) fn chain(operation: &'static str, btc_pk: Bip340PubKey, source: ChainError) -> Self {
        ValidatorError::Chain {
            operation,
            btc_pk,
            source,
        }
    }

    pub(crate) fn store(btc_pk: Bip340PubKey, source: StoreError) -> Self {
        ValidatorError::Store { btc_pk, source }
    }

    pub(crate) fn keystore(context: impl Into<String>, source: KeystoreError) -> Self {
        ValidatorError::KeyStore {
            context: context.into(),
            source,
        }
    }

    /// Whether a polling loop hitting this error must halt its validator.
    ///
    /// Transient chain failures are retried on the next poll.
    pub fn is_fatal(&self) -> bool {
        match self {
            ValidatorError::Chain { source, .. } => source.is_permanent(),
            ValidatorError::Store { .. }
            | ValidatorError::KeyStore { .. }
            | ValidatorError::Eots(_)
            | ValidatorError::ExtractionMismatch { .. }
            | ValidatorError::HeightInvariant { .. }
            | ValidatorError::InvalidTransition { .. }
            | ValidatorError::Slashed(_) => true,
            _ => false,
        }
    }
}
