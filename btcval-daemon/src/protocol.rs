//! Wire protocol between `btcval-cli` and the daemon.
//!
//! Uses a simple length-prefixed binary format over Unix sockets. Keys, hashes
//! and signatures travel as hex strings and are parsed by the server before
//! any validator state is touched.

use serde::{Deserialize, Serialize};

use crate::types::StoredValidator;

/// Parameters for creating a validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateValidatorParams {
    pub key_name: String,
    pub passphrase: String,
    pub chain_id: String,
    pub description: String,
    /// Decimal commission rate, e.g. `"0.05"`
    pub commission: String,
}

/// Parameters for a manual finality vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalitySignatureParams {
    pub btc_pk: String,
    pub height: u64,
    pub block_hash: String,
}

/// All possible messages from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    GetInfo,
    CreateValidator(CreateValidatorParams),
    RegisterValidator {
        btc_pk: String,
        /// Start the validator after registration
        passphrase: Option<String>,
    },
    StartValidator {
        btc_pk: String,
        passphrase: String,
    },
    QueryValidator {
        btc_pk: String,
    },
    QueryValidatorList,
    AddFinalitySignature(FinalitySignatureParams),
}

/// Validator as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub key_name: String,
    pub btc_pk: String,
    pub consensus_pk: String,
    pub chain_id: String,
    pub description: String,
    pub commission: String,
    pub status: String,
    pub last_voted_height: u64,
    pub last_processed_height: u64,
    pub last_committed_height: u64,
    pub running: bool,
}

impl ValidatorInfo {
    pub fn from_record(record: &StoredValidator, running: bool) -> Self {
        Self {
            key_name: record.key_name.clone(),
            btc_pk: record.btc_pk.to_hex(),
            consensus_pk: record.consensus_pk_hex(),
            chain_id: record.chain_id.clone(),
            description: String::from_utf8_lossy(&record.description).into_owned(),
            commission: record.commission.to_string(),
            status: record.status.to_string(),
            last_voted_height: record.last_voted_height,
            last_processed_height: record.last_processed_height,
            last_committed_height: record.last_committed_height,
            running,
        }
    }
}

/// Result of a manual finality vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalitySignatureResponse {
    pub tx_hash: String,
    /// Set when the vote conflicted with an earlier one and revealed the key
    pub extracted_sk_hex: Option<String>,
    pub local_sk_hex: Option<String>,
}

/// All possible messages from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Info { version: String, validators: u64 },
    ValidatorCreated { btc_pk: String },
    ValidatorRegistered { tx_hash: String },
    ValidatorStarted,
    Validator(ValidatorInfo),
    ValidatorList(Vec<ValidatorInfo>),
    FinalitySignature(FinalitySignatureResponse),
    Error { message: String },
}
