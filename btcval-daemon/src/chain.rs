//! Client interface to the consensus chain.

use btcval_eots::{Bip340PubKey, EotsSignature, ProofOfPossession};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BlockInfo, Commission};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub tx_hash: String,
}

/// A finality vote as recorded by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalityVote {
    pub block_hash: Vec<u8>,
    pub sig: EotsSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Transport or node failure; the same call may succeed later
    #[error("rpc failure: {0}")]
    Rpc(String),

    /// The chain rejected the transaction and will keep rejecting it
    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("validator {0} is not registered")]
    NotRegistered(Bip340PubKey),

    #[error("validator {0} is already registered")]
    AlreadyRegistered(Bip340PubKey),

    #[error("validator {0} is slashed")]
    Slashed(Bip340PubKey),

    #[error("unknown chain {0}")]
    UnknownChain(String),

    #[error("no block at height {height} on {chain_id}")]
    UnknownBlock { chain_id: String, height: u64 },

    #[error("signature does not verify")]
    InvalidSignature,
}

impl ChainError {
    /// Whether retrying the same request can never succeed.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, ChainError::Rpc(_) | ChainError::UnknownBlock { .. })
    }
}

pub trait ChainClient: Send + Sync {
    fn submit_registration(
        &self,
        chain_id: &str,
        consensus_pk: &PublicKey,
        btc_pk: &Bip340PubKey,
        pop: &ProofOfPossession,
        description: &[u8],
        commission: Commission,
    ) -> Result<TxResponse, ChainError>;

    fn submit_finality_vote(
        &self,
        chain_id: &str,
        btc_pk: &Bip340PubKey,
        height: u64,
        block_hash: &[u8],
        sig: &EotsSignature,
    ) -> Result<TxResponse, ChainError>;

    fn latest_committed_height(&self, chain_id: &str) -> Result<u64, ChainError>;

    fn block_info(&self, chain_id: &str, height: u64) -> Result<BlockInfo, ChainError>;

    /// Votes by `btc_pk` at `height` in the order the chain accepted them.
    /// More than one entry means the validator double-signed.
    fn finality_votes(
        &self,
        chain_id: &str,
        btc_pk: &Bip340PubKey,
        height: u64,
    ) -> Result<Vec<FinalityVote>, ChainError>;

    /// Whether the chain holds slashing evidence against `btc_pk`.
    fn query_slashed(&self, btc_pk: &Bip340PubKey) -> Result<bool, ChainError>;
}
