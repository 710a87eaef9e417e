//! BTC validator daemon.
//!
//! Runs BTC-staked validators ("finality providers") against a consensus
//! chain: registers them, follows the chain's committed height and submits an
//! EOTS-signed finality vote for every block. Two votes by one validator at
//! one height for different blocks reveal its BTC key, which is the slashing
//! evidence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Unix socket   ┌──────────────────────────────────────┐
//! │  btcval-cli  │ ◄─────────────► │ RpcServer                            │
//! └──────────────┘  Request/Resp   │   └─ ValidatorManager (dispatcher)   │
//!                                  │        └─ ValidatorInstance × N      │
//!                                  │             ├─ ValState ─► store     │
//!                                  │             └─ poll loop ─► chain    │
//!                                  └──────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! BTCVAL_PASSPHRASE=... btcvald --data-dir /var/lib/btcval --chain-id devnet-1
//! btcval-cli create-validator --key-name v1 --chain-id devnet-1
//! btcval-cli register-validator <btc-pk> --start
//! ```

pub mod chain;
pub mod config;
pub mod devchain;
pub mod error;
pub mod instance;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutil;

pub use chain::{ChainClient, ChainError, FinalityVote, TxResponse};
pub use config::{ConfigError, ValidatorConfig};
pub use devchain::{BlockProducer, DevChain};
pub use error::ValidatorError;
pub use instance::{ExtractedKey, ValidatorInstance};
pub use manager::{CreateValidatorRequest, RegisterValidatorRequest, ValidatorManager};
pub use protocol::{
    CreateValidatorParams, FinalitySignatureParams, FinalitySignatureResponse, Request, Response,
    ValidatorInfo,
};
pub use server::{RpcClient, RpcServer, ServerError};
pub use state::ValState;
pub use store::{FileValidatorStore, StoreError, ValidatorStore};
pub use types::{BlockInfo, Commission, CommissionError, StoredValidator, ValidatorStatus};
