//! Persisted validator record and the values it is built from.

use std::fmt;
use std::str::FromStr;

use btcval_eots::{Bip340PubKey, ProofOfPossession};
use secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Lifecycle status of a validator.
///
/// ```text
/// Created -> Registered -> Active -> { Slashed, Inactive }
/// ```
///
/// `Inactive` can be restarted into `Active`. `Slashed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidatorStatus {
    /// Key exists locally, nothing on chain yet
    Created,
    /// Registration transaction accepted by the chain
    Registered,
    /// Polling loop running and voting
    Active,
    /// Stopped by an operator or by an unrecoverable error
    Inactive,
    /// Double-sign evidence exists; must never vote again
    Slashed,
}

impl ValidatorStatus {
    pub fn can_transition_to(self, next: ValidatorStatus) -> bool {
        use ValidatorStatus::*;
        match (self, next) {
            (Slashed, _) => false,
            (a, b) if a == b => true,
            (Created, Registered) | (Created, Inactive) => true,
            (Registered, Active) | (Registered, Inactive) => true,
            (Active, Slashed) | (Active, Inactive) => true,
            (Inactive, Active) | (Inactive, Slashed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorStatus::Created => "CREATED",
            ValidatorStatus::Registered => "REGISTERED",
            ValidatorStatus::Active => "ACTIVE",
            ValidatorStatus::Inactive => "INACTIVE",
            ValidatorStatus::Slashed => "SLASHED",
        }
    }
}

impl fmt::Display for ValidatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{input:?}: {reason}")]
pub struct CommissionError {
    pub input: String,
    pub reason: &'static str,
}

/// Commission rate as an 18-decimal fixed-point fraction in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Commission(u128);

impl Commission {
    pub const PRECISION: u32 = 18;
    const ONE: u128 = 1_000_000_000_000_000_000;

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn one() -> Self {
        Self(Self::ONE)
    }

    /// Value scaled by `10^18`.
    pub fn atomics(&self) -> u128 {
        self.0
    }
}

impl FromStr for Commission {
    type Err = CommissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| CommissionError {
            input: s.to_string(),
            reason,
        };

        let (int_part, frac_part) = match s.trim().split_once('.') {
            Some((i, f)) => (i, f),
            None => (s.trim(), ""),
        };
        if int_part.is_empty() {
            return Err(err("missing integer part"));
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err("not a non-negative decimal"));
        }
        if frac_part.len() > Self::PRECISION as usize {
            return Err(err("more than 18 decimal places"));
        }
        if int_part.len() > 20 {
            return Err(err("out of range"));
        }

        let int: u128 = int_part.parse().map_err(|_| err("out of range"))?;
        let mut frac: u128 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| err("out of range"))?
        };
        frac *= 10u128.pow(Self::PRECISION - frac_part.len() as u32);

        let value = int
            .checked_mul(Self::ONE)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(|| err("out of range"))?;
        if value > Self::ONE {
            return Err(err("commission rate must be at most 1"));
        }
        Ok(Self(value))
    }
}

impl fmt::Display for Commission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:018}", self.0 / Self::ONE, self.0 % Self::ONE)
    }
}

impl Serialize for Commission {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Commission {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Durable record of one validator.
///
/// Only `ValState` mutates a live record; everything else works on clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValidator {
    pub key_name: String,
    pub consensus_pk: PublicKey,
    pub btc_pk: Bip340PubKey,
    pub pop: ProofOfPossession,
    pub chain_id: String,
    #[serde(with = "hex::serde")]
    pub description: Vec<u8>,
    pub commission: Commission,
    pub status: ValidatorStatus,
    pub last_voted_height: u64,
    pub last_processed_height: u64,
    pub last_committed_height: u64,
}

impl StoredValidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key_name: String,
        consensus_pk: PublicKey,
        btc_pk: Bip340PubKey,
        pop: ProofOfPossession,
        chain_id: String,
        description: Vec<u8>,
        commission: Commission,
    ) -> Self {
        Self {
            key_name,
            consensus_pk,
            btc_pk,
            pop,
            chain_id,
            description,
            commission,
            status: ValidatorStatus::Created,
            last_voted_height: 0,
            last_processed_height: 0,
            last_committed_height: 0,
        }
    }

    /// `last_voted <= last_processed <= last_committed`
    pub fn heights_consistent(&self) -> bool {
        self.last_voted_height <= self.last_processed_height
            && self.last_processed_height <= self.last_committed_height
    }

    pub fn consensus_pk_hex(&self) -> String {
        hex::encode(self.consensus_pk.serialize())
    }
}

/// A block on the consensus chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    #[serde(with = "hex::serde")]
    pub hash: Vec<u8>,
}
