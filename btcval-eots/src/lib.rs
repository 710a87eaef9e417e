// Copyright (C) 2026 The btcval Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Signing primitives for BTC validators.
//!
//! - [`eots`]: extractable one-time signatures used for finality votes. Two
//!   votes at one height for different blocks reveal the signing key.
//! - [`pop`]: proof of possession submitted at registration.
//! - [`Bip340PubKey`]: the x-only BTC public key identifying a validator.

pub mod eots;
pub mod keys;
pub mod pop;
mod scalar;

pub use eots::{
    compare_extracted, extract, public_randomness, sign, verify, vote_message, EotsSignature,
    KeyMatch, EOTS_SIGNATURE_SIZE,
};
pub use keys::{Bip340PubKey, BIP340_PUBKEY_SIZE};
pub use pop::ProofOfPossession;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EotsError {
    #[error("secp256k1 error: {0}")]
    Secp(#[from] secp256k1::Error),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid {what} length: expected {expected}, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("signature does not verify")]
    InvalidSignature,

    #[error("invalid proof of possession: {0} does not verify")]
    InvalidProofOfPossession(&'static str),

    #[error("signatures cover the same message, nothing to extract")]
    SameMessage,

    #[error("signatures use different nonces, not the same height")]
    NonceMismatch,

    #[error("nonce derivation produced zero")]
    DegenerateNonce,

    #[error("challenges collide, key cannot be extracted")]
    DegenerateChallenge,
}
