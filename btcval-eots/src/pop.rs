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

//! Proof of possession binding a BTC key to a consensus-chain key.
//!
//! The consensus key signs (ECDSA) the hash of the BTC x-only key, then the
//! BTC key signs (BIP-340) the hash of that ECDSA signature. Registration on
//! the consensus chain carries both signatures.

use secp256k1::{ecdsa, schnorr, Keypair, Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Bip340PubKey, EotsError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfPossession {
    /// Compact ECDSA signature by the consensus key
    #[serde(with = "hex::serde")]
    pub consensus_sig: Vec<u8>,
    /// BIP-340 signature by the BTC key
    #[serde(with = "hex::serde")]
    pub btc_sig: Vec<u8>,
}

impl ProofOfPossession {
    pub fn generate(consensus_sk: &SecretKey, btc_sk: &SecretKey) -> Self {
        let btc_pk = Bip340PubKey::from_secret_key(btc_sk);
        let consensus_msg = Message::from_digest(Sha256::digest(btc_pk.serialize()).into());
        let consensus_sig = SECP256K1
            .sign_ecdsa(&consensus_msg, consensus_sk)
            .serialize_compact()
            .to_vec();

        let btc_msg = Message::from_digest(Sha256::digest(&consensus_sig).into());
        let keypair = Keypair::from_secret_key(SECP256K1, btc_sk);
        let btc_sig = SECP256K1.sign_schnorr_no_aux_rand(&btc_msg, &keypair);
        let btc_sig: &[u8] = btc_sig.as_ref();

        Self {
            consensus_sig,
            btc_sig: btc_sig.to_vec(),
        }
    }

    pub fn verify(&self, consensus_pk: &PublicKey, btc_pk: &Bip340PubKey) -> Result<(), EotsError> {
        let consensus_msg = Message::from_digest(Sha256::digest(btc_pk.serialize()).into());
        let consensus_sig = ecdsa::Signature::from_compact(&self.consensus_sig)?;
        SECP256K1
            .verify_ecdsa(&consensus_msg, &consensus_sig, consensus_pk)
            .map_err(|_| EotsError::InvalidProofOfPossession("consensus signature"))?;

        let btc_msg = Message::from_digest(Sha256::digest(&self.consensus_sig).into());
        let btc_sig = schnorr::Signature::from_slice(&self.btc_sig)?;
        SECP256K1
            .verify_schnorr(&btc_sig, &btc_msg, btc_pk.x_only())
            .map_err(|_| EotsError::InvalidProofOfPossession("BTC signature"))
    }
}
