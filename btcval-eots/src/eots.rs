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

//! Extractable one-time signatures over finality votes.
//!
//! A vote signature is a BIP-340 Schnorr signature `(R.x, s)` whose nonce is
//! derived deterministically from the signer's secret, the chain ID and the
//! block height. Every vote at a given height therefore reuses the same `R`:
//!
//! ```text
//! s1 = k + e1*d
//! s2 = k + e2*d      =>   d = (s1 - s2) / (e1 - e2)
//! ```
//!
//! so two votes for different blocks at one height hand out `d`, which is the
//! secret key or its negation (BIP-340 signs with the even-Y representative).

use std::fmt;

use k256::Scalar;
use secp256k1::{schnorr, Message, Parity, SecretKey, XOnlyPublicKey, SECP256K1};
use sha2::{Digest, Sha256};

use crate::scalar;
use crate::{Bip340PubKey, EotsError};

/// Length of a serialized EOTS signature (`R.x || s`).
pub const EOTS_SIGNATURE_SIZE: usize = 64;

const NONCE_TAG: &[u8] = b"btcval/eots-nonce";
const CHALLENGE_TAG: &[u8] = b"BIP0340/challenge";

/// A finality vote signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EotsSignature([u8; EOTS_SIGNATURE_SIZE]);

impl EotsSignature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EotsError> {
        let arr: [u8; EOTS_SIGNATURE_SIZE] =
            bytes.try_into().map_err(|_| EotsError::InvalidLength {
                what: "EOTS signature",
                expected: EOTS_SIGNATURE_SIZE,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, EotsError> {
        let bytes = hex::decode(s).map_err(|e| EotsError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; EOTS_SIGNATURE_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// x-coordinate of the public nonce `R`.
    pub fn r_bytes(&self) -> [u8; 32] {
        let mut r = [0u8; 32];
        r.copy_from_slice(&self.0[..32]);
        r
    }

    pub fn s_bytes(&self) -> [u8; 32] {
        let mut s = [0u8; 32];
        s.copy_from_slice(&self.0[32..]);
        s
    }
}

impl fmt::Debug for EotsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EotsSignature({})", self.to_hex())
    }
}

/// The message a validator signs when voting for `block_hash` at `height`.
pub fn vote_message(height: u64, block_hash: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(height.to_be_bytes());
    hasher.update(block_hash);
    hasher.finalize().into()
}

/// Public randomness (`R`) the signer commits to for `height`.
pub fn public_randomness(
    sk: &SecretKey,
    chain_id: &[u8],
    height: u64,
) -> Result<XOnlyPublicKey, EotsError> {
    let k = nonce(sk, chain_id, height)?;
    Ok(k.x_only_public_key(SECP256K1).0)
}

/// Sign `msg` as the vote for `height`.
pub fn sign(
    sk: &SecretKey,
    chain_id: &[u8],
    height: u64,
    msg: &[u8; 32],
) -> Result<EotsSignature, EotsError> {
    let (pk, parity) = sk.x_only_public_key(SECP256K1);
    let d = match parity {
        Parity::Even => *sk,
        Parity::Odd => sk.negate(),
    };

    let k = nonce(sk, chain_id, height)?;
    let (r, r_parity) = k.x_only_public_key(SECP256K1);
    let k = match r_parity {
        Parity::Even => k,
        Parity::Odd => k.negate(),
    };

    let r_bytes = r.serialize();
    let e = challenge(&r_bytes, &pk.serialize(), msg);
    let s = scalar::from_secret(&k) + e * scalar::from_secret(&d);

    let mut sig = [0u8; EOTS_SIGNATURE_SIZE];
    sig[..32].copy_from_slice(&r_bytes);
    sig[32..].copy_from_slice(&scalar::to_bytes(&s));
    Ok(EotsSignature(sig))
}

/// Verify a vote signature. EOTS signatures are plain BIP-340 signatures.
pub fn verify(pk: &Bip340PubKey, msg: &[u8; 32], sig: &EotsSignature) -> Result<(), EotsError> {
    let schnorr_sig = schnorr::Signature::from_slice(&sig.0)?;
    SECP256K1
        .verify_schnorr(&schnorr_sig, &Message::from_digest(*msg), pk.x_only())
        .map_err(|_| EotsError::InvalidSignature)
}

/// Recover the signing key from two votes at the same height.
///
/// Both signatures must verify under `pk`, share the same nonce and cover
/// different messages. The result is the secret key or its negation.
pub fn extract(
    pk: &Bip340PubKey,
    msg1: &[u8; 32],
    sig1: &EotsSignature,
    msg2: &[u8; 32],
    sig2: &EotsSignature,
) -> Result<SecretKey, EotsError> {
    if msg1 == msg2 {
        return Err(EotsError::SameMessage);
    }
    if sig1.r_bytes() != sig2.r_bytes() {
        return Err(EotsError::NonceMismatch);
    }
    verify(pk, msg1, sig1)?;
    verify(pk, msg2, sig2)?;

    let r = sig1.r_bytes();
    let pk_bytes = pk.serialize();
    let e1 = challenge(&r, &pk_bytes, msg1);
    let e2 = challenge(&r, &pk_bytes, msg2);

    let s1 = scalar::reduce(sig1.s_bytes());
    let s2 = scalar::reduce(sig2.s_bytes());

    let denom: Option<Scalar> = (e1 - e2).invert().into();
    let denom = denom.ok_or(EotsError::DegenerateChallenge)?;
    scalar::to_secret(&((s1 - s2) * denom)).ok_or(EotsError::DegenerateChallenge)
}

/// How an extracted key relates to a locally held key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    Exact,
    Negated,
    Mismatch,
}

pub fn compare_extracted(extracted: &SecretKey, local: &SecretKey) -> KeyMatch {
    if extracted.secret_bytes() == local.secret_bytes() {
        KeyMatch::Exact
    } else if extracted.secret_bytes() == local.negate().secret_bytes() {
        KeyMatch::Negated
    } else {
        KeyMatch::Mismatch
    }
}

fn nonce(sk: &SecretKey, chain_id: &[u8], height: u64) -> Result<SecretKey, EotsError> {
    let digest = tagged_hash(
        NONCE_TAG,
        &[
            &sk.secret_bytes(),
            &(chain_id.len() as u64).to_be_bytes(),
            chain_id,
            &height.to_be_bytes(),
        ],
    );
    scalar::to_secret(&scalar::reduce(digest)).ok_or(EotsError::DegenerateNonce)
}

fn challenge(r: &[u8; 32], pk: &[u8; 32], msg: &[u8; 32]) -> Scalar {
    scalar::reduce(tagged_hash(CHALLENGE_TAG, &[r, pk, msg]))
}

fn tagged_hash(tag: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag);
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const CHAIN_ID: &[u8] = b"chain-test";

    fn random_secret() -> SecretKey {
        SecretKey::new(&mut rand::thread_rng())
    }

    fn block_hash(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn test_signature_verifies_as_bip340() {
        let sk = random_secret();
        let pk = Bip340PubKey::from_secret_key(&sk);
        let msg = vote_message(10, &block_hash(1));

        let sig = sign(&sk, CHAIN_ID, 10, &msg).unwrap();
        assert!(verify(&pk, &msg, &sig).is_ok());

        let other = vote_message(10, &block_hash(2));
        assert!(matches!(
            verify(&pk, &other, &sig),
            Err(EotsError::InvalidSignature)
        ));
    }

    #[test]
    fn test_signing_is_deterministic_per_height() {
        let sk = random_secret();
        let msg = vote_message(7, &block_hash(3));
        assert_eq!(
            sign(&sk, CHAIN_ID, 7, &msg).unwrap(),
            sign(&sk, CHAIN_ID, 7, &msg).unwrap()
        );
    }

    #[test]
    fn test_nonce_shared_within_height_only() {
        let sk = random_secret();
        let a = sign(&sk, CHAIN_ID, 5, &vote_message(5, &block_hash(1))).unwrap();
        let b = sign(&sk, CHAIN_ID, 5, &vote_message(5, &block_hash(2))).unwrap();
        let c = sign(&sk, CHAIN_ID, 6, &vote_message(6, &block_hash(1))).unwrap();
        let d = sign(&sk, b"other-chain", 5, &vote_message(5, &block_hash(1))).unwrap();

        assert_eq!(a.r_bytes(), b.r_bytes());
        assert_ne!(a.r_bytes(), c.r_bytes());
        assert_ne!(a.r_bytes(), d.r_bytes());
        assert_eq!(
            a.r_bytes(),
            public_randomness(&sk, CHAIN_ID, 5).unwrap().serialize()
        );
    }

    #[test]
    fn test_extract_recovers_key_or_negation() {
        for _ in 0..8 {
            let sk = random_secret();
            let pk = Bip340PubKey::from_secret_key(&sk);
            let height = rand::thread_rng().gen_range(1..1_000_000u64);

            let m1 = vote_message(height, &block_hash(0xaa));
            let m2 = vote_message(height, &block_hash(0xbb));
            let s1 = sign(&sk, CHAIN_ID, height, &m1).unwrap();
            let s2 = sign(&sk, CHAIN_ID, height, &m2).unwrap();

            let extracted = extract(&pk, &m1, &s1, &m2, &s2).unwrap();
            assert_ne!(compare_extracted(&extracted, &sk), KeyMatch::Mismatch);
            assert_eq!(Bip340PubKey::from_secret_key(&extracted), pk);
        }
    }

    #[test]
    fn test_extract_is_symmetric() {
        let sk = random_secret();
        let pk = Bip340PubKey::from_secret_key(&sk);
        let m1 = vote_message(3, &block_hash(1));
        let m2 = vote_message(3, &block_hash(2));
        let s1 = sign(&sk, CHAIN_ID, 3, &m1).unwrap();
        let s2 = sign(&sk, CHAIN_ID, 3, &m2).unwrap();

        assert_eq!(
            extract(&pk, &m1, &s1, &m2, &s2).unwrap(),
            extract(&pk, &m2, &s2, &m1, &s1).unwrap()
        );
    }

    #[test]
    fn test_extract_same_message_leaks_nothing() {
        let sk = random_secret();
        let pk = Bip340PubKey::from_secret_key(&sk);
        let m = vote_message(9, &block_hash(4));
        let s = sign(&sk, CHAIN_ID, 9, &m).unwrap();

        assert!(matches!(
            extract(&pk, &m, &s, &m, &s),
            Err(EotsError::SameMessage)
        ));
    }

    #[test]
    fn test_extract_rejects_different_heights() {
        let sk = random_secret();
        let pk = Bip340PubKey::from_secret_key(&sk);
        let m1 = vote_message(1, &block_hash(1));
        let m2 = vote_message(2, &block_hash(2));
        let s1 = sign(&sk, CHAIN_ID, 1, &m1).unwrap();
        let s2 = sign(&sk, CHAIN_ID, 2, &m2).unwrap();

        assert!(matches!(
            extract(&pk, &m1, &s1, &m2, &s2),
            Err(EotsError::NonceMismatch)
        ));
    }

    #[test]
    fn test_extract_rejects_forged_signature() {
        let sk = random_secret();
        let pk = Bip340PubKey::from_secret_key(&sk);
        let m1 = vote_message(4, &block_hash(1));
        let m2 = vote_message(4, &block_hash(2));
        let s1 = sign(&sk, CHAIN_ID, 4, &m1).unwrap();

        let mut forged = s1.to_bytes();
        forged[63] ^= 1;
        let forged = EotsSignature::from_slice(&forged).unwrap();

        assert!(extract(&pk, &m1, &s1, &m2, &forged).is_err());
    }

    #[test]
    fn test_compare_extracted() {
        let sk = random_secret();
        assert_eq!(compare_extracted(&sk, &sk), KeyMatch::Exact);
        assert_eq!(compare_extracted(&sk.negate(), &sk), KeyMatch::Negated);
        assert_eq!(
            compare_extracted(&random_secret(), &sk),
            KeyMatch::Mismatch
        );
    }

    #[test]
    fn test_signature_hex_round_trip() {
        let sk = random_secret();
        let sig = sign(&sk, CHAIN_ID, 1, &vote_message(1, &block_hash(1))).unwrap();
        assert_eq!(EotsSignature::from_hex(&sig.to_hex()).unwrap(), sig);
        assert!(EotsSignature::from_slice(&[0u8; 10]).is_err());
    }
}
