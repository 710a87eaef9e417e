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

//! BIP-340 x-only public keys.

use std::fmt;
use std::str::FromStr;

use secp256k1::{PublicKey, SecretKey, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::EotsError;

/// Length of a serialized x-only public key.
pub const BIP340_PUBKEY_SIZE: usize = 32;

/// A validator's BTC public key in BIP-340 (x-only) form.
///
/// The key carries no sign bit: a secret key and its negation map to the same
/// `Bip340PubKey`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bip340PubKey(XOnlyPublicKey);

impl Bip340PubKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EotsError> {
        if bytes.len() != BIP340_PUBKEY_SIZE {
            return Err(EotsError::InvalidLength {
                what: "BIP-340 public key",
                expected: BIP340_PUBKEY_SIZE,
                got: bytes.len(),
            });
        }
        Ok(Self(XOnlyPublicKey::from_slice(bytes)?))
    }

    pub fn from_hex(s: &str) -> Result<Self, EotsError> {
        let bytes = hex::decode(s).map_err(|e| EotsError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn from_secret_key(sk: &SecretKey) -> Self {
        Self(sk.x_only_public_key(SECP256K1).0)
    }

    pub fn serialize(&self) -> [u8; BIP340_PUBKEY_SIZE] {
        self.0.serialize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }

    pub fn x_only(&self) -> &XOnlyPublicKey {
        &self.0
    }
}

impl From<XOnlyPublicKey> for Bip340PubKey {
    fn from(pk: XOnlyPublicKey) -> Self {
        Self(pk)
    }
}

impl From<PublicKey> for Bip340PubKey {
    fn from(pk: PublicKey) -> Self {
        Self(pk.x_only_public_key().0)
    }
}

impl FromStr for Bip340PubKey {
    type Err = EotsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Bip340PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Bip340PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bip340PubKey({})", self.to_hex())
    }
}

impl Serialize for Bip340PubKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Bip340PubKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret() -> SecretKey {
        SecretKey::from_slice(&[127u8; 32]).unwrap()
    }

    #[test]
    fn test_hex_round_trip() {
        let pk = Bip340PubKey::from_secret_key(&test_secret());
        let parsed: Bip340PubKey = pk.to_hex().parse().unwrap();
        assert_eq!(parsed, pk);
    }

    #[test]
    fn test_negated_secret_has_same_key() {
        let sk = test_secret();
        assert_eq!(
            Bip340PubKey::from_secret_key(&sk),
            Bip340PubKey::from_secret_key(&sk.negate())
        );
    }

    #[test]
    fn test_from_full_public_key() {
        let sk = test_secret();
        let full = PublicKey::from_secret_key(SECP256K1, &sk);
        assert_eq!(Bip340PubKey::from(full), Bip340PubKey::from_secret_key(&sk));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            Bip340PubKey::from_hex("zz"),
            Err(EotsError::InvalidHex(_))
        ));
        assert!(matches!(
            Bip340PubKey::from_slice(&[1u8; 33]),
            Err(EotsError::InvalidLength { got: 33, .. })
        ));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let pk = Bip340PubKey::from_secret_key(&test_secret());
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", pk.to_hex()));
        let back: Bip340PubKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }
}
