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

//! Key storage for validator keys.
//!
//! The daemon keeps two stores: one for EOTS (BTC) keys and one for
//! consensus-chain keys. Both hold plain secp256k1 secrets, looked up by name
//! on creation and by x-only public key afterwards.
//!
//! ## Usage
//!
//! ```ignore
//! use btcval_keystore::{FileKeyStore, KdfParams, KeyStore};
//!
//! let store = FileKeyStore::open("/var/lib/btcval/keys/eots", KdfParams::default())?;
//! let pk = store.get_or_create_key("my-validator", "passphrase")?;
//! let sk = store.private_key(&pk.x_only_public_key().0, "passphrase")?;
//! ```

mod file;

pub use file::{FileKeyStore, KdfParams};

use secp256k1::{PublicKey, SecretKey, XOnlyPublicKey};

/// Storage of passphrase-protected secp256k1 keys.
pub trait KeyStore: Send + Sync {
    /// Return the public key stored under `name`, generating and storing a
    /// fresh key first if none exists.
    fn get_or_create_key(&self, name: &str, passphrase: &str) -> Result<PublicKey, KeystoreError>;

    /// Decrypt the secret key whose x-only public key is `pubkey`.
    fn private_key(
        &self,
        pubkey: &XOnlyPublicKey,
        passphrase: &str,
    ) -> Result<SecretKey, KeystoreError>;
}

/// Errors from key storage.
#[derive(Debug)]
pub enum KeystoreError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    InvalidName(String),
    NotFound(String),
    KeyDerivationFailed,
    EncryptionFailed,
    /// Wrong passphrase or corrupted file
    DecryptionFailed,
    UnsupportedVersion(u8),
    InvalidKeyData,
}

impl std::fmt::Display for KeystoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeystoreError::Io(e) => write!(f, "IO error: {}", e),
            KeystoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            KeystoreError::InvalidName(name) => write!(f, "Invalid key name: {:?}", name),
            KeystoreError::NotFound(key) => write!(f, "Key not found: {}", key),
            KeystoreError::KeyDerivationFailed => write!(f, "Failed to derive encryption key"),
            KeystoreError::EncryptionFailed => write!(f, "Failed to encrypt private key"),
            KeystoreError::DecryptionFailed => {
                write!(f, "Failed to decrypt (wrong passphrase or corrupted data)")
            }
            KeystoreError::UnsupportedVersion(v) => write!(f, "Unsupported keystore version: {}", v),
            KeystoreError::InvalidKeyData => write!(f, "Invalid key data after decryption"),
        }
    }
}

impl std::error::Error for KeystoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeystoreError::Io(e) => Some(e),
            KeystoreError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeystoreError {
    fn from(e: std::io::Error) -> Self {
        KeystoreError::Io(e)
    }
}

impl From<serde_json::Error> for KeystoreError {
    fn from(e: serde_json::Error) -> Self {
        KeystoreError::Serialization(e)
    }
}
