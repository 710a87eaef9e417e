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

//! Directory-backed key store.
//!
//! Each key lives in `<dir>/<name>.json`. The secret is encrypted with
//! AES-256-GCM under a key derived from the passphrase with Argon2id; the
//! public key is stored in clear so lookups don't need the passphrase.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, Params};
use parking_lot::Mutex;
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{KeyStore, KeystoreError};

const KEYSTORE_VERSION: u8 = 1;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SECRET_LEN: usize = 32;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedKey {
    version: u8,
    name: String,
    pubkey: PublicKey,
    kdf: KdfParams,
    #[serde(with = "hex::serde")]
    salt: Vec<u8>,
    #[serde(with = "hex::serde")]
    nonce: Vec<u8>,
    #[serde(with = "hex::serde")]
    ciphertext: Vec<u8>,
    created_at: u64,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKey([u8; 32]);

pub struct FileKeyStore {
    dir: PathBuf,
    kdf: KdfParams,
    // serializes get-or-create so two callers can't both generate `name`
    lock: Mutex<()>,
}

impl FileKeyStore {
    pub fn open(dir: impl AsRef<Path>, kdf: KdfParams) -> Result<Self, KeystoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!("Opened key store at {:?}", dir);
        Ok(Self {
            dir,
            kdf,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn load(path: &Path) -> Result<EncryptedKey, KeystoreError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn save(&self, path: &Path, key: &EncryptedKey) -> Result<(), KeystoreError> {
        let temp_path = path.with_extension("tmp");
        {
            let writer = BufWriter::new(File::create(&temp_path)?);
            serde_json::to_writer_pretty(writer, key)?;
        }
        File::open(&temp_path)?.sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn encrypt(
        &self,
        name: &str,
        sk: &SecretKey,
        passphrase: &str,
    ) -> Result<EncryptedKey, KeystoreError> {
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let derived = derive_key(passphrase, &salt, &self.kdf)?;
        let cipher =
            Aes256Gcm::new_from_slice(&derived.0).map_err(|_| KeystoreError::EncryptionFailed)?;

        let mut secret = sk.secret_bytes();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), secret.as_ref())
            .map_err(|_| KeystoreError::EncryptionFailed);
        secret.zeroize();

        Ok(EncryptedKey {
            version: KEYSTORE_VERSION,
            name: name.to_string(),
            pubkey: PublicKey::from_secret_key(SECP256K1, sk),
            kdf: self.kdf,
            salt,
            nonce,
            ciphertext: ciphertext?,
            created_at: current_timestamp(),
        })
    }

    fn decrypt(key: &EncryptedKey, passphrase: &str) -> Result<SecretKey, KeystoreError> {
        if key.version != KEYSTORE_VERSION {
            return Err(KeystoreError::UnsupportedVersion(key.version));
        }
        if key.nonce.len() != NONCE_LEN {
            return Err(KeystoreError::InvalidKeyData);
        }

        let derived = derive_key(passphrase, &key.salt, &key.kdf)?;
        let cipher =
            Aes256Gcm::new_from_slice(&derived.0).map_err(|_| KeystoreError::DecryptionFailed)?;
        let mut secret = cipher
            .decrypt(Nonce::from_slice(&key.nonce), key.ciphertext.as_ref())
            .map_err(|_| KeystoreError::DecryptionFailed)?;

        if secret.len() != SECRET_LEN {
            secret.zeroize();
            return Err(KeystoreError::InvalidKeyData);
        }
        let sk = SecretKey::from_slice(&secret).map_err(|_| KeystoreError::InvalidKeyData);
        secret.zeroize();
        let sk = sk?;

        if PublicKey::from_secret_key(SECP256K1, &sk) != key.pubkey {
            return Err(KeystoreError::InvalidKeyData);
        }
        Ok(sk)
    }

    fn find_by_pubkey(&self, pubkey: &XOnlyPublicKey) -> Result<EncryptedKey, KeystoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let key = Self::load(&path)?;
            if key.pubkey.x_only_public_key().0 == *pubkey {
                return Ok(key);
            }
        }
        Err(KeystoreError::NotFound(hex::encode(pubkey.serialize())))
    }
}

impl KeyStore for FileKeyStore {
    fn get_or_create_key(&self, name: &str, passphrase: &str) -> Result<PublicKey, KeystoreError> {
        validate_name(name)?;
        let _guard = self.lock.lock();

        let path = self.key_path(name);
        if path.exists() {
            let key = Self::load(&path)?;
            debug!("Key {} already exists", name);
            return Ok(key.pubkey);
        }

        let sk = SecretKey::new(&mut rand::thread_rng());
        let key = self.encrypt(name, &sk, passphrase)?;
        self.save(&path, &key)?;
        info!(
            "Created key {}, pubkey: 0x{}",
            name,
            hex::encode(key.pubkey.serialize())
        );
        Ok(key.pubkey)
    }

    fn private_key(
        &self,
        pubkey: &XOnlyPublicKey,
        passphrase: &str,
    ) -> Result<SecretKey, KeystoreError> {
        let key = self.find_by_pubkey(pubkey)?;
        Self::decrypt(&key, passphrase)
    }
}

fn validate_name(name: &str) -> Result<(), KeystoreError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(KeystoreError::InvalidName(name.to_string()))
    }
}

fn derive_key(passphrase: &str, salt: &[u8], kdf: &KdfParams) -> Result<DerivedKey, KeystoreError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|_| KeystoreError::KeyDerivationFailed)?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut output)
        .map_err(|_| KeystoreError::KeyDerivationFailed)?;
    Ok(DerivedKey(output))
}

fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn cheap_kdf() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn create_test_store() -> (FileKeyStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileKeyStore::open(temp_dir.path().join("keys"), cheap_kdf()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (store, _temp) = create_test_store();
        let pk1 = store.get_or_create_key("val-1", "pass").unwrap();
        let pk2 = store.get_or_create_key("val-1", "pass").unwrap();
        assert_eq!(pk1, pk2);

        let other = store.get_or_create_key("val-2", "pass").unwrap();
        assert_ne!(pk1, other);
    }

    #[test]
    fn test_private_key_round_trip() {
        let (store, _temp) = create_test_store();
        let pk = store.get_or_create_key("val-1", "pass").unwrap();
        let sk = store.private_key(&pk.x_only_public_key().0, "pass").unwrap();
        assert_eq!(PublicKey::from_secret_key(SECP256K1, &sk), pk);
    }

    #[test]
    fn test_wrong_passphrase_rejected() {
        let (store, _temp) = create_test_store();
        let pk = store.get_or_create_key("val-1", "pass").unwrap();
        let err = store
            .private_key(&pk.x_only_public_key().0, "not-the-pass")
            .unwrap_err();
        assert!(matches!(err, KeystoreError::DecryptionFailed));
    }

    #[test]
    fn test_unknown_key_not_found() {
        let (store, _temp) = create_test_store();
        store.get_or_create_key("val-1", "pass").unwrap();

        let stranger = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let stranger_pk = stranger.x_only_public_key(SECP256K1).0;
        assert!(matches!(
            store.private_key(&stranger_pk, "pass"),
            Err(KeystoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (store, _temp) = create_test_store();
        for name in ["", "../escape", "has space", ".hidden"] {
            assert!(
                matches!(
                    store.get_or_create_key(name, "pass"),
                    Err(KeystoreError::InvalidName(_))
                ),
                "name {:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_persistence_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("keys");

        let pk = {
            let store = FileKeyStore::open(&dir, cheap_kdf()).unwrap();
            store.get_or_create_key("val-1", "pass").unwrap()
        };

        let store = FileKeyStore::open(&dir, KdfParams::default()).unwrap();
        assert_eq!(store.get_or_create_key("val-1", "pass").unwrap(), pk);
        // params are read back from the file, not from the store config
        assert!(store.private_key(&pk.x_only_public_key().0, "pass").is_ok());
    }

    #[test]
    fn test_concurrent_create_same_name() {
        let (store, _temp) = create_test_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.get_or_create_key("shared", "pass").unwrap())
            })
            .collect();

        let keys: Vec<PublicKey> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }
}
