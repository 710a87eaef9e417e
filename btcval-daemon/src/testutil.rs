//! Shared fixtures for unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use btcval_eots::{Bip340PubKey, ProofOfPossession};
use btcval_keystore::{FileKeyStore, KdfParams, KeyStore};
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use tempfile::TempDir;

use crate::chain::ChainClient;
use crate::config::ValidatorConfig;
use crate::devchain::DevChain;
use crate::instance::ValidatorInstance;
use crate::store::{FileValidatorStore, StoreError, ValidatorStore};
use crate::types::{Commission, StoredValidator, ValidatorStatus};

pub(crate) const PASSPHRASE: &str = "correct horse battery staple";
pub(crate) const CHAIN_ID: &str = "test-chain";

pub(crate) fn cheap_kdf() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}

pub(crate) fn test_record(seed: u8) -> StoredValidator {
    let consensus_sk = SecretKey::from_slice(&[seed; 32]).unwrap();
    let btc_sk = SecretKey::from_slice(&[seed.wrapping_add(100); 32]).unwrap();
    StoredValidator::new(
        format!("validator-{}", seed),
        PublicKey::from_secret_key(SECP256K1, &consensus_sk),
        Bip340PubKey::from_secret_key(&btc_sk),
        ProofOfPossession::generate(&consensus_sk, &btc_sk),
        CHAIN_ID.to_string(),
        b"test validator".to_vec(),
        "0.05".parse::<Commission>().unwrap(),
    )
}

/// Store whose writes can be switched to fail.
pub(crate) struct FlakyStore {
    pub inner: FileValidatorStore,
    pub failing: AtomicBool,
}

impl ValidatorStore for FlakyStore {
    fn create(&self, record: &StoredValidator) -> Result<(), StoreError> {
        self.inner.create(record)
    }

    fn update(&self, record: &StoredValidator) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.update(record)
    }

    fn get(&self, btc_pk: &Bip340PubKey) -> Result<StoredValidator, StoreError> {
        self.inner.get(btc_pk)
    }

    fn list(&self) -> Result<Vec<StoredValidator>, StoreError> {
        self.inner.list()
    }
}

pub(crate) struct TestEnv {
    pub config: ValidatorConfig,
    pub chain: Arc<DevChain>,
    pub store: Arc<FlakyStore>,
    pub eots_keys: Arc<FileKeyStore>,
    pub consensus_keys: Arc<FileKeyStore>,
    temp_dir: TempDir,
}

impl TestEnv {
    pub fn new(config: ValidatorConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let store = FlakyStore {
            inner: FileValidatorStore::open(temp_dir.path().join("validators.json")).unwrap(),
            failing: AtomicBool::new(false),
        };
        let eots_keys = FileKeyStore::open(temp_dir.path().join("keys/eots"), cheap_kdf()).unwrap();
        let consensus_keys =
            FileKeyStore::open(temp_dir.path().join("keys/consensus"), cheap_kdf()).unwrap();

        Self {
            config,
            chain: Arc::new(DevChain::new(CHAIN_ID)),
            store: Arc::new(store),
            eots_keys: Arc::new(eots_keys),
            consensus_keys: Arc::new(consensus_keys),
            temp_dir,
        }
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn set_store_failing(&self, failing: bool) {
        self.store.failing.store(failing, Ordering::SeqCst);
    }

    pub fn eots_key(&self, btc_pk: &Bip340PubKey) -> SecretKey {
        self.eots_keys.private_key(btc_pk.x_only(), PASSPHRASE).unwrap()
    }

    /// A stored validator in `Created` state with keys in both key stores.
    pub fn created_instance(&self, name: &str) -> Arc<ValidatorInstance> {
        let btc_pk = Bip340PubKey::from(self.eots_keys.get_or_create_key(name, PASSPHRASE).unwrap());
        let consensus_pk = self.consensus_keys.get_or_create_key(name, PASSPHRASE).unwrap();
        let consensus_sk = self
            .consensus_keys
            .private_key(&consensus_pk.x_only_public_key().0, PASSPHRASE)
            .unwrap();

        let record = StoredValidator::new(
            name.to_string(),
            consensus_pk,
            btc_pk,
            ProofOfPossession::generate(&consensus_sk, &self.eots_key(&btc_pk)),
            CHAIN_ID.to_string(),
            Vec::new(),
            Commission::zero(),
        );
        self.store.create(&record).unwrap();

        Arc::new(ValidatorInstance::new(
            record,
            self.config.clone(),
            self.store.clone(),
            self.chain.clone(),
            self.eots_keys.clone(),
        ))
    }
}

/// A validator registered on the test chain, not yet started.
pub(crate) fn registered_instance(env: &TestEnv, name: &str) -> Arc<ValidatorInstance> {
    let instance = env.created_instance(name);
    let record = instance.record();
    env.chain
        .submit_registration(
            CHAIN_ID,
            &record.consensus_pk,
            &record.btc_pk,
            &record.pop,
            &record.description,
            record.commission,
        )
        .unwrap();
    instance.state().set_status(ValidatorStatus::Registered).unwrap();
    instance
}
