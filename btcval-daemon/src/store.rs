//! Durable storage of validator records.
//!
//! Records are written whole; the last write for a key wins. The file store
//! keeps every record in one JSON document keyed by BTC public key and
//! rewrites it through a temp file so a crash never leaves a torn document.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use btcval_eots::Bip340PubKey;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::StoredValidator;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validator {0} already stored")]
    AlreadyExists(Bip340PubKey),

    #[error("validator {0} not stored")]
    NotFound(Bip340PubKey),

    #[error("failed to persist validator store: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse validator store: {0}")]
    Parse(#[from] serde_json::Error),
}

pub trait ValidatorStore: Send + Sync {
    /// Insert a new record. Fails if the BTC key is already stored.
    fn create(&self, record: &StoredValidator) -> Result<(), StoreError>;

    /// Overwrite an existing record.
    fn update(&self, record: &StoredValidator) -> Result<(), StoreError>;

    fn get(&self, btc_pk: &Bip340PubKey) -> Result<StoredValidator, StoreError>;

    fn list(&self) -> Result<Vec<StoredValidator>, StoreError>;
}

pub struct FileValidatorStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, StoredValidator>>,
}

impl FileValidatorStore {
    /// Open the store at `path`, loading it if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            info!("Loading validator store from {:?}", path);
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            info!("Creating new validator store at {:?}", path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            BTreeMap::new()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &BTreeMap<String, StoredValidator>) -> Result<(), StoreError> {
        let temp_path = self.path.with_extension("tmp");
        {
            let writer = BufWriter::new(File::create(&temp_path)?);
            serde_json::to_writer_pretty(writer, records)?;
        }
        File::open(&temp_path)?.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        debug!("Persisted {} validator record(s)", records.len());
        Ok(())
    }
}

impl ValidatorStore for FileValidatorStore {
    fn create(&self, record: &StoredValidator) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let key = record.btc_pk.to_hex();
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(record.btc_pk));
        }

        let mut next = records.clone();
        next.insert(key, record.clone());
        self.persist(&next)?;
        *records = next;
        Ok(())
    }

    fn update(&self, record: &StoredValidator) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let key = record.btc_pk.to_hex();
        if !records.contains_key(&key) {
            return Err(StoreError::NotFound(record.btc_pk));
        }

        let mut next = records.clone();
        next.insert(key, record.clone());
        self.persist(&next)?;
        *records = next;
        Ok(())
    }

    fn get(&self, btc_pk: &Bip340PubKey) -> Result<StoredValidator, StoreError> {
        self.records
            .lock()
            .get(&btc_pk.to_hex())
            .cloned()
            .ok_or(StoreError::NotFound(*btc_pk))
    }

    fn list(&self) -> Result<Vec<StoredValidator>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
