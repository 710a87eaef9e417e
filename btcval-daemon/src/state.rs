//! Lock-protected live copy of a validator record.
//!
//! Every setter runs lock, validate, mutate, snapshot, unlock, then writes the
//! snapshot to the durable store outside the lock. A failed write is returned
//! to the caller while the in-memory record keeps the new value; the next
//! successful write carries it to disk.

use std::sync::Arc;

use btcval_eots::Bip340PubKey;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ValidatorError;
use crate::store::ValidatorStore;
use crate::types::{StoredValidator, ValidatorStatus};

pub struct ValState {
    btc_pk: Bip340PubKey,
    record: Mutex<StoredValidator>,
    store: Arc<dyn ValidatorStore>,
}

impl ValState {
    pub fn new(record: StoredValidator, store: Arc<dyn ValidatorStore>) -> Self {
        Self {
            btc_pk: record.btc_pk,
            record: Mutex::new(record),
            store,
        }
    }

    pub fn btc_pk(&self) -> Bip340PubKey {
        self.btc_pk
    }

    /// Point-in-time copy of the record.
    pub fn record(&self) -> StoredValidator {
        self.record.lock().clone()
    }

    pub fn status(&self) -> ValidatorStatus {
        self.record.lock().status
    }

    pub fn set_status(&self, status: ValidatorStatus) -> Result<(), ValidatorError> {
        let btc_pk = self.btc_pk;
        self.apply(|record| {
            if !record.status.can_transition_to(status) {
                return Err(ValidatorError::InvalidTransition {
                    btc_pk,
                    from: record.status,
                    to: status,
                });
            }
            record.status = status;
            Ok(())
        })
    }

    pub fn set_last_committed_height(&self, height: u64) -> Result<(), ValidatorError> {
        let btc_pk = self.btc_pk;
        self.apply(|record| {
            if height < record.last_committed_height {
                return Err(ValidatorError::HeightInvariant {
                    btc_pk,
                    reason: format!(
                        "committed height would regress from {} to {}",
                        record.last_committed_height, height
                    ),
                });
            }
            record.last_committed_height = height;
            Ok(())
        })
    }

    pub fn set_last_processed_height(&self, height: u64) -> Result<(), ValidatorError> {
        let btc_pk = self.btc_pk;
        self.apply(|record| {
            if height < record.last_processed_height {
                return Err(ValidatorError::HeightInvariant {
                    btc_pk,
                    reason: format!(
                        "processed height would regress from {} to {}",
                        record.last_processed_height, height
                    ),
                });
            }
            record.last_processed_height = height;
            Ok(())
        })
    }

    /// Record a vote at `height`: voted moves to `height` and processed is
    /// raised to at least `height`.
    pub fn set_last_processed_and_voted_height(&self, height: u64) -> Result<(), ValidatorError> {
        let btc_pk = self.btc_pk;
        self.apply(|record| {
            if height <= record.last_voted_height {
                return Err(ValidatorError::AlreadyVoted {
                    btc_pk,
                    height,
                    last_voted: record.last_voted_height,
                });
            }
            record.last_voted_height = height;
            record.last_processed_height = record.last_processed_height.max(height);
            Ok(())
        })
    }

    fn apply<F>(&self, mutate: F) -> Result<(), ValidatorError>
    where
        F: FnOnce(&mut StoredValidator) -> Result<(), ValidatorError>,
    {
        let snapshot = {
            let mut record = self.record.lock();
            let mut next = record.clone();
            mutate(&mut next)?;
            if !next.heights_consistent() {
                return Err(ValidatorError::HeightInvariant {
                    btc_pk: self.btc_pk,
                    reason: format!(
                        "voted {} <= processed {} <= committed {} does not hold",
                        next.last_voted_height,
                        next.last_processed_height,
                        next.last_committed_height
                    ),
                });
            }
            *record = next;
            record.clone()
        };

        debug!(
            "Validator {} now {} (voted {}, processed {}, committed {})",
            self.btc_pk,
            snapshot.status,
            snapshot.last_voted_height,
            snapshot.last_processed_height,
            snapshot.last_committed_height
        );
        self.store
            .update(&snapshot)
            .map_err(|e| ValidatorError::store(self.btc_pk, e))
    }
}
