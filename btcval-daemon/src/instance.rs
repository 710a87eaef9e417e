//! A single running validator.
//!
//! Each instance owns its [`ValState`] and, once started, a polling thread
//! that follows the chain's committed height and votes on every new block in
//! ascending order. Votes, whether from the loop or from an operator, are
//! serialized by the instance's vote lock.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use btcval_eots::{self as eots, Bip340PubKey, EotsSignature, KeyMatch};
use btcval_keystore::KeyStore;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use secp256k1::{PublicKey, SecretKey};
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, ChainError, TxResponse};
use crate::config::ValidatorConfig;
use crate::error::ValidatorError;
use crate::state::ValState;
use crate::store::ValidatorStore;
use crate::types::{BlockInfo, StoredValidator, ValidatorStatus};

/// Key recovered from two votes at one height.
#[derive(Debug, Clone, Copy)]
pub struct ExtractedKey {
    pub extracted: SecretKey,
    /// The validator's own key
    pub local: SecretKey,
    pub matched: KeyMatch,
}

struct PollLoop {
    // dropping the sender tells the loop to exit
    quit: Sender<()>,
    handle: JoinHandle<()>,
}

enum PollOutcome {
    Continue,
    Quit,
    Slashed,
}

pub struct ValidatorInstance {
    btc_pk: Bip340PubKey,
    state: ValState,
    config: ValidatorConfig,
    chain: Arc<dyn ChainClient>,
    eots_keys: Arc<dyn KeyStore>,
    signing_key: Mutex<Option<SecretKey>>,
    vote_lock: Mutex<()>,
    runner: Mutex<Option<PollLoop>>,
}

impl ValidatorInstance {
    pub fn new(
        record: StoredValidator,
        config: ValidatorConfig,
        store: Arc<dyn ValidatorStore>,
        chain: Arc<dyn ChainClient>,
        eots_keys: Arc<dyn KeyStore>,
    ) -> Self {
        Self {
            btc_pk: record.btc_pk,
            state: ValState::new(record, store),
            config,
            chain,
            eots_keys,
            signing_key: Mutex::new(None),
            vote_lock: Mutex::new(()),
            runner: Mutex::new(None),
        }
    }

    pub fn btc_pk(&self) -> Bip340PubKey {
        self.btc_pk
    }

    pub fn consensus_pk(&self) -> PublicKey {
        self.state.record().consensus_pk
    }

    pub fn chain_id(&self) -> String {
        self.state.record().chain_id
    }

    pub fn status(&self) -> ValidatorStatus {
        self.state.status()
    }

    pub fn last_voted_height(&self) -> u64 {
        self.state.record().last_voted_height
    }

    pub fn last_processed_height(&self) -> u64 {
        self.state.record().last_processed_height
    }

    pub fn last_committed_height(&self) -> u64 {
        self.state.record().last_committed_height
    }

    pub fn record(&self) -> StoredValidator {
        self.state.record()
    }

    pub fn state(&self) -> &ValState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .map(|runner| !runner.handle.is_finished())
            .unwrap_or(false)
    }

    /// Unlock the EOTS key, mark the validator active and spawn its polling
    /// loop. Starting a running validator is a no-op.
    pub fn start(self: &Arc<Self>, passphrase: &str) -> Result<(), ValidatorError> {
        let mut runner = self.runner.lock();
        if let Some(running) = runner.as_ref() {
            if !running.handle.is_finished() {
                debug!("Validator {} already running", self.btc_pk);
                return Ok(());
            }
        }

        match self.status() {
            ValidatorStatus::Slashed => return Err(ValidatorError::Slashed(self.btc_pk)),
            ValidatorStatus::Created => {
                return Err(ValidatorError::InvalidTransition {
                    btc_pk: self.btc_pk,
                    from: ValidatorStatus::Created,
                    to: ValidatorStatus::Active,
                })
            }
            _ => {}
        }

        let sk = self
            .eots_keys
            .private_key(self.btc_pk.x_only(), passphrase)
            .map_err(|e| ValidatorError::keystore(format!("unlock EOTS key {}", self.btc_pk), e))?;

        self.state.set_status(ValidatorStatus::Active)?;
        *self.signing_key.lock() = Some(sk);

        let (quit_tx, quit_rx) = bounded::<()>(0);
        let instance = Arc::clone(self);
        let handle = match thread::Builder::new()
            .name(format!("poll-{}", &self.btc_pk.to_hex()[..8]))
            .spawn(move || instance.run_poll_loop(quit_rx))
        {
            Ok(handle) => handle,
            Err(e) => {
                *self.signing_key.lock() = None;
                return Err(ValidatorError::Spawn(e));
            }
        };

        *runner = Some(PollLoop {
            quit: quit_tx,
            handle,
        });
        info!("Validator {} started", self.btc_pk);
        Ok(())
    }

    /// Stop the polling loop and forget the unlocked key.
    pub fn stop(&self) {
        let runner = self.runner.lock().take();
        if let Some(PollLoop { quit, handle }) = runner {
            drop(quit);
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Polling thread of validator {} panicked", self.btc_pk);
            }
            info!("Validator {} stopped", self.btc_pk);
        }
        *self.signing_key.lock() = None;
    }

    /// Sign and submit the vote for `block`, then advance voted and processed
    /// heights together. Counters move only once the chain accepts the vote.
    ///
    /// A chain that reports the validator as slashed moves it to `Slashed`.
    pub fn submit_finality_vote(&self, block: &BlockInfo) -> Result<TxResponse, ValidatorError> {
        let _vote = self.vote_lock.lock();

        let record = self.state.record();
        if record.status == ValidatorStatus::Slashed {
            return Err(ValidatorError::Slashed(self.btc_pk));
        }
        if block.height <= record.last_voted_height {
            return Err(ValidatorError::AlreadyVoted {
                btc_pk: self.btc_pk,
                height: block.height,
                last_voted: record.last_voted_height,
            });
        }
        if block.height > record.last_committed_height {
            return Err(ValidatorError::HeightNotCommitted {
                btc_pk: self.btc_pk,
                height: block.height,
                committed: record.last_committed_height,
            });
        }

        let sk = self.signing_key()?;
        let sig = sign_vote(&sk, &record.chain_id, block)?;
        let res = self.submit_vote(&record.chain_id, block, &sig)?;

        self.state.set_last_processed_and_voted_height(block.height)?;
        debug!(
            "Validator {} voted at height {} (tx {})",
            self.btc_pk, block.height, res.tx_hash
        );
        Ok(res)
    }

    /// Extract the signing key from `sig`, a vote for `block_hash` at
    /// `height`, paired with this validator's conflicting vote at that height.
    ///
    /// The conflicting vote is the one the chain recorded for a different
    /// block; without one, the validator's own vote on the canonical block is
    /// recomputed. Extraction yields the key or its negation. Anything else is
    /// reported as [`ValidatorError::ExtractionMismatch`].
    pub fn check_and_extract(
        &self,
        height: u64,
        block_hash: &[u8],
        sig: &EotsSignature,
    ) -> Result<ExtractedKey, ValidatorError> {
        let sk = self.signing_key()?;
        self.extract_with_key(&sk, &self.chain_id(), height, block_hash, sig)
    }

    /// Sign and submit a vote for an arbitrary block.
    ///
    /// A vote at a fresh height advances the counters like a normal vote.
    /// Once the chain holds slashing evidence the validator is marked
    /// `Slashed` and its loop stopped, whether or not the key could be
    /// extracted locally.
    pub fn test_submit_finality_signature_and_extract(
        &self,
        block: &BlockInfo,
    ) -> Result<(TxResponse, Option<ExtractedKey>), ValidatorError> {
        let result = {
            let _vote = self.vote_lock.lock();
            self.submit_and_extract(block)
        };

        if self.status() == ValidatorStatus::Slashed {
            self.stop();
        }
        result
    }

    fn submit_and_extract(
        &self,
        block: &BlockInfo,
    ) -> Result<(TxResponse, Option<ExtractedKey>), ValidatorError> {
        let record = self.state.record();
        if record.status == ValidatorStatus::Slashed {
            return Err(ValidatorError::Slashed(self.btc_pk));
        }

        let sk = self.signing_key()?;
        let sig = sign_vote(&sk, &record.chain_id, block)?;
        let res = self.submit_vote(&record.chain_id, block, &sig)?;

        let slashed = self
            .chain
            .query_slashed(&self.btc_pk)
            .map_err(|e| ValidatorError::chain("query slashing", self.btc_pk, e))?;
        if !slashed {
            if block.height > record.last_voted_height {
                if block.height > record.last_committed_height {
                    self.state.set_last_committed_height(block.height)?;
                }
                self.state.set_last_processed_and_voted_height(block.height)?;
            }
            return Ok((res, None));
        }

        warn!(
            "Validator {} double-signed at height {}",
            self.btc_pk, block.height
        );
        self.mark_slashed()?;
        let key = self.extract_with_key(&sk, &record.chain_id, block.height, &block.hash, &sig)?;
        Ok((res, Some(key)))
    }

    fn submit_vote(
        &self,
        chain_id: &str,
        block: &BlockInfo,
        sig: &EotsSignature,
    ) -> Result<TxResponse, ValidatorError> {
        match self
            .chain
            .submit_finality_vote(chain_id, &self.btc_pk, block.height, &block.hash, sig)
        {
            Ok(res) => Ok(res),
            Err(ChainError::Slashed(_)) => {
                warn!("Chain reports validator {} as slashed", self.btc_pk);
                self.mark_slashed()?;
                Err(ValidatorError::Slashed(self.btc_pk))
            }
            Err(e) => Err(ValidatorError::chain("submit finality vote", self.btc_pk, e)),
        }
    }

    fn extract_with_key(
        &self,
        sk: &SecretKey,
        chain_id: &str,
        height: u64,
        block_hash: &[u8],
        sig: &EotsSignature,
    ) -> Result<ExtractedKey, ValidatorError> {
        let conflicting = self
            .chain
            .finality_votes(chain_id, &self.btc_pk, height)
            .map_err(|e| ValidatorError::chain("query votes", self.btc_pk, e))?
            .into_iter()
            .find(|vote| vote.block_hash != block_hash);
        let (other_hash, other_sig) = match conflicting {
            Some(vote) => (vote.block_hash, vote.sig),
            None => {
                let canonical = self
                    .chain
                    .block_info(chain_id, height)
                    .map_err(|e| ValidatorError::chain("query block", self.btc_pk, e))?;
                let own_sig = sign_vote(sk, chain_id, &canonical)?;
                (canonical.hash, own_sig)
            }
        };

        let extracted = eots::extract(
            &self.btc_pk,
            &eots::vote_message(height, &other_hash),
            &other_sig,
            &eots::vote_message(height, block_hash),
            sig,
        )?;

        match eots::compare_extracted(&extracted, sk) {
            KeyMatch::Mismatch => {
                error!(
                    "Validator {}: key extracted at height {} matches neither the local key nor its negation",
                    self.btc_pk, height
                );
                Err(ValidatorError::ExtractionMismatch {
                    btc_pk: self.btc_pk,
                    extracted: hex::encode(extracted.secret_bytes()),
                })
            }
            matched => Ok(ExtractedKey {
                extracted,
                local: *sk,
                matched,
            }),
        }
    }

    /// Record that the chain slashed this validator.
    fn mark_slashed(&self) -> Result<(), ValidatorError> {
        match self.state.set_status(ValidatorStatus::Slashed) {
            Ok(()) => Ok(()),
            // recorded already by the polling loop or an operator vote
            Err(ValidatorError::InvalidTransition {
                from: ValidatorStatus::Slashed,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn signing_key(&self) -> Result<SecretKey, ValidatorError> {
        self.signing_key
            .lock()
            .as_ref()
            .copied()
            .ok_or(ValidatorError::NotRunning(self.btc_pk))
    }

    fn run_poll_loop(self: Arc<Self>, quit: Receiver<()>) {
        info!(
            "Polling loop started for validator {} every {:?}",
            self.btc_pk,
            self.config.poll_interval()
        );

        let stopped = loop {
            match self.poll_once(&quit) {
                Ok(PollOutcome::Continue) => {}
                Ok(PollOutcome::Quit) => break true,
                Ok(PollOutcome::Slashed) => {
                    error!(
                        "Validator {} has been slashed on chain, polling halted",
                        self.btc_pk
                    );
                    break false;
                }
                Err(e) if !e.is_fatal() => {
                    warn!("Validator {}: {}, retrying next poll", self.btc_pk, e);
                }
                Err(e) => {
                    self.halt(&e);
                    break false;
                }
            }

            match quit.recv_timeout(self.config.poll_interval()) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break true,
            }
        };

        // stop() owns the cleanup when it ended the loop
        if !stopped {
            self.release();
        }
        info!("Polling loop exited for validator {}", self.btc_pk);
    }

    fn poll_once(&self, quit: &Receiver<()>) -> Result<PollOutcome, ValidatorError> {
        let record = self.state.record();
        if record.status == ValidatorStatus::Slashed {
            return Ok(PollOutcome::Slashed);
        }

        let committed = self
            .chain
            .latest_committed_height(&record.chain_id)
            .map_err(|e| ValidatorError::chain("query committed height", self.btc_pk, e))?;
        if committed > record.last_committed_height {
            self.state.set_last_committed_height(committed)?;
        }

        let slashed = self
            .chain
            .query_slashed(&self.btc_pk)
            .map_err(|e| ValidatorError::chain("query slashing", self.btc_pk, e))?;
        if slashed {
            self.mark_slashed()?;
            return Ok(PollOutcome::Slashed);
        }

        if let Some(start) = self.config.scanning_start_height() {
            let skip_to = start.saturating_sub(1).min(committed);
            if self.state.record().last_processed_height < skip_to {
                info!(
                    "Validator {} skipping to height {} before voting",
                    self.btc_pk, start
                );
                self.state.set_last_processed_height(skip_to)?;
            }
        }

        let from = self.state.record().last_processed_height + 1;
        for height in from..=committed {
            match quit.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Disconnected) => return Ok(PollOutcome::Quit),
            }

            let block = self
                .chain
                .block_info(&record.chain_id, height)
                .map_err(|e| ValidatorError::chain("query block", self.btc_pk, e))?;
            match self.submit_finality_vote(&block) {
                Ok(_) => {}
                Err(ValidatorError::AlreadyVoted { .. }) => {
                    debug!("Validator {} already voted at height {}", self.btc_pk, height);
                }
                Err(ValidatorError::Slashed(_)) => return Ok(PollOutcome::Slashed),
                Err(e) => return Err(e),
            }
        }

        Ok(PollOutcome::Continue)
    }

    fn halt(&self, err: &ValidatorError) {
        error!("Validator {} halted: {}", self.btc_pk, err);
        if self.status() == ValidatorStatus::Slashed {
            return;
        }
        if let Err(e) = self.state.set_status(ValidatorStatus::Inactive) {
            warn!(
                "Validator {}: failed to record inactive status: {}",
                self.btc_pk, e
            );
        }
    }

    /// Forget the unlocked key and the finished loop handle after the loop
    /// ended on its own.
    fn release(&self) {
        let mut runner = self.runner.lock();
        *self.signing_key.lock() = None;
        runner.take();
    }
}

fn sign_vote(sk: &SecretKey, chain_id: &str, block: &BlockInfo) -> Result<EotsSignature, ValidatorError> {
    let msg = eots::vote_message(block.height, &block.hash);
    Ok(eots::sign(sk, chain_id.as_bytes(), block.height, &msg)?)
}
