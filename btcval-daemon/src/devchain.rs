//! In-process consensus chain for local runs and tests.
//!
//! Blocks are empty; each height's hash is derived from the chain ID so every
//! `DevChain` with the same ID agrees on the canonical chain. Votes are
//! verified as EOTS signatures, and a second vote at a height for a different
//! block is turned into slashing evidence by extracting the signer's key.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use btcval_eots::{self as eots, Bip340PubKey, EotsSignature, ProofOfPossession};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, ChainError, FinalityVote, TxResponse};
use crate::types::{BlockInfo, Commission};

const BLOCK_HASH_DOMAIN: &[u8] = b"btcval-devchain";

#[derive(Default)]
struct DevChainState {
    height: u64,
    registered: HashMap<Bip340PubKey, PublicKey>,
    votes: HashMap<(Bip340PubKey, u64), Vec<FinalityVote>>,
    vote_log: Vec<(Bip340PubKey, u64)>,
    evidence: HashMap<Bip340PubKey, SecretKey>,
    failing_votes: u32,
    tx_count: u64,
}

pub struct DevChain {
    chain_id: String,
    state: Mutex<DevChainState>,
}

impl DevChain {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            state: Mutex::new(DevChainState::default()),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// Move the tip to `height`. The tip never goes backwards.
    pub fn set_height(&self, height: u64) {
        let mut state = self.state.lock();
        state.height = state.height.max(height);
    }

    pub fn advance(&self, blocks: u64) -> u64 {
        let mut state = self.state.lock();
        state.height += blocks;
        state.height
    }

    pub fn block_hash(&self, height: u64) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(BLOCK_HASH_DOMAIN);
        hasher.update(self.chain_id.as_bytes());
        hasher.update(height.to_be_bytes());
        hasher.finalize().to_vec()
    }

    pub fn is_registered(&self, btc_pk: &Bip340PubKey) -> bool {
        self.state.lock().registered.contains_key(btc_pk)
    }

    /// Heights voted by `btc_pk`, in submission order.
    pub fn votes_by(&self, btc_pk: &Bip340PubKey) -> Vec<u64> {
        self.state
            .lock()
            .vote_log
            .iter()
            .filter(|(pk, _)| pk == btc_pk)
            .map(|(_, height)| *height)
            .collect()
    }

    /// Key extracted from a double vote by `btc_pk`, if any.
    pub fn slashing_evidence(&self, btc_pk: &Bip340PubKey) -> Option<SecretKey> {
        self.state.lock().evidence.get(btc_pk).copied()
    }

    /// Make the next `count` vote submissions fail with a transient error.
    pub fn fail_next_votes(&self, count: u32) {
        self.state.lock().failing_votes = count;
    }

    /// Produce one block every `interval` until the handle is stopped.
    pub fn spawn_block_producer(
        self: &Arc<Self>,
        interval: Duration,
    ) -> std::io::Result<BlockProducer> {
        let (quit_tx, quit_rx) = bounded::<()>(0);
        let chain = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("devchain-producer".to_string())
            .spawn(move || loop {
                match quit_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let height = chain.advance(1);
                        debug!("Produced block {} on {}", height, chain.chain_id);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(
            "Block producer started for {} ({:?} per block)",
            self.chain_id, interval
        );
        Ok(BlockProducer {
            quit: Some(quit_tx),
            handle: Some(handle),
        })
    }

    fn check_chain(&self, chain_id: &str) -> Result<(), ChainError> {
        if chain_id != self.chain_id {
            return Err(ChainError::UnknownChain(chain_id.to_string()));
        }
        Ok(())
    }

    fn next_tx_hash(&self, state: &mut DevChainState) -> String {
        state.tx_count += 1;
        let mut hasher = Sha256::new();
        hasher.update(self.chain_id.as_bytes());
        hasher.update(state.tx_count.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

impl ChainClient for DevChain {
    fn submit_registration(
        &self,
        chain_id: &str,
        consensus_pk: &PublicKey,
        btc_pk: &Bip340PubKey,
        pop: &ProofOfPossession,
        _description: &[u8],
        _commission: Commission,
    ) -> Result<TxResponse, ChainError> {
        self.check_chain(chain_id)?;
        pop.verify(consensus_pk, btc_pk)
            .map_err(|e| ChainError::Rejected(e.to_string()))?;

        let mut state = self.state.lock();
        if state.registered.contains_key(btc_pk) {
            return Err(ChainError::AlreadyRegistered(*btc_pk));
        }
        state.registered.insert(*btc_pk, *consensus_pk);
        let tx_hash = self.next_tx_hash(&mut state);

        info!("Registered validator {} on {}", btc_pk, self.chain_id);
        Ok(TxResponse { tx_hash })
    }

    fn submit_finality_vote(
        &self,
        chain_id: &str,
        btc_pk: &Bip340PubKey,
        height: u64,
        block_hash: &[u8],
        sig: &EotsSignature,
    ) -> Result<TxResponse, ChainError> {
        self.check_chain(chain_id)?;

        let mut state = self.state.lock();
        if state.failing_votes > 0 {
            state.failing_votes -= 1;
            return Err(ChainError::Rpc("node unavailable".to_string()));
        }
        if !state.registered.contains_key(btc_pk) {
            return Err(ChainError::NotRegistered(*btc_pk));
        }
        if state.evidence.contains_key(btc_pk) {
            return Err(ChainError::Slashed(*btc_pk));
        }
        if height == 0 || height > state.height {
            return Err(ChainError::UnknownBlock {
                chain_id: self.chain_id.clone(),
                height,
            });
        }

        let msg = eots::vote_message(height, block_hash);
        eots::verify(btc_pk, &msg, sig).map_err(|_| ChainError::InvalidSignature)?;

        let cast = state.votes.get(&(*btc_pk, height)).cloned().unwrap_or_default();
        if cast.iter().any(|vote| vote.block_hash == block_hash) {
            debug!("Duplicate vote by {} at height {}", btc_pk, height);
            return Ok(TxResponse {
                tx_hash: self.next_tx_hash(&mut state),
            });
        }

        if let Some(prev) = cast.first() {
            let prev_msg = eots::vote_message(height, &prev.block_hash);
            match eots::extract(btc_pk, &prev_msg, &prev.sig, &msg, sig) {
                Ok(sk) => {
                    warn!(
                        "Double vote by {} at height {}, validator slashed",
                        btc_pk, height
                    );
                    state.evidence.insert(*btc_pk, sk);
                }
                Err(e) => {
                    warn!(
                        "Conflicting vote by {} at height {} without extractable key: {}",
                        btc_pk, height, e
                    );
                    return Err(ChainError::Rejected(e.to_string()));
                }
            }
        }
        state
            .votes
            .entry((*btc_pk, height))
            .or_default()
            .push(FinalityVote {
                block_hash: block_hash.to_vec(),
                sig: *sig,
            });
        state.vote_log.push((*btc_pk, height));

        Ok(TxResponse {
            tx_hash: self.next_tx_hash(&mut state),
        })
    }

    fn latest_committed_height(&self, chain_id: &str) -> Result<u64, ChainError> {
        self.check_chain(chain_id)?;
        Ok(self.height())
    }

    fn block_info(&self, chain_id: &str, height: u64) -> Result<BlockInfo, ChainError> {
        self.check_chain(chain_id)?;
        if height == 0 || height > self.height() {
            return Err(ChainError::UnknownBlock {
                chain_id: self.chain_id.clone(),
                height,
            });
        }
        Ok(BlockInfo {
            height,
            hash: self.block_hash(height),
        })
    }

    fn finality_votes(
        &self,
        chain_id: &str,
        btc_pk: &Bip340PubKey,
        height: u64,
    ) -> Result<Vec<FinalityVote>, ChainError> {
        self.check_chain(chain_id)?;
        Ok(self
            .state
            .lock()
            .votes
            .get(&(*btc_pk, height))
            .cloned()
            .unwrap_or_default())
    }

    fn query_slashed(&self, btc_pk: &Bip340PubKey) -> Result<bool, ChainError> {
        Ok(self.state.lock().evidence.contains_key(btc_pk))
    }
}

/// Handle to a running block producer. Dropping it stops the producer.
pub struct BlockProducer {
    quit: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BlockProducer {
    pub fn stop(&mut self) {
        self.quit.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Block producer thread panicked");
            }
        }
    }
}

impl Drop for BlockProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SECP256K1;

    const CHAIN: &str = "dev-chain";

    fn registered_chain(btc_sk: &SecretKey) -> (DevChain, Bip340PubKey) {
        let chain = DevChain::new(CHAIN);
        let consensus_sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let consensus_pk = PublicKey::from_secret_key(SECP256K1, &consensus_sk);
        let btc_pk = Bip340PubKey::from_secret_key(btc_sk);
        let pop = ProofOfPossession::generate(&consensus_sk, btc_sk);
        chain
            .submit_registration(CHAIN, &consensus_pk, &btc_pk, &pop, b"", Commission::zero())
            .unwrap();
        (chain, btc_pk)
    }

    fn vote(chain: &DevChain, sk: &SecretKey, height: u64, hash: &[u8]) -> Result<TxResponse, ChainError> {
        let btc_pk = Bip340PubKey::from_secret_key(sk);
        let sig = eots::sign(sk, CHAIN.as_bytes(), height, &eots::vote_message(height, hash)).unwrap();
        chain.submit_finality_vote(CHAIN, &btc_pk, height, hash, &sig)
    }

    #[test]
    fn test_block_hashes_are_deterministic() {
        let a = DevChain::new(CHAIN);
        let b = DevChain::new(CHAIN);
        let other = DevChain::new("other");
        assert_eq!(a.block_hash(5), b.block_hash(5));
        assert_ne!(a.block_hash(5), a.block_hash(6));
        assert_ne!(a.block_hash(5), other.block_hash(5));
    }

    #[test]
    fn test_registration_rejects_bad_pop() {
        let chain = DevChain::new(CHAIN);
        let consensus_sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let btc_sk = SecretKey::from_slice(&[8u8; 32]).unwrap();
        let pop = ProofOfPossession::generate(&consensus_sk, &btc_sk);
        let other_btc = Bip340PubKey::from_secret_key(&SecretKey::from_slice(&[9u8; 32]).unwrap());
        let consensus_pk = PublicKey::from_secret_key(SECP256K1, &consensus_sk);

        let result =
            chain.submit_registration(CHAIN, &consensus_pk, &other_btc, &pop, b"", Commission::zero());
        assert!(matches!(result, Err(ChainError::Rejected(_))));
    }

    #[test]
    fn test_duplicate_registration() {
        let btc_sk = SecretKey::from_slice(&[8u8; 32]).unwrap();
        let (chain, btc_pk) = registered_chain(&btc_sk);
        let consensus_sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let consensus_pk = PublicKey::from_secret_key(SECP256K1, &consensus_sk);
        let pop = ProofOfPossession::generate(&consensus_sk, &btc_sk);

        let result =
            chain.submit_registration(CHAIN, &consensus_pk, &btc_pk, &pop, b"", Commission::zero());
        assert_eq!(result, Err(ChainError::AlreadyRegistered(btc_pk)));
    }

    #[test]
    fn test_vote_above_tip_rejected() {
        let btc_sk = SecretKey::from_slice(&[8u8; 32]).unwrap();
        let (chain, _) = registered_chain(&btc_sk);
        chain.set_height(3);

        let hash = chain.block_hash(4);
        assert!(matches!(
            vote(&chain, &btc_sk, 4, &hash),
            Err(ChainError::UnknownBlock { height: 4, .. })
        ));
    }

    #[test]
    fn test_vote_from_unregistered_rejected() {
        let chain = DevChain::new(CHAIN);
        chain.set_height(1);
        let sk = SecretKey::from_slice(&[5u8; 32]).unwrap();
        let hash = chain.block_hash(1);
        assert!(matches!(
            vote(&chain, &sk, 1, &hash),
            Err(ChainError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_double_vote_produces_evidence() {
        let btc_sk = SecretKey::from_slice(&[8u8; 32]).unwrap();
        let (chain, btc_pk) = registered_chain(&btc_sk);
        chain.set_height(10);

        let canonical = chain.block_hash(10);
        vote(&chain, &btc_sk, 10, &canonical).unwrap();
        assert!(!chain.query_slashed(&btc_pk).unwrap());

        vote(&chain, &btc_sk, 10, &[0xab; 32]).unwrap();
        assert!(chain.query_slashed(&btc_pk).unwrap());

        let votes = chain.finality_votes(CHAIN, &btc_pk, 10).unwrap();
        assert_eq!(votes.len(), 2);
        assert_eq!(votes[0].block_hash, canonical);
        assert_eq!(votes[1].block_hash, vec![0xab; 32]);
        assert!(chain.finality_votes(CHAIN, &btc_pk, 9).unwrap().is_empty());

        let evidence = chain.slashing_evidence(&btc_pk).unwrap();
        assert_ne!(
            eots::compare_extracted(&evidence, &btc_sk),
            eots::KeyMatch::Mismatch
        );

        // slashed validators cannot vote again
        let hash = chain.block_hash(9);
        assert_eq!(
            vote(&chain, &btc_sk, 9, &hash),
            Err(ChainError::Slashed(btc_pk))
        );
    }

    #[test]
    fn test_repeated_identical_vote_is_not_slashing() {
        let btc_sk = SecretKey::from_slice(&[8u8; 32]).unwrap();
        let (chain, btc_pk) = registered_chain(&btc_sk);
        chain.set_height(2);

        let hash = chain.block_hash(2);
        vote(&chain, &btc_sk, 2, &hash).unwrap();
        vote(&chain, &btc_sk, 2, &hash).unwrap();
        assert!(!chain.query_slashed(&btc_pk).unwrap());
        assert_eq!(chain.votes_by(&btc_pk), vec![2]);
    }

    #[test]
    fn test_injected_vote_failures() {
        let btc_sk = SecretKey::from_slice(&[8u8; 32]).unwrap();
        let (chain, _) = registered_chain(&btc_sk);
        chain.set_height(1);
        chain.fail_next_votes(1);

        let hash = chain.block_hash(1);
        assert!(matches!(vote(&chain, &btc_sk, 1, &hash), Err(ChainError::Rpc(_))));
        assert!(vote(&chain, &btc_sk, 1, &hash).is_ok());
    }

    #[test]
    fn test_block_producer_advances_and_stops() {
        let chain = Arc::new(DevChain::new(CHAIN));
        let mut producer = chain.spawn_block_producer(Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(100));
        producer.stop();

        let height = chain.height();
        assert!(height > 0);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(chain.height(), height);
    }
}
