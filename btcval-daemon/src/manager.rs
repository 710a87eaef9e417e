//! Owner of every validator instance.
//!
//! A single dispatcher thread holds the instance map and serves requests from
//! a bounded mailbox in FIFO order, so creation, registration and start never
//! race each other. Registration finishes in two steps: the chain submission
//! queues a [`ValidatorRegisteredEvent`] that the dispatcher handles before it
//! takes the next request from the mailbox.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use btcval_eots::{Bip340PubKey, ProofOfPossession};
use btcval_keystore::{KeyStore, KeystoreError};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, ChainError, TxResponse};
use crate::config::ValidatorConfig;
use crate::error::ValidatorError;
use crate::instance::ValidatorInstance;
use crate::store::{StoreError, ValidatorStore};
use crate::types::{Commission, StoredValidator, ValidatorStatus};

type Reply<T> = Sender<Result<T, ValidatorError>>;

pub struct CreateValidatorRequest {
    pub key_name: String,
    pub passphrase: String,
    pub chain_id: String,
    pub description: Vec<u8>,
    pub commission: Commission,
}

pub struct RegisterValidatorRequest {
    pub btc_pk: Bip340PubKey,
    /// When set, the validator is started once registered
    pub passphrase: Option<String>,
}

struct ValidatorRegisteredEvent {
    btc_pk: Bip340PubKey,
    tx: TxResponse,
    passphrase: Option<String>,
    reply: Reply<TxResponse>,
}

enum ManagerRequest {
    Create(CreateValidatorRequest, Reply<StoredValidator>),
    Register(RegisterValidatorRequest, Reply<TxResponse>),
    Start {
        btc_pk: Bip340PubKey,
        passphrase: String,
        reply: Reply<()>,
    },
    Get {
        btc_pk: Bip340PubKey,
        reply: Reply<Arc<ValidatorInstance>>,
    },
    List {
        reply: Reply<Vec<StoredValidator>>,
    },
}

pub struct ValidatorManager {
    mailbox: Mutex<Option<Sender<ManagerRequest>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ValidatorManager {
    /// Load every stored validator and start the dispatcher. Loaded
    /// validators are not started; see [`ValidatorManager::start_all`].
    pub fn new(
        config: ValidatorConfig,
        store: Arc<dyn ValidatorStore>,
        eots_keys: Arc<dyn KeyStore>,
        consensus_keys: Arc<dyn KeyStore>,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Self, ValidatorError> {
        let mut validators = HashMap::new();
        for record in store.list().map_err(ValidatorError::LoadStore)? {
            debug!("Loaded validator {} ({})", record.btc_pk, record.status);
            let instance = ValidatorInstance::new(
                record,
                config.clone(),
                store.clone(),
                chain.clone(),
                eots_keys.clone(),
            );
            validators.insert(instance.btc_pk(), Arc::new(instance));
        }
        info!("Validator manager loaded {} validator(s)", validators.len());

        let (tx, rx) = bounded(config.mailbox_capacity.max(1));
        let dispatcher = Dispatcher {
            config,
            store,
            eots_keys,
            consensus_keys,
            chain,
            validators,
            events: VecDeque::new(),
        };
        let handle = thread::Builder::new()
            .name("validator-manager".to_string())
            .spawn(move || dispatcher.run(rx))
            .map_err(ValidatorError::Spawn)?;

        Ok(Self {
            mailbox: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    pub fn create_validator(
        &self,
        request: CreateValidatorRequest,
    ) -> Result<StoredValidator, ValidatorError> {
        self.request(|reply| ManagerRequest::Create(request, reply))
    }

    pub fn register_validator(
        &self,
        request: RegisterValidatorRequest,
    ) -> Result<TxResponse, ValidatorError> {
        self.request(|reply| ManagerRequest::Register(request, reply))
    }

    pub fn start_validator(
        &self,
        btc_pk: Bip340PubKey,
        passphrase: &str,
    ) -> Result<(), ValidatorError> {
        let passphrase = passphrase.to_string();
        self.request(|reply| ManagerRequest::Start {
            btc_pk,
            passphrase,
            reply,
        })
    }

    pub fn validator(&self, btc_pk: Bip340PubKey) -> Result<Arc<ValidatorInstance>, ValidatorError> {
        self.request(|reply| ManagerRequest::Get { btc_pk, reply })
    }

    pub fn list_validators(&self) -> Result<Vec<StoredValidator>, ValidatorError> {
        self.request(|reply| ManagerRequest::List { reply })
    }

    /// Start every validator persisted as registered or active. Returns the
    /// validators that were started; failures are logged and skipped.
    pub fn start_all(&self, passphrase: &str) -> Result<Vec<Bip340PubKey>, ValidatorError> {
        let mut started = Vec::new();
        for record in self.list_validators()? {
            if !matches!(
                record.status,
                ValidatorStatus::Registered | ValidatorStatus::Active
            ) {
                continue;
            }
            match self.start_validator(record.btc_pk, passphrase) {
                Ok(()) => started.push(record.btc_pk),
                Err(e) => warn!("Failed to start validator {}: {}", record.btc_pk, e),
            }
        }
        Ok(started)
    }

    /// Close the mailbox, wait for the dispatcher and stop every validator.
    pub fn stop(&self) {
        self.mailbox.lock().take();
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                error!("Validator manager thread panicked");
            }
            info!("Validator manager stopped");
        }
    }

    fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ManagerRequest,
    ) -> Result<T, ValidatorError> {
        let mailbox = self
            .mailbox
            .lock()
            .clone()
            .ok_or(ValidatorError::ManagerStopped)?;

        let (reply_tx, reply_rx) = bounded(1);
        mailbox
            .send(build(reply_tx))
            .map_err(|_| ValidatorError::ManagerStopped)?;
        reply_rx
            .recv()
            .map_err(|_| ValidatorError::ManagerStopped)?
    }
}

impl Drop for ValidatorManager {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Dispatcher {
    config: ValidatorConfig,
    store: Arc<dyn ValidatorStore>,
    eots_keys: Arc<dyn KeyStore>,
    consensus_keys: Arc<dyn KeyStore>,
    chain: Arc<dyn ChainClient>,
    validators: HashMap<Bip340PubKey, Arc<ValidatorInstance>>,
    events: VecDeque<ValidatorRegisteredEvent>,
}

impl Dispatcher {
    fn run(mut self, mailbox: Receiver<ManagerRequest>) {
        debug!("Validator manager dispatcher started");

        while let Ok(request) = mailbox.recv() {
            self.handle(request);
            while let Some(event) = self.events.pop_front() {
                self.handle_registered(event);
            }
        }

        for instance in self.validators.values() {
            instance.stop();
        }
        debug!("Validator manager dispatcher exited");
    }

    fn handle(&mut self, request: ManagerRequest) {
        match request {
            ManagerRequest::Create(request, reply) => {
                let result = self.create(request);
                if let Err(e) = &result {
                    warn!("Create validator failed: {}", e);
                }
                respond(reply, result);
            }
            ManagerRequest::Register(request, reply) => {
                // on success the reply travels with the registered event
                if let Err(e) = self.register(request, &reply) {
                    warn!("Register validator failed: {}", e);
                    respond(reply, Err(e));
                }
            }
            ManagerRequest::Start {
                btc_pk,
                passphrase,
                reply,
            } => {
                let result = self
                    .instance(&btc_pk)
                    .and_then(|instance| instance.start(&passphrase));
                respond(reply, result);
            }
            ManagerRequest::Get { btc_pk, reply } => {
                respond(reply, self.instance(&btc_pk));
            }
            ManagerRequest::List { reply } => {
                let mut records: Vec<_> = self.validators.values().map(|v| v.record()).collect();
                records.sort_by(|a, b| a.key_name.cmp(&b.key_name));
                respond(reply, Ok(records));
            }
        }
    }

    fn instance(&self, btc_pk: &Bip340PubKey) -> Result<Arc<ValidatorInstance>, ValidatorError> {
        self.validators
            .get(btc_pk)
            .cloned()
            .ok_or(ValidatorError::NotFound(*btc_pk))
    }

    fn create(&mut self, request: CreateValidatorRequest) -> Result<StoredValidator, ValidatorError> {
        let name = request.key_name.as_str();
        let btc_pk = Bip340PubKey::from(
            self.eots_keys
                .get_or_create_key(name, &request.passphrase)
                .map_err(|e| key_error(name, "create EOTS key", e))?,
        );
        if self.validators.contains_key(&btc_pk) {
            return Err(ValidatorError::AlreadyExists(btc_pk));
        }

        let consensus_pk = self
            .consensus_keys
            .get_or_create_key(name, &request.passphrase)
            .map_err(|e| key_error(name, "create consensus key", e))?;
        let consensus_sk = self
            .consensus_keys
            .private_key(&consensus_pk.x_only_public_key().0, &request.passphrase)
            .map_err(|e| key_error(name, "unlock consensus key", e))?;
        let btc_sk = self
            .eots_keys
            .private_key(btc_pk.x_only(), &request.passphrase)
            .map_err(|e| key_error(name, "unlock EOTS key", e))?;

        let record = StoredValidator::new(
            request.key_name.clone(),
            consensus_pk,
            btc_pk,
            ProofOfPossession::generate(&consensus_sk, &btc_sk),
            request.chain_id,
            request.description,
            request.commission,
        );
        self.store.create(&record).map_err(|e| match e {
            StoreError::AlreadyExists(pk) => ValidatorError::AlreadyExists(pk),
            e => ValidatorError::store(btc_pk, e),
        })?;

        let instance = ValidatorInstance::new(
            record.clone(),
            self.config.clone(),
            self.store.clone(),
            self.chain.clone(),
            self.eots_keys.clone(),
        );
        self.validators.insert(btc_pk, Arc::new(instance));

        info!(
            "Created validator {} (key {}, chain {})",
            btc_pk, record.key_name, record.chain_id
        );
        Ok(record)
    }

    fn register(
        &mut self,
        request: RegisterValidatorRequest,
        reply: &Reply<TxResponse>,
    ) -> Result<(), ValidatorError> {
        let instance = self.instance(&request.btc_pk)?;
        let record = instance.record();
        if record.status != ValidatorStatus::Created {
            return Err(ValidatorError::InvalidTransition {
                btc_pk: record.btc_pk,
                from: record.status,
                to: ValidatorStatus::Registered,
            });
        }

        let result = self.chain.submit_registration(
            &record.chain_id,
            &record.consensus_pk,
            &record.btc_pk,
            &record.pop,
            &record.description,
            record.commission,
        );
        let tx = match result {
            Ok(tx) => tx,
            Err(ChainError::AlreadyRegistered(_)) => {
                warn!(
                    "Validator {} is already registered on {}",
                    record.btc_pk, record.chain_id
                );
                TxResponse {
                    tx_hash: String::new(),
                }
            }
            Err(e) if e.is_permanent() => {
                if let Err(status_err) = instance.state().set_status(ValidatorStatus::Inactive) {
                    warn!(
                        "Validator {}: failed to record inactive status: {}",
                        record.btc_pk, status_err
                    );
                }
                return Err(ValidatorError::chain("register", record.btc_pk, e));
            }
            Err(e) => return Err(ValidatorError::chain("register", record.btc_pk, e)),
        };

        self.events.push_back(ValidatorRegisteredEvent {
            btc_pk: record.btc_pk,
            tx,
            passphrase: request.passphrase,
            reply: reply.clone(),
        });
        Ok(())
    }

    fn handle_registered(&mut self, event: ValidatorRegisteredEvent) {
        let result = self.instance(&event.btc_pk).and_then(|instance| {
            instance.state().set_status(ValidatorStatus::Registered)?;
            info!(
                "Validator {} registered (tx {})",
                event.btc_pk, event.tx.tx_hash
            );

            if self.config.auto_start_on_registration {
                if let Some(passphrase) = &event.passphrase {
                    if let Err(e) = instance.start(passphrase) {
                        warn!(
                            "Validator {} registered but failed to start: {}",
                            event.btc_pk, e
                        );
                    }
                }
            }
            Ok(event.tx)
        });
        respond(event.reply, result);
    }
}

fn key_error(name: &str, context: &str, e: KeystoreError) -> ValidatorError {
    match e {
        KeystoreError::InvalidName(name) => ValidatorError::InvalidKeyName(name),
        e => ValidatorError::keystore(format!("{} {}", context, name), e),
    }
}

fn respond<T>(reply: Reply<T>, result: Result<T, ValidatorError>) {
    if reply.send(result).is_err() {
        debug!("Requester went away before the reply");
    }
}
