//! RPC server implementation.
//!
//! Listens on a Unix socket and serves one request per connection.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use btcval_eots::{Bip340PubKey, KeyMatch};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::ValidatorError;
use crate::manager::{CreateValidatorRequest, RegisterValidatorRequest, ValidatorManager};
use crate::protocol::{
    CreateValidatorParams, FinalitySignatureParams, FinalitySignatureResponse, Request, Response,
    ValidatorInfo,
};
use crate::types::{BlockInfo, Commission};

const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Errors from the RPC server and client.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Validator(#[from] ValidatorError),

    /// Error reported by the daemon
    #[error("{0}")]
    Remote(String),
}

pub struct RpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    manager: Arc<ValidatorManager>,
}

impl RpcServer {
    pub fn bind(
        socket_path: impl AsRef<Path>,
        manager: Arc<ValidatorManager>,
    ) -> Result<Self, ServerError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!("RPC server listening on {:?}", socket_path);

        Ok(Self {
            listener,
            socket_path,
            manager,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve connections until the listener fails (blocking).
    pub fn run(&self) -> Result<(), ServerError> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    debug!("New connection");
                    if let Err(e) = self.handle_connection(stream) {
                        error!("Error handling connection: {}", e);
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: UnixStream) -> Result<(), ServerError> {
        let request: Request = read_frame(&mut stream)?;
        let response = self.handle_request(request);
        write_frame(&mut stream, &response)
    }

    fn handle_request(&self, request: Request) -> Response {
        let result = match request {
            Request::GetInfo => self.handle_get_info(),
            Request::CreateValidator(params) => self.handle_create(params),
            Request::RegisterValidator { btc_pk, passphrase } => {
                self.handle_register(&btc_pk, passphrase)
            }
            Request::StartValidator { btc_pk, passphrase } => {
                self.handle_start(&btc_pk, &passphrase)
            }
            Request::QueryValidator { btc_pk } => self.handle_query(&btc_pk),
            Request::QueryValidatorList => self.handle_list(),
            Request::AddFinalitySignature(params) => self.handle_finality_signature(params),
        };

        result.unwrap_or_else(|e| {
            warn!("Request failed: {}", e);
            Response::Error {
                message: e.to_string(),
            }
        })
    }

    fn handle_get_info(&self) -> Result<Response, ServerError> {
        let validators = self.manager.list_validators()?.len() as u64;
        Ok(Response::Info {
            version: env!("CARGO_PKG_VERSION").to_string(),
            validators,
        })
    }

    fn handle_create(&self, params: CreateValidatorParams) -> Result<Response, ServerError> {
        let commission: Commission = params
            .commission
            .parse()
            .map_err(ValidatorError::InvalidCommission)?;

        let record = self.manager.create_validator(CreateValidatorRequest {
            key_name: params.key_name,
            passphrase: params.passphrase,
            chain_id: params.chain_id,
            description: params.description.into_bytes(),
            commission,
        })?;
        Ok(Response::ValidatorCreated {
            btc_pk: record.btc_pk.to_hex(),
        })
    }

    fn handle_register(
        &self,
        btc_pk: &str,
        passphrase: Option<String>,
    ) -> Result<Response, ServerError> {
        let btc_pk = parse_btc_pk(btc_pk)?;
        let tx = self
            .manager
            .register_validator(RegisterValidatorRequest { btc_pk, passphrase })?;
        Ok(Response::ValidatorRegistered { tx_hash: tx.tx_hash })
    }

    fn handle_start(&self, btc_pk: &str, passphrase: &str) -> Result<Response, ServerError> {
        let btc_pk = parse_btc_pk(btc_pk)?;
        self.manager.start_validator(btc_pk, passphrase)?;
        Ok(Response::ValidatorStarted)
    }

    fn handle_query(&self, btc_pk: &str) -> Result<Response, ServerError> {
        let instance = self.manager.validator(parse_btc_pk(btc_pk)?)?;
        Ok(Response::Validator(ValidatorInfo::from_record(
            &instance.record(),
            instance.is_running(),
        )))
    }

    fn handle_list(&self) -> Result<Response, ServerError> {
        let mut infos = Vec::new();
        for record in self.manager.list_validators()? {
            let running = self
                .manager
                .validator(record.btc_pk)
                .map(|instance| instance.is_running())
                .unwrap_or(false);
            infos.push(ValidatorInfo::from_record(&record, running));
        }
        Ok(Response::ValidatorList(infos))
    }

    fn handle_finality_signature(
        &self,
        params: FinalitySignatureParams,
    ) -> Result<Response, ServerError> {
        let btc_pk = parse_btc_pk(&params.btc_pk)?;
        let hash = hex::decode(params.block_hash.trim_start_matches("0x"))
            .map_err(|e| ServerError::InvalidInput(format!("block hash: {}", e)))?;
        if params.height == 0 {
            return Err(ServerError::InvalidInput("height must be positive".to_string()));
        }

        let instance = self.manager.validator(btc_pk)?;
        let block = BlockInfo {
            height: params.height,
            hash,
        };
        let (tx, extracted) = instance.test_submit_finality_signature_and_extract(&block)?;

        let (extracted_sk_hex, local_sk_hex) = match extracted {
            Some(key) => {
                let local = match key.matched {
                    KeyMatch::Negated => key.local.negate(),
                    _ => key.local,
                };
                (
                    Some(hex::encode(key.extracted.secret_bytes())),
                    Some(hex::encode(local.secret_bytes())),
                )
            }
            None => (None, None),
        };
        Ok(Response::FinalitySignature(FinalitySignatureResponse {
            tx_hash: tx.tx_hash,
            extracted_sk_hex,
            local_sk_hex,
        }))
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Failed to remove socket {:?}: {}", self.socket_path, e);
        }
    }
}

fn parse_btc_pk(s: &str) -> Result<Bip340PubKey, ValidatorError> {
    Bip340PubKey::from_hex(s.trim_start_matches("0x"))
        .map_err(|e| ValidatorError::InvalidPublicKey(format!("{}: {}", s, e)))
}

fn read_frame<T: serde::de::DeserializeOwned>(stream: &mut UnixStream) -> Result<T, ServerError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let msg_len = u32::from_le_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_LEN {
        return Err(ServerError::Protocol("Message too large".to_string()));
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf)?;
    Ok(bincode::deserialize(&msg_buf)?)
}

fn write_frame<T: serde::Serialize>(stream: &mut UnixStream, msg: &T) -> Result<(), ServerError> {
    let bytes = bincode::serialize(msg)?;
    stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

/// Client for talking to a running daemon.
pub struct RpcClient {
    socket_path: PathBuf,
}

impl RpcClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    fn send_request(&self, request: &Request) -> Result<Response, ServerError> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        write_frame(&mut stream, request)?;
        match read_frame(&mut stream)? {
            Response::Error { message } => Err(ServerError::Remote(message)),
            response => Ok(response),
        }
    }

    /// Daemon version and number of managed validators.
    pub fn get_info(&self) -> Result<(String, u64), ServerError> {
        match self.send_request(&Request::GetInfo)? {
            Response::Info {
                version,
                validators,
            } => Ok((version, validators)),
            _ => Err(unexpected()),
        }
    }

    /// Returns the new validator's BTC public key in hex.
    pub fn create_validator(&self, params: CreateValidatorParams) -> Result<String, ServerError> {
        match self.send_request(&Request::CreateValidator(params))? {
            Response::ValidatorCreated { btc_pk } => Ok(btc_pk),
            _ => Err(unexpected()),
        }
    }

    pub fn register_validator(
        &self,
        btc_pk: &str,
        passphrase: Option<String>,
    ) -> Result<String, ServerError> {
        let request = Request::RegisterValidator {
            btc_pk: btc_pk.to_string(),
            passphrase,
        };
        match self.send_request(&request)? {
            Response::ValidatorRegistered { tx_hash } => Ok(tx_hash),
            _ => Err(unexpected()),
        }
    }

    pub fn start_validator(&self, btc_pk: &str, passphrase: &str) -> Result<(), ServerError> {
        let request = Request::StartValidator {
            btc_pk: btc_pk.to_string(),
            passphrase: passphrase.to_string(),
        };
        match self.send_request(&request)? {
            Response::ValidatorStarted => Ok(()),
            _ => Err(unexpected()),
        }
    }

    pub fn query_validator(&self, btc_pk: &str) -> Result<ValidatorInfo, ServerError> {
        let request = Request::QueryValidator {
            btc_pk: btc_pk.to_string(),
        };
        match self.send_request(&request)? {
            Response::Validator(info) => Ok(info),
            _ => Err(unexpected()),
        }
    }

    pub fn query_validator_list(&self) -> Result<Vec<ValidatorInfo>, ServerError> {
        match self.send_request(&Request::QueryValidatorList)? {
            Response::ValidatorList(list) => Ok(list),
            _ => Err(unexpected()),
        }
    }

    pub fn add_finality_signature(
        &self,
        params: FinalitySignatureParams,
    ) -> Result<FinalitySignatureResponse, ServerError> {
        match self.send_request(&Request::AddFinalitySignature(params))? {
            Response::FinalitySignature(res) => Ok(res),
            _ => Err(unexpected()),
        }
    }
}

fn unexpected() -> ServerError {
    ServerError::Protocol("Unexpected response".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorConfig;
    use crate::testutil::{TestEnv, CHAIN_ID, PASSPHRASE};
    use std::thread;
    use std::time::{Duration, Instant};

    fn create_test_server(env: &TestEnv) -> (Arc<RpcServer>, PathBuf) {
        let manager = ValidatorManager::new(
            env.config.clone(),
            env.store.clone(),
            env.eots_keys.clone(),
            env.consensus_keys.clone(),
            env.chain.clone(),
        )
        .unwrap();
        let socket_path = env.dir().join("btcval.sock");
        let server = RpcServer::bind(&socket_path, Arc::new(manager)).unwrap();
        (Arc::new(server), socket_path)
    }

    /// Serve `connections` requests on a background thread.
    fn serve(server: &Arc<RpcServer>, connections: usize) -> thread::JoinHandle<()> {
        let server = server.clone();
        thread::spawn(move || {
            for _ in 0..connections {
                if let Ok((stream, _)) = server.listener.accept() {
                    let _ = server.handle_connection(stream);
                }
            }
        })
    }

    fn create_params(name: &str) -> CreateValidatorParams {
        CreateValidatorParams {
            key_name: name.to_string(),
            passphrase: PASSPHRASE.to_string(),
            chain_id: CHAIN_ID.to_string(),
            description: "rpc validator".to_string(),
            commission: "0.05".to_string(),
        }
    }

    #[test]
    fn test_server_creation() {
        let env = TestEnv::new(ValidatorConfig::default());
        let (_server, socket_path) = create_test_server(&env);
        assert!(socket_path.exists());
    }

    #[test]
    fn test_get_info() {
        let env = TestEnv::new(ValidatorConfig::default());
        let (server, socket_path) = create_test_server(&env);
        let handle = serve(&server, 1);

        let client = RpcClient::new(&socket_path);
        let (version, validators) = client.get_info().unwrap();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
        assert_eq!(validators, 0);

        handle.join().unwrap();
    }

    #[test]
    fn test_create_and_query() {
        let env = TestEnv::new(ValidatorConfig::default());
        let (server, socket_path) = create_test_server(&env);
        let handle = serve(&server, 3);

        let client = RpcClient::new(&socket_path);
        let btc_pk = client.create_validator(create_params("v1")).unwrap();

        let info = client.query_validator(&btc_pk).unwrap();
        assert_eq!(info.key_name, "v1");
        assert_eq!(info.status, "CREATED");
        assert_eq!(info.commission, "0.050000000000000000");
        assert!(!info.running);

        let list = client.query_validator_list().unwrap();
        assert_eq!(list, vec![info]);

        handle.join().unwrap();
    }

    #[test]
    fn test_bad_input_rejected_before_state() {
        let env = TestEnv::new(ValidatorConfig::default());
        let (server, socket_path) = create_test_server(&env);
        let handle = serve(&server, 3);

        let client = RpcClient::new(&socket_path);
        let mut params = create_params("v1");
        params.commission = "1.5".to_string();
        let err = client.create_validator(params).unwrap_err();
        assert!(err.to_string().contains("commission"));

        let err = client.query_validator("not-a-key").unwrap_err();
        assert!(err.to_string().contains("invalid public key"));

        assert!(client.query_validator_list().unwrap().is_empty());
        handle.join().unwrap();
    }

    #[test]
    fn test_double_sign_reveals_key() {
        let env = TestEnv::new(ValidatorConfig {
            poll_interval_ms: 10,
            ..Default::default()
        });
        let (server, socket_path) = create_test_server(&env);
        let handle = serve(&server, 4);

        let client = RpcClient::new(&socket_path);
        let btc_pk = client.create_validator(create_params("v1")).unwrap();
        client
            .register_validator(&btc_pk, Some(PASSPHRASE.to_string()))
            .unwrap();

        env.chain.set_height(5);
        let pk = Bip340PubKey::from_hex(&btc_pk).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while env.chain.votes_by(&pk).len() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let res = client
            .add_finality_signature(FinalitySignatureParams {
                btc_pk: btc_pk.clone(),
                height: 5,
                block_hash: hex::encode([0xaa; 32]),
            })
            .unwrap();
        let extracted = res.extracted_sk_hex.expect("key must be extracted");
        assert_eq!(Some(extracted), res.local_sk_hex);

        let info = client.query_validator(&btc_pk).unwrap();
        assert_eq!(info.status, "SLASHED");
        assert!(!info.running);

        handle.join().unwrap();
    }
}
