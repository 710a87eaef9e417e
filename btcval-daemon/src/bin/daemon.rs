//! BTC validator daemon binary.
//!
//! Loads the validator store and key stores from the data directory, resumes
//! every registered validator and serves RPC requests on a Unix socket.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use btcval_daemon::{DevChain, FileValidatorStore, RpcServer, ValidatorConfig, ValidatorManager};
use btcval_keystore::{FileKeyStore, KdfParams};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// BTC validator daemon.
#[derive(Parser, Debug)]
#[command(name = "btcvald")]
#[command(about = "Runs BTC validators and submits EOTS finality votes")]
#[command(version)]
struct Args {
    /// Path to Unix socket for client connections
    #[arg(long, default_value = "/var/run/btcval.sock")]
    socket: PathBuf,

    /// Directory holding the validator store and key stores
    #[arg(long, default_value = "/var/lib/btcval")]
    data_dir: PathBuf,

    /// Key passphrase used to resume validators (or use BTCVAL_PASSPHRASE env var)
    #[arg(long, env = "BTCVAL_PASSPHRASE", default_value = "", hide_env_values = true)]
    passphrase: String,

    /// Chain ID of the local development chain
    #[arg(long, default_value = "btcval-devnet")]
    chain_id: String,

    /// Milliseconds between blocks on the development chain
    #[arg(long, default_value_t = 2000)]
    block_interval_ms: u64,

    /// Validator config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting btcvald");
    info!("Socket path: {:?}", args.socket);
    info!("Data dir: {:?}", args.data_dir);

    let config = match &args.config {
        Some(path) => match ValidatorConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config {:?}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => ValidatorConfig::default(),
    };
    info!("Validator config: {:?}", config);

    let store = match FileValidatorStore::open(args.data_dir.join("validators.json")) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open validator store: {}", e);
            std::process::exit(1);
        }
    };

    let open_keys = |dir: &str| {
        let path = args.data_dir.join("keys").join(dir);
        match FileKeyStore::open(&path, KdfParams::default()) {
            Ok(keys) => keys,
            Err(e) => {
                error!("Failed to open key store {:?}: {}", path, e);
                std::process::exit(1);
            }
        }
    };
    let eots_keys = open_keys("eots");
    let consensus_keys = open_keys("consensus");

    let chain = Arc::new(DevChain::new(args.chain_id.clone()));
    let _producer = match chain.spawn_block_producer(Duration::from_millis(args.block_interval_ms)) {
        Ok(producer) => producer,
        Err(e) => {
            error!("Failed to start block producer: {}", e);
            std::process::exit(1);
        }
    };

    let manager = match ValidatorManager::new(
        config,
        Arc::new(store),
        Arc::new(eots_keys),
        Arc::new(consensus_keys),
        chain,
    ) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("Failed to start validator manager: {}", e);
            std::process::exit(1);
        }
    };

    if args.passphrase.is_empty() {
        warn!("No passphrase given, registered validators stay stopped until started over RPC");
    } else {
        match manager.start_all(&args.passphrase) {
            Ok(started) => info!("Resumed {} validator(s)", started.len()),
            Err(e) => {
                error!("Failed to resume validators: {}", e);
                std::process::exit(1);
            }
        }
    }

    let server = match RpcServer::bind(&args.socket, manager.clone()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {}", e);
            std::process::exit(1);
        }
    };

    info!("btcvald ready, waiting for connections...");

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        manager.stop();
        std::process::exit(1);
    }
    manager.stop();
}
