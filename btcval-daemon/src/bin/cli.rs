//! Command line client for btcvald.

use std::path::PathBuf;

use btcval_daemon::{
    CreateValidatorParams, FinalitySignatureParams, RpcClient, ServerError, ValidatorInfo,
};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "btcval-cli")]
#[command(about = "Control a running btcvald")]
#[command(version)]
struct Args {
    /// Path to the daemon's Unix socket
    #[arg(long, default_value = "/var/run/btcval.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show daemon version and validator count
    Info,

    /// Create a validator with fresh EOTS and consensus keys
    CreateValidator {
        #[arg(long)]
        key_name: String,
        #[arg(long)]
        chain_id: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "0.05")]
        commission: String,
        #[arg(long, env = "BTCVAL_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },

    /// Register a created validator on chain
    RegisterValidator {
        btc_pk: String,
        /// Start voting as soon as the registration lands
        #[arg(long)]
        start: bool,
        #[arg(long, env = "BTCVAL_PASSPHRASE", hide_env_values = true, default_value = "")]
        passphrase: String,
    },

    /// Start a registered or inactive validator
    StartValidator {
        btc_pk: String,
        #[arg(long, env = "BTCVAL_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },

    /// Show one validator
    Validator { btc_pk: String },

    /// List all validators
    Validators,

    /// Sign and submit a vote for an arbitrary block
    AddFinalitySig {
        btc_pk: String,
        height: u64,
        block_hash: String,
    },
}

fn main() {
    let args = Args::parse();
    let client = RpcClient::new(&args.socket);

    if let Err(e) = run(&client, args.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(client: &RpcClient, command: Command) -> Result<(), ServerError> {
    match command {
        Command::Info => {
            let (version, validators) = client.get_info()?;
            println!("btcvald {} managing {} validator(s)", version, validators);
        }
        Command::CreateValidator {
            key_name,
            chain_id,
            description,
            commission,
            passphrase,
        } => {
            let btc_pk = client.create_validator(CreateValidatorParams {
                key_name,
                passphrase,
                chain_id,
                description,
                commission,
            })?;
            println!("{}", btc_pk);
        }
        Command::RegisterValidator {
            btc_pk,
            start,
            passphrase,
        } => {
            let passphrase = start.then_some(passphrase);
            let tx_hash = client.register_validator(&btc_pk, passphrase)?;
            println!("registered, tx {}", tx_hash);
        }
        Command::StartValidator { btc_pk, passphrase } => {
            client.start_validator(&btc_pk, &passphrase)?;
            println!("started");
        }
        Command::Validator { btc_pk } => {
            print_validator(&client.query_validator(&btc_pk)?);
        }
        Command::Validators => {
            for info in client.query_validator_list()? {
                print_validator(&info);
            }
        }
        Command::AddFinalitySig {
            btc_pk,
            height,
            block_hash,
        } => {
            let res = client.add_finality_signature(FinalitySignatureParams {
                btc_pk,
                height,
                block_hash,
            })?;
            println!("tx {}", res.tx_hash);
            if let (Some(extracted), Some(local)) = (res.extracted_sk_hex, res.local_sk_hex) {
                println!("double vote, extracted key {}", extracted);
                println!("local key                  {}", local);
            }
        }
    }
    Ok(())
}

fn print_validator(info: &ValidatorInfo) {
    println!(
        "{} {} {:<10} voted={} processed={} committed={} running={}",
        info.key_name,
        info.btc_pk,
        info.status,
        info.last_voted_height,
        info.last_processed_height,
        info.last_committed_height,
        info.running
    );
}
