//! mock-chaind - stand-in node binary for harness tests.
//!
//! Implements just the command surface the harness drives: testnet file
//! generation, genesis account edits, a file keyring, offline state reset, a
//! status RPC whose block height ticks on a timer, bank and staking
//! transactions against a file ledger, and queries over the genesis
//! document and that ledger.

#![forbid(unsafe_code)]

mod genesis_cmd;
mod home;
mod keyring;
mod ledger;
mod query;
mod server;
mod tx;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "mock-chaind")]
#[command(author, version, about = "Mock chain node for system-test harness runs")]
struct Cli {
    /// Node home directory
    #[arg(long, global = true, env = "MOCK_CHAIND_HOME")]
    home: Option<PathBuf>,

    /// RPC address of the node to talk to
    #[arg(long, global = true)]
    node: Option<String>,

    /// Output format: json, or text for indented JSON
    #[arg(long, short = 'o', global = true, default_value = "json")]
    output: String,

    /// Keyring backend; only the file-based `test` layout is implemented
    #[arg(long, global = true, default_value = "test")]
    keyring_backend: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate node homes for a local testnet
    Testnet {
        #[command(subcommand)]
        command: TestnetCommand,
    },
    /// Edit the genesis document
    Genesis {
        #[command(subcommand)]
        command: GenesisCommand,
    },
    /// Manage the keyring
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    /// Consensus engine maintenance
    #[command(alias = "tendermint")]
    Comet {
        #[command(subcommand)]
        command: CometCommand,
    },
    /// Run the node
    Start(server::StartArgs),
    /// Print the status of a running node
    Status,
    /// Read-only queries
    #[command(name = "q", alias = "query")]
    Query {
        #[command(subcommand)]
        command: query::QueryCommand,
    },
    /// Sign and broadcast a transaction
    Tx(tx::TxArgs),
}

#[derive(Subcommand)]
enum TestnetCommand {
    InitFiles(genesis_cmd::InitFilesArgs),
}

#[derive(Subcommand)]
enum GenesisCommand {
    AddGenesisAccount(genesis_cmd::AddAccountArgs),
}

#[derive(Subcommand)]
enum KeysCommand {
    Add {
        name: String,
    },
    Show {
        name: String,
        /// Print only the address
        #[arg(short = 'a', long = "address")]
        address: bool,
    },
    List,
}

#[derive(Subcommand)]
enum CometCommand {
    UnsafeResetAll,
}

fn init_logging(verbose: bool, server: bool) {
    let default = match (verbose, server) {
        (true, _) => "debug",
        (false, true) => "info",
        (false, false) => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn require_home(home: Option<PathBuf>) -> Result<PathBuf> {
    home.context("--home is required for this command")
}

fn print_json(value: &serde_json::Value, output: &str) -> Result<()> {
    let text = match output {
        "json" => serde_json::to_string(value)?,
        "text" => serde_json::to_string_pretty(value)?,
        other => bail!("unknown output format `{other}`"),
    };
    println!("{text}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, matches!(cli.command, Command::Start(_)));

    if cli.keyring_backend != "test" {
        bail!("keyring backend `{}` is not supported", cli.keyring_backend);
    }

    let output = cli.output.as_str();
    match cli.command {
        Command::Testnet {
            command: TestnetCommand::InitFiles(args),
        } => genesis_cmd::init_files(&args),
        Command::Genesis {
            command: GenesisCommand::AddGenesisAccount(args),
        } => genesis_cmd::add_genesis_account(&require_home(cli.home)?, &args),
        Command::Keys { command } => {
            let ring = keyring::Keyring::open(&require_home(cli.home)?);
            match command {
                KeysCommand::Add { name } => {
                    let key = ring.add(&name)?;
                    print_json(&serde_json::to_value(&key)?, output)
                }
                KeysCommand::Show { name, address } => {
                    let key = ring.get(&name)?;
                    if address {
                        println!("{}", key.address);
                        Ok(())
                    } else {
                        print_json(&serde_json::to_value(&key)?, output)
                    }
                }
                KeysCommand::List => print_json(&serde_json::to_value(ring.list()?)?, output),
            }
        }
        Command::Comet {
            command: CometCommand::UnsafeResetAll,
        } => home::unsafe_reset_all(&require_home(cli.home)?),
        Command::Start(args) => {
            let home = require_home(cli.home)?;
            tokio::runtime::Runtime::new()?.block_on(server::run(home, args))
        }
        Command::Status => {
            let node = cli.node.context("--node is required for status")?;
            print_json(&server::fetch_status(&node)?, output)
        }
        Command::Query { command } => {
            print_json(&query::run(&require_home(cli.home)?, command)?, output)
        }
        Command::Tx(args) => print_json(&tx::run(&require_home(cli.home)?, args)?, output),
    }
}
