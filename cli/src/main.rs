//! blkindex CLI: index node blk-files into a SQLite chain store and
//! inspect the result.
//!
//! # Commands
//! ```text
//! blkindex run     --datadir <dir> [--network main|testnet|regtest] [--once]
//! blkindex status
//! blkindex block   <hash|height>
//! blkindex tx      <hash>
//! blkindex address <address> [--color <n>] [--utxos]
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use blkindex_core::Network;

mod cmd_query;
mod cmd_run;
mod logging;

#[derive(Parser)]
#[command(
    name = "blkindex",
    about = "blk-file chain indexer",
    long_about = "
blkindex reads the node's blkNNNNN.dat files, stores blocks, transactions,
inputs, outputs and addresses in SQLite, and keeps main-chain and spent
bookkeeping up to date across reorganizations.

ENVIRONMENT VARIABLES:
  BLKINDEX_DATADIR   Node data directory
  BLKINDEX_DB        SQLite database path
  RUST_LOG           Log filter (overrides --log-level)
",
    version
)]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, env = "BLKINDEX_DB", default_value = "./blkindex.db")]
    db: String,

    /// Default log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Per-component log level, e.g. blkindex-core=debug (repeatable)
    #[arg(long = "log", global = true)]
    log_overrides: Vec<String>,

    /// Emit JSON structured logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index blk-files (daemon unless --once)
    Run {
        /// Node data directory
        #[arg(long, env = "BLKINDEX_DATADIR", default_value = ".")]
        datadir: PathBuf,
        /// Network, selects the blocks sub-directory
        #[arg(long, default_value = "main")]
        network: Network,
        /// Explicit blk-file directory (overrides datadir + network)
        #[arg(long)]
        blk_dir: Option<PathBuf>,
        /// Blocks per store transaction
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        /// Polling interval in daemon mode (milliseconds)
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
        /// Blocking workers for transaction hashing (0 = inline)
        #[arg(long, default_value_t = 0)]
        workers: usize,
        /// Expected record magic (hex, e.g. 0xd9b4bef9)
        #[arg(long)]
        magic: Option<String>,
        /// Run a single update pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Show block counts and the main-chain tip
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a block by hash or main-chain height
    Block {
        /// Block hash or height
        id: String,
        /// Include transactions
        #[arg(long)]
        txs: bool,
    },

    /// Show a transaction by hash
    Tx {
        /// Transaction hash
        hash: String,
    },

    /// Show per-color balance (or UTXOs) of an address
    Address {
        address: String,
        /// Restrict UTXOs to one color
        #[arg(long)]
        color: Option<u32>,
        /// List unspent outputs instead of the balance
        #[arg(long)]
        utxos: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = logging::LogConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
        ..logging::LogConfig::default()
    }
    .with_overrides(&cli.log_overrides)?;
    logging::init_tracing(&log);

    match cli.command {
        Commands::Run {
            datadir,
            network,
            blk_dir,
            batch_size,
            poll_ms,
            workers,
            magic,
            once,
        } => {
            let args = cmd_run::RunArgs {
                datadir,
                network,
                blk_dir,
                batch_size,
                poll_ms,
                workers,
                magic,
                once,
            };
            cmd_run::run(&cli.db, args).await
        }

        Commands::Status { json } => cmd_query::status(&cli.db, json).await,

        Commands::Block { id, txs } => cmd_query::block(&cli.db, &id, txs).await,

        Commands::Tx { hash } => cmd_query::tx(&cli.db, &hash).await,

        Commands::Address {
            address,
            color,
            utxos,
        } => cmd_query::address(&cli.db, &address, color, utxos).await,
    }
}
