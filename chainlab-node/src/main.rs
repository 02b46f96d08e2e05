//! Chainlab Node - operator CLI
//!
//! Each invocation opens the node stored in the data directory, runs one
//! command against it and saves its state again. Peers are reached over
//! HTTP using the node routes under `/api`.

use anyhow::{Context, Result};
use chainlab_core::block::MiningLimits;
use chainlab_core::{
    Block, Blockchain, FileBlockStore, HttpPeerTransport, LedgerNode, Wallet,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod state;

use config::NodeSettings;
use state::NodeState;

/// Chainlab Node CLI
#[derive(Parser)]
#[command(name = "chainlab-node")]
#[command(about = "Proof-of-work ledger node", long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(long, short, env = "CHAINLAB_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for blocks, wallet key and node state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Leading hex zeros required in a block hash
    #[arg(long)]
    difficulty: Option<usize>,

    /// Bootstrap peer URL (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show chain length, tip and pool size
    Status,
    /// Print every block as JSON
    PrintChain,
    /// Check hash integrity and linkage of the stored chain
    Validate,
    /// Show the balance of an address
    Balance { address: String },
    /// List mined transactions touching an address
    History { address: String },
    /// Show (and create if needed) the node wallet
    Wallet,
    /// Sign a transfer from the node wallet and submit it
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: f64,
        /// Mine a block right after submitting
        #[arg(long, short)]
        mine: bool,
    },
    /// Mine the pending pool into a new block
    Mine {
        /// Reward recipient; defaults to the node wallet
        #[arg(long)]
        reward_address: Option<String>,
    },
    /// Register a peer and discover the peers it knows
    AddPeer { url: String },
    /// List known peers
    Peers,
    /// Adopt the longest valid chain offered by peers
    Sync,
    /// Offer a block stored as JSON to the ledger
    Receive { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = NodeSettings::load(cli.config.as_deref())?
        .with_overrides(cli.data_dir, cli.difficulty, cli.peers);

    info!("📁 Data directory: {}", settings.data_dir.display());
    let node = open_node(&settings).await?;

    run(cli.command, &node, &settings).await?;

    NodeState::capture(&node)
        .await
        .write(&settings.state_path())
        .await?;
    Ok(())
}

async fn open_node(settings: &NodeSettings) -> Result<LedgerNode> {
    let store = FileBlockStore::new(&settings.data_dir).context("Failed to open block store")?;
    let transport = HttpPeerTransport::with_timeout(settings.request_timeout())
        .context("Failed to create peer transport")?;

    let node = LedgerNode::start(settings.node.clone(), Arc::new(transport), Arc::new(store)).await;
    NodeState::read(&settings.state_path())
        .await?
        .restore(&node)
        .await;
    Ok(node)
}

async fn run(command: Command, node: &LedgerNode, settings: &NodeSettings) -> Result<()> {
    match command {
        Command::Status => print_json(&node.status().await)?,
        Command::PrintChain => print_json(&node.chain().await)?,
        Command::Validate => {
            let chain = node.chain().await;
            match Blockchain::validate_chain(&chain) {
                Ok(()) => println!("✅ Chain of {} blocks is valid", chain.len()),
                Err(e) => println!("❌ Chain is invalid ({}): {}", e.code(), e),
            }
        }
        Command::Balance { address } => {
            println!("{}", node.balance_of(&address).await);
        }
        Command::History { address } => {
            for (index, tx) in node.history_of(&address).await {
                let from = tx.from_address.as_deref().unwrap_or("(reward)");
                println!("#{:<6} {} -> {} : {}", index, from, tx.to_address, tx.amount);
            }
        }
        Command::Wallet => {
            let wallet = load_wallet(settings)?;
            println!("Address: {}", wallet.public_key());
            println!("Balance: {}", node.balance_of(wallet.public_key()).await);
        }
        Command::Send { to, amount, mine } => {
            let wallet = load_wallet(settings)?;
            let tx = wallet.create_transaction(to, amount)?;
            node.submit_transaction(tx).await?;
            println!("📝 Transaction queued ({} pending)", node.pending_transactions().await.len());

            if mine {
                mine_block(node, wallet.public_key()).await?;
            }
        }
        Command::Mine { reward_address } => {
            let reward_address = match reward_address {
                Some(address) => address,
                None => load_wallet(settings)?.public_key().to_string(),
            };
            mine_block(node, &reward_address).await?;
        }
        Command::AddPeer { url } => print_json(&node.add_peer(url).await)?,
        Command::Peers => {
            for peer in node.peers().await {
                println!("{}", peer);
            }
        }
        Command::Sync => print_json(&node.sync_chain().await)?,
        Command::Receive { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let block: Block = serde_json::from_str(&raw).context("Invalid block JSON")?;
            print_json(&node.receive_block(block).await)?;
        }
    }
    Ok(())
}

/// Mine one block; Ctrl-C aborts the proof-of-work search
async fn mine_block(node: &LedgerNode, reward_address: &str) -> Result<()> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling mining");
                cancel.cancel();
            }
        })
    };

    let result = node
        .mine(reward_address, MiningLimits::unbounded().with_cancellation(cancel))
        .await;
    watcher.abort();

    let report = result.context("Mining failed")?;
    print_json(&report)
}

fn load_wallet(settings: &NodeSettings) -> Result<Wallet> {
    let path = settings.wallet_path();
    Wallet::load_or_create(&path).with_context(|| format!("Failed to load wallet {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
