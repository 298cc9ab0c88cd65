//! `wharfd`: the Wharf retrieval market daemon.
//!
//! Binary entrypoint that assembles the piece store, dagstore and retrieval
//! provider into a running node answering the query protocol.
//!
//! # Usage
//!
//! ```text
//! wharfd run                                 # start the node
//! wharfd run -c wharf.toml                   # start with a config file
//! wharfd run -d ./node2 -l 127.0.0.1:4831    # second instance
//! wharfd import piece.car --payload <hex>    # add a piece and its storage deal
//! wharfd ask set --price-per-byte 2          # update the retrieval ask
//! wharfd shards                              # list dagstore shards
//! wharfd deals                               # list retrieval deals
//! wharfd lookup <block-hash>                 # pieces holding a block
//! ```

mod config;
mod node;
mod telemetry;
mod transfer;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wharf_dagstore::DagStoreError;
use wharf_meta::MetaStore;
use wharf_net::{QueryResponder, QueryServer, QueryServerConfig};
use wharf_piece::PieceStore;
use wharf_types::{
    BlockHash, MinerDeal, MinerDealState, PayloadCid, ProposalCid, RetrievalAsk, TokenAmount,
};

use config::CliConfig;
use node::{Node, build_node};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "wharfd", version, about = "Wharf retrieval market daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override data directory (useful for running multiple instances).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node and serve retrieval queries.
    Run {
        /// Override query listen address (e.g. "127.0.0.1:4830").
        #[arg(short = 'l', long)]
        listen_addr: Option<String>,
    },

    /// List shard records from the local metadata store.
    Shards,

    /// List retrieval deals from the local metadata store.
    Deals,

    /// Show or update the retrieval ask.
    Ask {
        #[command(subcommand)]
        action: AskCommands,
    },

    /// Copy a piece into the piece store and register its shard.
    Import {
        /// File holding the piece data.
        file: PathBuf,

        /// Payload root (hex) to record a storage deal for.
        #[arg(long)]
        payload: Option<String>,

        /// Mark the storage deal as verified.
        #[arg(long)]
        verified: bool,

        /// Index the shard now instead of on first retrieval.
        #[arg(long)]
        eager: bool,
    },

    /// Find the pieces whose shards contain a block.
    Lookup {
        /// Block multihash (hex).
        hash: String,
    },
}

#[derive(Subcommand)]
enum AskCommands {
    /// Print the current ask.
    Get,

    /// Update fields of the current ask; omitted fields keep their value.
    Set {
        #[arg(long)]
        price_per_byte: Option<u128>,

        #[arg(long)]
        unseal_price: Option<u128>,

        /// Bytes sent before the first payment is due.
        #[arg(long)]
        payment_interval: Option<u64>,

        /// Growth of each subsequent payment interval, in bytes.
        #[arg(long)]
        payment_interval_increase: Option<u64>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    // CLI args override config file values.
    if let Some(dir) = cli.data_dir {
        config.node.data_dir = dir;
    }

    match cli.command {
        Commands::Run { listen_addr } => {
            if let Some(addr) = listen_addr {
                config.node.listen_addr = addr;
            }
            cmd_run(config).await
        }
        Commands::Shards => cmd_shards(&config),
        Commands::Deals => cmd_deals(&config),
        Commands::Ask { action } => cmd_ask(&config, action).await,
        Commands::Import {
            file,
            payload,
            verified,
            eager,
        } => cmd_import(&config, file, payload, verified, eager).await,
        Commands::Lookup { hash } => cmd_lookup(&config, &hash).await,
    }
}

// -----------------------------------------------------------------------
// wharfd run
// -----------------------------------------------------------------------

async fn cmd_run(config: CliConfig) -> Result<()> {
    info!("starting wharfd");
    info!(
        data_dir = %config.node.data_dir.display(),
        listen_addr = %config.node.listen_addr,
        block_size = config.block_size(),
        gc_interval = ?config.gc_interval(),
        "node configuration"
    );

    let listen: SocketAddr = config
        .node
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.node.listen_addr))?;

    let node = build_node(&config)?;
    node.start().await.context("failed to start node")?;

    let cancel = CancellationToken::new();
    let logger = node.spawn_event_logger(cancel.clone());

    let responder: Arc<dyn QueryResponder> = node.provider.query_handler();
    let server = QueryServer::bind(listen, responder, QueryServerConfig::default())
        .await
        .with_context(|| format!("failed to bind query listener on {listen}"))?;
    let bound = server.local_addr()?;
    let server_task = tokio::spawn(server.serve(cancel.clone()));

    info!(
        peer_id = %node.peer_id,
        provider = %node.provider.address(),
        query_addr = %bound,
        "wharfd is running. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");

    cancel.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "query server failed"),
        Err(e) => error!(error = %e, "query server task panicked"),
    }
    node.close().await;
    let _ = logger.await;

    info!("shutdown complete");
    Ok(())
}

// -----------------------------------------------------------------------
// wharfd shards / deals
// -----------------------------------------------------------------------

/// Open the metadata store alone, for commands that only read it.
fn open_meta(config: &CliConfig) -> Result<MetaStore> {
    let meta_path = config.meta_dir();
    MetaStore::open(&meta_path).with_context(|| {
        format!(
            "cannot open metadata at {}. Is the node running?",
            meta_path.display()
        )
    })
}

fn cmd_shards(config: &CliConfig) -> Result<()> {
    let meta = open_meta(config)?;
    let shards = meta.list_shards()?;

    println!("Shards: {}", shards.len());
    for record in &shards {
        let error = record.last_error.as_deref().unwrap_or("");
        println!(
            "  {}  {:<12}  lazy={:<5}  {}  {}",
            record.key, record.state, record.lazy, record.source_url, error
        );
    }
    Ok(())
}

fn cmd_deals(config: &CliConfig) -> Result<()> {
    let meta = open_meta(config)?;
    let deals = meta.list_retrieval_deals()?;

    println!("Retrieval deals: {}", deals.len());
    for deal in &deals {
        println!(
            "  {}  {:<22}  payload={}  sent={}  paid={}  {}",
            deal.identifier(),
            deal.status,
            deal.proposal.payload_cid,
            deal.total_sent,
            deal.funds_received,
            deal.message
        );
    }
    Ok(())
}

// -----------------------------------------------------------------------
// wharfd ask
// -----------------------------------------------------------------------

async fn cmd_ask(config: &CliConfig, action: AskCommands) -> Result<()> {
    let node = build_node(config)?;
    let result = run_ask(&node, action);
    node.close().await;
    result
}

fn run_ask(node: &Node, action: AskCommands) -> Result<()> {
    let ask = match action {
        AskCommands::Get => node.provider.get_ask()?,
        AskCommands::Set {
            price_per_byte,
            unseal_price,
            payment_interval,
            payment_interval_increase,
        } => {
            let ask = apply_ask_update(
                node.provider.get_ask()?,
                price_per_byte,
                unseal_price,
                payment_interval,
                payment_interval_increase,
            );
            node.provider.set_ask(&ask)?;
            ask
        }
    };

    println!("Provider:                  {}", node.provider.address());
    println!("Price per byte:            {}", ask.price_per_byte);
    println!("Unseal price:              {}", ask.unseal_price);
    println!("Payment interval:          {}", ask.payment_interval);
    println!("Payment interval increase: {}", ask.payment_interval_increase);
    Ok(())
}

/// Overwrite the fields given on the command line and keep the rest.
fn apply_ask_update(
    mut ask: RetrievalAsk,
    price_per_byte: Option<u128>,
    unseal_price: Option<u128>,
    payment_interval: Option<u64>,
    payment_interval_increase: Option<u64>,
) -> RetrievalAsk {
    if let Some(price) = price_per_byte {
        ask.price_per_byte = TokenAmount::new(price);
    }
    if let Some(price) = unseal_price {
        ask.unseal_price = TokenAmount::new(price);
    }
    if let Some(interval) = payment_interval {
        ask.payment_interval = interval;
    }
    if let Some(increase) = payment_interval_increase {
        ask.payment_interval_increase = increase;
    }
    ask
}

// -----------------------------------------------------------------------
// wharfd import
// -----------------------------------------------------------------------

async fn cmd_import(
    config: &CliConfig,
    file: PathBuf,
    payload: Option<String>,
    verified: bool,
    eager: bool,
) -> Result<()> {
    let payload: Option<PayloadCid> = payload
        .map(|hex| hex.parse())
        .transpose()
        .context("invalid payload cid")?;
    let data = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let node = build_node(config)?;
    let result = import_piece(&node, Bytes::from(data), payload, verified, eager).await;
    node.close().await;
    let piece_cid = result?;

    println!("Piece:   {piece_cid}");
    if let Some(payload) = payload {
        println!("Payload: {payload}");
    }
    Ok(())
}

/// Store `data` as a piece and register its shard. With a payload CID, also
/// record an active storage deal so the payload can be retrieved.
async fn import_piece(
    node: &Node,
    data: Bytes,
    payload: Option<PayloadCid>,
    verified: bool,
    eager: bool,
) -> Result<wharf_types::PieceCid> {
    let size = data.len() as u64;
    let piece_cid = node.pieces.put(data).await.context("failed to store piece")?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    match node.dagstore.register_shard(piece_cid, "", eager, Some(tx)) {
        Ok(()) => rx
            .await
            .context("shard registration dropped")?
            .context("failed to register shard")?,
        Err(DagStoreError::ShardExists(_)) => info!(%piece_cid, "shard already registered"),
        Err(e) => return Err(e).context("failed to register shard"),
    }

    if let Some(payload_cid) = payload {
        let mut seed = piece_cid.as_bytes().to_vec();
        seed.extend_from_slice(payload_cid.as_bytes());
        let deal = MinerDeal {
            proposal_cid: ProposalCid::from_data(&seed),
            client: node.peer_id,
            provider: node.provider.address(),
            payload_cid,
            piece_cid,
            piece_size: size,
            state: MinerDealState::Active,
            sector: 0,
            offset: 0,
            length: size,
            verified,
            fast_retrieval: true,
        };
        node.meta.put_miner_deal(&deal)?;
        info!(%piece_cid, %payload_cid, proposal = %deal.proposal_cid, "recorded storage deal");
    }
    Ok(piece_cid)
}

// -----------------------------------------------------------------------
// wharfd lookup
// -----------------------------------------------------------------------

async fn cmd_lookup(config: &CliConfig, hash: &str) -> Result<()> {
    let hash: BlockHash = hash.parse().context("invalid block hash")?;
    let node = build_node(config)?;
    let result = node.dagstore.get_pieces_containing_block(&hash);
    node.close().await;

    match result {
        Ok(pieces) => {
            println!("Block {hash} found in {} piece(s):", pieces.len());
            for piece in pieces {
                println!("  {piece}");
            }
            Ok(())
        }
        Err(DagStoreError::BlockNotFound(_)) => {
            println!("Block {hash} not found in any indexed shard");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
