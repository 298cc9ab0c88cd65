//! Node assembly: opens the stores and wires the dagstore and the retrieval
//! provider together in dependency order.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wharf_dagstore::{
    DagStore, DagStoreConfig, DagStoreWrapper, FileMountFactory, MountRegistry, PieceMountFactory,
    WrapperConfig,
};
use wharf_meta::MetaStore;
use wharf_piece::{FilePieceStore, PieceAccessor};
use wharf_retrieval::{
    AcceptAll, DefaultPricing, PaymentAddresses, ProviderDeps, RetrievalProvider, VoucherLedger,
};
use wharf_types::events::{DealUpdated, EventBus, ShardFailed};
use wharf_types::{DealStatus, PeerId};

use crate::config::CliConfig;
use crate::transfer::LocalTransfer;

/// Every long-lived component of a running daemon.
pub struct Node {
    pub peer_id: PeerId,
    pub meta: Arc<MetaStore>,
    pub events: EventBus,
    pub pieces: Arc<FilePieceStore>,
    pub dagstore: Arc<DagStoreWrapper>,
    /// Channel state for deals served by this node.
    pub transfer: Arc<LocalTransfer>,
    pub provider: Arc<RetrievalProvider>,
}

/// Open every store under the configured data directory and build the
/// provider on top. Nothing is started yet.
pub fn build_node(config: &CliConfig) -> Result<Node> {
    let data_dir = &config.node.data_dir;
    std::fs::create_dir_all(data_dir).context("failed to create data directory")?;
    let peer_id = load_or_create_peer_id(data_dir)?;

    let meta = Arc::new(
        MetaStore::open(config.meta_dir())
            .with_context(|| format!("cannot open metadata at {}", config.meta_dir().display()))?,
    );
    let events = EventBus::new();

    let pieces = Arc::new(
        FilePieceStore::new(config.pieces_dir()).context("failed to initialize piece store")?,
    );
    let accessor: Arc<dyn PieceAccessor> = pieces.clone();

    let mounts = MountRegistry::new()
        .with(Arc::new(PieceMountFactory::new(accessor.clone())))
        .with(Arc::new(FileMountFactory));
    let store_config = DagStoreConfig {
        block_size: config.block_size(),
        max_concurrent_index: config.max_concurrent_index(),
        ..DagStoreConfig::new(config.dagstore_dir().join("transients"))
    };
    let store = DagStore::open(meta.clone(), &mounts, store_config, events.clone())
        .context("failed to open dagstore")?;
    let wrapper_config = WrapperConfig {
        gc_interval: config.gc_interval(),
        max_recovery_attempts: config.max_recovery_attempts(),
        ..WrapperConfig::new(config.dagstore_dir())
    };
    let dagstore = Arc::new(DagStoreWrapper::new(store, accessor.clone(), mounts, wrapper_config));

    let provider_address = config.provider_address()?;
    let payment_address = config.payment_address()?;
    let transfer = Arc::new(LocalTransfer::new());
    let provider = Arc::new(RetrievalProvider::new(
        provider_address,
        ProviderDeps {
            meta: meta.clone(),
            events: events.clone(),
            dagstore: dagstore.clone(),
            pieces: accessor,
            transfer: transfer.clone(),
            paych: Arc::new(VoucherLedger::new()),
            payment: Arc::new(PaymentAddresses::new().with(provider_address, payment_address)),
            pricing: Arc::new(DefaultPricing {
                verified_deals_free_transfer: config.retrieval.verified_deals_free_transfer,
            }),
            decider: Arc::new(AcceptAll),
        },
    ));

    info!(
        %peer_id,
        provider = %provider_address,
        payment = %payment_address,
        data_dir = %data_dir.display(),
        "node assembled"
    );
    Ok(Node {
        peer_id,
        meta,
        events,
        pieces,
        dagstore,
        transfer,
        provider,
    })
}

impl Node {
    /// Start background loops, register shards for existing storage deals
    /// and resume interrupted retrievals.
    pub async fn start(&self) -> Result<()> {
        self.dagstore.start();
        let deals = self.meta.list_miner_deals().context("failed to list storage deals")?;
        if self.dagstore.migrate_deals(&deals).await? {
            info!(deals = deals.len(), "registered shards for existing storage deals");
        }
        self.provider.start().await?;
        Ok(())
    }

    /// Log deal and shard events until `cancel` fires.
    pub fn spawn_event_logger(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut deals = self.events.subscribe::<DealUpdated>();
        let mut shards = self.events.subscribe::<ShardFailed>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(event) = deals.recv() => match event.status {
                        DealStatus::Errored | DealStatus::Cancelled | DealStatus::Rejected => {
                            warn!(
                                deal = %event.deal,
                                status = %event.status,
                                message = %event.message,
                                "deal ended"
                            );
                        }
                        status => info!(deal = %event.deal, %status, "deal updated"),
                    },
                    Some(event) = shards.recv() => {
                        warn!(shard = %event.key, error = %event.error, "shard failed");
                    }
                    else => break,
                }
            }
        })
    }

    /// Stop the provider, then shut the dagstore's background loops down.
    pub async fn close(&self) {
        self.provider.close();
        self.dagstore.close().await;
    }
}

/// Load the node's peer id from `data_dir/node.id`, creating one on first
/// start.
pub fn load_or_create_peer_id(data_dir: &Path) -> Result<PeerId> {
    let path = data_dir.join("node.id");
    if path.exists() {
        let hex = std::fs::read_to_string(&path).context("failed to read node id")?;
        return hex.trim().parse().context("invalid node id file");
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(data_dir.to_string_lossy().as_bytes());
    let peer_id = PeerId::from(*hasher.finalize().as_bytes());

    std::fs::write(&path, peer_id.to_string()).context("failed to write node id")?;
    info!(path = %path.display(), %peer_id, "generated new node id");
    Ok(peer_id)
}
