//! [`DagStoreWrapper`]: the retrieval-facing face of the dagstore.
//!
//! Maps pieces to shards, registers them on demand, gates loads on recovery
//! of errored shards, and runs the GC and failure-recovery loops for the
//! lifetime of the node.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wharf_piece::PieceAccessor;
use wharf_types::{BlockHash, MinerDeal, PieceCid, ShardKey, ShardState};

use crate::blockstore::ShardAccessor;
use crate::error::DagStoreError;
use crate::mount::{Mount, MountRegistry, PieceMount};
use crate::store::{DagStore, RegisterOpts, ShardFailure, ShardInfo, ShardResult};

type Result<T> = std::result::Result<T, DagStoreError>;

/// Attempts `load_shard` makes to resolve an unknown shard by registering it.
pub const MAX_REGISTER_ATTEMPTS: u32 = 5;

/// Marker written once every pre-existing deal has been registered.
pub const REGISTRATION_MARKER: &str = ".shard-registration-complete";

/// Settings for [`DagStoreWrapper`].
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    /// Directory holding the registration marker.
    pub root_dir: PathBuf,
    /// Period of the transient GC loop.
    pub gc_interval: Duration,
    /// Automatic recoveries attempted per shard before giving up on it.
    pub max_recovery_attempts: u32,
    /// How long `close` waits for the background loops to exit.
    pub close_timeout: Duration,
}

impl WrapperConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            gc_interval: Duration::from_secs(60),
            max_recovery_attempts: 3,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// The dagstore as seen by the retrieval market.
///
/// Shards are keyed by piece CID and registered on demand. The wrapper also
/// owns the background GC and failure recovery loops.
pub struct DagStoreWrapper {
    store: Arc<DagStore>,
    accessor: Arc<dyn PieceAccessor>,
    mounts: MountRegistry,
    config: WrapperConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DagStoreWrapper {
    pub fn new(
        store: Arc<DagStore>,
        accessor: Arc<dyn PieceAccessor>,
        mounts: MountRegistry,
        config: WrapperConfig,
    ) -> Self {
        Self {
            store,
            accessor,
            mounts,
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<DagStore> {
        &self.store
    }

    /// Spawn the GC and recovery loops.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("wrapper task lock poisoned");
        if !tasks.is_empty() {
            warn!("dagstore wrapper already started");
            return;
        }

        tasks.push(tokio::spawn(gc_loop(
            self.store.clone(),
            self.config.gc_interval,
            self.cancel.clone(),
        )));

        match self.store.take_failures() {
            Some(failures) => tasks.push(tokio::spawn(recovery_loop(
                self.store.clone(),
                failures,
                self.config.max_recovery_attempts,
                self.cancel.clone(),
            ))),
            None => warn!("shard failure channel already taken; automatic recovery disabled"),
        }
        info!(gc_interval = ?self.config.gc_interval, "dagstore wrapper started");
    }

    /// Stop the background loops and wait (bounded) for them to exit.
    pub async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> =
            std::mem::take(&mut *self.tasks.lock().expect("wrapper task lock poisoned"));
        for task in tasks {
            match tokio::time::timeout(self.config.close_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "dagstore background task panicked"),
                Err(_) => warn!("dagstore background task did not stop in time"),
            }
        }
        info!("dagstore wrapper closed");
    }

    // ----- Shards -----

    /// Register the shard for `piece`.
    ///
    /// Without a result channel, a shard that already exists in `New`,
    /// `Available` or `Serving` is left alone. `source_hint` may be empty
    /// (serve from piece storage), a mount URL, or the path of data already
    /// on local disk.
    pub fn register_shard(
        &self,
        piece: PieceCid,
        source_hint: &str,
        eager_init: bool,
        result_tx: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let key = ShardKey::from(piece);
        if result_tx.is_none()
            && let Ok(info) = self.store.get_shard_info(&key)
            && matches!(
                info.state(),
                ShardState::New | ShardState::Available | ShardState::Serving
            )
        {
            debug!(%piece, state = %info.state(), "shard already registered");
            return Ok(());
        }

        let mut opts = RegisterOpts {
            lazy: !eager_init,
            existing_transient: None,
        };
        let mount: Arc<dyn Mount> = if source_hint.contains("://") {
            self.mounts.instantiate(source_hint)?
        } else {
            if !source_hint.is_empty() {
                opts.existing_transient = Some(PathBuf::from(source_hint));
            }
            Arc::new(PieceMount::new(piece, self.accessor.clone()))
        };

        let rx = self.store.register_shard(key, mount, opts)?;
        forward(rx, result_tx);
        Ok(())
    }

    /// Acquire the shard for `piece`, registering or recovering it first
    /// when needed. Returns [`DagStoreError::Cancelled`] as soon as `cancel`
    /// fires; the underlying operation still completes in the background.
    pub async fn load_shard(
        &self,
        piece: PieceCid,
        cancel: &CancellationToken,
    ) -> Result<ShardAccessor> {
        let key = ShardKey::from(piece);

        let info = lookup_or_register(
            &key,
            || self.store.get_shard_info(&key),
            move |attempt| async move {
                debug!(%piece, attempt, "shard unknown, registering lazily");
                let (tx, rx) = oneshot::channel();
                match self.register_shard(piece, "", false, Some(tx)) {
                    Ok(()) => wait(rx, cancel).await?,
                    // Lost a race with another registration; look again.
                    Err(DagStoreError::ShardExists(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            },
        )
        .await?;

        if info.state() == ShardState::Errored {
            info!(
                %piece,
                last_error = ?info.record.last_error,
                "recovering errored shard before load"
            );
            let rx = self.store.recover_shard(&key)?;
            if let Err(e) = wait(rx, cancel).await? {
                return Err(DagStoreError::RecoveryFailed {
                    key,
                    reason: e.to_string(),
                });
            }
        }

        let rx = self.store.acquire_shard(&key)?;
        let accessor = wait(rx, cancel).await??;
        debug!(%piece, "loaded shard");
        Ok(accessor)
    }

    /// Destroy the shard for `piece`. The outcome is sent on `result_tx` when
    /// one is given.
    pub fn destroy_shard(
        &self,
        piece: PieceCid,
        result_tx: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let rx = self.store.destroy_shard(&ShardKey::from(piece))?;
        forward(rx, result_tx);
        Ok(())
    }

    /// Pieces whose shards contain `hash`. Fails with
    /// [`DagStoreError::BlockNotFound`] when no shard does.
    pub fn get_pieces_containing_block(&self, hash: &BlockHash) -> Result<Vec<PieceCid>> {
        let keys = self.store.top_index().get_shards_for_multihash(hash)?;
        let mut pieces = Vec::with_capacity(keys.len());
        for key in keys {
            match key.piece_cid() {
                Ok(piece) => pieces.push(piece),
                Err(e) => warn!(%key, error = %e, "top index holds a non-piece shard key"),
            }
        }
        Ok(pieces)
    }

    /// Lazily register a shard for every deal already handed to sealing.
    ///
    /// Runs at most once per data directory: a marker file records
    /// completion. Returns `false` when the marker was already present.
    /// Per-deal failures are logged and do not stop the run.
    pub async fn migrate_deals(&self, deals: &[MinerDeal]) -> Result<bool> {
        let marker = self.config.root_dir.join(REGISTRATION_MARKER);
        if tokio::fs::try_exists(&marker).await? {
            debug!("shard registration already complete");
            return Ok(false);
        }

        let mut registered = 0usize;
        let mut failed = 0usize;
        for deal in deals.iter().filter(|d| d.state.is_handed_to_sealing()) {
            let key = ShardKey::from(deal.piece_cid);
            if self.store.get_shard_info(&key).is_ok() {
                continue;
            }
            match self.register_shard(deal.piece_cid, "", false, None) {
                Ok(()) => registered += 1,
                Err(DagStoreError::ShardExists(_)) => {}
                Err(e) => {
                    failed += 1;
                    warn!(
                        proposal = %deal.proposal_cid,
                        piece = %deal.piece_cid,
                        error = %e,
                        "failed to register shard for deal"
                    );
                }
            }
        }

        write_marker(&marker).await?;
        info!(registered, failed, "registered shards for existing deals");
        Ok(true)
    }
}

async fn write_marker(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, b"").await
}

/// Look `key` up, registering it while unknown, at most
/// [`MAX_REGISTER_ATTEMPTS`] times. A registration is always followed by a
/// fresh lookup, so one that succeeds on the last attempt still counts.
pub(crate) async fn lookup_or_register<L, R, F>(
    key: &ShardKey,
    mut lookup: L,
    mut register: R,
) -> Result<ShardInfo>
where
    L: FnMut() -> Result<ShardInfo>,
    R: FnMut(u32) -> F,
    F: Future<Output = Result<()>>,
{
    let mut attempts = 0;
    loop {
        match lookup() {
            Ok(info) => return Ok(info),
            Err(DagStoreError::ShardUnknown(_)) if attempts < MAX_REGISTER_ATTEMPTS => {
                attempts += 1;
                register(attempts).await?;
            }
            Err(DagStoreError::ShardUnknown(_)) => {
                return Err(DagStoreError::RetriesExhausted {
                    key: key.clone(),
                    attempts,
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wait for an operation result unless `cancel` fires first.
async fn wait<T>(rx: ShardResult<T>, cancel: &CancellationToken) -> Result<Result<T>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DagStoreError::Cancelled),
        res = rx => Ok(res?),
    }
}

/// Relay an operation result to an optional caller channel.
fn forward(rx: ShardResult<()>, tx: Option<oneshot::Sender<Result<()>>>) {
    let Some(tx) = tx else {
        return;
    };
    tokio::spawn(async move {
        let result = rx.await.unwrap_or(Err(DagStoreError::Closed));
        let _ = tx.send(result);
    });
}

/// Reclaim idle transients every `period` until cancelled.
async fn gc_loop(store: Arc<DagStore>, period: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(period);
    // The first tick fires immediately.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        match store.gc().await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(reclaimed = reclaimed.len(), "dagstore gc reclaimed transients");
            }
            Ok(_) => debug!("dagstore gc: nothing to reclaim"),
            Err(e) => error!(error = %e, "dagstore gc failed"),
        }
    }
    debug!("gc loop stopped");
}

/// Recover shards reported as failed. Each shard gets at most `max_attempts`
/// recoveries over the life of the loop.
async fn recovery_loop(
    store: Arc<DagStore>,
    mut failures: mpsc::Receiver<ShardFailure>,
    max_attempts: u32,
    cancel: CancellationToken,
) {
    let mut attempts: HashMap<ShardKey, u32> = HashMap::new();
    loop {
        let failure = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = failures.recv() => match msg {
                Some(f) => f,
                None => break,
            },
        };

        let tried = attempts.entry(failure.key.clone()).or_insert(0);
        if *tried >= max_attempts {
            warn!(key = %failure.key, attempts = *tried, "giving up on shard recovery");
            continue;
        }
        *tried += 1;
        info!(
            key = %failure.key,
            attempt = *tried,
            error = %failure.error,
            "recovering failed shard"
        );

        let rx = match store.recover_shard(&failure.key) {
            Ok(rx) => rx,
            Err(e) => {
                debug!(key = %failure.key, error = %e, "shard gone before recovery");
                continue;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = rx => match res {
                Ok(Ok(())) => info!(key = %failure.key, "shard recovered"),
                Ok(Err(e)) => warn!(key = %failure.key, error = %e, "shard recovery failed"),
                Err(_) => warn!(key = %failure.key, "shard recovery abandoned"),
            },
        }
    }
    debug!("recovery loop stopped");
}
