//! [`DagStore`]: shard registry and state machine.
//!
//! Shard records live in the metadata store; this type keeps the live side
//! (mount, open accessor count, per-shard operation lock). Every state
//! changing operation runs in a spawned task holding that shard's operation
//! lock and reports on a oneshot channel, so callers may stop waiting at any
//! time without aborting the work.
//!
//! State machine:
//!
//! ```text
//! register(lazy) ─► New ──acquire──► Initializing ─► Available ◄─► Serving
//! register(eager) ─────────────────► Initializing ─┘
//!                                        │ failure
//!                                        ▼
//!                                     Errored ──recover──► Initializing
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use wharf_meta::MetaStore;
use wharf_types::events::{EventBus, ShardFailed, ShardReady};
use wharf_types::{ShardKey, ShardRecord, ShardState};

use crate::blockstore::{ReadOnlyBlockstore, ShardAccessor};
use crate::error::DagStoreError;
use crate::index::{Chunker, ShardIndex, TopIndex};
use crate::mount::{Mount, MountRegistry, UnresolvedMount};

type Result<T> = std::result::Result<T, DagStoreError>;

/// Receiver for the outcome of an asynchronous shard operation.
pub type ShardResult<T> = oneshot::Receiver<Result<T>>;

/// Settings for [`DagStore::open`].
#[derive(Debug, Clone)]
pub struct DagStoreConfig {
    /// Directory holding local copies of fetched shard data.
    pub transients_dir: PathBuf,
    /// Size of the blocks shards are split into when indexed.
    pub block_size: u32,
    /// Upper bound on shards fetched and indexed at the same time.
    pub max_concurrent_index: usize,
    pub failure_channel_capacity: usize,
}

impl DagStoreConfig {
    /// Defaults: 256 KiB blocks and four concurrent index jobs.
    pub fn new(transients_dir: impl Into<PathBuf>) -> Self {
        Self {
            transients_dir: transients_dir.into(),
            block_size: 256 * 1024,
            max_concurrent_index: 4,
            failure_channel_capacity: 128,
        }
    }
}

/// Options for [`DagStore::register_shard`].
#[derive(Debug, Clone, Default)]
pub struct RegisterOpts {
    /// Defer fetch and indexing until the first acquire.
    pub lazy: bool,
    /// Shard data already present on local disk.
    pub existing_transient: Option<PathBuf>,
}

/// Snapshot of a shard's record and reference count.
#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub record: ShardRecord,
    /// Open accessors.
    pub refs: usize,
}

impl ShardInfo {
    pub fn state(&self) -> ShardState {
        self.record.state
    }
}

/// Notification that a shard entered `Errored`.
#[derive(Debug, Clone)]
pub struct ShardFailure {
    pub key: ShardKey,
    pub error: String,
}

struct ShardEntry {
    key: ShardKey,
    mount: Arc<dyn Mount>,
    /// Serializes register/acquire/recover/destroy/gc on this shard.
    op: tokio::sync::Mutex<()>,
    refs: Mutex<usize>,
}

impl ShardEntry {
    fn new(key: ShardKey, mount: Arc<dyn Mount>) -> Arc<Self> {
        Arc::new(Self {
            key,
            mount,
            op: tokio::sync::Mutex::new(()),
            refs: Mutex::new(0),
        })
    }

    fn refs(&self) -> usize {
        *self.refs.lock().expect("shard refs lock poisoned")
    }
}

/// One open accessor's claim on a shard. Dropping the last claim moves the
/// shard from `Serving` back to `Available`.
pub(crate) struct ShardRef {
    entry: Arc<ShardEntry>,
    meta: Arc<MetaStore>,
}

impl ShardRef {
    /// Mark the shard `Serving` and take a reference. The refs lock is held
    /// across the write so a concurrent release cannot persist `Available` in
    /// between.
    fn acquire(
        entry: Arc<ShardEntry>,
        meta: Arc<MetaStore>,
        record: &mut ShardRecord,
    ) -> Result<Self> {
        let mut refs = entry.refs.lock().expect("shard refs lock poisoned");
        record.set_state(ShardState::Serving);
        meta.put_shard(record)?;
        *refs += 1;
        drop(refs);
        Ok(Self { entry, meta })
    }
}

impl Drop for ShardRef {
    fn drop(&mut self) {
        let mut refs = self.entry.refs.lock().expect("shard refs lock poisoned");
        *refs = refs.saturating_sub(1);
        if *refs > 0 {
            return;
        }
        match self.meta.get_shard(&self.entry.key) {
            Ok(Some(mut record)) if record.state == ShardState::Serving => {
                record.set_state(ShardState::Available);
                if let Err(e) = self.meta.put_shard(&record) {
                    error!(key = %self.entry.key, error = %e, "failed to persist shard release");
                }
            }
            Ok(_) => {}
            Err(e) => error!(key = %self.entry.key, error = %e, "failed to load shard on release"),
        }
        debug!(key = %self.entry.key, "released last shard accessor");
    }
}

/// Shard registry backed by the meta store.
///
/// Every operation on a shard is serialized by that shard's own lock, so
/// operations on different shards run concurrently. Block lookups across
/// shards go through [`TopIndex`].
pub struct DagStore {
    meta: Arc<MetaStore>,
    top: TopIndex,
    config: DagStoreConfig,
    chunker: Chunker,
    shards: Mutex<HashMap<ShardKey, Arc<ShardEntry>>>,
    index_permits: Semaphore,
    failures_tx: mpsc::Sender<ShardFailure>,
    failures_rx: Mutex<Option<mpsc::Receiver<ShardFailure>>>,
    events: EventBus,
}

impl DagStore {
    /// Open the dagstore and restore every persisted shard.
    ///
    /// Shards that were `Serving` come back `Available` (no accessor
    /// survives a restart); shards caught mid-initialization, or whose
    /// mount URL no longer resolves, come back `Errored` and are reported on
    /// the failure channel.
    pub fn open(
        meta: Arc<MetaStore>,
        mounts: &MountRegistry,
        config: DagStoreConfig,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.transients_dir)?;
        let (failures_tx, failures_rx) = mpsc::channel(config.failure_channel_capacity.max(1));
        let store = Arc::new(Self {
            top: TopIndex::new(meta.clone()),
            chunker: Chunker::new(config.block_size),
            index_permits: Semaphore::new(config.max_concurrent_index.max(1)),
            shards: Mutex::new(HashMap::new()),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
            meta,
            config,
            events,
        });

        let records = store.meta.list_shards()?;
        let restored = records.len();
        for mut record in records {
            let mount = match mounts.instantiate(&record.source_url) {
                Ok(mount) => mount,
                Err(e) => {
                    warn!(
                        key = %record.key,
                        url = %record.source_url,
                        error = %e,
                        "cannot resolve shard mount"
                    );
                    let reason = e.to_string();
                    record.set_errored(format!("mount: {reason}"));
                    Arc::new(UnresolvedMount {
                        url: record.source_url.clone(),
                        reason,
                    })
                }
            };
            match record.state {
                ShardState::Serving => record.set_state(ShardState::Available),
                ShardState::Initializing => record.set_errored("interrupted during initialization"),
                _ => {}
            }
            store.meta.put_shard(&record)?;
            if record.state == ShardState::Errored {
                let reason = record.last_error.clone().unwrap_or_default();
                store.notify_failure(&record.key, reason);
            }
            store
                .shards
                .lock()
                .expect("shard table lock poisoned")
                .insert(record.key.clone(), ShardEntry::new(record.key, mount));
        }
        info!(restored, "dagstore opened");
        Ok(store)
    }

    /// Node-wide block to shard index.
    pub fn top_index(&self) -> &TopIndex {
        &self.top
    }

    /// Take the failure receiver. Only the first caller gets it.
    pub fn take_failures(&self) -> Option<mpsc::Receiver<ShardFailure>> {
        self.failures_rx
            .lock()
            .expect("failure receiver lock poisoned")
            .take()
    }

    // ----- Operations -----

    /// Register a new shard. Fails synchronously with
    /// [`DagStoreError::ShardExists`] if the key is taken.
    ///
    /// Lazy registrations complete immediately; eager ones report once the
    /// shard is fetched and indexed.
    pub fn register_shard(
        self: &Arc<Self>,
        key: ShardKey,
        mount: Arc<dyn Mount>,
        opts: RegisterOpts,
    ) -> Result<ShardResult<()>> {
        let (tx, rx) = oneshot::channel();
        let entry = {
            let mut shards = self.shards.lock().expect("shard table lock poisoned");
            if shards.contains_key(&key) {
                return Err(DagStoreError::ShardExists(key));
            }
            let mut record = ShardRecord::new(key.clone(), mount.url(), opts.lazy);
            record.transient_path = opts
                .existing_transient
                .as_ref()
                .map(|p| p.display().to_string());
            self.meta.put_shard(&record)?;
            let entry = ShardEntry::new(key.clone(), mount);
            shards.insert(key.clone(), entry.clone());
            entry
        };
        info!(%key, lazy = opts.lazy, "registered shard");

        if opts.lazy {
            let _ = tx.send(Ok(()));
            return Ok(rx);
        }
        let store = self.clone();
        tokio::spawn(async move {
            let _op = entry.op.lock().await;
            let _ = tx.send(store.initialize(&entry).await);
        });
        Ok(rx)
    }

    /// Acquire a shard for reading, initializing it first if needed.
    pub fn acquire_shard(self: &Arc<Self>, key: &ShardKey) -> Result<ShardResult<ShardAccessor>> {
        let entry = self.entry(key)?;
        let (tx, rx) = oneshot::channel();
        let store = self.clone();
        tokio::spawn(async move {
            let _op = entry.op.lock().await;
            let result = store.acquire(&entry).await;
            if let Err(Ok(accessor)) = tx.send(result) {
                debug!(key = %entry.key, "acquire result abandoned by caller");
                drop(accessor);
            }
        });
        Ok(rx)
    }

    /// Re-initialize an `Errored` shard. A no-op for any other state.
    pub fn recover_shard(self: &Arc<Self>, key: &ShardKey) -> Result<ShardResult<()>> {
        let entry = self.entry(key)?;
        let (tx, rx) = oneshot::channel();
        let store = self.clone();
        tokio::spawn(async move {
            let _op = entry.op.lock().await;
            let result = match store.record(&entry.key) {
                Ok(record) if record.state == ShardState::Errored => {
                    info!(key = %entry.key, last_error = ?record.last_error, "recovering shard");
                    store.initialize(&entry).await
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            };
            let _ = tx.send(result);
        });
        Ok(rx)
    }

    /// Remove a shard's record, block index and owned transient data.
    pub fn destroy_shard(self: &Arc<Self>, key: &ShardKey) -> Result<ShardResult<()>> {
        let entry = self.entry(key)?;
        let (tx, rx) = oneshot::channel();
        let store = self.clone();
        tokio::spawn(async move {
            let _op = entry.op.lock().await;
            let _ = tx.send(store.destroy(&entry).await);
        });
        Ok(rx)
    }

    pub fn get_shard_info(&self, key: &ShardKey) -> Result<ShardInfo> {
        let entry = self.entry(key)?;
        Ok(ShardInfo {
            record: self.record(key)?,
            refs: entry.refs(),
        })
    }

    /// Every registered shard, including errored ones.
    pub fn all_shards(&self) -> Result<Vec<ShardInfo>> {
        let entries: Vec<_> = self
            .shards
            .lock()
            .expect("shard table lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.meta.get_shard(&entry.key)? {
                Some(record) => infos.push(ShardInfo {
                    record,
                    refs: entry.refs(),
                }),
                None => continue,
            }
        }
        infos.sort_by(|a, b| a.record.key.cmp(&b.record.key));
        Ok(infos)
    }

    /// Delete transient copies of shards nobody is reading. Shards busy with
    /// another operation are skipped until the next round. Returns the keys
    /// whose transients were reclaimed.
    pub async fn gc(&self) -> Result<Vec<ShardKey>> {
        let entries: Vec<_> = self
            .shards
            .lock()
            .expect("shard table lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut reclaimed = Vec::new();
        for entry in entries {
            let Ok(_op) = entry.op.try_lock() else {
                continue;
            };
            if entry.refs() > 0 {
                continue;
            }
            let Some(mut record) = self.meta.get_shard(&entry.key)? else {
                continue;
            };
            if !matches!(record.state, ShardState::Available | ShardState::Errored) {
                continue;
            }
            let Some(path) = record.transient_path.clone() else {
                continue;
            };
            if !self.owns_transient(Path::new(&path)) {
                continue;
            }
            remove_if_exists(Path::new(&path)).await?;
            record.transient_path = None;
            self.meta.put_shard(&record)?;
            debug!(key = %entry.key, %path, "reclaimed transient");
            reclaimed.push(entry.key.clone());
        }
        Ok(reclaimed)
    }

    // ----- Internals -----

    fn entry(&self, key: &ShardKey) -> Result<Arc<ShardEntry>> {
        self.shards
            .lock()
            .expect("shard table lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| DagStoreError::ShardUnknown(key.clone()))
    }

    fn record(&self, key: &ShardKey) -> Result<ShardRecord> {
        self.meta
            .get_shard(key)?
            .ok_or_else(|| DagStoreError::ShardUnknown(key.clone()))
    }

    /// Fetch, index and mark `Available`, or mark `Errored`.
    async fn initialize(&self, entry: &ShardEntry) -> Result<()> {
        let mut record = self.record(&entry.key)?;
        record.set_state(ShardState::Initializing);
        self.meta.put_shard(&record)?;

        match self.fetch_and_index(entry, &mut record).await {
            Ok(_) => {
                record.set_state(ShardState::Available);
                self.meta.put_shard(&record)?;
                self.events.emit(ShardReady {
                    key: entry.key.clone(),
                });
                info!(key = %entry.key, "shard available");
                Ok(())
            }
            Err(e) => {
                self.fail(&mut record, &e)?;
                Err(e)
            }
        }
    }

    /// Open an accessor on `entry`, initializing a lazy shard first. Any load
    /// failure moves the shard to `Errored`.
    async fn acquire(&self, entry: &Arc<ShardEntry>) -> Result<ShardAccessor> {
        let mut record = self.record(&entry.key)?;
        let loaded = match record.state {
            ShardState::Errored => {
                return Err(DagStoreError::ShardErrored {
                    key: entry.key.clone(),
                    reason: record.last_error.clone().unwrap_or_default(),
                });
            }
            ShardState::New | ShardState::Initializing => {
                record.set_state(ShardState::Initializing);
                self.meta.put_shard(&record)?;
                self.fetch_and_index(entry, &mut record).await
            }
            ShardState::Available | ShardState::Serving => self.load_data(entry, &mut record).await,
        };
        let data = match loaded {
            Ok(data) => data,
            Err(e) => {
                self.fail(&mut record, &e)?;
                return Err(e);
            }
        };

        let blocks = match self.meta.get_shard_index(&entry.key)? {
            Some(blocks) => blocks,
            None => self.index(&entry.key, &data)?,
        };
        let index = Arc::new(ShardIndex::new(blocks));
        let shard_ref = ShardRef::acquire(entry.clone(), self.meta.clone(), &mut record)?;
        debug!(key = %entry.key, refs = entry.refs(), "acquired shard");

        let blockstore = ReadOnlyBlockstore::new(entry.key.clone(), data, index);
        Ok(ShardAccessor::new(blockstore, entry.mount.clone(), shard_ref))
    }

    /// Drop the record and any transient we own. Fails while accessors are open.
    async fn destroy(&self, entry: &ShardEntry) -> Result<()> {
        let refs = entry.refs();
        if refs > 0 {
            return Err(DagStoreError::ShardInUse {
                key: entry.key.clone(),
                refs,
            });
        }
        if let Some(record) = self.meta.get_shard(&entry.key)?
            && let Some(path) = record.transient_path.as_deref()
            && self.owns_transient(Path::new(path))
        {
            remove_if_exists(Path::new(path)).await?;
        }
        self.meta.delete_shard(&entry.key)?;
        self.shards
            .lock()
            .expect("shard table lock poisoned")
            .remove(&entry.key);
        info!(key = %entry.key, "destroyed shard");
        Ok(())
    }

    /// Bounded by `max_concurrent_index`.
    async fn fetch_and_index(&self, entry: &ShardEntry, record: &mut ShardRecord) -> Result<Bytes> {
        let _permit = self
            .index_permits
            .acquire()
            .await
            .map_err(|_| DagStoreError::Closed)?;
        let data = self.load_data(entry, record).await?;
        self.index(&entry.key, &data)?;
        Ok(data)
    }

    /// Chunk `data` and write the shard index and the top index in one batch.
    fn index(&self, key: &ShardKey, data: &[u8]) -> Result<Vec<wharf_types::BlockLocation>> {
        let blocks = self.chunker.index(data);
        self.top.add_shard_blocks(key, &blocks)?;
        debug!(%key, blocks = blocks.len(), "indexed shard");
        Ok(blocks)
    }

    /// Read the transient copy, fetching it through the mount when absent.
    async fn load_data(&self, entry: &ShardEntry, record: &mut ShardRecord) -> Result<Bytes> {
        if let Some(path) = record.transient_path.clone() {
            match tokio::fs::read(&path).await {
                Ok(data) => return Ok(Bytes::from(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(key = %entry.key, %path, "transient missing, refetching");
                    record.transient_path = None;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let data = entry.mount.fetch().await?;
        let path = self.transient_path(&entry.key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        record.transient_path = Some(path.display().to_string());
        debug!(key = %entry.key, size = data.len(), "fetched shard data");
        Ok(data)
    }

    /// Persist the error and tell the recovery loop about it.
    fn fail(&self, record: &mut ShardRecord, e: &DagStoreError) -> Result<()> {
        warn!(key = %record.key, error = %e, "shard errored");
        record.set_errored(e.to_string());
        self.meta.put_shard(record)?;
        let reason = record.last_error.clone().unwrap_or_default();
        self.notify_failure(&record.key, reason);
        Ok(())
    }

    fn notify_failure(&self, key: &ShardKey, error: String) {
        self.events.emit(ShardFailed {
            key: key.clone(),
            error: error.clone(),
        });
        let failure = ShardFailure {
            key: key.clone(),
            error,
        };
        if let Err(e) = self.failures_tx.try_send(failure) {
            warn!(%key, error = %e, "dropped shard failure notification");
        }
    }

    fn transient_path(&self, key: &ShardKey) -> PathBuf {
        self.config.transients_dir.join(format!("{key}.shard"))
    }

    /// Transients supplied at registration live elsewhere and are never deleted.
    fn owns_transient(&self, path: &Path) -> bool {
        path.starts_with(&self.config.transients_dir)
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
