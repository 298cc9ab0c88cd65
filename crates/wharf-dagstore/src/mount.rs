//! Mounts: where a shard's bytes come from.
//!
//! A mount is addressed by a `scheme://rest` URL. [`MountRegistry`] maps
//! schemes to [`MountFactory`]s so persisted shard records can be turned
//! back into live mounts after a restart.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;
use wharf_piece::{PieceAccessor, PieceError};
use wharf_types::PieceCid;

use crate::error::DagStoreError;

/// Scheme of mounts backed by the node's own piece storage.
pub const MARKET_SCHEME: &str = "market";

/// Result of [`Mount::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountStat {
    /// False when the source has no data for this shard.
    pub exists: bool,
    /// Size of the shard data in bytes. Zero when it does not exist.
    pub size: u64,
    /// Data can be served without a slow preparation step (e.g. unsealing).
    pub ready: bool,
}

/// A source of shard bytes.
#[async_trait::async_trait]
pub trait Mount: Send + Sync + fmt::Debug {
    /// Read the full shard contents.
    async fn fetch(&self) -> Result<Bytes, DagStoreError>;

    /// Report existence, size and readiness without reading the data.
    async fn stat(&self) -> Result<MountStat, DagStoreError>;

    /// URL that [`MountRegistry::instantiate`] turns back into this mount.
    fn url(&self) -> String;
}

/// Builds mounts for one URL scheme.
pub trait MountFactory: Send + Sync {
    /// Scheme this factory handles, without the `://`.
    fn scheme(&self) -> &'static str;

    /// Build a mount from the part of the URL after `scheme://`.
    fn from_url(&self, rest: &str) -> Result<Arc<dyn Mount>, DagStoreError>;
}

/// Scheme → factory lookup.
#[derive(Default, Clone)]
pub struct MountRegistry {
    factories: HashMap<&'static str, Arc<dyn MountFactory>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for the same scheme.
    pub fn register(&mut self, factory: Arc<dyn MountFactory>) {
        debug!(scheme = factory.scheme(), "registered mount type");
        self.factories.insert(factory.scheme(), factory);
    }

    /// Builder form of [`MountRegistry::register`].
    pub fn with(mut self, factory: Arc<dyn MountFactory>) -> Self {
        self.register(factory);
        self
    }

    /// Resolve a `scheme://rest` URL to a mount.
    pub fn instantiate(&self, url: &str) -> Result<Arc<dyn Mount>, DagStoreError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| DagStoreError::InvalidUrl(url.to_string()))?;
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| DagStoreError::UnknownScheme(scheme.to_string()))?;
        factory.from_url(rest)
    }
}

impl fmt::Debug for MountRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.factories.keys().collect();
        schemes.sort();
        f.debug_struct("MountRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Piece mount
// ---------------------------------------------------------------------------

/// Mount serving a piece out of the shared piece accessor.
pub struct PieceMount {
    piece: PieceCid,
    accessor: Arc<dyn PieceAccessor>,
}

impl PieceMount {
    pub fn new(piece: PieceCid, accessor: Arc<dyn PieceAccessor>) -> Self {
        Self { piece, accessor }
    }

    /// Piece served by this mount.
    pub fn piece(&self) -> PieceCid {
        self.piece
    }
}

impl fmt::Debug for PieceMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceMount").field("piece", &self.piece).finish()
    }
}

#[async_trait::async_trait]
impl Mount for PieceMount {
    async fn fetch(&self) -> Result<Bytes, DagStoreError> {
        Ok(self.accessor.fetch_from_piece_storage(self.piece).await?)
    }

    async fn stat(&self) -> Result<MountStat, DagStoreError> {
        let size = match self.accessor.get_unpadded_size(self.piece).await {
            Ok(size) => size,
            Err(PieceError::NotFound(_)) => {
                return Ok(MountStat {
                    exists: false,
                    size: 0,
                    ready: false,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let ready = self.accessor.is_locally_unsealed(self.piece).await?;
        Ok(MountStat {
            exists: true,
            size,
            ready,
        })
    }

    fn url(&self) -> String {
        format!("{MARKET_SCHEME}://{}", self.piece)
    }
}

/// Builds [`PieceMount`]s for `market://<piece cid>` URLs.
pub struct PieceMountFactory {
    accessor: Arc<dyn PieceAccessor>,
}

impl PieceMountFactory {
    pub fn new(accessor: Arc<dyn PieceAccessor>) -> Self {
        Self { accessor }
    }
}

impl MountFactory for PieceMountFactory {
    fn scheme(&self) -> &'static str {
        MARKET_SCHEME
    }

    fn from_url(&self, rest: &str) -> Result<Arc<dyn Mount>, DagStoreError> {
        let piece: PieceCid = rest
            .parse()
            .map_err(|e| DagStoreError::InvalidUrl(format!("{MARKET_SCHEME}://{rest}: {e}")))?;
        Ok(Arc::new(PieceMount::new(piece, self.accessor.clone())))
    }
}

// ---------------------------------------------------------------------------
// File mount
// ---------------------------------------------------------------------------

/// Mount over a plain local file.
#[derive(Debug)]
pub struct FileMount {
    path: PathBuf,
}

impl FileMount {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl Mount for FileMount {
    async fn fetch(&self) -> Result<Bytes, DagStoreError> {
        Ok(Bytes::from(tokio::fs::read(&self.path).await?))
    }

    async fn stat(&self) -> Result<MountStat, DagStoreError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(MountStat {
                exists: true,
                size: meta.len(),
                ready: true,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MountStat {
                exists: false,
                size: 0,
                ready: false,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn url(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Builds [`FileMount`]s for `file://<path>` URLs.
pub struct FileMountFactory;

impl MountFactory for FileMountFactory {
    fn scheme(&self) -> &'static str {
        "file"
    }

    fn from_url(&self, rest: &str) -> Result<Arc<dyn Mount>, DagStoreError> {
        if rest.is_empty() {
            return Err(DagStoreError::InvalidUrl("file://".into()));
        }
        Ok(Arc::new(FileMount::new(rest)))
    }
}

/// Stand-in for a persisted mount whose URL can no longer be resolved.
/// Every operation fails with the original resolution error.
#[derive(Debug)]
pub(crate) struct UnresolvedMount {
    pub(crate) url: String,
    pub(crate) reason: String,
}

#[async_trait::async_trait]
impl Mount for UnresolvedMount {
    async fn fetch(&self) -> Result<Bytes, DagStoreError> {
        Err(DagStoreError::MountUnavailable(self.reason.clone()))
    }

    async fn stat(&self) -> Result<MountStat, DagStoreError> {
        Err(DagStoreError::MountUnavailable(self.reason.clone()))
    }

    fn url(&self) -> String {
        self.url.clone()
    }
}
