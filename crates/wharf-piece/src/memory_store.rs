//! In-memory piece storage backend.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;
use wharf_types::PieceCid;

use crate::error::PieceError;
use crate::traits::{PieceAccessor, PieceStore};

#[derive(Default)]
struct Inner {
    pieces: HashMap<PieceCid, Bytes>,
    /// Pieces that only exist sealed; fetching them implies an unseal.
    sealed_only: HashSet<PieceCid>,
    /// Pieces whose fetch fails with `Unavailable`.
    failing: HashSet<PieceCid>,
    /// Added to every fetch, standing in for unseal latency.
    fetch_delay: Duration,
}

/// In-memory piece store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryPieceStore {
    inner: RwLock<Inner>,
}

impl MemoryPieceStore {
    /// An empty store with no failures or delays configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a piece that is only available sealed.
    pub fn put_sealed(&self, data: Bytes) -> PieceCid {
        let piece = PieceCid::from_data(&data);
        let mut inner = self.inner.write().expect("lock poisoned");
        inner.pieces.insert(piece, data);
        inner.sealed_only.insert(piece);
        piece
    }

    /// Mark a stored piece as unsealed (or sealed-only again).
    pub fn set_unsealed(&self, piece: PieceCid, unsealed: bool) {
        let mut inner = self.inner.write().expect("lock poisoned");
        if unsealed {
            inner.sealed_only.remove(&piece);
        } else {
            inner.sealed_only.insert(piece);
        }
    }

    /// Make fetches of `piece` fail until cleared.
    pub fn set_failing(&self, piece: PieceCid, failing: bool) {
        let mut inner = self.inner.write().expect("lock poisoned");
        if failing {
            inner.failing.insert(piece);
        } else {
            inner.failing.remove(&piece);
        }
    }

    /// Delay every fetch by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.inner.write().expect("lock poisoned").fetch_delay = delay;
    }
}

#[async_trait::async_trait]
impl PieceAccessor for MemoryPieceStore {
    async fn fetch_from_piece_storage(&self, piece: PieceCid) -> Result<Bytes, PieceError> {
        let delay = self.inner.read().expect("lock poisoned").fetch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let inner = self.inner.read().expect("lock poisoned");
        if inner.failing.contains(&piece) {
            return Err(PieceError::Unavailable(format!("fetch of {piece} failed")));
        }
        let data = inner
            .pieces
            .get(&piece)
            .cloned()
            .ok_or(PieceError::NotFound(piece))?;
        if inner.sealed_only.contains(&piece) {
            debug!(%piece, "serving piece through unseal");
        }
        Ok(data)
    }

    async fn get_unpadded_size(&self, piece: PieceCid) -> Result<u64, PieceError> {
        let inner = self.inner.read().expect("lock poisoned");
        inner
            .pieces
            .get(&piece)
            .map(|d| d.len() as u64)
            .ok_or(PieceError::NotFound(piece))
    }

    async fn is_locally_unsealed(&self, piece: PieceCid) -> Result<bool, PieceError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.pieces.contains_key(&piece) && !inner.sealed_only.contains(&piece))
    }
}

#[async_trait::async_trait]
impl PieceStore for MemoryPieceStore {
    async fn put(&self, data: Bytes) -> Result<PieceCid, PieceError> {
        let piece = PieceCid::from_data(&data);
        debug!(%piece, size = data.len(), "storing piece in memory");
        let mut inner = self.inner.write().expect("lock poisoned");
        inner.pieces.insert(piece, data);
        inner.sealed_only.remove(&piece);
        Ok(piece)
    }

    async fn delete(&self, piece: PieceCid) -> Result<(), PieceError> {
        let mut inner = self.inner.write().expect("lock poisoned");
        inner.pieces.remove(&piece);
        inner.sealed_only.remove(&piece);
        Ok(())
    }

    async fn contains(&self, piece: PieceCid) -> Result<bool, PieceError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.pieces.contains_key(&piece))
    }

    async fn list(&self) -> Result<Vec<PieceCid>, PieceError> {
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.pieces.keys().copied().collect())
    }
}
