//! Core traits for piece storage.

use bytes::Bytes;
use wharf_types::PieceCid;

use crate::error::PieceError;

/// Read access to sealed pieces, shared by every dagstore mount.
///
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait PieceAccessor: Send + Sync {
    /// Return the full unsealed contents of a piece, unsealing if needed.
    async fn fetch_from_piece_storage(&self, piece: PieceCid) -> Result<Bytes, PieceError>;

    /// Size of the piece payload without padding.
    async fn get_unpadded_size(&self, piece: PieceCid) -> Result<u64, PieceError>;

    /// True when an unsealed copy is available without running the unsealer.
    async fn is_locally_unsealed(&self, piece: PieceCid) -> Result<bool, PieceError>;
}

/// Writable piece storage.
#[async_trait::async_trait]
pub trait PieceStore: PieceAccessor {
    /// Store piece data and return its content identifier.
    async fn put(&self, data: Bytes) -> Result<PieceCid, PieceError>;

    /// Delete a piece. Deleting an absent piece is not an error.
    async fn delete(&self, piece: PieceCid) -> Result<(), PieceError>;

    async fn contains(&self, piece: PieceCid) -> Result<bool, PieceError>;

    /// Every stored piece, in no particular order.
    async fn list(&self) -> Result<Vec<PieceCid>, PieceError>;
}
