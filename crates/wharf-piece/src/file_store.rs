//! File-based piece storage backend.
//!
//! Stores one file per piece with a 2-level fan-out directory structure:
//! `{base_dir}/{hex[0..2]}/{hex[2..4]}/{hex}`. Everything on disk is an
//! unsealed copy, so presence implies [`PieceAccessor::is_locally_unsealed`].

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, error};
use wharf_types::PieceCid;

use crate::error::PieceError;
use crate::traits::{PieceAccessor, PieceStore};

/// Piece store keeping one file per piece, fanned out by the first hex
/// digits of the piece CID.
pub struct FilePieceStore {
    base_dir: PathBuf,
}

impl FilePieceStore {
    /// Create a new store rooted at `base_dir`, creating the directory if
    /// it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, PieceError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `base/ab/cd/abcd...`, so no directory grows too large.
    fn piece_path(&self, piece: &PieceCid) -> PathBuf {
        let hex = piece.to_string();
        self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    /// Read a piece and check it still hashes to its CID.
    async fn read_verified(&self, piece: PieceCid) -> Result<Bytes, PieceError> {
        let path = self.piece_path(&piece);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PieceError::NotFound(piece));
            }
            Err(e) => return Err(PieceError::Io(e)),
        };
        let actual = PieceCid::from_data(&data);
        if actual != piece {
            error!(expected = %piece, %actual, "piece corruption detected on read");
            return Err(PieceError::CorruptPiece {
                expected: piece,
                actual,
            });
        }
        Ok(Bytes::from(data))
    }
}

#[async_trait::async_trait]
impl PieceAccessor for FilePieceStore {
    async fn fetch_from_piece_storage(&self, piece: PieceCid) -> Result<Bytes, PieceError> {
        let data = self.read_verified(piece).await?;
        debug!(%piece, size = data.len(), "read piece from disk");
        Ok(data)
    }

    async fn get_unpadded_size(&self, piece: PieceCid) -> Result<u64, PieceError> {
        match tokio::fs::metadata(self.piece_path(&piece)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PieceError::NotFound(piece)),
            Err(e) => Err(PieceError::Io(e)),
        }
    }

    async fn is_locally_unsealed(&self, piece: PieceCid) -> Result<bool, PieceError> {
        self.contains(piece).await
    }
}

#[async_trait::async_trait]
impl PieceStore for FilePieceStore {
    async fn put(&self, data: Bytes) -> Result<PieceCid, PieceError> {
        let piece = PieceCid::from_data(&data);
        let path = self.piece_path(&piece);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write next to the target and rename so readers never see a
        // partial piece.
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(%piece, path = %path.display(), size = data.len(), "stored piece file");
        Ok(piece)
    }

    async fn delete(&self, piece: PieceCid) -> Result<(), PieceError> {
        match tokio::fs::remove_file(self.piece_path(&piece)).await {
            Ok(()) => {
                debug!(%piece, "deleted piece file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PieceError::Io(e)),
        }
    }

    async fn contains(&self, piece: PieceCid) -> Result<bool, PieceError> {
        match tokio::fs::metadata(self.piece_path(&piece)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PieceError::Io(e)),
        }
    }

    async fn list(&self) -> Result<Vec<PieceCid>, PieceError> {
        let mut pieces = Vec::new();
        let mut level0 = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(d0) = level0.next_entry().await? {
            if !d0.file_type().await?.is_dir() {
                continue;
            }
            let mut level1 = tokio::fs::read_dir(d0.path()).await?;
            while let Some(d1) = level1.next_entry().await? {
                if !d1.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(d1.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str()
                        && let Ok(piece) = name.parse::<PieceCid>()
                    {
                        pieces.push(piece);
                    }
                }
            }
        }
        Ok(pieces)
    }
}
