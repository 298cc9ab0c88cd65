//! Error types for piece storage operations.

use wharf_types::PieceCid;

#[derive(Debug, thiserror::Error)]
pub enum PieceError {
    #[error("piece not found: {0}")]
    NotFound(PieceCid),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Piece data on disk does not hash to its identifier. The piece is
    /// treated as unavailable.
    #[error("piece corruption detected: expected {expected}, actual hash {actual}")]
    CorruptPiece { expected: PieceCid, actual: PieceCid },

    /// The backend could not serve the piece right now.
    #[error("piece storage unavailable: {0}")]
    Unavailable(String),
}
