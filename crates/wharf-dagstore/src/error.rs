//! Error types for the dagstore.

use wharf_types::{BlockHash, ShardKey};

/// Errors returned by [`DagStore`](crate::DagStore) and its wrapper.
#[derive(Debug, thiserror::Error)]
pub enum DagStoreError {
    /// No shard is registered under this key.
    #[error("shard not found: {0}")]
    ShardUnknown(ShardKey),

    #[error("shard already registered: {0}")]
    ShardExists(ShardKey),

    #[error("shard {key} is in use by {refs} accessor(s)")]
    ShardInUse { key: ShardKey, refs: usize },

    #[error("shard {key} is errored: {reason}")]
    ShardErrored { key: ShardKey, reason: String },

    /// The content index has no shard containing this block.
    #[error("block not found: {0}")]
    BlockNotFound(BlockHash),

    #[error("recovery of shard {key} failed: {reason}")]
    RecoveryFailed { key: ShardKey, reason: String },

    #[error("shard {key} still unknown after {attempts} registration attempts")]
    RetriesExhausted { key: ShardKey, attempts: u32 },

    /// The caller stopped waiting. The underlying operation may still finish.
    #[error("operation cancelled")]
    Cancelled,

    /// The dagstore dropped the operation without answering.
    #[error("dagstore closed")]
    Closed,

    #[error("invalid mount url: {0}")]
    InvalidUrl(String),

    #[error("no mount registered for scheme {0:?}")]
    UnknownScheme(String),

    #[error("mount unavailable: {0}")]
    MountUnavailable(String),

    #[error("piece error: {0}")]
    Piece(#[from] wharf_piece::PieceError),

    #[error("metadata error: {0}")]
    Meta(#[from] wharf_meta::MetaError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DagStoreError {
    /// True for a missing shard or block.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ShardUnknown(_) | Self::BlockNotFound(_))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for DagStoreError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::Closed
    }
}
