//! Error types for the metadata store.

/// Errors returned by [`MetaStore`](crate::MetaStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error (e.g. from Fjall guard operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),

    /// A stored value was written with a format this build cannot read.
    #[error("unsupported record version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    /// A stored key or value does not have the expected shape.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A schema migration step failed; the version marker was left at `from`.
    #[error("migration from schema v{from} failed: {reason}")]
    Migration { from: u32, reason: String },
}
