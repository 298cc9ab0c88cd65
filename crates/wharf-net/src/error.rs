//! Error types for network operations.

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },

    /// The peer closed the stream before a full frame arrived.
    #[error("stream closed")]
    StreamClosed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}
