//! Network layer for the retrieval query protocol.
//!
//! - [`write_frame`] / [`read_frame`]: 4-byte big-endian length prefix
//!   followed by a postcard payload.
//! - [`QueryServer`]: accepts TCP connections, answers exactly one
//!   [`QueryRequest`](wharf_types::QueryRequest) per connection through a
//!   [`QueryResponder`], then closes.
//! - [`query`]: the matching client.

mod client;
mod error;
mod frame;
mod server;

pub use client::{query, query_with_timeout};
pub use error::NetError;
pub use frame::{MAX_MESSAGE_SIZE, read_frame, write_frame};
pub use server::{QueryServer, QueryServerConfig};

use wharf_types::{QueryRequest, QueryResponse};

/// Protocol identifier announced in logs and by the daemon.
pub const QUERY_PROTOCOL: &str = "/wharf/retrieval/qry/1";

/// Produces the answer to one query.
///
/// Implementations must always return a response; failures are expressed
/// as [`QueryResponse`]s with an `Error` status, never as transport errors.
#[async_trait::async_trait]
pub trait QueryResponder: Send + Sync {
    async fn respond(&self, request: QueryRequest) -> QueryResponse;
}
