//! Query protocol client.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;
use wharf_types::{QueryRequest, QueryResponse};

use crate::error::NetError;
use crate::frame::{read_frame, write_frame};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Ask the provider at `addr` about a payload.
pub async fn query(addr: SocketAddr, request: &QueryRequest) -> Result<QueryResponse, NetError> {
    query_with_timeout(addr, request, DEFAULT_TIMEOUT).await
}

/// Like [`query`], failing with [`NetError::Timeout`] once `timeout` passes.
pub async fn query_with_timeout(
    addr: SocketAddr,
    request: &QueryRequest,
    timeout: Duration,
) -> Result<QueryResponse, NetError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, request).await?;
        let response: QueryResponse = read_frame(&mut stream).await?;
        Ok::<_, NetError>(response)
    };
    let response = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| NetError::Timeout(timeout))??;
    debug!(%addr, status = ?response.status, "query answered");
    Ok(response)
}
