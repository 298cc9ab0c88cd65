//! TCP server for the query protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use wharf_types::{QueryRequest, QueryResponse};

use crate::error::NetError;
use crate::frame::{read_frame, write_frame};
use crate::{QUERY_PROTOCOL, QueryResponder};

/// Limits applied by [`QueryServer`].
#[derive(Debug, Clone)]
pub struct QueryServerConfig {
    /// Deadline for reading the request and writing the response.
    pub stream_timeout: Duration,
    /// Connections handled at the same time; further accepts wait.
    pub max_connections: usize,
}

impl Default for QueryServerConfig {
    fn default() -> Self {
        Self {
            stream_timeout: Duration::from_secs(30),
            max_connections: 256,
        }
    }
}

/// Answers query protocol requests, one request per connection.
pub struct QueryServer {
    listener: TcpListener,
    responder: Arc<dyn QueryResponder>,
    config: QueryServerConfig,
}

impl QueryServer {
    /// Bind the listener. Nothing is accepted until [`QueryServer::serve`] runs.
    pub async fn bind(
        addr: SocketAddr,
        responder: Arc<dyn QueryResponder>,
        config: QueryServerConfig,
    ) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            responder,
            config,
        })
    }

    /// Address actually bound, useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires. In-flight exchanges are
    /// left to finish on their own.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), NetError> {
        let local = self.local_addr()?;
        info!(addr = %local, protocol = QUERY_PROTOCOL, "query server listening");
        let permits = Arc::new(Semaphore::new(self.config.max_connections.max(1)));

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept query connection");
                        continue;
                    }
                },
            };

            let responder = self.responder.clone();
            let timeout = self.config.stream_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                match tokio::time::timeout(timeout, handle_stream(stream, peer, responder)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(%peer, error = %e, "query exchange failed"),
                    Err(_) => debug!(%peer, ?timeout, "query exchange timed out"),
                }
            });
        }

        info!(addr = %local, "query server stopped");
        Ok(())
    }
}

/// One request, one response, then close.
async fn handle_stream(
    mut stream: TcpStream,
    peer: SocketAddr,
    responder: Arc<dyn QueryResponder>,
) -> Result<(), NetError> {
    let response = match read_frame::<_, QueryRequest>(&mut stream).await {
        Ok(request) => {
            trace!(%peer, payload = %request.payload_cid, "query received");
            responder.respond(request).await
        }
        // A peer that hung up gets nothing back.
        Err(NetError::StreamClosed) => return Err(NetError::StreamClosed),
        Err(e) => {
            debug!(%peer, error = %e, "malformed query");
            QueryResponse::error(format!("malformed query: {e}"))
        }
    };
    write_frame(&mut stream, &response).await
}
