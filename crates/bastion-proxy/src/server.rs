//! TCP front door of the gateway.
//!
//! Accepts client connections, dials the upstream database for each one and
//! runs a [`SessionContext`] over the pair.

use crate::error::ProxyError;
use crate::session::{SessionContext, SessionServices};
use crate::wire;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// SQLSTATE too_many_connections.
const TOO_MANY_CONNECTIONS: &str = "53300";
/// SQLSTATE sqlclient_unable_to_establish_sqlconnection.
const UNABLE_TO_CONNECT: &str = "08001";

pub struct GatewayServer {
    services: SessionServices,
    shutdown: CancellationToken,
    connections: Arc<Semaphore>,
}

impl GatewayServer {
    pub fn new(services: SessionServices) -> Self {
        let max = services.config.listener.max_connections.max(1) as usize;
        Self {
            services,
            shutdown: CancellationToken::new(),
            connections: Arc::new(Semaphore::new(max)),
        }
    }

    /// Token that stops the accept loop and every running session when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let address = self.services.config.listener.bind_address();
        TcpListener::bind(&address)
            .await
            .map_err(|source| ProxyError::BindFailed { address, source })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ProxyError> {
        self.services
            .config
            .validate()
            .map_err(|e| ProxyError::Configuration(e.to_string()))?;
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let local = listener.local_addr()?;
        tracing::info!(
            address = %local,
            upstream = %self.services.config.upstream.address(),
            max_connections = self.services.config.listener.max_connections,
            "Gateway listening"
        );

        loop {
            let (mut socket, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Per-connection accept errors (e.g. EMFILE) should not stop the loop.
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let Ok(permit) = self.connections.clone().try_acquire_owned() else {
                tracing::warn!(peer = %peer, "Connection limit reached, refusing client");
                tokio::spawn(async move {
                    let frame = wire::error_response(
                        TOO_MANY_CONNECTIONS,
                        "sorry, too many clients already",
                    );
                    let _ = socket.write_all(&frame).await;
                    let _ = socket.shutdown().await;
                });
                continue;
            };

            let services = self.services.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                tracing::debug!(peer = %peer, "Accepted connection");
                if let Err(e) = handle_connection(socket, services, &shutdown).await {
                    tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    client: TcpStream,
    services: SessionServices,
    shutdown: &CancellationToken,
) -> Result<(), ProxyError> {
    let _ = client.set_nodelay(true);
    let upstream = services.config.upstream.address();
    let dial = tokio::time::timeout(
        services.config.upstream.connect_timeout(),
        TcpStream::connect(&upstream),
    )
    .await;

    let backend = match dial {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::error!(upstream = %upstream, error = %e, "Failed to connect to upstream");
            return refuse_unreachable(client, &upstream, e.to_string()).await;
        }
        Err(_) => {
            tracing::error!(upstream = %upstream, "Timed out connecting to upstream");
            return refuse_unreachable(client, &upstream, "connect timed out".to_string()).await;
        }
    };
    let _ = backend.set_nodelay(true);

    let id = uuid::Uuid::new_v4().to_string();
    let session = SessionContext::new(id, client, backend, services, shutdown);
    session.run().await.map(|_| ())
}

async fn refuse_unreachable(
    mut client: TcpStream,
    upstream: &str,
    reason: String,
) -> Result<(), ProxyError> {
    let message = format!("could not connect to upstream {}: {}", upstream, reason);
    let _ = client
        .write_all(&wire::error_response(UNABLE_TO_CONNECT, &message))
        .await;
    let _ = client.shutdown().await;
    Err(ProxyError::BackendUnavailable(message))
}
