//! TCP listener for the device API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionContext, serve_connection};
use crate::device::DeviceIdentity;
use crate::error::{ServerError, ServerResult};
use crate::satellite::{ConnectionId, SatelliteHandle};
use crate::signals::ShutdownHandle;

/// How long open connections get to say goodbye on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP server accepting hub connections.
pub struct TcpServer {
    /// Server configuration.
    config: ServerConfig,
    /// Device identity shared by every connection.
    identity: Arc<DeviceIdentity>,
    listener: TcpListener,
    /// Semaphore for limiting concurrent connections.
    connection_semaphore: Arc<Semaphore>,
    next_id: AtomicU64,
}

/// An accepted, not yet served, connection.
pub struct Accepted {
    pub id: ConnectionId,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    permit: OwnedSemaphorePermit,
}

impl TcpServer {
    /// Binds the listener to `config.bind`.
    pub async fn bind(config: ServerConfig, identity: DeviceIdentity) -> ServerResult<Self> {
        if config.max_connections == 0 {
            return Err(ServerError::config("max_connections must be at least 1"));
        }

        let listener = TcpListener::bind(config.bind).await?;
        info!(
            addr = %listener.local_addr()?,
            name = %identity.name,
            "Device API listening"
        );

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self {
            config,
            identity: Arc::new(identity),
            listener,
            connection_semaphore,
            next_id: AtomicU64::new(1),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The advertised identity.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Accepts a single connection, waiting for a free slot first.
    pub async fn accept(&self) -> ServerResult<Accepted> {
        let permit = self
            .connection_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Shutdown)?;

        let (stream, peer) = self.listener.accept().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, %peer, "Accepted new connection");

        Ok(Accepted {
            id,
            stream,
            peer,
            permit,
        })
    }

    /// Runs the accept loop until shutdown, then waits briefly for open
    /// connections to close.
    pub async fn run_until_shutdown(
        &self,
        satellite: SatelliteHandle,
        shutdown: ShutdownHandle,
    ) -> ServerResult<()> {
        let ctx = ConnectionContext {
            identity: self.identity.clone(),
            password: self.config.password.clone(),
            ping_interval: self.config.ping_interval,
            keepalive_timeout: self.config.keepalive_timeout,
            outbound_capacity: self.config.outbound_queue_capacity,
            satellite,
            shutdown: shutdown.clone(),
        };
        let mut connections = JoinSet::new();
        let stop = shutdown.wait().wait();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                accepted = self.accept() => match accepted {
                    Ok(accepted) => {
                        let span = info_span!("connection", id = accepted.id, peer = %accepted.peer);
                        let ctx = ctx.clone();
                        connections.spawn(
                            async move {
                                let _permit = accepted.permit;
                                // Outcome is logged by the connection itself.
                                let _ = serve_connection(accepted.stream, accepted.peer, accepted.id, ctx).await;
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task failed");
                    }
                }
                _ = &mut stop => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let open = connections.len();
        if open > 0 {
            debug!(open, "Waiting for connections to close");
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(open = connections.len(), "Aborting connections that did not close");
                connections.abort_all();
            }
        }
        Ok(())
    }
}
