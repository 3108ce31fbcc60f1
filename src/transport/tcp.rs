//! TCP listener and connector feeding sockets into a core.

use crate::error::Result;
use crate::protocol::strategy::ConnectionState;
use crate::transport::connection::Connection;
use crate::transport::core::CoreShared;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, instrument, warn};

/// Bind `addr` and spawn the accept loop. Returns the bound address.
#[instrument(skip(core))]
pub(crate) async fn listen<S: ConnectionState>(core: &Arc<CoreShared<S>>, addr: &str) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(address = %local, "Listening");
    core.runtime().spawn(accept_loop(core.clone(), listener));
    Ok(local)
}

async fn accept_loop<S: ConnectionState>(core: Arc<CoreShared<S>>, listener: TcpListener) {
    let shutdown = core.shutdown_token().clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Listener stopped");
                return;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        if let Err(e) = core.accept(stream, peer) {
                            warn!(peer = %peer, error = %e, "Connection rejected");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
}

/// Dial `addr` and register the socket as a connection.
#[instrument(skip(core))]
pub(crate) async fn connect<S: ConnectionState>(
    core: &Arc<CoreShared<S>>,
    addr: &str,
) -> Result<Arc<Connection<S>>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    debug!(peer = %peer, "Connected");
    core.accept(stream, peer)
}
