//! Board Command Channel server.
//!
//! Listens on a TCP port and serves a single Controller connection at a
//! time. A new connection replaces the current one once the old
//! connection's disconnect hook has run.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use astropi_protocol::Framing;
use astropi_protocol::constants::DEFAULT_COMMAND_PORT;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::connection::{self, ControllerConnection, ControllerMeta};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    pub framing: Framing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_COMMAND_PORT,
            framing: Framing::default(),
        }
    }
}

/// The board's Command Channel server.
///
/// Manages a single Controller connection at a time and dispatches
/// commands to the provided [`Handler`].
pub struct AgentServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    controller: Mutex<Option<ControllerConnection>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> AgentServer<H> {
    /// Creates a new server with the given handler.
    pub fn new(config: ServerConfig, handler: Arc<H>) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            controller: Mutex::new(None),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Returns `true` if a Controller is currently connected and alive.
    pub async fn has_controller(&self) -> bool {
        let lock = self.controller.lock().await;
        match lock.as_ref() {
            Some(conn) => conn.sender().is_connected(),
            None => false,
        }
    }

    /// Returns the sender for the current Controller connection, if any.
    pub async fn controller_sender(&self) -> Option<connection::Sender> {
        self.controller.lock().await.as_ref().map(|c| c.sender())
    }

    /// Closes the current Controller connection (if any) and waits for its
    /// cleanup.
    pub async fn disconnect_controller(&self) {
        let old = self.controller.lock().await.take();
        if let Some(conn) = old {
            conn.close_and_wait().await;
        }
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled on shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        {
            let mut slot = self.local_addr.lock().await;
            if slot.is_some() {
                return Err(ServerError::AlreadyRunning);
            }
            *slot = Some(local_addr);
        }
        tracing::info!(framing = ?self.config.framing, "command server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.disconnect_controller().await;
                    *self.local_addr.lock().await = None;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Handles a single TCP connection and registers it as the Controller.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // Hold the slot while the old connection winds down so its
        // disconnect hook cannot race the new connection's setup.
        let mut slot = self.controller.lock().await;
        if let Some(old) = slot.take() {
            if old.sender().is_connected() {
                tracing::info!(%peer_addr, old = %old.meta.remote_addr, "replacing active controller connection");
            } else {
                tracing::info!("clearing stale controller connection");
            }
            old.close_and_wait().await;
        }

        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        tracing::info!(%peer_addr, "controller connection established");

        let conn = connection::spawn_connection(
            reader,
            writer,
            self.config.framing,
            ControllerMeta {
                remote_addr: peer_addr,
            },
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );
        *slot = Some(conn);
        Ok(())
    }
}
