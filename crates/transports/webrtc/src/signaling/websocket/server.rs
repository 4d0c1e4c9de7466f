//! WebSocket relay server
//!
//! Binds the listener, then runs the accept loop on a spawned task until the
//! returned handle is shut down. Accept errors are logged and the loop keeps
//! going.

use super::handler::{handle_connection, SharedState};
use crate::config::RelayConfig;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Signaling relay server
pub struct RelayServer {
    config: Arc<RelayConfig>,
    state: Arc<SharedState>,
}

impl RelayServer {
    /// Create a relay server; the configuration is validated here
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let state = Arc::new(SharedState::new(Arc::clone(&config)));
        Ok(Self { config, state })
    }

    /// Get shared state (for external access)
    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Bind and start accepting connections
    pub async fn start(self) -> Result<RelayServerHandle> {
        let bind_address = self.config.bind_address();
        let listener = TcpListener::bind(&bind_address).await?;
        let local_addr = listener.local_addr()?;

        info!("Signaling relay listening on ws://{}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let state = Arc::clone(&self.state);

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                debug!("Accepted connection from {}", peer_addr);
                                let state = Arc::clone(&state);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, state).await {
                                        error!("WebSocket connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Signaling relay received shutdown signal");
                        break;
                    }
                }
            }

            info!("Signaling relay accept loop exited");
        });

        Ok(RelayServerHandle {
            local_addr,
            state: self.state,
            shutdown_tx,
            accept_task: Some(accept_task),
        })
    }
}

/// Handle to a running relay
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    state: Arc<SharedState>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Option<JoinHandle<()>>,
}

impl RelayServerHandle {
    /// Address the relay is bound to (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients should connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Shared relay state
    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Stop accepting connections and wait for the accept loop to exit
    ///
    /// Connections that are already established keep running until their peer
    /// disconnects.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!("Relay accept loop panicked: {}", e);
            }
        }
    }
}

impl Drop for RelayServerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
