//! Startup and shutdown ordering for the whole bridge.
//!
//! Startup: coordinator, then the serial transport, then the TCP server.
//! Shutdown: the serial transport (including any pending reconnect
//! timer), then every TCP session, then the listener, then the
//! coordinator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::coordinator::{spawn_coordinator, CoordinatorHandle};
use crate::discovery::Context;
use crate::serial::{Backoff, BusConnector, LinkState, SerialTransport, OUTBOUND_QUEUE};
use crate::server::{Broadcaster, ServerError, ServerSettings, TcpServer};
use crate::store::StateStore;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Everything needed to start a bridge.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub server: ServerSettings,
    pub backoff: Backoff,
}

impl BridgeOptions {
    /// Options derived from a validated configuration.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerSettings {
                bind: config.server.bind_addr()?,
                name: config.name.clone(),
                handshake_timeout: config.server.handshake_timeout(),
                max_connections: config.server.max_connections,
            },
            backoff: Backoff::new(config.bus.reconnect_initial(), config.bus.reconnect_max()),
        })
    }
}

/// A running bridge.
pub struct Bridge {
    handle: CoordinatorHandle,
    serial: SerialTransport,
    server: TcpServer,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    coordinator: JoinHandle<()>,
}

impl Bridge {
    /// Starts every component.
    ///
    /// # Errors
    ///
    /// `BridgeError::Server` if the listener cannot be bound. Components
    /// already started are shut down before returning.
    pub async fn start(
        store: StateStore,
        options: BridgeOptions,
        connector: Arc<dyn BusConnector>,
        ctx: &Context,
    ) -> Result<Self, BridgeError> {
        let cancel = CancellationToken::new();
        let (link_tx, link_rx) = watch::channel(LinkState::Down);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let broadcaster = Broadcaster::new();

        let (handle, coordinator) = spawn_coordinator(
            store,
            link_rx,
            outbound_tx,
            broadcaster.clone(),
            cancel.child_token(),
        );

        let serial = SerialTransport::spawn(
            connector,
            options.backoff,
            outbound_rx,
            link_tx,
            handle.event_sender(),
            cancel.child_token(),
        );

        let mut server = TcpServer::new(options.server, ctx, broadcaster, handle.event_sender());
        let local_addr = match server.start().await {
            Ok(addr) => addr,
            Err(e) => {
                serial.shutdown().await;
                cancel.cancel();
                let _ = coordinator.await;
                return Err(e.into());
            }
        };

        info!(addr = %local_addr, "Bridge started");
        Ok(Self {
            handle,
            serial,
            server,
            local_addr,
            cancel,
            coordinator,
        })
    }

    /// API handle for reads and commands.
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn name(&self) -> String {
        self.server.name()
    }

    /// Changes the advertised server name without touching sessions.
    pub fn rename(&self, name: impl Into<String>) {
        self.server.rename(name);
    }

    /// Number of sessions currently receiving broadcasts.
    pub fn subscriber_count(&self) -> usize {
        self.server.subscriber_count()
    }

    /// Stops everything in order and waits for it.
    pub async fn shutdown(self) {
        info!("Bridge shutting down");
        self.serial.shutdown().await;
        self.server.stop().await;

        self.cancel.cancel();
        match tokio::time::timeout(Duration::from_secs(5), self.coordinator).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Coordinator task ended abnormally"),
            Err(_) => warn!("Coordinator did not stop in time"),
        }
        info!("Bridge stopped");
    }
}
