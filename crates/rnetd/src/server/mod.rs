//! TCP server for RNet clients.
//!
//! The server:
//! - Listens on a TCP port for client connections
//! - Spawns a session task for each client
//! - Fans report frames out to every subscribed session
//! - Advertises itself through the injected `ServicePublisher`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    TcpServer    │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  Event::Client*  ┌─────────────────┐
//! │  run_session    │─────────────────▶│   Coordinator   │
//! │  (per client)   │                  │                 │
//! └───────▲─────────┘                  └───────┬─────────┘
//!         │ bounded queue                      │ broadcast()
//!         └──────────── Broadcaster ◀──────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Lock poisoning is recovered from, never propagated
//! - Accept errors are logged and the listener keeps running

mod session;

pub use session::{Session, SessionAction, SessionId, SessionState, SESSION_QUEUE};

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::coordinator::Event;
use crate::discovery::{
    Context, DiscoveryError, ServiceAdvertisement, ServiceEvent, ServiceHandle, ServicePublisher,
};
use session::{run_session, SessionContext};

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Server already started")]
    AlreadyStarted,
}

// ============================================================================
// Broadcaster
// ============================================================================

/// The set of subscribed sessions and their outbound queues.
///
/// Delivery uses `try_send`: a full queue drops the frame for that session
/// only, a closed queue removes the session. No call ever waits on a peer.
#[derive(Clone, Default)]
pub struct Broadcaster {
    subscribers: Arc<RwLock<HashMap<SessionId, mpsc::Sender<Bytes>>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session. Returns false if it was already subscribed.
    pub fn subscribe(&self, id: SessionId, queue: mpsc::Sender<Bytes>) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.contains_key(&id) {
            return false;
        }
        subscribers.insert(id, queue);
        true
    }

    /// Removes a session. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SessionId) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Queues a frame for every subscribed session.
    ///
    /// Returns the number of sessions the frame was queued for.
    pub fn broadcast(&self, frame: &Bytes) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, queue) in subscribers.iter() {
                match queue.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(session = id, "Session queue full, dropping frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        for id in closed {
            if self.unsubscribe(id) {
                debug!(session = id, "Removed closed session from broadcast set");
            }
        }
        delivered
    }

    /// Queues a frame for one session. Returns false if it could not be queued.
    pub fn send_to(&self, id: SessionId, frame: Bytes) -> bool {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match subscribers.get(&id) {
            Some(queue) => queue.try_send(frame).is_ok(),
            None => false,
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Settings the server needs from the configuration.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind: SocketAddr,
    pub name: String,
    pub handshake_timeout: Duration,
    pub max_connections: usize,
}

/// The listening side of the bridge.
pub struct TcpServer {
    settings: ServerSettings,
    publisher: Arc<dyn ServicePublisher>,
    service_type: String,
    broadcaster: Broadcaster,
    events: mpsc::Sender<Event>,

    name: Mutex<String>,
    service: Mutex<Option<ServiceHandle>>,
    local_addr: Option<SocketAddr>,

    sessions: TaskTracker,
    session_cancel: CancellationToken,
    listener_cancel: CancellationToken,
    listener_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Creates a server. Nothing is bound until [`start`](Self::start).
    ///
    /// # Arguments
    ///
    /// * `settings` - Bind address, advertised name and limits
    /// * `ctx` - Process-wide collaborators (service publisher)
    /// * `broadcaster` - Shared with the coordinator for fan-out
    /// * `events` - Coordinator inbox for session events
    pub fn new(
        settings: ServerSettings,
        ctx: &Context,
        broadcaster: Broadcaster,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            name: Mutex::new(settings.name.clone()),
            settings,
            publisher: Arc::clone(&ctx.publisher),
            service_type: ctx.service_type.clone(),
            broadcaster,
            events,
            service: Mutex::new(None),
            local_addr: None,
            sessions: TaskTracker::new(),
            session_cancel: CancellationToken::new(),
            listener_cancel: CancellationToken::new(),
            listener_task: None,
        }
    }

    /// Binds the listener, starts accepting and advertises the service.
    ///
    /// # Errors
    ///
    /// `ServerError::Bind` if the address cannot be bound. Advertisement
    /// failures are logged only.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.listener_task.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let bind = self.settings.bind;
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| ServerError::Bind { addr: bind, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr: bind, source })?;
        self.local_addr = Some(local_addr);

        info!(addr = %local_addr, "TCP server listening");

        let acceptor = Acceptor {
            listener,
            sessions: self.sessions.clone(),
            max_connections: self.settings.max_connections,
            next_id: AtomicU64::new(1),
            listener_cancel: self.listener_cancel.clone(),
            ctx: SessionContext {
                broadcaster: self.broadcaster.clone(),
                events: self.events.clone(),
                handshake_timeout: self.settings.handshake_timeout,
                cancel: self.session_cancel.clone(),
            },
        };
        self.listener_task = Some(tokio::spawn(acceptor.run()));

        self.publish();
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn name(&self) -> String {
        self.name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of subscribed sessions.
    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.len()
    }

    /// Number of open connections, subscribed or not.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queues a frame for every subscribed session.
    pub fn broadcast(&self, frame: &Bytes) -> usize {
        self.broadcaster.broadcast(frame)
    }

    /// Changes the advertised name. Sessions and the listener are untouched.
    pub fn rename(&self, name: impl Into<String>) {
        let name = name.into();
        info!(name = %name, "Renaming server");
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = name;
        if self.local_addr.is_some() {
            self.unpublish();
            self.publish();
        }
    }

    /// Closes every session, then the listener, then withdraws the
    /// advertisement. Resolves once all of it has finished.
    pub async fn stop(mut self) {
        info!(sessions = self.sessions.len(), "Stopping TCP server");

        self.session_cancel.cancel();
        self.sessions.close();
        self.sessions.wait().await;
        debug!("All sessions closed");

        self.listener_cancel.cancel();
        if let Some(task) = self.listener_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }

        self.unpublish();
        info!("TCP server stopped");
    }

    fn publish(&self) {
        let Some(addr) = self.local_addr else {
            return;
        };
        let advertisement =
            ServiceAdvertisement::for_bridge(self.name(), self.service_type.clone(), addr.port());

        match self.publisher.publish(&advertisement) {
            Ok(mut handle) => {
                if let Some(events) = handle.take_events() {
                    tokio::spawn(log_service_events(advertisement.name.clone(), events));
                }
                *self.service.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(DiscoveryError::Disabled) => {
                info!("Service discovery disabled");
            }
            Err(e) => {
                warn!(error = %e, "Service advertisement failed, clients must be configured manually");
            }
        }
    }

    fn unpublish(&self) {
        let handle = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }
}

async fn log_service_events(name: String, mut events: mpsc::Receiver<ServiceEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ServiceEvent::Up => info!(name = %name, "Service advertised"),
            ServiceEvent::Error(reason) => {
                warn!(name = %name, error = %reason, "Service advertisement error");
            }
        }
    }
}

// ============================================================================
// Accept loop
// ============================================================================

struct Acceptor {
    listener: TcpListener,
    sessions: TaskTracker,
    max_connections: usize,
    next_id: AtomicU64,
    listener_cancel: CancellationToken,
    ctx: SessionContext,
}

impl Acceptor {
    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.listener_cancel.cancelled() => break,

                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        // e.g. fd exhaustion
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
        debug!("Listener closed");
    }

    fn admit(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if self.ctx.cancel.is_cancelled() {
            debug!(peer = %peer, "Server stopping, refusing connection");
            return;
        }
        if self.sessions.len() >= self.max_connections {
            warn!(
                peer = %peer,
                max = self.max_connections,
                "Connection limit reached, closing new connection"
            );
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.spawn(run_session(stream, id, self.ctx.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_is_idempotent() {
        let b = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(4);
        assert!(b.subscribe(1, tx.clone()));
        assert!(!b.subscribe(1, tx));
        assert_eq!(b.len(), 1);
        assert!(b.unsubscribe(1));
        assert!(!b.unsubscribe(1));
        assert!(b.is_empty());
    }

    #[test]
    fn test_closed_session_is_removed_and_others_still_receive() {
        let b = Broadcaster::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        b.subscribe(1, tx1);
        b.subscribe(2, tx2);
        b.subscribe(3, tx3);
        drop(rx2);

        let frame = Bytes::from_static(&[0xF0, 0xF7]);
        assert_eq!(b.broadcast(&frame), 2);
        assert!(!b.contains(2));
        assert_eq!(rx1.try_recv().unwrap(), frame);
        assert_eq!(rx3.try_recv().unwrap(), frame);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let b = Broadcaster::new();
        let (slow, _slow_rx) = mpsc::channel(1);
        let (fast, mut fast_rx) = mpsc::channel(8);
        b.subscribe(1, slow);
        b.subscribe(2, fast);

        let frame = Bytes::from_static(b"x");
        for _ in 0..4 {
            b.broadcast(&frame);
        }
        // The stalled session stays subscribed; the healthy one got everything
        assert!(b.contains(1));
        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[test]
    fn test_send_to_single_session() {
        let b = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(4);
        b.subscribe(5, tx);
        assert!(b.send_to(5, Bytes::from_static(b"a")));
        assert!(!b.send_to(6, Bytes::from_static(b"a")));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
    }
}
