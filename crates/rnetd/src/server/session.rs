//! One TCP client connection.
//!
//! ```text
//! Connecting ──accept──▶ AwaitingHandshake ──Handshake──▶ Subscribed
//!                               │                            │
//!                               └──── timeout / I/O error ───┴──▶ Closed
//! ```
//!
//! Only `Subscribed` sessions receive broadcasts, and only their frames
//! reach the coordinator. Reading and writing run in separate tasks: the
//! writer drains a bounded queue, so a slow peer only ever fills its own
//! queue.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Decode errors are logged and skipped; I/O errors close the session

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use rnet_protocol::{Decoded, Message, Packet, RNetCodec};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Broadcaster;
use crate::coordinator::Event;

/// Identifies a session for its lifetime.
pub type SessionId = u64;

/// Frames queued per session before broadcasts to it are dropped.
pub const SESSION_QUEUE: usize = 64;

/// Bound on a single socket write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a closing session may spend flushing queued frames.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingHandshake,
    Subscribed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the connection task should do with an incoming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Ignore,
    /// Handshake received: start broadcasting to this session
    Subscribe,
    /// Hand the packet to the coordinator
    Forward(Packet),
}

/// Pure session lifecycle, independent of any socket.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    state: SessionState,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_subscribed(&self) -> bool {
        self.state == SessionState::Subscribed
    }

    /// The transport is ready to read.
    pub fn accept(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::AwaitingHandshake;
        }
    }

    pub fn on_frame(&mut self, frame: Decoded) -> SessionAction {
        let packet = match frame {
            Ok(packet) => packet,
            Err(e) => {
                warn!(session = self.id, state = %self.state, error = %e, "Dropped invalid client frame");
                return SessionAction::Ignore;
            }
        };

        match (self.state, &packet.message) {
            (SessionState::AwaitingHandshake, Message::Handshake { .. }) => {
                self.state = SessionState::Subscribed;
                SessionAction::Subscribe
            }
            (SessionState::AwaitingHandshake, _) => {
                debug!(session = self.id, packet = %packet, "Ignoring frame before handshake");
                SessionAction::Ignore
            }
            (SessionState::Subscribed, Message::Handshake { .. }) => {
                debug!(session = self.id, "Ignoring repeated handshake");
                SessionAction::Ignore
            }
            (SessionState::Subscribed, _) => SessionAction::Forward(packet),
            (SessionState::Connecting | SessionState::Closed, _) => SessionAction::Ignore,
        }
    }

    /// Moves to `Closed`. Returns true exactly once, and only for a session
    /// that had subscribed, so the disconnect is reported once.
    pub fn close(&mut self) -> bool {
        let was_subscribed = self.state == SessionState::Subscribed;
        self.state = SessionState::Closed;
        was_subscribed
    }
}

// ============================================================================
// Connection task
// ============================================================================

/// Everything a connection task shares with the server.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub broadcaster: Broadcaster,
    pub events: mpsc::Sender<Event>,
    pub handshake_timeout: Duration,
    pub cancel: CancellationToken,
}

/// Drives one client connection until it closes.
pub(crate) async fn run_session(stream: TcpStream, id: SessionId, ctx: SessionContext) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    if let Err(e) = stream.set_nodelay(true) {
        debug!(session = id, error = %e, "Failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(SESSION_QUEUE);
    let token = ctx.cancel.child_token();
    let mut writer_task = tokio::spawn(write_frames(writer, rx, token.clone(), id));

    let mut session = Session::new(id);
    session.accept();
    debug!(session = id, peer = %peer, "Client connected");

    let mut frames = FramedRead::new(reader, RNetCodec::new());
    let deadline = tokio::time::sleep(ctx.handshake_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,

            _ = &mut deadline, if session.state() == SessionState::AwaitingHandshake => {
                warn!(session = id, peer = %peer, "No handshake received, closing");
                break;
            }

            item = frames.next() => match item {
                Some(Ok(frame)) => match session.on_frame(frame) {
                    SessionAction::Subscribe => {
                        ctx.broadcaster.subscribe(id, tx.clone());
                        info!(session = id, peer = %peer, "Client subscribed");
                        if ctx.events.send(Event::ClientSubscribed { session: id }).await.is_err() {
                            break;
                        }
                    }
                    SessionAction::Forward(packet) => {
                        let event = Event::ClientPacket { session: id, packet };
                        if ctx.events.send(event).await.is_err() {
                            break;
                        }
                    }
                    SessionAction::Ignore => {}
                },
                Some(Err(e)) => {
                    debug!(session = id, error = %e, "Client read failed");
                    break;
                }
                None => break,
            },
        }
    }

    if session.close() {
        ctx.broadcaster.unsubscribe(id);
        info!(session = id, peer = %peer, "Client disconnected");
        let _ = ctx.events.send(Event::ClientDisconnected { session: id }).await;
    } else {
        debug!(session = id, peer = %peer, "Connection closed before subscribing");
    }

    // Let queued frames drain, then make sure the writer is gone
    drop(tx);
    if timeout(CLOSE_GRACE, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
}

/// Writes queued frames until the queue closes or a write fails.
async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    id: SessionId,
) {
    while let Some(frame) = rx.recv().await {
        match timeout(WRITE_TIMEOUT, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(session = id, error = %e, "Client write failed");
                token.cancel();
                return;
            }
            Err(_) => {
                warn!(session = id, "Client write timed out");
                token.cancel();
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}
