//! Serial Transport - owns the bus link.
//!
//! A single task connects through a [`BusConnector`], reassembles frames
//! with [`RNetCodec`] and forwards decoded packets to the coordinator.
//! Outbound packets come from one bounded queue, so writes never
//! interleave.
//!
//! ```text
//!            connect ok
//!   ┌──────┐ ─────────▶ ┌────┐
//!   │ Down │            │ Up │
//!   └──────┘ ◀───────── └────┘
//!      ▲ │  I/O error / EOF
//!      │ │ connect failed
//!      └─┘ sleep(initial * 2^attempt, capped)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Malformed frames are logged and dropped; only I/O errors drop the link
//! - Channel closure ends the task quietly

mod connector;
#[cfg(unix)]
mod device;

pub use connector::{connector_for, BusConnector, BusStream, DeviceConnector, TcpBridgeConnector};
#[cfg(unix)]
pub use device::SerialDevice;

/// RNet controllers talk 19200 8N1.
pub const DEFAULT_BAUD_RATE: u32 = 19_200;

/// Baud rates accepted for a device node.
pub const SUPPORTED_BAUD_RATES: [u32; 5] = [9_600, 19_200, 38_400, 57_600, 115_200];

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rnet_protocol::{CodecError, Packet, RNetCodec};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Event;

/// Capacity of the outbound bus queue.
pub const OUTBOUND_QUEUE: usize = 128;

// ============================================================================
// Link state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Up,
}

impl LinkState {
    pub fn is_up(self) -> bool {
        self == Self::Up
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Down => write!(f, "down"),
            Self::Up => write!(f, "up"),
        }
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`,
    /// never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Handle to the running transport task.
pub struct SerialTransport {
    link: watch::Receiver<LinkState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SerialTransport {
    /// Spawns the transport task.
    ///
    /// # Arguments
    ///
    /// * `connector` - How to open the bus link
    /// * `backoff` - Reconnect delays
    /// * `outbound` - Packets to write, in order
    /// * `link` - Published link state
    /// * `events` - Coordinator inbox for decoded packets and link changes
    /// * `cancel` - Stops the task, including a pending reconnect timer
    pub fn spawn(
        connector: Arc<dyn BusConnector>,
        backoff: Backoff,
        outbound: mpsc::Receiver<Packet>,
        link: watch::Sender<LinkState>,
        events: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        let link_rx = link.subscribe();
        let worker = Worker {
            connector,
            backoff,
            outbound,
            link,
            events,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());
        Self {
            link: link_rx,
            cancel,
            task,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.borrow().is_up()
    }

    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }

    /// Cancels the task and waits for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Serial transport task ended abnormally");
        }
    }
}

/// Why a connected session with the bus ended.
enum LinkEnd {
    Lost,
    Stopped,
}

struct Worker {
    connector: Arc<dyn BusConnector>,
    backoff: Backoff,
    outbound: mpsc::Receiver<Packet>,
    link: watch::Sender<LinkState>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        let endpoint = self.connector.describe();
        info!(endpoint = %endpoint, "Serial transport starting");

        let mut attempt: u32 = 0;
        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    attempt = 0;
                    self.discard_stale_outbound();
                    info!(endpoint = %endpoint, "Bus link up");
                    self.set_link(LinkState::Up).await;

                    let end = self.pump(stream).await;
                    self.set_link(LinkState::Down).await;
                    if matches!(end, LinkEnd::Stopped) {
                        break;
                    }
                    warn!(endpoint = %endpoint, "Bus link lost");
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, attempt, "Failed to open bus link");
                }
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnecting");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_link(LinkState::Down).await;
        info!(endpoint = %endpoint, "Serial transport stopped");
    }

    /// Moves bytes in both directions until the link fails or we are stopped.
    async fn pump(&mut self, stream: Box<dyn BusStream>) -> LinkEnd {
        let (reader, writer) = tokio::io::split(stream);
        let mut frames = FramedRead::new(reader, RNetCodec::new());
        let mut sink = FramedWrite::new(writer, RNetCodec::new());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LinkEnd::Stopped,

                item = frames.next() => match item {
                    Some(Ok(Ok(packet))) => {
                        debug!(packet = %packet, "Bus packet received");
                        if self.events.send(Event::Bus(packet)).await.is_err() {
                            return LinkEnd::Stopped;
                        }
                    }
                    Some(Ok(Err(e))) => {
                        warn!(error = %e, "Dropped invalid bus frame");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Bus read failed");
                        return LinkEnd::Lost;
                    }
                    None => {
                        debug!("Bus stream closed");
                        return LinkEnd::Lost;
                    }
                },

                packet = self.outbound.recv() => match packet {
                    Some(packet) => {
                        debug!(packet = %packet, "Writing bus packet");
                        match sink.send(&packet).await {
                            Ok(()) => {}
                            Err(CodecError::Protocol(e)) => {
                                warn!(error = %e, packet = %packet, "Dropped unencodable packet");
                            }
                            Err(CodecError::Io(e)) => {
                                warn!(error = %e, "Bus write failed");
                                return LinkEnd::Lost;
                            }
                        }
                    }
                    None => return LinkEnd::Stopped,
                },
            }
        }
    }

    /// Frames queued while the link was down are stale by now.
    fn discard_stale_outbound(&mut self) {
        let mut discarded = 0usize;
        while self.outbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "Discarded frames queued while the bus was down");
        }
    }

    async fn set_link(&self, state: LinkState) {
        if self.link.send_replace(state) == state {
            return;
        }
        if self.events.send(Event::Link(state)).await.is_err() {
            debug!("Coordinator gone, link change not delivered");
        }
    }
}
