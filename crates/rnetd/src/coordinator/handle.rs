//! Client interface for the coordinator.
//!
//! The `CoordinatorHandle` is the API surface of the bridge: reads come
//! from the latest published snapshot without a round trip, writes travel
//! to the actor as events and wait for its verdict.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `CommandError::ChannelClosed`

use std::sync::Arc;

use rnet_core::{Source, Zone, ZoneId};
use tokio::sync::{mpsc, oneshot, watch};

use super::commands::{AllZonesCommand, AllZonesReport, Command, CommandError, Event};
use crate::serial::LinkState;
use crate::store::Snapshot;

/// Fade applied by `set_all_mute` when the caller has no preference.
pub const DEFAULT_MUTE_FADE_MS: u16 = 1000;

/// Handle for interacting with the coordinator.
///
/// Cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<Event>,
    snapshot: watch::Receiver<Arc<Snapshot>>,
    link: watch::Receiver<LinkState>,
}

impl CoordinatorHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<Event>,
        snapshot: watch::Receiver<Arc<Snapshot>>,
        link: watch::Receiver<LinkState>,
    ) -> Self {
        Self {
            sender,
            snapshot,
            link,
        }
    }

    /// Sender for components that feed events in (transport, server).
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.sender.clone()
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Whether the bus link is up.
    pub fn is_connected(&self) -> bool {
        self.link.borrow().is_up()
    }

    /// The latest published state.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Receiver that is notified after every state change.
    pub fn watch_snapshot(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.clone()
    }

    pub fn controllers_len(&self) -> usize {
        self.snapshot.borrow().controllers_len()
    }

    pub fn zones_len(&self, controller: u8) -> usize {
        self.snapshot.borrow().zones_len(controller)
    }

    pub fn zone(&self, id: ZoneId) -> Option<Zone> {
        self.snapshot.borrow().zone(id).cloned()
    }

    pub fn sources_len(&self) -> usize {
        self.snapshot.borrow().sources_len()
    }

    pub fn source(&self, id: u8) -> Option<Source> {
        self.snapshot.borrow().source(id).cloned()
    }

    pub fn find_zone_by_name(&self, name: &str) -> Option<Zone> {
        self.snapshot.borrow().find_zone_by_name(name).cloned()
    }

    pub fn find_source_by_name(&self, name: &str) -> Option<Source> {
        self.snapshot.borrow().find_source_by_name(name).cloned()
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Sends a command and waits for it to be applied.
    ///
    /// # Errors
    ///
    /// - `CommandError::ServiceUnavailable` if the bus link is down
    /// - `CommandError::Domain` if validation fails (state is unchanged)
    /// - `CommandError::BusBusy` if the outbound queue is full
    /// - `CommandError::ChannelClosed` if the coordinator has shut down
    pub async fn execute(&self, command: Command) -> Result<(), CommandError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(Event::Command {
                command,
                respond_to,
            })
            .await
            .map_err(|_| CommandError::ChannelClosed)?;
        rx.await.map_err(|_| CommandError::ChannelClosed)?
    }

    pub async fn set_power(&self, zone: ZoneId, power: bool) -> Result<(), CommandError> {
        self.execute(Command::SetPower { zone, power }).await
    }

    /// Stored rounded down to an even step and clamped to the zone maximum.
    pub async fn set_volume(&self, zone: ZoneId, volume: i32) -> Result<(), CommandError> {
        self.execute(Command::SetVolume { zone, volume }).await
    }

    /// `None` disconnects the zone from any source.
    pub async fn set_source(
        &self,
        zone: ZoneId,
        source_id: Option<u8>,
    ) -> Result<(), CommandError> {
        self.execute(Command::SetSource { zone, source_id }).await
    }

    pub async fn set_mute(
        &self,
        zone: ZoneId,
        muted: bool,
        fade_ms: u16,
    ) -> Result<(), CommandError> {
        self.execute(Command::SetMute {
            zone,
            muted,
            fade_ms,
        })
        .await
    }

    /// Sets a parameter by numeric id; see `ZoneParameter` for the known ids.
    pub async fn set_parameter(
        &self,
        zone: ZoneId,
        parameter_id: u8,
        value: i32,
    ) -> Result<(), CommandError> {
        self.execute(Command::SetParameter {
            zone,
            parameter_id,
            value,
        })
        .await
    }

    /// Accepts 0..=100; a current volume above the new maximum is lowered.
    pub async fn set_max_volume(&self, zone: ZoneId, max_volume: i32) -> Result<(), CommandError> {
        self.execute(Command::SetMaxVolume { zone, max_volume }).await
    }

    async fn execute_all(&self, command: AllZonesCommand) -> Result<AllZonesReport, CommandError> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(Event::AllZones {
                command,
                respond_to,
            })
            .await
            .map_err(|_| CommandError::ChannelClosed)?;
        rx.await.map_err(|_| CommandError::ChannelClosed)?
    }

    /// Powers every known zone on or off, one command per zone.
    pub async fn set_all_power(&self, power: bool) -> Result<AllZonesReport, CommandError> {
        self.execute_all(AllZonesCommand::Power { power }).await
    }

    /// Mutes or unmutes every known zone with the given fade.
    pub async fn set_all_mute(
        &self,
        muted: bool,
        fade_ms: u16,
    ) -> Result<AllZonesReport, CommandError> {
        self.execute_all(AllZonesCommand::Mute { muted, fade_ms }).await
    }
}
