//! Coordinator actor - owns the state store and processes events in order.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Dropped responders and closed channels are logged, never fatal

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use rnet_core::ZoneId;
use rnet_protocol::{Message, Packet};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::{AllZonesCommand, AllZonesReport, Command, CommandError, Event};
use crate::serial::LinkState;
use crate::server::{Broadcaster, SessionId};
use crate::store::{Mutation, Snapshot, StateStore};

/// Runs `apply` for every zone and collects the outcome per zone.
///
/// A failing zone is recorded and the remaining zones are still attempted.
pub fn apply_to_zones<F>(zones: &[ZoneId], mut apply: F) -> AllZonesReport
where
    F: FnMut(ZoneId) -> Result<(), CommandError>,
{
    let mut report = AllZonesReport::default();
    for &zone in zones {
        match apply(zone) {
            Ok(()) => report.succeeded.push(zone),
            Err(e) => {
                warn!(zone = %zone, error = %e, "Command failed for zone");
                report.failed.push((zone, e));
            }
        }
    }
    report
}

/// Validates `command` against the store and applies it.
fn apply_command(store: &mut StateStore, command: Command) -> Result<Mutation, CommandError> {
    let mutation = match command {
        Command::SetPower { zone, power } => store.set_power(zone, power)?,
        Command::SetVolume { zone, volume } => store.set_volume(zone, volume)?,
        Command::SetSource { zone, source_id } => store.set_source(zone, source_id)?,
        Command::SetMute {
            zone,
            muted,
            fade_ms,
        } => store.set_mute(zone, muted, fade_ms)?,
        Command::SetParameter {
            zone,
            parameter_id,
            value,
        } => store.set_parameter(zone, parameter_id, value)?,
        Command::SetMaxVolume { zone, max_volume } => store.set_max_volume(zone, max_volume)?,
    };
    Ok(mutation)
}

fn bus_error<T>(e: mpsc::error::TrySendError<T>) -> CommandError {
    match e {
        mpsc::error::TrySendError::Full(_) => CommandError::BusBusy,
        mpsc::error::TrySendError::Closed(_) => CommandError::ServiceUnavailable,
    }
}

/// The coordinator actor.
///
/// Single owner of the [`StateStore`]. Bus reports, client frames and API
/// commands all arrive on one channel and are applied one at a time, so
/// every observer sees the same order of changes.
pub struct Coordinator {
    receiver: mpsc::Receiver<Event>,
    store: StateStore,
    snapshot: watch::Sender<Arc<Snapshot>>,
    link: watch::Receiver<LinkState>,
    outbound: mpsc::Sender<Packet>,
    broadcaster: Broadcaster,
    cancel: CancellationToken,
    /// Zones still owed a RequestData after the link came up
    refresh: VecDeque<ZoneId>,
}

impl Coordinator {
    pub(crate) fn new(
        receiver: mpsc::Receiver<Event>,
        store: StateStore,
        snapshot: watch::Sender<Arc<Snapshot>>,
        link: watch::Receiver<LinkState>,
        outbound: mpsc::Sender<Packet>,
        broadcaster: Broadcaster,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            store,
            snapshot,
            link,
            outbound,
            broadcaster,
            cancel,
            refresh: VecDeque::new(),
        }
    }

    /// Processes events until cancelled or every sender is gone.
    pub async fn run(mut self) {
        info!(
            controllers = self.store.snapshot().controllers_len(),
            zones = self.store.snapshot().zones().count(),
            "Coordinator starting"
        );

        let outbound = self.outbound.clone();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.receiver.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                permit = outbound.reserve(), if !self.refresh.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(zone) = self.refresh.pop_front() {
                            permit.send(Packet::from_bridge(zone, Message::RequestData));
                        }
                    }
                    Err(_) => self.refresh.clear(),
                },
            }
        }

        info!("Coordinator stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Bus(packet) => self.handle_bus_packet(&packet),
            Event::Link(state) => self.handle_link(state),
            Event::ClientSubscribed { session } => {
                let reports = self.store.snapshot_reports();
                self.send_to_session(session, &reports);
            }
            Event::ClientDisconnected { session } => {
                debug!(session, "Session left");
            }
            Event::ClientPacket { session, packet } => self.handle_client_packet(session, packet),
            Event::Command {
                command,
                respond_to,
            } => {
                let result = self.execute(command);
                let _ = respond_to.send(result);
            }
            Event::AllZones {
                command,
                respond_to,
            } => {
                let result = self.execute_all(command);
                let _ = respond_to.send(result);
            }
        }
    }

    fn handle_bus_packet(&mut self, packet: &Packet) {
        let reports = self.store.apply_bus_event(packet);
        if reports.is_empty() {
            return;
        }
        self.publish_snapshot();
        self.broadcast(&reports);
    }

    fn handle_link(&mut self, state: LinkState) {
        match state {
            LinkState::Up => {
                info!("Bus link up, requesting zone state");
                self.refresh = self.store.zone_ids().into();
                while let Some(&zone) = self.refresh.front() {
                    let request = Packet::from_bridge(zone, Message::RequestData);
                    match self.send_to_bus(request) {
                        Ok(()) => {
                            self.refresh.pop_front();
                        }
                        Err(CommandError::BusBusy) => {
                            warn!(
                                deferred = self.refresh.len(),
                                "Bus queue full, deferring remaining zone requests"
                            );
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, zones = self.refresh.len(), "Failed to request zone state");
                            self.refresh.clear();
                            break;
                        }
                    }
                }
            }
            LinkState::Down => {
                if !self.refresh.is_empty() {
                    debug!(dropped = self.refresh.len(), "Dropping zone requests for lost link");
                    self.refresh.clear();
                }
                warn!("Bus link down, commands unavailable");
            }
        }
    }

    fn handle_client_packet(&mut self, session: SessionId, packet: Packet) {
        if matches!(packet.message, Message::RequestData) {
            let zone = packet.target.zone_id();
            let reports = match self.store.snapshot().zone(zone) {
                Some(_) => self.store.zone_reports(zone),
                None => self.store.snapshot_reports(),
            };
            self.send_to_session(session, &reports);
            return;
        }

        match Command::from_packet(&packet) {
            Some(command) => {
                if let Err(e) = self.execute(command) {
                    warn!(session, packet = %packet, error = %e, "Client command rejected");
                }
            }
            None => debug!(session, packet = %packet, "Ignoring non-command client frame"),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn is_connected(&self) -> bool {
        self.link.borrow().is_up()
    }

    /// Validates and applies a command, then forwards and broadcasts it.
    fn execute(&mut self, command: Command) -> Result<(), CommandError> {
        if !self.is_connected() {
            return Err(CommandError::ServiceUnavailable);
        }
        // A command emits at most two bus packets. Both slots are held
        // before the store changes, so a refused command leaves no trace.
        let first = self.outbound.try_reserve().map_err(bus_error)?;
        let second = self.outbound.try_reserve().map_err(bus_error)?;

        let Mutation { bus, reports } = apply_command(&mut self.store, command)?;
        debug!(command = ?command, "Applied command");

        let mut permits = [first, second].into_iter();
        for packet in bus {
            match permits.next() {
                Some(permit) => permit.send(packet),
                None => warn!(packet = %packet, "No bus slot left for packet"),
            }
        }
        drop(permits);

        self.publish_snapshot();
        self.broadcast(&reports);
        Ok(())
    }

    fn execute_all(&mut self, command: AllZonesCommand) -> Result<AllZonesReport, CommandError> {
        if !self.is_connected() {
            return Err(CommandError::ServiceUnavailable);
        }
        let zones = self.store.zone_ids();
        Ok(apply_to_zones(&zones, |zone| self.execute(command.for_zone(zone))))
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    fn send_to_bus(&self, packet: Packet) -> Result<(), CommandError> {
        self.outbound.try_send(packet).map_err(bus_error)
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(Arc::new(self.store.snapshot().clone()));
    }

    fn broadcast(&self, reports: &[Packet]) {
        for packet in reports {
            match packet.encode() {
                Ok(frame) => {
                    let delivered = self.broadcaster.broadcast(&frame.freeze());
                    debug!(packet = %packet, sessions = delivered, "Broadcast report");
                }
                Err(e) => warn!(packet = %packet, error = %e, "Failed to encode report"),
            }
        }
    }

    /// Queues `reports` to one session as a single write, so a full
    /// snapshot occupies one slot of the session queue.
    fn send_to_session(&self, session: SessionId, reports: &[Packet]) {
        let mut batch = BytesMut::new();
        let mut frames = 0usize;
        for packet in reports {
            match packet.encode() {
                Ok(frame) => {
                    batch.extend_from_slice(&frame);
                    frames += 1;
                }
                Err(e) => warn!(packet = %packet, error = %e, "Failed to encode report"),
            }
        }
        if frames == 0 {
            return;
        }
        if self.broadcaster.send_to(session, batch.freeze()) {
            debug!(session, frames, "Sent state to session");
        } else {
            warn!(session, "Session queue unavailable, state not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rnet_core::DomainError;

    #[test]
    fn test_failure_on_one_zone_does_not_abort_the_rest() {
        let zones: Vec<ZoneId> = (0..4).map(|z| ZoneId::new(0, z)).collect();
        let mut attempted = Vec::new();
        let report = apply_to_zones(&zones, |zone| {
            attempted.push(zone);
            if zone.zone == 2 {
                Err(CommandError::Domain(DomainError::ZoneNotFound { zone }))
            } else {
                Ok(())
            }
        });

        assert_eq!(attempted, zones);
        assert_eq!(report.succeeded.len(), 3);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, ZoneId::new(0, 2));
        assert!(!report.is_complete());
    }

    #[test]
    fn test_empty_zone_list() {
        let report = apply_to_zones(&[], |_| Err(CommandError::ChannelClosed));
        assert!(report.is_complete());
        assert!(report.succeeded.is_empty());
    }
}
