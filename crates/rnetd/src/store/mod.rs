//! State Store - authoritative zone, source and controller state.
//!
//! The store is owned by the coordinator task; nothing else mutates it.
//! Readers get an immutable [`Snapshot`] that the coordinator republishes
//! after every change.
//!
//! Every mutation returns the packets it produced:
//! - Set variants to forward to the bus
//! - Get variants (reports) to broadcast to subscribed TCP sessions
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Lookups return `Option` or `DomainError::ZoneNotFound`
//! - Validation happens before any field is touched

mod snapshot;

pub use snapshot::Snapshot;

use rnet_core::{Controller, DomainError, DomainResult, Source, ZoneId, ZoneParameter};
use rnet_protocol::{Address, Message, Packet, NO_SOURCE};
use tracing::{debug, warn};

// ============================================================================
// Mutation
// ============================================================================

/// Packets produced by one mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mutation {
    /// Commands to send on the bus
    pub bus: Vec<Packet>,
    /// Reports to broadcast to subscribed sessions
    pub reports: Vec<Packet>,
}

impl Mutation {
    fn push(&mut self, zone: ZoneId, command: Message, report: Message) {
        self.bus.push(Packet::from_bridge(zone, command));
        self.reports.push(Packet::from_bridge(zone, report));
    }
}

// ============================================================================
// State Store
// ============================================================================

/// Owns the bridge's view of the audio system.
///
/// # Invariants
///
/// - A zone's volume is even and never above its maximum volume
/// - Parameter values are always inside their accepted range
/// - A failed mutation leaves the state untouched and produces no packets
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    state: Snapshot,
}

impl StateStore {
    /// Creates a store from configured controllers and sources.
    pub fn new(controllers: Vec<Controller>, mut sources: Vec<Source>) -> Self {
        sources.sort_by_key(|s| s.id);
        Self {
            state: Snapshot {
                controllers,
                sources,
            },
        }
    }

    /// Current state, borrowed.
    pub fn snapshot(&self) -> &Snapshot {
        &self.state
    }

    /// Every known zone id, controller by controller.
    pub fn zone_ids(&self) -> Vec<ZoneId> {
        self.state.zones().map(|z| z.id).collect()
    }

    fn zone_mut(&mut self, id: ZoneId) -> DomainResult<&mut rnet_core::Zone> {
        self.state
            .controllers
            .iter_mut()
            .find(|c| c.id == id.controller)
            .and_then(|c| c.zone_mut(id.zone))
            .ok_or(DomainError::ZoneNotFound { zone: id })
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub fn set_power(&mut self, id: ZoneId, power: bool) -> DomainResult<Mutation> {
        let zone = self.zone_mut(id)?;
        zone.set_power(power);

        let mut mutation = Mutation::default();
        mutation.push(id, Message::PowerSet { power }, Message::PowerGet { power });
        Ok(mutation)
    }

    /// Stores the volume rounded down to an even step and clamped to the
    /// zone's maximum. The packets carry the stored value.
    pub fn set_volume(&mut self, id: ZoneId, requested: i32) -> DomainResult<Mutation> {
        let zone = self.zone_mut(id)?;
        let volume = zone.set_volume(requested);

        let mut mutation = Mutation::default();
        mutation.push(id, Message::VolumeSet { volume }, Message::VolumeGet { volume });
        Ok(mutation)
    }

    /// Routes a source to a zone, `None` disconnects it.
    pub fn set_source(&mut self, id: ZoneId, source_id: Option<u8>) -> DomainResult<Mutation> {
        if let Some(source) = source_id {
            if source == NO_SOURCE || self.state.source(source).is_none() {
                return Err(DomainError::SourceNotFound { id: source });
            }
        }
        let zone = self.zone_mut(id)?;
        zone.set_source(source_id);

        let mut mutation = Mutation::default();
        mutation.push(
            id,
            Message::SourceSet { source_id },
            Message::SourceGet { source_id },
        );
        Ok(mutation)
    }

    pub fn set_mute(&mut self, id: ZoneId, muted: bool, fade_ms: u16) -> DomainResult<Mutation> {
        let zone = self.zone_mut(id)?;
        zone.set_muted(muted);

        let mut mutation = Mutation::default();
        mutation.push(
            id,
            Message::MuteSet { muted, fade_ms },
            Message::MuteGet { muted, fade_ms },
        );
        Ok(mutation)
    }

    /// Sets a zone parameter by its numeric id.
    ///
    /// # Errors
    ///
    /// - `DomainError::InvalidParameter` for an id outside the known set
    /// - `DomainError::InvalidValue` for a value outside the parameter's range
    /// - `DomainError::ZoneNotFound` for an unknown zone
    pub fn set_parameter(
        &mut self,
        id: ZoneId,
        parameter_id: u8,
        value: i32,
    ) -> DomainResult<Mutation> {
        let parameter = ZoneParameter::from_id(parameter_id)?;
        let zone = self.zone_mut(id)?;
        let value = zone.set_parameter(parameter, value)?;

        let mut mutation = Mutation::default();
        mutation.push(
            id,
            Message::ParameterSet { parameter, value },
            Message::ParameterGet { parameter, value },
        );
        Ok(mutation)
    }

    /// Sets the maximum volume. If the current volume is now above it, the
    /// lowered volume is emitted as well.
    pub fn set_max_volume(&mut self, id: ZoneId, requested: i32) -> DomainResult<Mutation> {
        let zone = self.zone_mut(id)?;
        let previous_volume = zone.volume;
        let max_volume = zone.set_max_volume(requested)?;
        let volume = zone.volume;

        let mut mutation = Mutation::default();
        mutation.push(
            id,
            Message::MaxVolumeSet { max_volume },
            Message::MaxVolumeGet { max_volume },
        );
        if volume != previous_volume {
            mutation.push(id, Message::VolumeSet { volume }, Message::VolumeGet { volume });
        }
        Ok(mutation)
    }

    // ------------------------------------------------------------------------
    // Bus reconciliation
    // ------------------------------------------------------------------------

    /// Applies a packet received from the bus.
    ///
    /// Zone messages address the zone they describe in the target field.
    /// Returns reports for the fields that actually changed. Packets for
    /// unknown zones and out-of-range values are logged and ignored.
    pub fn apply_bus_event(&mut self, packet: &Packet) -> Vec<Packet> {
        let id = packet.target.zone_id();

        if let Message::SourceName {
            source_id,
            source_type,
            name,
        } = &packet.message
        {
            return self.apply_source_name(*source_id, *source_type, name);
        }

        if matches!(
            packet.message,
            Message::RequestData | Message::Handshake { .. }
        ) {
            return Vec::new();
        }

        let zone = match self.zone_mut(id) {
            Ok(zone) => zone,
            Err(e) => {
                warn!(error = %e, packet = %packet, "Ignoring bus packet for unknown zone");
                return Vec::new();
            }
        };

        let mut reports = Vec::new();
        let mut report = |message| reports.push(Packet::from_bridge(id, message));

        match &packet.message {
            Message::PowerSet { power } | Message::PowerGet { power } => {
                if zone.set_power(*power) {
                    report(Message::PowerGet { power: *power });
                }
            }
            Message::VolumeSet { volume } | Message::VolumeGet { volume } => {
                let before = zone.volume;
                let stored = zone.set_volume(i32::from(*volume));
                if stored != before {
                    report(Message::VolumeGet { volume: stored });
                }
            }
            Message::SourceSet { source_id } | Message::SourceGet { source_id } => {
                if zone.set_source(*source_id) {
                    report(Message::SourceGet {
                        source_id: *source_id,
                    });
                }
            }
            Message::MuteSet { muted, fade_ms } | Message::MuteGet { muted, fade_ms } => {
                if zone.set_muted(*muted) {
                    report(Message::MuteGet {
                        muted: *muted,
                        fade_ms: *fade_ms,
                    });
                }
            }
            Message::ParameterSet { parameter, value }
            | Message::ParameterGet { parameter, value } => {
                let before = zone.parameter(*parameter);
                match zone.set_parameter(*parameter, i32::from(*value)) {
                    Ok(stored) if stored != before => report(Message::ParameterGet {
                        parameter: *parameter,
                        value: stored,
                    }),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, zone = %id, "Ignoring bus parameter report"),
                }
            }
            Message::MaxVolumeSet { max_volume } | Message::MaxVolumeGet { max_volume } => {
                let (before_max, before_volume) = (zone.max_volume, zone.volume);
                match zone.set_max_volume(i32::from(*max_volume)) {
                    Ok(stored) => {
                        if stored != before_max {
                            report(Message::MaxVolumeGet { max_volume: stored });
                        }
                        if zone.volume != before_volume {
                            report(Message::VolumeGet {
                                volume: zone.volume,
                            });
                        }
                    }
                    Err(e) => warn!(error = %e, zone = %id, "Ignoring bus max volume report"),
                }
            }
            Message::ZoneName { name } => {
                if zone.set_name(name) {
                    report(Message::ZoneName { name: name.clone() });
                }
            }
            Message::RequestData | Message::Handshake { .. } | Message::SourceName { .. } => {}
        }

        if !reports.is_empty() {
            debug!(zone = %id, changes = reports.len(), "Applied bus report");
        }
        reports
    }

    fn apply_source_name(
        &mut self,
        source_id: u8,
        source_type: rnet_core::SourceType,
        name: &str,
    ) -> Vec<Packet> {
        if source_id == NO_SOURCE {
            warn!(source = source_id, "Ignoring name for reserved source id");
            return Vec::new();
        }
        let sources = &mut self.state.sources;
        match sources.binary_search_by_key(&source_id, |s| s.id) {
            Ok(idx) => {
                let Some(source) = sources.get_mut(idx) else {
                    return Vec::new();
                };
                if source.name == name && source.source_type == source_type {
                    return Vec::new();
                }
                source.name = name.to_string();
                source.source_type = source_type;
            }
            Err(idx) => sources.insert(idx, Source::new(source_id, name, source_type)),
        }

        vec![Packet::from_bridge(
            Address::default(),
            Message::SourceName {
                source_id,
                source_type,
                name: name.to_string(),
            },
        )]
    }

    // ------------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------------

    /// Full description of one zone as report packets.
    pub fn zone_reports(&self, id: ZoneId) -> Vec<Packet> {
        let Some(zone) = self.state.zone(id) else {
            return Vec::new();
        };

        let mut messages = vec![
            Message::ZoneName {
                name: zone.name.clone(),
            },
            Message::PowerGet { power: zone.power },
            Message::VolumeGet {
                volume: zone.volume,
            },
            Message::SourceGet {
                source_id: zone.source_id,
            },
            Message::MuteGet {
                muted: zone.muted,
                fade_ms: 0,
            },
            Message::MaxVolumeGet {
                max_volume: zone.max_volume,
            },
        ];
        messages.extend(ZoneParameter::ALL.iter().map(|p| Message::ParameterGet {
            parameter: *p,
            value: zone.parameter(*p),
        }));

        messages
            .into_iter()
            .map(|m| Packet::from_bridge(id, m))
            .collect()
    }

    /// The whole state as report packets: sources first, then every zone.
    pub fn snapshot_reports(&self) -> Vec<Packet> {
        let sources = self.state.sources.iter().map(|s| {
            Packet::from_bridge(
                Address::default(),
                Message::SourceName {
                    source_id: s.id,
                    source_type: s.source_type,
                    name: s.name.clone(),
                },
            )
        });
        let zones = self
            .state
            .zones()
            .flat_map(|z| self.zone_reports(z.id));
        sources.chain(zones).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rnet_core::SourceType;

    fn store() -> StateStore {
        StateStore::new(
            vec![
                Controller::new(0, ["Kitchen", "Den"]),
                Controller::new(1, ["Patio"]),
            ],
            vec![
                Source::new(2, "Radio", SourceType::Radio),
                Source::new(0, "TV", SourceType::Tv),
            ],
        )
    }

    const KITCHEN: ZoneId = ZoneId::new(0, 0);

    fn zone(store: &StateStore, id: ZoneId) -> &rnet_core::Zone {
        store.snapshot().zone(id).unwrap()
    }

    #[test]
    fn test_sources_sorted_by_id() {
        let s = store();
        let ids: Vec<u8> = s.snapshot().sources.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn test_set_volume_rounds_down_and_reports_stored_value() {
        let mut s = store();
        let mutation = s.set_volume(KITCHEN, 55).unwrap();
        assert_eq!(zone(&s, KITCHEN).volume, 54);
        assert_eq!(mutation.bus[0].message, Message::VolumeSet { volume: 54 });
        assert_eq!(mutation.reports[0].message, Message::VolumeGet { volume: 54 });
        assert_eq!(mutation.bus[0].target, Address::new(0, 0));
    }

    #[test]
    fn test_set_volume_clamps_to_max() {
        let mut s = store();
        s.set_max_volume(KITCHEN, 60).unwrap();
        s.set_volume(KITCHEN, 99).unwrap();
        assert_eq!(zone(&s, KITCHEN).volume, 60);
        s.set_volume(KITCHEN, -4).unwrap();
        assert_eq!(zone(&s, KITCHEN).volume, 0);
    }

    #[test]
    fn test_invalid_parameter_changes_nothing() {
        let mut s = store();
        let before = s.snapshot().clone();
        assert_eq!(
            s.set_parameter(KITCHEN, 3, 1),
            Err(DomainError::InvalidParameter { id: 3 })
        );
        assert_eq!(s.snapshot(), &before);
    }

    #[test]
    fn test_parameter_out_of_range_changes_nothing() {
        let mut s = store();
        assert!(matches!(
            s.set_parameter(KITCHEN, ZoneParameter::Bass.id(), 11),
            Err(DomainError::InvalidValue { .. })
        ));
        assert_eq!(zone(&s, KITCHEN).parameter(ZoneParameter::Bass), 0);

        let mutation = s
            .set_parameter(KITCHEN, ZoneParameter::Bass.id(), -10)
            .unwrap();
        assert_eq!(
            mutation.bus[0].message,
            Message::ParameterSet {
                parameter: ZoneParameter::Bass,
                value: -10
            }
        );
    }

    #[test]
    fn test_unknown_zone_is_rejected() {
        let mut s = store();
        let missing = ZoneId::new(1, 4);
        assert_eq!(
            s.set_power(missing, true),
            Err(DomainError::ZoneNotFound { zone: missing })
        );
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let mut s = store();
        assert_eq!(
            s.set_source(KITCHEN, Some(7)),
            Err(DomainError::SourceNotFound { id: 7 })
        );
        assert_eq!(
            s.set_source(KITCHEN, Some(NO_SOURCE)),
            Err(DomainError::SourceNotFound { id: NO_SOURCE })
        );
        assert!(s.set_source(KITCHEN, Some(2)).is_ok());
        assert!(s.set_source(KITCHEN, None).is_ok());
        assert_eq!(zone(&s, KITCHEN).source_id, None);
    }

    #[test]
    fn test_lowering_max_volume_lowers_volume() {
        let mut s = store();
        s.set_volume(KITCHEN, 80).unwrap();
        let mutation = s.set_max_volume(KITCHEN, 51).unwrap();

        assert_eq!(zone(&s, KITCHEN).max_volume, 50);
        assert_eq!(zone(&s, KITCHEN).volume, 50);
        assert_eq!(mutation.bus.len(), 2);
        assert_eq!(mutation.reports[1].message, Message::VolumeGet { volume: 50 });
    }

    #[test]
    fn test_max_volume_out_of_range() {
        let mut s = store();
        assert!(s.set_max_volume(KITCHEN, 101).is_err());
        assert!(s.set_max_volume(KITCHEN, -1).is_err());
        assert_eq!(zone(&s, KITCHEN).max_volume, 100);
    }

    #[test]
    fn test_mute_carries_fade() {
        let mut s = store();
        let mutation = s.set_mute(KITCHEN, true, 1000).unwrap();
        assert!(zone(&s, KITCHEN).muted);
        assert_eq!(
            mutation.bus[0].message,
            Message::MuteSet {
                muted: true,
                fade_ms: 1000
            }
        );
    }

    #[test]
    fn test_bus_event_reports_only_changes() {
        let mut s = store();
        let report = Packet::new(
            Address::new(0, 1),
            Address::new(0, 1),
            Message::PowerGet { power: true },
        );
        let reports = s.apply_bus_event(&report);
        assert_eq!(reports.len(), 1);
        assert!(zone(&s, ZoneId::new(0, 1)).power);

        assert!(s.apply_bus_event(&report).is_empty());
    }

    #[test]
    fn test_bus_event_for_unknown_zone_is_ignored() {
        let mut s = store();
        let before = s.snapshot().clone();
        let packet = Packet::from_bridge(ZoneId::new(9, 9), Message::VolumeGet { volume: 40 });
        assert!(s.apply_bus_event(&packet).is_empty());
        assert_eq!(s.snapshot(), &before);
    }

    #[test]
    fn test_bus_overwrites_optimistic_command() {
        let mut s = store();
        s.set_volume(KITCHEN, 40).unwrap();
        assert_eq!(zone(&s, KITCHEN).volume, 40);

        // Hardware refused the change and reports what it actually has
        let reports = s.apply_bus_event(&Packet::from_bridge(
            KITCHEN,
            Message::VolumeGet { volume: 30 },
        ));
        assert_eq!(zone(&s, KITCHEN).volume, 30);
        assert_eq!(reports[0].message, Message::VolumeGet { volume: 30 });
    }

    #[test]
    fn test_bus_zone_name_and_source_name() {
        let mut s = store();
        s.apply_bus_event(&Packet::from_bridge(
            KITCHEN,
            Message::ZoneName {
                name: "Cuisine".to_string(),
            },
        ));
        assert_eq!(zone(&s, KITCHEN).name, "Cuisine");

        let reports = s.apply_bus_event(&Packet::from_bridge(
            Address::default(),
            Message::SourceName {
                source_id: 1,
                source_type: SourceType::Spotify,
                name: "Spotify".to_string(),
            },
        ));
        assert_eq!(reports.len(), 1);
        let ids: Vec<u8> = s.snapshot().sources.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        // 0xFF means "no source" on the wire and can never name one
        let reports = s.apply_bus_event(&Packet::from_bridge(
            Address::default(),
            Message::SourceName {
                source_id: NO_SOURCE,
                source_type: SourceType::Generic,
                name: "Ghost".to_string(),
            },
        ));
        assert!(reports.is_empty());
        assert!(s.snapshot().source(NO_SOURCE).is_none());
    }

    #[test]
    fn test_bus_parameter_out_of_range_is_ignored() {
        let mut s = store();
        let packet = Packet::from_bridge(
            KITCHEN,
            Message::ParameterGet {
                parameter: ZoneParameter::Treble,
                value: 40,
            },
        );
        assert!(s.apply_bus_event(&packet).is_empty());
        assert_eq!(zone(&s, KITCHEN).parameter(ZoneParameter::Treble), 0);
    }

    #[test]
    fn test_snapshot_reports_cover_every_zone() {
        let s = store();
        let reports = s.snapshot_reports();
        let per_zone = 6 + ZoneParameter::ALL.len();
        assert_eq!(reports.len(), 2 + 3 * per_zone);
        assert!(matches!(reports[0].message, Message::SourceName { .. }));
        assert!(reports
            .iter()
            .all(|p| !p.message.is_command() && p.source == rnet_protocol::BRIDGE_ADDRESS));
    }
}
