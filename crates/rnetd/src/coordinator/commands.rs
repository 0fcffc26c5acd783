//! Coordinator events, commands and errors.
//!
//! Everything that can change bridge state reaches the coordinator as an
//! [`Event`] on a single channel, so bus reports, client frames and API
//! calls are applied in one well-defined order.

use rnet_core::{DomainError, ZoneId};
use rnet_protocol::{Message, Packet};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::serial::LinkState;
use crate::server::SessionId;

// ============================================================================
// Commands
// ============================================================================

/// A validated-on-apply change to one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetPower {
        zone: ZoneId,
        power: bool,
    },
    /// Requested volume; stored rounded down to even and clamped
    SetVolume {
        zone: ZoneId,
        volume: i32,
    },
    SetSource {
        zone: ZoneId,
        source_id: Option<u8>,
    },
    SetMute {
        zone: ZoneId,
        muted: bool,
        fade_ms: u16,
    },
    SetParameter {
        zone: ZoneId,
        parameter_id: u8,
        value: i32,
    },
    SetMaxVolume {
        zone: ZoneId,
        max_volume: i32,
    },
}

impl Command {
    pub fn zone(&self) -> ZoneId {
        match self {
            Self::SetPower { zone, .. }
            | Self::SetVolume { zone, .. }
            | Self::SetSource { zone, .. }
            | Self::SetMute { zone, .. }
            | Self::SetParameter { zone, .. }
            | Self::SetMaxVolume { zone, .. } => *zone,
        }
    }

    /// The command a client frame asks for, `None` for non-command messages.
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        let zone = packet.target.zone_id();
        let command = match packet.message {
            Message::PowerSet { power } => Self::SetPower { zone, power },
            Message::VolumeSet { volume } => Self::SetVolume {
                zone,
                volume: i32::from(volume),
            },
            Message::SourceSet { source_id } => Self::SetSource { zone, source_id },
            Message::MuteSet { muted, fade_ms } => Self::SetMute {
                zone,
                muted,
                fade_ms,
            },
            Message::ParameterSet { parameter, value } => Self::SetParameter {
                zone,
                parameter_id: parameter.id(),
                value: i32::from(value),
            },
            Message::MaxVolumeSet { max_volume } => Self::SetMaxVolume {
                zone,
                max_volume: i32::from(max_volume),
            },
            _ => return None,
        };
        Some(command)
    }
}

/// A command applied to every known zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllZonesCommand {
    Power { power: bool },
    Mute { muted: bool, fade_ms: u16 },
}

impl AllZonesCommand {
    pub fn for_zone(self, zone: ZoneId) -> Command {
        match self {
            Self::Power { power } => Command::SetPower { zone, power },
            Self::Mute { muted, fade_ms } => Command::SetMute {
                zone,
                muted,
                fade_ms,
            },
        }
    }
}

/// Outcome of an all-zones command. One zone failing never stops the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllZonesReport {
    pub succeeded: Vec<ZoneId>,
    pub failed: Vec<(ZoneId, CommandError)>,
}

impl AllZonesReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Inputs to the coordinator, processed strictly in arrival order.
#[derive(Debug)]
pub enum Event {
    /// A packet decoded from the bus
    Bus(Packet),

    /// Bus link went up or down
    Link(LinkState),

    /// A session completed its handshake
    ClientSubscribed { session: SessionId },

    /// A subscribed session closed
    ClientDisconnected { session: SessionId },

    /// A frame from a subscribed session
    ClientPacket { session: SessionId, packet: Packet },

    /// A command from the API layer
    Command {
        command: Command,
        respond_to: oneshot::Sender<Result<(), CommandError>>,
    },

    /// A command for every zone from the API layer
    AllZones {
        command: AllZonesCommand,
        respond_to: oneshot::Sender<Result<AllZonesReport, CommandError>>,
    },
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned to command issuers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The bus link is down
    #[error("Service unavailable: bus link is down")]
    ServiceUnavailable,

    /// The outbound bus queue is full
    #[error("Bus is busy, command dropped")]
    BusBusy,

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The coordinator has shut down
    #[error("Coordinator channel closed")]
    ChannelClosed,
}
