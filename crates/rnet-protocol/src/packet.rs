//! Addressed, typed packets.

use std::fmt;

use bytes::BytesMut;
use rnet_core::ZoneId;

use crate::{Message, MessageType, ProtocolError, RawPacket};

/// A controller/zone pair on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    pub controller: u8,
    pub zone: u8,
}

impl Address {
    pub const fn new(controller: u8, zone: u8) -> Self {
        Self { controller, zone }
    }

    /// The zone this address names.
    pub const fn zone_id(self) -> ZoneId {
        ZoneId::new(self.controller, self.zone)
    }
}

impl From<ZoneId> for Address {
    fn from(id: ZoneId) -> Self {
        Self::new(id.controller, id.zone)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.controller, self.zone)
    }
}

/// Address the bridge uses as the source of every packet it emits.
pub const BRIDGE_ADDRESS: Address = Address::new(0x00, 0x70);

/// A decoded packet: addressing plus a typed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub target: Address,
    pub source: Address,
    pub message: Message,
}

impl Packet {
    pub fn new(target: Address, source: Address, message: Message) -> Self {
        Self {
            target,
            source,
            message,
        }
    }

    /// A packet from the bridge to a zone.
    pub fn from_bridge(target: impl Into<Address>, message: Message) -> Self {
        Self::new(target.into(), BRIDGE_ADDRESS, message)
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Lowers the packet to its raw form.
    pub fn to_raw(&self) -> RawPacket {
        RawPacket {
            target: self.target,
            source: self.source,
            message_type: self.message_type().as_u8(),
            body: self.message.to_body(),
        }
    }

    /// Encodes the packet into a complete frame.
    ///
    /// # Errors
    ///
    /// `ProtocolError::BodyTooLong` if a name does not fit the length byte.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        self.to_raw().encode()
    }

    /// Decodes one complete frame into a typed packet.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        RawPacket::decode(frame)?.interpret()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (target: {}, source: {})",
            self.message, self.target, self.source
        )
    }
}

impl RawPacket {
    /// Dispatches on the message type and parses the body.
    pub fn interpret(&self) -> Result<Packet, ProtocolError> {
        let message_type = MessageType::try_from(self.message_type)?;
        self.parse_as(message_type)
    }

    /// Parses the body as a specific variant.
    ///
    /// # Errors
    ///
    /// `ProtocolError::TypeMismatch` when the packet carries a different
    /// message type; the body is never parsed in that case.
    pub fn reinterpret(&self, expected: MessageType) -> Result<Packet, ProtocolError> {
        if self.message_type != expected.as_u8() {
            return Err(ProtocolError::TypeMismatch {
                expected,
                actual: self.message_type,
            });
        }
        self.parse_as(expected)
    }

    fn parse_as(&self, message_type: MessageType) -> Result<Packet, ProtocolError> {
        let message = Message::from_body(message_type, &self.body)?;
        Ok(Packet::new(self.target, self.source, message))
    }
}
