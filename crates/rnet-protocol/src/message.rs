//! Typed message bodies.
//!
//! The variant set is closed: every message type byte the bridge understands
//! maps to exactly one [`Message`] variant. "Set" variants are commands
//! addressed to a zone, "Get" variants are status reports about a zone.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rnet_core::{SourceType, ZoneParameter};

use crate::ProtocolError;

/// Source id byte meaning "no source selected". Never a real source id.
pub const NO_SOURCE: u8 = 0xFF;

/// Message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    RequestData = 0x01,
    Handshake = 0x02,
    PowerSet = 0x10,
    PowerGet = 0x11,
    VolumeSet = 0x12,
    VolumeGet = 0x13,
    SourceSet = 0x14,
    SourceGet = 0x15,
    MuteSet = 0x16,
    MuteGet = 0x17,
    ParameterSet = 0x18,
    ParameterGet = 0x19,
    MaxVolumeSet = 0x1A,
    MaxVolumeGet = 0x1B,
    ZoneName = 0x20,
    SourceName = 0x21,
}

impl MessageType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let ty = match value {
            0x01 => Self::RequestData,
            0x02 => Self::Handshake,
            0x10 => Self::PowerSet,
            0x11 => Self::PowerGet,
            0x12 => Self::VolumeSet,
            0x13 => Self::VolumeGet,
            0x14 => Self::SourceSet,
            0x15 => Self::SourceGet,
            0x16 => Self::MuteSet,
            0x17 => Self::MuteGet,
            0x18 => Self::ParameterSet,
            0x19 => Self::ParameterGet,
            0x1A => Self::MaxVolumeSet,
            0x1B => Self::MaxVolumeGet,
            0x20 => Self::ZoneName,
            0x21 => Self::SourceName,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(ty)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A typed message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestData,
    Handshake { handshake_type: u8 },
    PowerSet { power: bool },
    PowerGet { power: bool },
    VolumeSet { volume: u8 },
    VolumeGet { volume: u8 },
    SourceSet { source_id: Option<u8> },
    SourceGet { source_id: Option<u8> },
    MuteSet { muted: bool, fade_ms: u16 },
    MuteGet { muted: bool, fade_ms: u16 },
    ParameterSet { parameter: ZoneParameter, value: i8 },
    ParameterGet { parameter: ZoneParameter, value: i8 },
    MaxVolumeSet { max_volume: u8 },
    MaxVolumeGet { max_volume: u8 },
    ZoneName { name: String },
    SourceName {
        source_id: u8,
        source_type: SourceType,
        name: String,
    },
}

impl Message {
    /// The type byte this message is sent with.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RequestData => MessageType::RequestData,
            Self::Handshake { .. } => MessageType::Handshake,
            Self::PowerSet { .. } => MessageType::PowerSet,
            Self::PowerGet { .. } => MessageType::PowerGet,
            Self::VolumeSet { .. } => MessageType::VolumeSet,
            Self::VolumeGet { .. } => MessageType::VolumeGet,
            Self::SourceSet { .. } => MessageType::SourceSet,
            Self::SourceGet { .. } => MessageType::SourceGet,
            Self::MuteSet { .. } => MessageType::MuteSet,
            Self::MuteGet { .. } => MessageType::MuteGet,
            Self::ParameterSet { .. } => MessageType::ParameterSet,
            Self::ParameterGet { .. } => MessageType::ParameterGet,
            Self::MaxVolumeSet { .. } => MessageType::MaxVolumeSet,
            Self::MaxVolumeGet { .. } => MessageType::MaxVolumeGet,
            Self::ZoneName { .. } => MessageType::ZoneName,
            Self::SourceName { .. } => MessageType::SourceName,
        }
    }

    /// Serializes the body.
    pub fn to_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::RequestData => {}
            Self::Handshake { handshake_type } => buf.put_u8(*handshake_type),
            Self::PowerSet { power } | Self::PowerGet { power } => buf.put_u8(u8::from(*power)),
            Self::VolumeSet { volume } | Self::VolumeGet { volume } => buf.put_u8(*volume),
            Self::SourceSet { source_id } | Self::SourceGet { source_id } => {
                buf.put_u8(source_id.unwrap_or(NO_SOURCE))
            }
            Self::MuteSet { muted, fade_ms } | Self::MuteGet { muted, fade_ms } => {
                buf.put_u8(u8::from(*muted));
                buf.put_u16(*fade_ms);
            }
            Self::ParameterSet { parameter, value } | Self::ParameterGet { parameter, value } => {
                buf.put_u8(parameter.id());
                buf.put_i8(*value);
            }
            Self::MaxVolumeSet { max_volume } | Self::MaxVolumeGet { max_volume } => {
                buf.put_u8(*max_volume)
            }
            Self::ZoneName { name } => buf.put_slice(name.as_bytes()),
            Self::SourceName {
                source_id,
                source_type,
                name,
            } => {
                buf.put_u8(*source_id);
                buf.put_u8(source_type.as_u8());
                buf.put_slice(name.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Populates a message of the given type from its body.
    pub fn from_body(message_type: MessageType, body: &[u8]) -> Result<Self, ProtocolError> {
        use MessageType as T;

        let message = match message_type {
            T::RequestData => {
                exact::<0>(message_type, body)?;
                Self::RequestData
            }
            T::Handshake => {
                let [handshake_type] = exact(message_type, body)?;
                Self::Handshake { handshake_type }
            }
            T::PowerSet | T::PowerGet => {
                let [flag] = exact(message_type, body)?;
                let power = flag != 0;
                if message_type == T::PowerSet {
                    Self::PowerSet { power }
                } else {
                    Self::PowerGet { power }
                }
            }
            T::VolumeSet | T::VolumeGet => {
                let [volume] = exact(message_type, body)?;
                if message_type == T::VolumeSet {
                    Self::VolumeSet { volume }
                } else {
                    Self::VolumeGet { volume }
                }
            }
            T::SourceSet | T::SourceGet => {
                let [id] = exact(message_type, body)?;
                let source_id = (id != NO_SOURCE).then_some(id);
                if message_type == T::SourceSet {
                    Self::SourceSet { source_id }
                } else {
                    Self::SourceGet { source_id }
                }
            }
            T::MuteSet | T::MuteGet => {
                let [flag, hi, lo] = exact(message_type, body)?;
                let muted = flag != 0;
                let fade_ms = u16::from_be_bytes([hi, lo]);
                if message_type == T::MuteSet {
                    Self::MuteSet { muted, fade_ms }
                } else {
                    Self::MuteGet { muted, fade_ms }
                }
            }
            T::ParameterSet | T::ParameterGet => {
                let [id, raw] = exact(message_type, body)?;
                let parameter = ZoneParameter::from_id(id)
                    .map_err(|e| ProtocolError::body(message_type, e.to_string()))?;
                let value = i8::from_be_bytes([raw]);
                if message_type == T::ParameterSet {
                    Self::ParameterSet { parameter, value }
                } else {
                    Self::ParameterGet { parameter, value }
                }
            }
            T::MaxVolumeSet | T::MaxVolumeGet => {
                let [max_volume] = exact(message_type, body)?;
                if message_type == T::MaxVolumeSet {
                    Self::MaxVolumeSet { max_volume }
                } else {
                    Self::MaxVolumeGet { max_volume }
                }
            }
            T::ZoneName => Self::ZoneName {
                name: utf8(message_type, body)?,
            },
            T::SourceName => match body {
                [source_id, source_type, name @ ..] => Self::SourceName {
                    source_id: *source_id,
                    source_type: SourceType::from_u8(*source_type),
                    name: utf8(message_type, name)?,
                },
                _ => return Err(ProtocolError::body(message_type, "expected at least 2 bytes")),
            },
        };

        Ok(message)
    }

    // ------------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------------

    pub fn handshake_type(&self) -> Option<u8> {
        match self {
            Self::Handshake { handshake_type } => Some(*handshake_type),
            _ => None,
        }
    }

    pub fn power(&self) -> Option<bool> {
        match self {
            Self::PowerSet { power } | Self::PowerGet { power } => Some(*power),
            _ => None,
        }
    }

    pub fn volume(&self) -> Option<u8> {
        match self {
            Self::VolumeSet { volume } | Self::VolumeGet { volume } => Some(*volume),
            _ => None,
        }
    }

    /// Selected source for Source messages. The outer `Option` is `None`
    /// for other variants, the inner one for "no source".
    pub fn source_id(&self) -> Option<Option<u8>> {
        match self {
            Self::SourceSet { source_id } | Self::SourceGet { source_id } => Some(*source_id),
            _ => None,
        }
    }

    pub fn muted(&self) -> Option<bool> {
        match self {
            Self::MuteSet { muted, .. } | Self::MuteGet { muted, .. } => Some(*muted),
            _ => None,
        }
    }

    pub fn parameter(&self) -> Option<(ZoneParameter, i8)> {
        match self {
            Self::ParameterSet { parameter, value } | Self::ParameterGet { parameter, value } => {
                Some((*parameter, *value))
            }
            _ => None,
        }
    }

    pub fn max_volume(&self) -> Option<u8> {
        match self {
            Self::MaxVolumeSet { max_volume } | Self::MaxVolumeGet { max_volume } => {
                Some(*max_volume)
            }
            _ => None,
        }
    }

    /// Whether this is a command addressed to a zone.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::PowerSet { .. }
                | Self::VolumeSet { .. }
                | Self::SourceSet { .. }
                | Self::MuteSet { .. }
                | Self::ParameterSet { .. }
                | Self::MaxVolumeSet { .. }
        )
    }
}

/// Short description used when logging packets.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_type())?;
        match self {
            Self::RequestData => Ok(()),
            Self::Handshake { handshake_type } => write!(f, " type: {handshake_type:#04x}"),
            Self::PowerSet { power } | Self::PowerGet { power } => write!(f, " power: {power}"),
            Self::VolumeSet { volume } | Self::VolumeGet { volume } => {
                write!(f, " volume: {volume}")
            }
            Self::SourceSet { source_id } | Self::SourceGet { source_id } => match source_id {
                Some(id) => write!(f, " sourceID: {id}"),
                None => write!(f, " sourceID: none"),
            },
            Self::MuteSet { muted, fade_ms } | Self::MuteGet { muted, fade_ms } => {
                write!(f, " muted: {muted}, fade: {fade_ms}ms")
            }
            Self::ParameterSet { parameter, value } | Self::ParameterGet { parameter, value } => {
                write!(f, " {parameter}: {value}")
            }
            Self::MaxVolumeSet { max_volume } | Self::MaxVolumeGet { max_volume } => {
                write!(f, " max volume: {max_volume}")
            }
            Self::ZoneName { name } => write!(f, " name: {name:?}"),
            Self::SourceName {
                source_id, name, ..
            } => write!(f, " sourceID: {source_id}, name: {name:?}"),
        }
    }
}

fn exact<const N: usize>(message_type: MessageType, body: &[u8]) -> Result<[u8; N], ProtocolError> {
    <[u8; N]>::try_from(body)
        .map_err(|_| ProtocolError::body(message_type, format!("expected {N} bytes, got {}", body.len())))
}

fn utf8(message_type: MessageType, bytes: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::body(message_type, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for code in 0u8..=0xFF {
            if let Ok(ty) = MessageType::try_from(code) {
                assert_eq!(ty.as_u8(), code);
            }
        }
        assert_eq!(
            MessageType::try_from(0x7E),
            Err(ProtocolError::UnknownMessageType(0x7E))
        );
    }

    #[test]
    fn test_body_length_is_checked() {
        let err = Message::from_body(MessageType::VolumeSet, &[1, 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidBody { .. }));
        assert!(err.to_string().contains("expected 1 bytes, got 2"));

        assert!(Message::from_body(MessageType::MuteGet, &[1]).is_err());
        assert!(Message::from_body(MessageType::SourceName, &[1]).is_err());
    }

    #[test]
    fn test_unknown_parameter_in_body() {
        let err = Message::from_body(MessageType::ParameterSet, &[3, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidBody { .. }));
    }

    #[test]
    fn test_signed_parameter_value() {
        let msg = Message::ParameterSet {
            parameter: ZoneParameter::Bass,
            value: -7,
        };
        let body = msg.to_body();
        assert_eq!(body.as_ref(), &[0, 0xF9]);
        assert_eq!(Message::from_body(MessageType::ParameterSet, &body).unwrap(), msg);
    }

    #[test]
    fn test_no_source_encoding() {
        let msg = Message::SourceGet { source_id: None };
        assert_eq!(msg.to_body().as_ref(), &[NO_SOURCE]);
        assert_eq!(msg.source_id(), Some(None));
        assert_eq!(Message::PowerGet { power: true }.source_id(), None);
    }

    #[test]
    fn test_invalid_utf8_name() {
        assert!(Message::from_body(MessageType::ZoneName, &[0xC3, 0x28]).is_err());
    }

    #[test]
    fn test_display_describes_payload() {
        let msg = Message::VolumeGet { volume: 42 };
        assert_eq!(msg.to_string(), "VolumeGet volume: 42");
        let msg = Message::MuteSet {
            muted: true,
            fade_ms: 1000,
        };
        assert_eq!(msg.to_string(), "MuteSet muted: true, fade: 1000ms");
    }

    #[test]
    fn test_command_classification() {
        assert!(Message::PowerSet { power: true }.is_command());
        assert!(!Message::PowerGet { power: true }.is_command());
        assert!(!Message::Handshake { handshake_type: 2 }.is_command());
    }
}
