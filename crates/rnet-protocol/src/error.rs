//! Codec error types.

use thiserror::Error;

use crate::MessageType;

/// Errors produced while encoding or decoding RNet frames.
///
/// `Format` and `Checksum` are frame-level faults: the offending bytes are
/// dropped and the link stays up. `TypeMismatch` is a caller error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {reason}")]
    Format { reason: &'static str },

    #[error("Checksum mismatch: computed {expected:#04x}, frame carries {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("Type mismatch: expected {expected}, packet is {actual:#04x}")]
    TypeMismatch { expected: MessageType, actual: u8 },

    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Invalid {message_type} body: {reason}")]
    InvalidBody {
        message_type: MessageType,
        reason: String,
    },

    #[error("Message body too long: {len} bytes (max: {max})")]
    BodyTooLong { len: usize, max: usize },
}

impl ProtocolError {
    pub(crate) fn format(reason: &'static str) -> Self {
        Self::Format { reason }
    }

    pub(crate) fn body(message_type: MessageType, reason: impl Into<String>) -> Self {
        Self::InvalidBody {
            message_type,
            reason: reason.into(),
        }
    }

    /// Whether the error describes corrupt bytes on the wire, as opposed
    /// to a well-formed frame that could not be interpreted.
    pub fn is_frame_error(&self) -> bool {
        matches!(self, Self::Format { .. } | Self::Checksum { .. })
    }
}
