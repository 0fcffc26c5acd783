//! RNet Protocol - Packet codec for the RNet control bus
//!
//! The same frame format is spoken on the serial bus and by TCP clients:
//!
//! ```text
//! [0xF0][target ctrl][target zone][source ctrl][source zone][type][len][body..][checksum][0xF7]
//! ```
//!
//! - `frame` - marker bytes, escaping and checksum over raw packets
//! - `message` - the closed set of typed message bodies
//! - `packet` - addressed, typed packets and reinterpretation
//! - `codec` - `tokio_util::codec` implementation with resynchronization

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod packet;

pub use codec::{CodecError, Decoded, RNetCodec};
pub use error::ProtocolError;
pub use frame::{RawPacket, END_MARKER, ESCAPE_MARKER, MAX_BODY_LEN, MAX_FRAME_LEN, START_MARKER};
pub use message::{Message, MessageType, NO_SOURCE};
pub use packet::{Address, Packet, BRIDGE_ADDRESS};
