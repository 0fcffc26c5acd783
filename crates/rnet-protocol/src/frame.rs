//! Frame layer: markers, escaping and checksum.
//!
//! A [`RawPacket`] carries addressing, the message type and an opaque body.
//! Interpreting the body is the job of [`crate::message`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::Address;
use crate::ProtocolError;

/// First byte of every frame.
pub const START_MARKER: u8 = 0xF0;

/// Last byte of every frame.
pub const END_MARKER: u8 = 0xF7;

/// Prefix of an escaped byte.
pub const ESCAPE_MARKER: u8 = 0xF1;

/// The length field is a single byte.
pub const MAX_BODY_LEN: usize = 255;

/// Header bytes between the start marker and the body.
const HEADER_LEN: usize = 6;

/// Worst case: every header, body and checksum byte escaped, plus markers.
pub const MAX_FRAME_LEN: usize = 2 + (HEADER_LEN + MAX_BODY_LEN) * 2 + 1;

/// A packet whose body has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub target: Address,
    pub source: Address,
    pub message_type: u8,
    pub body: Bytes,
}

impl RawPacket {
    /// Serializes the packet into a complete frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.body.len() + 4);
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Appends the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = u8::try_from(self.body.len()).map_err(|_| ProtocolError::BodyTooLong {
            len: self.body.len(),
            max: MAX_BODY_LEN,
        })?;

        let header = [
            self.target.controller,
            self.target.zone,
            self.source.controller,
            self.source.zone,
            self.message_type,
            len,
        ];
        let checksum = checksum(header.iter().chain(self.body.iter()).copied());

        out.reserve(2 + (header.len() + self.body.len()) * 2 + 1);
        out.put_u8(START_MARKER);
        for byte in header.iter().chain(self.body.iter()) {
            put_escaped(out, *byte);
        }
        out.put_u8(checksum);
        out.put_u8(END_MARKER);
        Ok(())
    }

    /// Parses one complete frame, markers included.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Format` on bad markers, bad escapes or a length mismatch
    /// - `ProtocolError::Checksum` if the checksum does not match
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let inner = match frame {
            [START_MARKER, inner @ .., END_MARKER] => inner,
            [START_MARKER, ..] => return Err(ProtocolError::format("missing end marker")),
            _ => return Err(ProtocolError::format("missing start marker")),
        };

        let content = unescape(inner)?;
        let (checksum_byte, rest) = content
            .split_last()
            .ok_or_else(|| ProtocolError::format("empty frame"))?;

        if rest.len() < HEADER_LEN {
            return Err(ProtocolError::format("frame shorter than header"));
        }
        let (header, body) = rest.split_at(HEADER_LEN);

        let &[target_controller, target_zone, source_controller, source_zone, message_type, len] =
            header
        else {
            return Err(ProtocolError::format("frame shorter than header"));
        };

        if usize::from(len) != body.len() {
            return Err(ProtocolError::format("length field does not match body"));
        }

        let expected = checksum(rest.iter().copied());
        if expected != *checksum_byte {
            return Err(ProtocolError::Checksum {
                expected,
                actual: *checksum_byte,
            });
        }

        Ok(Self {
            target: Address::new(target_controller, target_zone),
            source: Address::new(source_controller, source_zone),
            message_type,
            body: Bytes::copy_from_slice(body),
        })
    }
}

/// Checksum over the unescaped content (start marker implied).
///
/// The sum of every byte from the start marker through the last body byte,
/// plus the number of those bytes, truncated to seven bits.
pub fn checksum(content: impl IntoIterator<Item = u8>) -> u8 {
    let mut sum = u32::from(START_MARKER);
    let mut count: u32 = 1;
    for byte in content {
        sum = sum.wrapping_add(u32::from(byte));
        count = count.wrapping_add(1);
    }
    (sum.wrapping_add(count) & 0x7F) as u8
}

/// Writes a byte, escaping it if its high bit is set.
fn put_escaped(out: &mut BytesMut, byte: u8) {
    if byte & 0x80 != 0 {
        out.put_u8(ESCAPE_MARKER);
        out.put_u8(!byte & 0x7F);
    } else {
        out.put_u8(byte);
    }
}

/// Reverses [`put_escaped`] over the bytes between the markers.
fn unescape(escaped: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();

    while let Some(&byte) = bytes.next() {
        match byte {
            ESCAPE_MARKER => {
                let next = bytes
                    .next()
                    .ok_or_else(|| ProtocolError::format("dangling escape"))?;
                if next & 0x80 != 0 {
                    return Err(ProtocolError::format("invalid escape sequence"));
                }
                out.push(!next);
            }
            b if b & 0x80 != 0 => {
                return Err(ProtocolError::format("unescaped reserved byte"));
            }
            b => out.push(b),
        }
    }

    Ok(out)
}
