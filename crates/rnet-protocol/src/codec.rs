//! Stream codec with frame reassembly and resynchronization.
//!
//! Bytes may arrive in arbitrary chunks. The decoder scans for a candidate
//! frame bounded by start/end markers and hands it to [`Packet::decode`].
//! A bad candidate is reported as an `Err` item, never as a stream error,
//! and the buffer only advances past its start marker so a legitimate
//! frame starting inside the garbage is not lost.

use std::io;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::{Packet, ProtocolError, END_MARKER, MAX_FRAME_LEN, START_MARKER};

/// One decoder output: a packet, or the reason a candidate frame was dropped.
pub type Decoded = Result<Packet, ProtocolError>;

/// Errors surfaced by the encoder half.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// `tokio_util` codec for RNet frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct RNetCodec;

impl RNetCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RNetCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Drop anything before the first start marker
        match src.iter().position(|&b| b == START_MARKER) {
            Some(0) => {}
            Some(pos) => {
                trace!(discarded = pos, "Skipping bytes before start marker");
                src.advance(pos);
            }
            None => {
                if !src.is_empty() {
                    trace!(discarded = src.len(), "Skipping bytes without start marker");
                    src.clear();
                }
                return Ok(None);
            }
        }

        let boundary = src
            .iter()
            .skip(1)
            .position(|&b| b == END_MARKER || b == START_MARKER)
            .map(|pos| pos + 1);

        let Some(end) = boundary else {
            if src.len() > MAX_FRAME_LEN {
                src.advance(1);
                return Ok(Some(Err(ProtocolError::Format {
                    reason: "frame exceeds maximum length",
                })));
            }
            return Ok(None);
        };

        if src.get(end) == Some(&START_MARKER) {
            // Truncated frame: another frame starts before this one ended
            src.advance(1);
            return Ok(Some(Err(ProtocolError::Format {
                reason: "start marker inside frame",
            })));
        }

        let candidate = src.get(..=end).unwrap_or_default();
        match Packet::decode(candidate) {
            Ok(packet) => {
                src.advance(end + 1);
                Ok(Some(Ok(packet)))
            }
            Err(e) => {
                src.advance(1);
                Ok(Some(Err(e)))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !buf.is_empty() {
                    trace!(discarded = buf.len(), "Dropping partial frame at end of stream");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for RNetCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.to_raw().encode_into(dst)?;
        Ok(())
    }
}

impl Encoder<&Packet> for RNetCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.to_raw().encode_into(dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, Message};
    use futures::StreamExt;
    use rnet_core::ZoneId;
    use tokio_util::codec::FramedRead;

    fn volume_frame(volume: u8) -> BytesMut {
        Packet::from_bridge(ZoneId::new(0, 1), Message::VolumeGet { volume })
            .encode()
            .unwrap()
    }

    /// Feeds chunks one at a time and collects every decoded item.
    fn feed(chunks: &[&[u8]]) -> Vec<Decoded> {
        let mut codec = RNetCodec::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(item) = codec.decode(&mut buf).unwrap() {
                out.push(item);
            }
        }
        out
    }

    #[test]
    fn test_whole_frame() {
        let frame = volume_frame(40);
        let items = feed(&[&frame]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().message.volume(), Some(40));
    }

    #[test]
    fn test_split_at_every_offset_decodes_identically() {
        let frame = volume_frame(0xF0 & 0x7E);
        let whole = feed(&[&frame]);
        for split in 0..=frame.len() {
            let (a, b) = frame.split_at(split);
            assert_eq!(feed(&[a, b]), whole, "split at {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = Packet::from_bridge(
            ZoneId::new(0, 1),
            Message::ZoneName {
                name: "Living Room".to_string(),
            },
        )
        .encode()
        .unwrap();
        let chunks: Vec<&[u8]> = frame.chunks(1).collect();
        let items = feed(&chunks);
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[test]
    fn test_garbage_before_frame_is_skipped() {
        let frame = volume_frame(10);
        let items = feed(&[&[0x01, 0x02, END_MARKER, 0x7F], &frame]);
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[test]
    fn test_checksum_error_then_recovery() {
        let mut bad = volume_frame(10);
        let idx = bad.len() - 2;
        bad[idx] ^= 0x01;
        let good = volume_frame(12);

        let items = feed(&[&bad, &good]);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(ProtocolError::Checksum { .. })));
        assert_eq!(items[1].as_ref().unwrap().message.volume(), Some(12));
    }

    #[test]
    fn test_truncated_frame_does_not_swallow_next_start() {
        let good = volume_frame(20);
        let truncated = &good[..5];
        let items = feed(&[truncated, &good]);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], Err(ProtocolError::Format { .. })));
        assert_eq!(items[1].as_ref().unwrap().message.volume(), Some(20));
    }

    #[test]
    fn test_incomplete_frame_waits_for_more() {
        let frame = volume_frame(20);
        let mut codec = RNetCodec::new();
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), frame.len() - 1);
    }

    #[test]
    fn test_runaway_frame_is_dropped() {
        let mut junk = vec![START_MARKER];
        junk.extend(std::iter::repeat(0x01).take(MAX_FRAME_LEN + 1));
        let items = feed(&[&junk]);
        assert!(matches!(
            items.first(),
            Some(Err(ProtocolError::Format {
                reason: "frame exceeds maximum length"
            }))
        ));
    }

    #[test]
    fn test_unknown_type_is_an_item_not_a_stream_error() {
        let mut raw = Packet::from_bridge(ZoneId::new(0, 0), Message::RequestData).to_raw();
        raw.message_type = 0x66;
        let frame = raw.encode().unwrap();
        let items = feed(&[&frame, &volume_frame(2)]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Err(ProtocolError::UnknownMessageType(0x66)));
        assert!(items[1].is_ok());
    }

    #[test]
    fn test_encoder_matches_packet_encode() {
        let packet = Packet::new(
            Address::new(2, 3),
            Address::new(0, 0x70),
            Message::PowerSet { power: true },
        );
        let mut dst = BytesMut::new();
        RNetCodec::new().encode(&packet, &mut dst).unwrap();
        assert_eq!(dst, packet.encode().unwrap());
    }

    #[tokio::test]
    async fn test_framed_read_survives_garbage_and_eof() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&volume_frame(4));
        stream.extend_from_slice(&[0x33, START_MARKER, 0x01]);
        stream.extend_from_slice(&volume_frame(6));
        stream.extend_from_slice(&[START_MARKER, 0x00]);

        let mut framed = FramedRead::new(stream.as_slice(), RNetCodec::new());
        let mut volumes = Vec::new();
        let mut errors = 0;
        while let Some(item) = framed.next().await {
            match item.unwrap() {
                Ok(packet) => volumes.extend(packet.message.volume()),
                Err(_) => errors += 1,
            }
        }
        assert_eq!(volumes, vec![4, 6]);
        assert_eq!(errors, 1);
    }
}
