//! Wire frame codec
//!
//! Every P2P message travels in a fixed 24-byte frame header followed by the
//! payload:
//!
//! ```text
//! magic (4) | command (12, NUL-padded ascii) | length (4, LE) | checksum (4)
//! ```
//!
//! The checksum is the first four bytes of double-SHA256 of the payload.
//! The codec plugs into `tokio_util`'s framed transports and never assumes
//! anything about how the stream chunks bytes: a frame split across a
//! hundred reads decodes exactly like one delivered whole.

use crate::core::checksum;
use crate::network::message::ProtocolMessage;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame header size: magic + command + length + checksum.
pub const HEADER_SIZE: usize = 24;

/// Hard cap on payload length. Anything larger is a protocol violation and
/// the connection is torn down rather than buffering unbounded data.
pub const MAX_MESSAGE_SIZE: u32 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("bad network magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("declared payload length {0} exceeds maximum message size")]
    OversizedPayload(u32),
    #[error("checksum mismatch on '{command}' frame")]
    BadChecksum { command: String },
    #[error("command field is not printable ascii")]
    BadCommand,
    #[error("invalid '{command}' payload: {source}")]
    InvalidPayload {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encoder/decoder for framed protocol messages on one network.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    magic: [u8; 4],
}

impl FrameCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }
}

impl Encoder<ProtocolMessage> for FrameCodec {
    type Error = FramingError;

    fn encode(&mut self, message: ProtocolMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        message.encode_payload(&mut payload);
        if payload.len() as u64 > MAX_MESSAGE_SIZE as u64 {
            return Err(FramingError::OversizedPayload(payload.len() as u32));
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&self.magic);
        dst.put_slice(&message.command_bytes());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(&payload));
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = ProtocolMessage;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate the header without consuming it, so a partial payload can
        // wait for more bytes.
        let magic = &src[0..4];
        if magic != self.magic {
            let got = u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]);
            return Err(FramingError::BadMagic(got));
        }

        let length = u32::from_le_bytes([src[16], src[17], src[18], src[19]]);
        if length > MAX_MESSAGE_SIZE {
            return Err(FramingError::OversizedPayload(length));
        }

        let frame_len = HEADER_SIZE + length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let command = parse_command(&src[4..16])?;
        let expected = [src[20], src[21], src[22], src[23]];

        // Consume the whole frame before any checksum/payload verdict, so a
        // rejected frame never leaves stale bytes in the buffer.
        src.advance(HEADER_SIZE);
        let payload = src.split_to(length as usize);

        if checksum(&payload) != expected {
            return Err(FramingError::BadChecksum { command });
        }

        let message = ProtocolMessage::decode_payload(&command, &payload)
            .map_err(|source| FramingError::InvalidPayload { command, source })?;
        Ok(Some(message))
    }
}

fn parse_command(field: &[u8]) -> Result<String, FramingError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let name = &field[..end];
    if name.is_empty() || !name.iter().all(u8::is_ascii_graphic) || field[end..].iter().any(|&b| b != 0) {
        return Err(FramingError::BadCommand);
    }
    // Safe: ascii_graphic implies valid UTF-8.
    Ok(String::from_utf8_lossy(name).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{GetHeadersMessage, ProtocolMessage};
    use crate::core::BlockHash;

    const MAGIC: [u8; 4] = [0xF9, 0xBE, 0xB4, 0xD9];

    fn encode(message: ProtocolMessage) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new(MAGIC).encode(message, &mut buf).unwrap();
        buf
    }

    fn sample_message() -> ProtocolMessage {
        ProtocolMessage::GetHeaders(GetHeadersMessage {
            version: 70016,
            locator: vec![BlockHash([0xAB; 32])],
            stop_hash: BlockHash::ZERO,
        })
    }

    #[test]
    fn frame_round_trips() {
        let mut buf = encode(sample_message());
        let decoded = FrameCodec::new(MAGIC).decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample_message());
        assert!(buf.is_empty());
    }

    #[test]
    fn decoding_is_chunk_size_independent() {
        let frame = encode(sample_message());
        let mut codec = FrameCodec::new(MAGIC);
        let mut buf = BytesMut::new();

        // Feed one byte at a time; only the final byte completes the frame.
        for (i, byte) in frame.iter().enumerate() {
            buf.put_u8(*byte);
            let result = codec.decode(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some(sample_message()));
            }
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = encode(ProtocolMessage::Ping(1));
        buf.extend_from_slice(&encode(ProtocolMessage::Ping(2)));

        let mut codec = FrameCodec::new(MAGIC);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ProtocolMessage::Ping(1)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ProtocolMessage::Ping(2)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn corrupted_checksum_consumes_the_frame() {
        let mut buf = encode(sample_message());
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let mut codec = FrameCodec::new(MAGIC);
        match codec.decode(&mut buf) {
            Err(FramingError::BadChecksum { command }) => assert_eq!(command, "getheaders"),
            other => panic!("expected checksum error, got {other:?}"),
        }
        // The bad frame must not linger in the buffer.
        assert!(buf.is_empty());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut buf = encode(ProtocolMessage::Verack);
        buf[0] = 0x0B;
        assert!(matches!(
            FrameCodec::new(MAGIC).decode(&mut buf),
            Err(FramingError::BadMagic(_))
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_slice(b"tx\0\0\0\0\0\0\0\0\0\0");
        buf.put_u32_le(MAX_MESSAGE_SIZE + 1);
        buf.put_slice(&[0; 4]);

        assert!(matches!(
            FrameCodec::new(MAGIC).decode(&mut buf),
            Err(FramingError::OversizedPayload(_))
        ));
    }

    #[test]
    fn garbage_command_field_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_slice(&[0xFF; 12]);
        buf.put_u32_le(0);
        buf.put_slice(&checksum(&[]));

        assert!(matches!(
            FrameCodec::new(MAGIC).decode(&mut buf),
            Err(FramingError::BadCommand)
        ));
    }

    #[test]
    fn unknown_command_decodes_as_unknown() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_slice(b"sendheaders\0");
        buf.put_u32_le(0);
        buf.put_slice(&checksum(&[]));

        let decoded = FrameCodec::new(MAGIC).decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            ProtocolMessage::Unknown {
                command: "sendheaders".to_string(),
                payload: vec![],
            }
        );
    }
}
