//! Message envelope and inbound frame reassembly.
//!
//! # Envelope layout (little-endian)
//!
//! ```text
//! [0]       : kind (0x01 request, 0x02 response, 0x03 notification)
//! [1-2]     : id (u16)
//! [3..n-4]  : payload
//! [n-4..n]  : CRC-32 of bytes [0..n-4], zero-padded to 4 bytes
//! ```
//!
//! On the wire every envelope is stuffed with [`cobs::pack`] and terminated
//! by the delimiter. [`FrameAssembler`] collects characteristic notifications
//! until a delimiter arrives and turns each complete frame back into a
//! [`Message`].

use crate::error::FrameError;
use crate::protocol::checksum::checksum_default;
use crate::protocol::cobs;
use tracing::trace;

/// Id carried by every notification; never allocated to a request
pub const NOTIFICATION_ID: u16 = 0xFFFF;

/// Bytes before the payload
pub const HEADER_LEN: usize = 3;

/// Bytes after the payload
pub const CHECKSUM_LEN: usize = 4;

/// Upper bound for a partially received frame
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

impl MessageKind {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Request => 0x01,
            Self::Response => 0x02,
            Self::Notification => 0x03,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::Notification),
            _ => None,
        }
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub id: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(id: u16, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Request,
            id,
            payload,
        }
    }

    pub fn response(id: u16, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            payload,
        }
    }

    pub fn notification(payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Notification,
            id: NOTIFICATION_ID,
            payload,
        }
    }
}

/// Serialize a message into its checksummed envelope
pub fn encode(message: &Message) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(HEADER_LEN + message.payload.len() + CHECKSUM_LEN);
    buffer.push(message.kind.as_byte());
    buffer.extend_from_slice(&message.id.to_le_bytes());
    buffer.extend_from_slice(&message.payload);
    let crc = checksum_default(&buffer);
    buffer.extend_from_slice(&crc.to_le_bytes());
    buffer
}

/// Parse an envelope, verifying the checksum before anything else
pub fn decode(bytes: &[u8]) -> Result<Message, FrameError> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(FrameError::MalformedFrame(format!(
            "frame of {} bytes is shorter than the {} byte minimum",
            bytes.len(),
            HEADER_LEN + CHECKSUM_LEN
        )));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = checksum_default(body);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    let kind = MessageKind::from_byte(body[0])
        .ok_or_else(|| FrameError::MalformedFrame(format!("unknown kind {:#04x}", body[0])))?;
    let id = u16::from_le_bytes([body[1], body[2]]);
    if kind == MessageKind::Notification && id != NOTIFICATION_ID {
        return Err(FrameError::MalformedFrame(format!(
            "notification carries id {id}"
        )));
    }

    Ok(Message {
        kind,
        id,
        payload: body[HEADER_LEN..].to_vec(),
    })
}

/// Envelope plus link framing, ready to be written to the characteristic
pub fn encode_for_wire(message: &Message) -> Vec<u8> {
    cobs::pack(&encode(message))
}

/// Reassembles frames from characteristic notifications.
///
/// Owned by the transport for one physical connection and reset whenever
/// the link goes down.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest bytes and return one result per completed frame
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Message, FrameError>> {
        let mut frames = Vec::new();

        for &byte in bytes {
            if byte != cobs::DELIMITER {
                if self.buffer.len() >= MAX_PENDING_BYTES {
                    self.buffer.clear();
                    frames.push(Err(FrameError::MalformedFrame(format!(
                        "no delimiter within {MAX_PENDING_BYTES} bytes"
                    ))));
                }
                self.buffer.push(byte);
                continue;
            }

            let raw = std::mem::take(&mut self.buffer);
            // A lone priority byte or back-to-back delimiters carry nothing
            if raw.is_empty() || raw == [cobs::PRIORITY_PREFIX] {
                continue;
            }
            trace!("Assembled frame: {:02X?}", raw);
            frames.push(cobs::unpack(&raw).and_then(|envelope| decode(&envelope)));
        }

        frames
    }

    /// Bytes waiting for a delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Message> {
        vec![
            Message::request(1, vec![0x46, 0x00]),
            Message::response(0xFFFE, vec![0x47, 0x00]),
            Message::response(42, Vec::new()),
            Message::notification(vec![0x3C, 0x00, 0x00]),
            Message::request(7, (0..=255u8).collect()),
        ]
    }

    #[test]
    fn test_roundtrip() {
        for message in samples() {
            assert_eq!(decode(&encode(&message)).unwrap(), message);
        }
    }

    #[test]
    fn test_any_flipped_byte_is_a_checksum_mismatch() {
        for message in samples() {
            let encoded = encode(&message);
            for index in 0..encoded.len() {
                let mut corrupted = encoded.clone();
                corrupted[index] ^= 0x5A;
                assert!(
                    matches!(decode(&corrupted), Err(FrameError::ChecksumMismatch { .. })),
                    "byte {index} of {message:?}"
                );
            }
        }
    }

    #[test]
    fn test_short_frame_is_malformed() {
        assert!(matches!(decode(&[0x01, 0x00]), Err(FrameError::MalformedFrame(_))));
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let mut body = vec![0x09, 0x01, 0x00];
        let crc = checksum_default(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        assert!(matches!(decode(&body), Err(FrameError::MalformedFrame(_))));
    }

    #[test]
    fn test_assembler_handles_fragments() {
        let message = Message::response(3, vec![0x0D, 0x00]);
        let wire = encode_for_wire(&message);

        let mut assembler = FrameAssembler::new();
        let (first, second) = wire.split_at(wire.len() / 2);
        assert!(assembler.push(first).is_empty());
        assert!(assembler.pending() > 0);

        let frames = assembler.push(second);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), &message);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_assembler_splits_coalesced_frames() {
        let a = Message::response(1, vec![0x47, 0x00]);
        let b = Message::notification(vec![0x21, b'h', b'i', 0x00]);
        let mut wire = encode_for_wire(&a);
        wire.push(cobs::PRIORITY_PREFIX);
        wire.extend(encode_for_wire(&b));

        let frames = FrameAssembler::new().push(&wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &a);
        assert_eq!(frames[1].as_ref().unwrap(), &b);
    }

    #[test]
    fn test_assembler_skips_garbage_and_recovers() {
        let message = Message::response(9, vec![0x1F, 0x00]);
        let mut wire = vec![0x41, 0x42, 0x43, cobs::DELIMITER, cobs::DELIMITER];
        wire.extend(encode_for_wire(&message));

        let frames = FrameAssembler::new().push(&wire);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_err());
        assert_eq!(frames[1].as_ref().unwrap(), &message);
    }

    #[test]
    fn test_reset_drops_partial_frame() {
        let wire = encode_for_wire(&Message::response(5, vec![0x11, 0x00]));
        let mut assembler = FrameAssembler::new();
        assembler.push(&wire[..wire.len() - 1]);
        assembler.reset();
        assert_eq!(assembler.pending(), 0);
        // The trailing delimiter alone now completes nothing
        assert!(assembler.push(&wire[wire.len() - 1..]).is_empty());
    }
}
