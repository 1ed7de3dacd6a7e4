//! On-wire packet model.
//!
//! The canonical frame is `AA 01 02 | type | id | size | payload[size] |
//! checksum`. The checksum is the unsigned 8-bit sum of the frame bytes up to
//! (but not including) the final byte before the checksum itself, i.e. for a
//! frame of length `L` it covers indices `0..L-2`.

use thiserror::Error;

use crate::command::{DeviceFault, OpCode};

/// Fixed 3-byte frame prefix.
pub const HEADER_SYNC: [u8; 3] = [0xAA, 0x01, 0x02];

/// Largest payload the size field may carry.
pub const MAX_PAYLOAD_SIZE: usize = 249;

/// Frame bytes beyond the payload: header (3), type, id, size, checksum.
pub const FRAME_OVERHEAD: usize = 7;

/// Errors raised while interpreting frame bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {0} bytes is shorter than the minimum")]
    Truncated(usize),

    #[error("header sync mismatch")]
    BadHeader,

    #[error("unknown packet type byte 0x{0:02X}")]
    UnknownType(u8),

    #[error("payload size {0} exceeds the maximum of 249")]
    PayloadTooLong(usize),

    #[error("frame length {got} does not match size field ({want} expected)")]
    LengthMismatch { want: usize, got: usize },

    #[error("checksum mismatch (stored 0x{stored:02X}, computed 0x{computed:02X})")]
    ChecksumMismatch { stored: u8, computed: u8 },
}

/// Wire packet type discriminator.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Failure = 0,
    Transaction = 1,
    Stream = 2,
}

impl PacketType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PacketType::Failure),
            1 => Some(PacketType::Transaction),
            2 => Some(PacketType::Stream),
            _ => None,
        }
    }
}

/// Unsigned 8-bit sum over the checksum-covered prefix of a frame.
///
/// Callers pass the covered slice: for a complete frame of length `L` that is
/// `frame[..L - 2]`.
pub fn wire_checksum(covered: &[u8]) -> u8 {
    covered.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A framed link packet.
///
/// `checksum` holds the byte as received off the wire, or as computed at
/// construction time for locally-originated packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    id: u8,
    payload: Vec<u8>,
    checksum: u8,
}

impl Packet {
    /// Build a locally-originated packet, computing its checksum.
    pub fn new(packet_type: PacketType, id: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        let mut packet = Self {
            packet_type,
            id,
            payload,
            checksum: 0,
        };
        let frame = packet.serialize();
        packet.checksum = wire_checksum(&frame[..frame.len() - 2]);
        Ok(packet)
    }

    /// Build a one-byte transaction packet for `op`.
    pub fn transaction(op: OpCode, id: u8) -> Self {
        // A single opcode byte can never exceed the payload limit.
        Self::new(PacketType::Transaction, id, vec![op as u8])
            .expect("one-byte payload is always within bounds")
    }

    /// Reassemble a packet from already-validated frame fields.
    ///
    /// Used by the framing layer, which validates the checksum incrementally;
    /// no re-validation happens here.
    pub fn from_parts(packet_type: PacketType, id: u8, payload: Vec<u8>, checksum: u8) -> Self {
        Self {
            packet_type,
            id,
            payload,
            checksum,
        }
    }

    /// Parse and validate a complete frame.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(FrameError::Truncated(bytes.len()));
        }
        if bytes[0..3] != HEADER_SYNC {
            return Err(FrameError::BadHeader);
        }
        let packet_type = PacketType::from_byte(bytes[3]).ok_or(FrameError::UnknownType(bytes[3]))?;
        let size = bytes[5] as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLong(size));
        }
        let want = FRAME_OVERHEAD + size;
        if bytes.len() != want {
            return Err(FrameError::LengthMismatch {
                want,
                got: bytes.len(),
            });
        }
        let stored = bytes[bytes.len() - 1];
        let computed = wire_checksum(&bytes[..bytes.len() - 2]);
        if stored != computed {
            return Err(FrameError::ChecksumMismatch { stored, computed });
        }
        Ok(Self {
            packet_type,
            id: bytes[4],
            payload: bytes[6..6 + size].to_vec(),
            checksum: stored,
        })
    }

    /// Serialize to the canonical frame byte sequence.
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_OVERHEAD + self.payload.len());
        frame.extend_from_slice(&HEADER_SYNC);
        frame.push(self.packet_type as u8);
        frame.push(self.id);
        frame.push(self.payload.len() as u8);
        frame.extend_from_slice(&self.payload);
        frame.push(self.checksum);
        frame
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Total frame length in bytes.
    pub fn len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Recompute the checksum and compare against the stored byte.
    pub fn checksum_valid(&self) -> bool {
        let frame = self.serialize();
        self.checksum != 0 && self.checksum == wire_checksum(&frame[..frame.len() - 2])
    }

    /// The transaction opcode, when this is a transaction packet with a
    /// recognizable first payload byte.
    pub fn opcode(&self) -> Option<OpCode> {
        if self.packet_type != PacketType::Transaction {
            return None;
        }
        OpCode::from_byte(*self.payload.first()?)
    }

    /// The device fault code, when this is a failure packet with a
    /// recognizable first payload byte.
    pub fn fault(&self) -> Option<DeviceFault> {
        if self.packet_type != PacketType::Failure {
            return None;
        }
        DeviceFault::from_byte(*self.payload.first()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_handshake_frame_matches_reference_bytes() {
        let packet = Packet::transaction(OpCode::Initial, 0);
        assert_eq!(
            packet.serialize(),
            vec![0xAA, 0x01, 0x02, 0x01, 0x00, 0x01, 0x01, 0xAF]
        );
    }

    #[test]
    fn keepalive_frame_is_eight_bytes() {
        let packet = Packet::transaction(OpCode::Keepalive, 5);
        let frame = packet.serialize();
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[4], 5);
        assert_eq!(frame[6], OpCode::Keepalive as u8);
    }

    #[test]
    fn serialize_parse_round_trip() {
        let packet = Packet::new(PacketType::Stream, 0x42, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let frame = packet.serialize();
        let parsed = Packet::parse(&frame).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.serialize(), frame);
    }

    #[test]
    fn parse_rejects_corrupted_checksum() {
        let mut frame = Packet::transaction(OpCode::StartStream, 9).serialize();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        assert!(matches!(
            Packet::parse(&frame),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn parse_rejects_bad_header() {
        let mut frame = Packet::transaction(OpCode::StartStream, 9).serialize();
        frame[0] = 0xAB;
        assert_eq!(Packet::parse(&frame), Err(FrameError::BadHeader));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let mut frame = Packet::transaction(OpCode::Initial, 1).serialize();
        frame[3] = 7;
        assert_eq!(Packet::parse(&frame), Err(FrameError::UnknownType(7)));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let err = Packet::new(PacketType::Stream, 0, vec![0; 250]).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLong(250));
    }

    #[test]
    fn checksum_covers_all_but_final_two_bytes() {
        // AA + 01 + 02 + 01 + 00 + 01 = 0xAF; the last payload byte is not
        // part of the covered range.
        let frame = Packet::transaction(OpCode::Initial, 0).serialize();
        assert_eq!(wire_checksum(&frame[..frame.len() - 2]), 0xAF);
    }
}
