//! Byte-wise packet assembly with header resync.

use log::trace;

use stim_types::{Packet, PacketType, HEADER_SYNC, MAX_PAYLOAD_SIZE};

/// Header-drift resyncs tolerated before the factory reports failure.
pub const DEFAULT_RESET_TIMEOUT: u32 = 50;

/// Incremental frame assembler.
///
/// Bytes are pushed one at a time. A byte that violates the frame contract
/// at its position discards the in-progress frame and resumes header
/// scanning on the next call; the resync counter only clears when a frame
/// completes with a valid checksum. Once [`is_ready`](Self::is_ready)
/// reports `true` the factory is spent: callers take the packet and allocate
/// a fresh factory.
#[derive(Debug)]
pub struct PacketFactory {
    current_byte: usize,
    type_byte: u8,
    packet_id: u8,
    payload_size: usize,
    payload: Vec<u8>,
    checksum_acc: u8,
    ready: Option<Packet>,
    reset: bool,
    resets_since_success: u32,
    reset_timeout: u32,
}

impl PacketFactory {
    pub fn new() -> Self {
        Self::with_reset_timeout(DEFAULT_RESET_TIMEOUT)
    }

    pub fn with_reset_timeout(reset_timeout: u32) -> Self {
        Self {
            current_byte: 0,
            type_byte: 0,
            packet_id: 0,
            payload_size: 0,
            payload: Vec::new(),
            checksum_acc: 0,
            ready: None,
            reset: false,
            resets_since_success: 0,
            reset_timeout,
        }
    }

    /// Feed the next wire byte.
    ///
    /// No-op once a packet is ready; the caller is expected to take it.
    pub fn push_byte(&mut self, byte: u8) {
        if self.ready.is_some() {
            return;
        }
        let pos = self.current_byte;
        match pos {
            0..=2 => {
                if byte != HEADER_SYNC[pos] {
                    self.resync("header sync mismatch");
                    return;
                }
                self.accumulate(byte);
            }
            3 => {
                self.type_byte = byte;
                self.accumulate(byte);
            }
            4 => {
                self.packet_id = byte;
                self.accumulate(byte);
            }
            5 => {
                let size = byte as usize;
                if size > MAX_PAYLOAD_SIZE {
                    self.resync("payload size over maximum");
                    return;
                }
                self.payload_size = size;
                self.payload = Vec::with_capacity(size);
                // The size byte is inside the covered range only when a
                // payload follows it.
                if size > 0 {
                    self.checksum_acc = self.checksum_acc.wrapping_add(byte);
                }
                self.current_byte += 1;
            }
            p if p < 6 + self.payload_size => {
                // Every payload byte except the last is checksum-covered.
                if p <= 4 + self.payload_size {
                    self.checksum_acc = self.checksum_acc.wrapping_add(byte);
                }
                self.payload.push(byte);
                self.current_byte += 1;
            }
            _ => self.finish(byte),
        }
    }

    /// Validate the checksum byte and complete the frame.
    fn finish(&mut self, checksum: u8) {
        if checksum == 0 {
            self.resync("zero checksum byte");
            return;
        }
        if checksum != self.checksum_acc {
            self.resync("checksum mismatch");
            return;
        }
        let Some(packet_type) = PacketType::from_byte(self.type_byte) else {
            self.resync("unknown packet type");
            return;
        };
        let payload = std::mem::take(&mut self.payload);
        self.ready = Some(Packet::from_parts(
            packet_type,
            self.packet_id,
            payload,
            checksum,
        ));
        self.resets_since_success = 0;
        self.reset = false;
    }

    fn accumulate(&mut self, byte: u8) {
        self.checksum_acc = self.checksum_acc.wrapping_add(byte);
        self.current_byte += 1;
    }

    fn resync(&mut self, reason: &str) {
        trace!("frame resync at byte {}: {}", self.current_byte, reason);
        self.reset = true;
        self.resets_since_success += 1;
        self.current_byte = 0;
        self.payload = Vec::new();
        self.payload_size = 0;
        self.checksum_acc = 0;
    }

    /// A validated frame is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        self.ready.is_some()
    }

    /// The resync budget is exhausted without a completed frame.
    pub fn is_failed(&self) -> bool {
        self.ready.is_none() && self.resets_since_success >= self.reset_timeout
    }

    /// Consume the factory, yielding the completed packet if any.
    pub fn take(self) -> Option<Packet> {
        self.ready
    }

    pub fn resets_since_success(&self) -> u32 {
        self.resets_since_success
    }
}

impl Default for PacketFactory {
    fn default() -> Self {
        Self::new()
    }
}
