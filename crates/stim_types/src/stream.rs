//! Decoded stream packet payloads.

/// Bytes in a stream packet payload: u32 LE device timestamp + u16 LE raw
/// ADC count.
pub const STREAM_PAYLOAD_LEN: usize = 6;

/// Full-scale ADC span in microvolts.
pub const ADC_SCALE_UV: f64 = 3932.0;

/// Offset applied after scaling, in microvolts.
pub const ADC_OFFSET_UV: f64 = -1885.0032958984373;

/// Number of raw ADC codes across the full scale.
pub const ADC_FULL_SCALE: f64 = 65536.0;

/// Convert a raw ADC count to microvolts.
///
/// `µV = raw / 65536 × 3932.0 − 1885.0032958984373`
pub fn raw_to_microvolts(raw: u16) -> f64 {
    raw as f64 / ADC_FULL_SCALE * ADC_SCALE_UV + ADC_OFFSET_UV
}

/// One decoded neural signal sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSample {
    /// Device tick counter at capture time.
    pub device_timestamp: u32,
    /// Raw ADC count.
    pub raw: u16,
    /// Physical value after scale and offset.
    pub microvolts: f64,
}

impl StreamSample {
    /// Decode a stream packet payload.
    ///
    /// The timestamp is a 32-bit little-endian field; returns `None` when the
    /// payload is not exactly six bytes.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() != STREAM_PAYLOAD_LEN {
            return None;
        }
        let device_timestamp = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let raw = u16::from_le_bytes([payload[4], payload[5]]);
        Some(Self {
            device_timestamp,
            raw,
            microvolts: raw_to_microvolts(raw),
        })
    }

    /// Encode back into the 6-byte payload layout.
    pub fn encode(&self) -> [u8; STREAM_PAYLOAD_LEN] {
        let mut payload = [0u8; STREAM_PAYLOAD_LEN];
        payload[0..4].copy_from_slice(&self.device_timestamp.to_le_bytes());
        payload[4..6].copy_from_slice(&self.raw.to_le_bytes());
        payload
    }
}
