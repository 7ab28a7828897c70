//! Per-channel static description and raw-to-physical sample conversion.
//!
//! A [`ChannelDescriptor`] is built once when the device's channel list is
//! enumerated. The controller mutates only the `enabled` flag in response to
//! user toggles; everything else is immutable. During an active capture the
//! reader works on a snapshot of the enabled set, so mid-capture toggles
//! never race with decoding: the capture must be stopped and restarted for
//! the new set to take effect.

use serde::{Deserialize, Serialize};

/// Pull-up resistor of the resistance measurement divider, in ohms.
pub const RESISTANCE_PULLUP_OHMS: f64 = 2100.0;
/// Full-scale value of the 16-bit sample field after the word fix-up.
pub const ADC_SAMPLE_MAX: u32 = 0xFFFF;
/// Saturation value reported for an open-circuit resistance reading.
pub const MAX_RESISTANCE_OHMS: f64 = 1_000_000.0;

/// How a channel converts a raw sample into a physical value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Voltage/current style channel: `(raw + offset) * scale * 1e-3`.
    Linear { offset: f64, scale: f64 },
    /// Resistance channel: pull-up divider formula with open-circuit
    /// saturation.
    Resistance,
}

/// Static per-channel information captured at device enumeration time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Device-side channel identifier (e.g. `"voltage0"`).
    pub id: String,
    /// Position of the channel in the device's scan order.
    pub index: usize,
    pub is_output: bool,
    /// Whether the channel participates in bulk buffered transfer.
    pub is_scan_element: bool,
    pub enabled: bool,
    pub kind: ChannelKind,
}

impl ChannelDescriptor {
    pub fn new(
        id: impl Into<String>,
        index: usize,
        is_output: bool,
        is_scan_element: bool,
        kind: ChannelKind,
    ) -> Self {
        Self {
            id: id.into(),
            index,
            is_output,
            is_scan_element,
            enabled: false,
            kind,
        }
    }

    /// Whether this channel contributes samples to a buffered capture.
    pub fn is_buffer_capture(&self) -> bool {
        self.enabled && self.is_scan_element && !self.is_output
    }

    /// Converts one raw 32-bit word from the hardware buffer into a physical
    /// value.
    pub fn convert_sample(&self, raw: u32) -> f64 {
        let value = fixup_raw(raw);
        match self.kind {
            ChannelKind::Linear { offset, scale } => (f64::from(value) + offset) * scale * 1e-3,
            ChannelKind::Resistance => {
                if value >= ADC_SAMPLE_MAX {
                    MAX_RESISTANCE_OHMS
                } else {
                    let resistance =
                        f64::from(value) * RESISTANCE_PULLUP_OHMS / f64::from(ADC_SAMPLE_MAX - value);
                    resistance.min(MAX_RESISTANCE_OHMS)
                }
            }
        }
    }
}

/// Normalizes a raw buffer word into its 16-bit sample field.
///
/// The converter stores samples big-endian in the upper bytes of each 32-bit
/// word: shift left by one byte, swap to host order, mask to 16 bits.
pub fn fixup_raw(raw: u32) -> u32 {
    (raw << 8).swap_bytes() & 0xFFFF
}

/// Inverse of [`fixup_raw`]: encodes a 16-bit sample the way the converter
/// lays it out in the hardware buffer. Used to build synthetic raw data.
pub fn encode_raw(value: u16) -> u32 {
    u32::from(value).swap_bytes() >> 8
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::encode_raw as encode;

    fn resistance_channel(index: usize) -> ChannelDescriptor {
        let mut ch =
            ChannelDescriptor::new(format!("resistance{index}"), index, false, true, ChannelKind::Resistance);
        ch.enabled = true;
        ch
    }

    #[test]
    fn fixup_roundtrip() {
        for value in [0u16, 1, 0x1000, 0xABCD, 0xFFFF] {
            assert_eq!(fixup_raw(encode(value)), u32::from(value));
        }
    }

    #[test]
    fn linear_conversion_applies_offset_scale_and_millis() {
        let mut ch = ChannelDescriptor::new(
            "voltage0",
            0,
            false,
            true,
            ChannelKind::Linear {
                offset: -32768.0,
                scale: 0.5,
            },
        );
        ch.enabled = true;
        let raw = encode(0x8000);
        // (32768 - 32768) * 0.5 * 1e-3 == 0
        assert_eq!(ch.convert_sample(raw), 0.0);
        let raw = encode(0x8002);
        assert!((ch.convert_sample(raw) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn resistance_conversion_divider_formula() {
        let ch = resistance_channel(2);
        let raw = encode(0x1000);
        let expected = 4096.0 * RESISTANCE_PULLUP_OHMS / (65535.0 - 4096.0);
        assert!((ch.convert_sample(raw) - expected).abs() < 1e-9);
    }

    #[test]
    fn resistance_conversion_saturates_at_full_scale() {
        let ch = resistance_channel(2);
        assert_eq!(ch.convert_sample(encode(0xFFFF)), MAX_RESISTANCE_OHMS);
    }

    #[test]
    fn buffer_capture_excludes_outputs_and_disabled() {
        let mut ch = ChannelDescriptor::new(
            "current1",
            1,
            false,
            true,
            ChannelKind::Linear {
                offset: 0.0,
                scale: 1.0,
            },
        );
        assert!(!ch.is_buffer_capture());
        ch.enabled = true;
        assert!(ch.is_buffer_capture());
        ch.is_output = true;
        assert!(!ch.is_buffer_capture());
    }
}
