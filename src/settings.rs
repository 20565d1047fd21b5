//! Acquisition settings and their encoding into the two protocol images the
//! firmware stores per protocol slot.
//!
//! Encoding quantizes the record length, time offset and voltage offset to
//! what the hardware can represent and writes the quantized values back, so a
//! second encode of the same settings is byte-identical to the first.

use serde::{Deserialize, Serialize};

/// Size of the first protocol image.
pub const B1_LEN: usize = 0x0d;
/// Size of the second protocol image.
pub const B2_LEN: usize = 0x12;

const MIN_POINTS: i64 = 16;
const MAX_POINTS: i64 = 1_500_000;
const TIME_OFFSET_STEP_NS: f64 = 16.0;

// This formula is a guess carried over for compatibility with existing data;
// recalibrate against hardware before trusting it.
const VOLTAGE_SPAN: f64 = 0.5;
const VOLTAGE_FLOOR: f64 = -0.25;
const VOLTAGE_FULL_SCALE: f64 = 65535.0;

// ============================================================================
// Enumerations
// ============================================================================

/// Sampling interval of the digitizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimePerPoint {
    Ps250,
    #[default]
    Ps500,
    Ns1,
    Ns2,
}

impl TimePerPoint {
    pub fn nanoseconds(self) -> f64 {
        match self {
            TimePerPoint::Ps250 => 0.25,
            TimePerPoint::Ps500 => 0.5,
            TimePerPoint::Ns1 => 1.0,
            TimePerPoint::Ns2 => 2.0,
        }
    }

    /// Bits OR-ed into the compression byte of the second image.
    pub fn raw_bits(self) -> u8 {
        match self {
            TimePerPoint::Ps250 => 0x10,
            TimePerPoint::Ps500 => 0x20,
            TimePerPoint::Ns1 => 0x40,
            TimePerPoint::Ns2 => 0x80,
        }
    }

    /// Index stored in the first image.
    pub fn code(self) -> u8 {
        match self {
            TimePerPoint::Ps250 => 0,
            TimePerPoint::Ps500 => 1,
            TimePerPoint::Ns1 => 2,
            TimePerPoint::Ns2 => 3,
        }
    }

    /// Closest supported interval to `ns`.
    pub fn nearest(ns: f64) -> Self {
        if ns <= 0.251 {
            TimePerPoint::Ps250
        } else if ns < 0.51 {
            TimePerPoint::Ps500
        } else if ns < 1.01 {
            TimePerPoint::Ns1
        } else {
            TimePerPoint::Ns2
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    PeakOnly = 0x0,
    #[default]
    Lossless = 0x1,
    Stick = 0x2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sensitivity {
    #[default]
    X2 = 0x0,
    X3 = 0x1,
    X4 = 0x2,
}

// ============================================================================
// Settings
// ============================================================================

/// The two byte images written to a protocol slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedSettings {
    pub b1: [u8; B1_LEN],
    pub b2: [u8; B2_LEN],
}

/// Configuration of one protocol slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Record length in nanoseconds.
    pub record_length: f64,
    /// Delay after the trigger in nanoseconds.
    pub time_offset: f64,
    pub records_per_spectrum: u32,
    /// Input offset in volts.
    pub voltage_offset: f64,
    pub time_per_point: TimePerPoint,
    pub precision_enhancer: bool,
    pub compression: Compression,
    /// 0-15.
    pub ringing_protection: u8,
    pub sensitivity: Sensitivity,
    pub minimum_threshold: u32,
    pub background_interval: u32,
    pub adjacent_background: u8,
    pub correlated_subtraction: bool,
    pub minimum_peak: u32,
    pub maximum_peak: u32,
    /// Nanoseconds.
    pub single_ion_length: f64,
    /// Nanoseconds.
    pub single_ion_start: f64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            record_length: 1e7,
            time_offset: 16.0,
            records_per_spectrum: 256,
            voltage_offset: 0.0,
            time_per_point: TimePerPoint::Ps500,
            precision_enhancer: true,
            compression: Compression::Lossless,
            ringing_protection: 2,
            sensitivity: Sensitivity::X2,
            minimum_threshold: 10,
            background_interval: 200,
            adjacent_background: 0x10,
            correlated_subtraction: false,
            minimum_peak: 4,
            maximum_peak: 400,
            single_ion_length: 100.0,
            single_ion_start: 100.0,
        }
    }
}

impl AcquisitionSettings {
    /// Number of sample points the current record length maps to, after clamping.
    pub fn points(&self) -> u32 {
        let points = (self.record_length / self.time_per_point.nanoseconds()).round() as i64;
        points.clamp(MIN_POINTS, MAX_POINTS) as u32
    }

    /// Encode into the firmware images, rewriting the quantized fields in place.
    pub fn encode(&mut self) -> EncodedSettings {
        let mut b1 = [0u8; B1_LEN];
        let mut b2 = [0u8; B2_LEN];
        let tpp = self.time_per_point.nanoseconds();

        let points = self.points();
        self.record_length = points as f64 * tpp;

        let divider = (0x10 as f64 * 0.5 / tpp) as u32;
        let ticks = points / divider;
        b1[0] = ticks as u8;
        b1[1] = (ticks >> 8) as u8;

        let toi = ((self.time_offset / TIME_OFFSET_STEP_NS).round() as i64).clamp(1, 0xffff);
        self.time_offset = toi as f64 * TIME_OFFSET_STEP_NS;
        b1[3] = toi as u8;
        b1[4] = (toi >> 8) as u8;

        let records = self.records_per_spectrum;
        b1[5] = records as u8;
        b1[6] = (records >> 8) as u8;

        let i = (((self.voltage_offset - VOLTAGE_FLOOR) / VOLTAGE_SPAN) * VOLTAGE_FULL_SCALE)
            .round() as i64;
        let i = i.clamp(0, 0xffff);
        b1[8] = i as u8;
        b1[9] = (i >> 8) as u8;
        self.voltage_offset = VOLTAGE_SPAN * (i as f64 / VOLTAGE_FULL_SCALE) + VOLTAGE_FLOOR;

        b1[0x0b] = self.time_per_point.code();
        b1[0x0c] = u8::from(self.precision_enhancer);

        b2[0] = self.compression as u8 | self.time_per_point.raw_bits();
        b2[1] = (self.ringing_protection.min(0x0f) << 4) | self.sensitivity as u8;
        b2[2] = 0x0a;
        b2[3] = 0x00;
        b2[4] = 0x30;
        b2[5] = (self.background_interval / 4) as u8;
        b2[6] = (self.adjacent_background & 0x7f)
            | if self.correlated_subtraction { 0x80 } else { 0x00 };

        let adjusted = (points / 8) * 8 - 2;
        b2[7] = 0x64;
        b2[8] = 0x04;
        b2[9] = adjusted as u8;
        b2[0x0a] = (adjusted >> 8) as u8;
        b2[0x0b] = ((adjusted >> 16) & 0x1f) as u8;

        b2[0x10] = records as u8;
        b2[0x11] = (records >> 8) as u8;

        EncodedSettings { b1, b2 }
    }

    /// Two settings are the same when they encode to the same images.
    pub fn same_encoding(&mut self, other: &mut AcquisitionSettings) -> bool {
        self.encode() == other.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_idempotent() {
        let mut s = AcquisitionSettings {
            record_length: 12_345.6,
            time_offset: 100.0,
            voltage_offset: 0.0123,
            ..Default::default()
        };
        let first = s.encode();
        let after_first = s.clone();
        let second = s.encode();
        assert_eq!(first, second);
        assert_eq!(s, after_first);
    }

    #[test]
    fn record_length_clamps_to_max_points() {
        let mut s = AcquisitionSettings {
            record_length: 1e7,
            time_per_point: TimePerPoint::Ps500,
            ..Default::default()
        };
        let enc = s.encode();
        assert_eq!(s.points(), 1_500_000);
        assert_eq!(s.record_length, 750_000.0);

        // divider is 16 at 0.5 ns; only the low 16 bits of the tick count fit
        let ticks = 1_500_000u32 / 16;
        assert_eq!(enc.b1[0], ticks as u8);
        assert_eq!(enc.b1[1], (ticks >> 8) as u8);

        let adjusted = 1_500_000u32 - 2;
        assert_eq!(enc.b2[9], adjusted as u8);
        assert_eq!(enc.b2[10], (adjusted >> 8) as u8);
        assert_eq!(enc.b2[11], ((adjusted >> 16) & 0x1f) as u8);
    }

    #[test]
    fn record_length_clamps_to_min_points() {
        let mut s = AcquisitionSettings {
            record_length: 1.0,
            time_per_point: TimePerPoint::Ns1,
            ..Default::default()
        };
        s.encode();
        assert_eq!(s.record_length, 16.0);
    }

    #[test]
    fn voltage_offset_round_trip() {
        let mut s = AcquisitionSettings::default();
        s.voltage_offset = 0.0;
        let enc = s.encode();
        assert_eq!((enc.b1[8], enc.b1[9]), (0x00, 0x80));
        assert!(s.voltage_offset.abs() < 1e-5);

        s.voltage_offset = 0.25;
        let enc = s.encode();
        assert_eq!((enc.b1[8], enc.b1[9]), (0xff, 0xff));
        assert!((s.voltage_offset - 0.25).abs() < 1e-12);

        s.voltage_offset = -0.25;
        let enc = s.encode();
        assert_eq!((enc.b1[8], enc.b1[9]), (0x00, 0x00));
        assert!((s.voltage_offset + 0.25).abs() < 1e-12);

        s.voltage_offset = 3.0;
        let enc = s.encode();
        assert_eq!((enc.b1[8], enc.b1[9]), (0xff, 0xff));
    }

    #[test]
    fn time_offset_quantizes_to_16ns() {
        let mut s = AcquisitionSettings {
            time_offset: 70.0,
            ..Default::default()
        };
        let enc = s.encode();
        assert_eq!(s.time_offset, 64.0);
        assert_eq!((enc.b1[3], enc.b1[4]), (4, 0));

        s.time_offset = 0.0;
        s.encode();
        assert_eq!(s.time_offset, 16.0);
    }

    #[test]
    fn second_image_layout() {
        let mut s = AcquisitionSettings {
            compression: Compression::Lossless,
            time_per_point: TimePerPoint::Ns1,
            ringing_protection: 2,
            sensitivity: Sensitivity::X4,
            background_interval: 200,
            adjacent_background: 0xff,
            correlated_subtraction: true,
            records_per_spectrum: 0x1234,
            ..Default::default()
        };
        let enc = s.encode();
        assert_eq!(enc.b2[0], 0x41);
        assert_eq!(enc.b2[1], 0x22);
        assert_eq!(&enc.b2[2..5], &[0x0a, 0x00, 0x30]);
        assert_eq!(enc.b2[5], 50);
        assert_eq!(enc.b2[6], 0xff);
        assert_eq!(&enc.b2[7..9], &[0x64, 0x04]);
        assert_eq!(&enc.b2[12..16], &[0, 0, 0, 0]);
        assert_eq!(&enc.b2[16..18], &[0x34, 0x12]);
        assert_eq!(&enc.b1[5..7], &[0x34, 0x12]);
        assert_eq!(enc.b1[11], 2);
        assert_eq!(enc.b1[12], 1);
    }

    #[test]
    fn same_encoding_ignores_sub_quantum_differences() {
        let mut a = AcquisitionSettings::default();
        let mut b = AcquisitionSettings {
            time_offset: 17.0,
            ..Default::default()
        };
        assert!(a.same_encoding(&mut b));

        b.records_per_spectrum = 512;
        assert!(!a.same_encoding(&mut b));
    }

    #[test]
    fn nearest_time_per_point() {
        assert_eq!(TimePerPoint::nearest(0.1), TimePerPoint::Ps250);
        assert_eq!(TimePerPoint::nearest(0.5), TimePerPoint::Ps500);
        assert_eq!(TimePerPoint::nearest(0.8), TimePerPoint::Ns1);
        assert_eq!(TimePerPoint::nearest(5.0), TimePerPoint::Ns2);
    }
}
