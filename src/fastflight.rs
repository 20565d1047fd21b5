//! FastFlight-2 driver: device configuration and chunked sweep acquisition.
//!
//! # Sweeps
//!
//! The instrument sums at most [`CHUNK_SIZE`] records into one reported
//! spectrum. Larger sweeps are split over protocol slots: slot 0 runs full
//! chunks and slot 1 the remainder, and the host adds the spectra together.
//! Which slot produced a spectrum is read from the spectrum itself, so the
//! record count stays right even when the device is a slot ahead of the host.
//!
//! With dithering enabled, full chunks rotate over several slots whose voltage
//! offsets are stepped across a small span. The offset each of those slots
//! adds is known after quantization and is subtracted from the final sums.

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::buffer::DataBuffer;
use crate::decoder::{Spectrum, SpectrumDecoder, Watchdog};
use crate::errors::{DriverError, Result};
use crate::hardware::*;
use crate::registers::RegisterAccess;
use crate::settings::{AcquisitionSettings, EncodedSettings, TimePerPoint};
use crate::transport::{Transport, UsbConfig, UsbTransport};

// ============================================================================
// Constants
// ============================================================================

/// Only sensitivity the hardware offers.
const FIXED_SENSITIVITY: f64 = 0.5;

const BUFFER_CLEAR_ON: u8 = 0x20;
const BUFFER_CLEAR_OFF: u8 = 0x00;
const ACQUISITION_MODE: u8 = 0xd0;

const DEFAULT_DITHER_SPAN_VOLTS: f64 = 0.004;
const DEFAULT_TRIGGER_THRESHOLD: f64 = 0.0;

// ============================================================================
// Data Types
// ============================================================================

/// Voltage dithering across protocol slots.
#[derive(Debug, Clone, PartialEq)]
pub struct DitherConfig {
    pub enabled: bool,
    /// Total voltage range covered by the dither slots.
    pub span: f64,
    /// Number of slots to rotate over (at most `MAX_PROTOCOL - 1`).
    pub slots: usize,
}

impl Default for DitherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            span: DEFAULT_DITHER_SPAN_VOLTS,
            slots: MAX_PROTOCOL - 1,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct Sweep {
    /// Trace length reported by the device.
    pub length: usize,
    /// Accumulated samples, compensated and calibrated.
    pub samples: Vec<f64>,
    /// Records the device actually summed.
    pub records: u64,
    pub spectra: usize,
}

/// Running sum over the spectra of one sweep.
#[derive(Debug, Clone)]
pub struct Accumulator {
    sums: Vec<i64>,
    length: Option<usize>,
    spectra: usize,
}

impl Accumulator {
    pub fn new(length: usize) -> Self {
        Self {
            sums: vec![0; length],
            length: None,
            spectra: 0,
        }
    }

    pub fn add(&mut self, spectrum: &Spectrum) {
        self.add_samples(&spectrum.samples, spectrum.length);
    }

    pub fn add_samples(&mut self, samples: &[u32], length: usize) {
        match self.length {
            Some(previous) if previous != length => {
                warn!(
                    "trace length changed from {} to {} during sweep",
                    previous, length
                );
                self.length = Some(previous.max(length));
            }
            Some(_) => {}
            None => self.length = Some(length),
        }
        for (sum, &s) in self.sums.iter_mut().zip(samples) {
            *sum += i64::from(s);
        }
        self.spectra += 1;
    }

    /// Subtract a constant from every sample.
    pub fn offset(&mut self, counts: i64) {
        for sum in self.sums.iter_mut() {
            *sum -= counts;
        }
    }

    pub fn sums(&self) -> &[i64] {
        &self.sums
    }

    pub fn length(&self) -> usize {
        self.length.unwrap_or(0)
    }

    pub fn spectra(&self) -> usize {
        self.spectra
    }
}

// ============================================================================
// FastFlight Driver
// ============================================================================

/// FastFlight-2 driver.
///
/// Owns the transport, the stream decoder and the per-slot cache of what was
/// last written to the device. Not meant to be shared between threads.
///
/// # Example (Rust)
/// ```ignore
/// let mut ff = FastFlight::open(&UsbConfig::default())?;
/// ff.set_time_per_point(0.5);
/// ff.set_trace_length(20_000.0);
/// let sweep = ff.take_sweep(ff.length(), 100_000)?;
/// println!("{} points, {} records", sweep.length, sweep.records);
/// ```
pub struct FastFlight {
    transport: Box<dyn Transport>,
    decoder: SpectrumDecoder,
    settings: AcquisitionSettings,
    slots: [Option<EncodedSettings>; MAX_PROTOCOL],
    slot_records: [u32; MAX_PROTOCOL],
    active_protocol: Option<u8>,
    last_protocol: Option<u8>,
    records_per_sweep: u32,
    trigger_threshold: f64,
    calibration: Option<Vec<f64>>,
    dither: DitherConfig,
    sweep_timeout: Option<Duration>,
    running: bool,
}

impl FastFlight {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the first FastFlight-2 matching `config` over USB.
    pub fn open(config: &UsbConfig) -> Result<Self> {
        let transport = UsbTransport::open(config)?;
        Ok(Self::from_transport(transport, config.clone()))
    }

    /// Drive an already opened transport.
    pub fn from_transport<T: Transport + 'static>(transport: T, config: UsbConfig) -> Self {
        let settings = AcquisitionSettings::default();
        let records_per_sweep = settings.records_per_spectrum;
        Self {
            transport: Box::new(transport),
            decoder: SpectrumDecoder::new(DataBuffer::new(config)),
            settings,
            slots: [None; MAX_PROTOCOL],
            slot_records: [0; MAX_PROTOCOL],
            active_protocol: None,
            last_protocol: None,
            records_per_sweep,
            trigger_threshold: DEFAULT_TRIGGER_THRESHOLD,
            calibration: None,
            dither: DitherConfig::default(),
            sweep_timeout: None,
            running: false,
        }
    }

    /// Direct register access.
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        &mut *self.transport
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Replace the acquisition settings; they are quantized immediately.
    pub fn set_settings(&mut self, settings: AcquisitionSettings) {
        self.settings = settings;
        self.settings.encode();
    }

    pub fn set_time_per_point(&mut self, ns: f64) {
        self.settings.time_per_point = TimePerPoint::nearest(ns);
        self.settings.encode();
    }

    pub fn time_per_point(&self) -> f64 {
        self.settings.time_per_point.nanoseconds()
    }

    /// Set the record length in nanoseconds.
    pub fn set_trace_length(&mut self, ns: f64) {
        self.settings.record_length = ns;
        self.settings.encode();
    }

    pub fn trace_length(&self) -> f64 {
        self.settings.record_length
    }

    /// Set the record length in points.
    pub fn set_length(&mut self, points: usize) {
        self.settings.record_length = points as f64 * self.time_per_point();
        self.settings.encode();
    }

    pub fn length(&self) -> usize {
        self.settings.points() as usize
    }

    pub fn set_offset(&mut self, volts: f64) {
        self.settings.voltage_offset = volts;
        self.settings.encode();
    }

    pub fn offset(&self) -> f64 {
        self.settings.voltage_offset
    }

    /// `(volts per count, volt offset, seconds per point)` for the last sweep.
    pub fn scale(&self) -> (f64, f64, f64) {
        let scale = VOLTS_PER_COUNT / f64::from(self.records_per_sweep.max(1));
        let tscale = self.time_per_point() * 1e-9;
        (scale, self.settings.voltage_offset, tscale)
    }

    pub fn set_dither(&mut self, dither: DitherConfig) {
        self.dither = dither;
    }

    pub fn dither(&self) -> &DitherConfig {
        &self.dither
    }

    /// Bound the duration of a sweep. `None` waits indefinitely.
    pub fn set_sweep_timeout(&mut self, timeout: Option<Duration>) {
        self.sweep_timeout = timeout;
    }

    // ------------------------------------------------------------------------
    // Trigger and front end
    // ------------------------------------------------------------------------

    pub fn set_trigger_50ohm(&mut self, state: bool) {
        if !state {
            warn!("FastFlight 2 only supports 50 ohm trigger");
        }
    }

    pub fn is_trigger_50ohm(&self) -> bool {
        true
    }

    pub fn set_sensitivity(&mut self, sensitivity: f64) {
        if sensitivity != FIXED_SENSITIVITY {
            warn!(
                "FastFlight 2 has fixed sensitivity of {}, ignoring {}",
                FIXED_SENSITIVITY, sensitivity
            );
        }
    }

    pub fn sensitivity(&self) -> f64 {
        FIXED_SENSITIVITY
    }

    /// Set the trigger threshold in volts.
    pub fn set_trigger_threshold(&mut self, volts: f64) -> Result<()> {
        let i = (((2.5 - volts) / 5.0) * 1024.0).ceil() as i64;
        let i = i.clamp(0, 0x3ff) as u16;
        let low = ((i & 0x3) * 0x40) as u8;
        let high = (i / 0x04) as u8;
        if !self.transport.set_parameter(TRIGGER_THRESHOLD_LOW_PARAMETER, low)
            || !self.transport.set_parameter(TRIGGER_THRESHOLD_HIGH_PARAMETER, high)
        {
            return Err(DriverError::Protocol("trigger threshold rejected".into()));
        }
        self.trigger_threshold = volts;
        debug!("trigger threshold {:.3} V (code 0x{:03x})", volts, i);
        Ok(())
    }

    pub fn trigger_threshold(&self) -> f64 {
        self.trigger_threshold
    }

    pub fn set_external_trigger(&mut self, state: bool) -> Result<()> {
        self.transport.set_external_trigger(state)
    }

    pub fn external_trigger(&mut self) -> Result<bool> {
        self.transport.external_trigger()
    }

    pub fn set_trigger_enable_high(&mut self, high: bool) -> Result<()> {
        self.transport.set_trigger_enable_high(high)
    }

    pub fn trigger_enable_high(&mut self) -> Result<bool> {
        self.transport.trigger_enable_high()
    }

    pub fn set_trigger_rising(&mut self, rising: bool) -> Result<()> {
        self.transport.set_trigger_rising(rising)
    }

    pub fn is_trigger_rising(&mut self) -> Result<bool> {
        self.transport.trigger_rising()
    }

    pub fn set_rapid_protocol_selection(&mut self, state: bool) -> Result<()> {
        self.transport.set_rapid_protocol_selection(state)
    }

    pub fn rapid_protocol_selection(&mut self) -> Result<bool> {
        self.transport.rapid_protocol_selection()
    }

    pub fn reset_timer(&mut self) -> Result<()> {
        self.transport.reset_timer()
    }

    // ------------------------------------------------------------------------
    // Protocol slots
    // ------------------------------------------------------------------------

    /// Write `settings` into a protocol slot unless the slot already holds
    /// the same images. Returns whether anything was written.
    pub fn send_protocol(&mut self, slot: usize, settings: &mut AcquisitionSettings) -> Result<bool> {
        if slot >= MAX_PROTOCOL {
            return Err(DriverError::InvalidArgument(format!(
                "protocol slot {} out of range (max {})",
                slot,
                MAX_PROTOCOL - 1
            )));
        }
        let encoded = settings.encode();
        self.slot_records[slot] = settings.records_per_spectrum;
        if self.slots[slot] == Some(encoded) {
            debug!("protocol slot {} unchanged, not resending", slot);
            return Ok(false);
        }

        let base = PROTOCOL_BASE + slot as u16 * PROTOCOL_STEP;
        self.slots[slot] = None;
        self.transport.write_memory_block(base, &encoded.b1)?;
        self.transport
            .write_memory_block(base + PROTOCOL_B2_OFFSET, &encoded.b2)?;
        self.slots[slot] = Some(encoded);
        debug!(
            "protocol slot {}: {} records, {:.6} V offset",
            slot, settings.records_per_spectrum, settings.voltage_offset
        );
        Ok(true)
    }

    /// Make `slot` the protocol the device runs next.
    pub fn select_protocol(&mut self, slot: usize) -> Result<()> {
        if slot >= MAX_PROTOCOL {
            return Err(DriverError::InvalidArgument(format!(
                "protocol slot {} out of range",
                slot
            )));
        }
        if !self
            .transport
            .set_parameter(PROTOCOL_SELECT_PARAMETER, slot as u8)
        {
            return Err(DriverError::Protocol(format!(
                "device rejected protocol slot {}",
                slot
            )));
        }
        self.active_protocol = Some(slot as u8);
        Ok(())
    }

    /// Slot that produced the most recently decoded spectrum.
    pub fn last_protocol(&self) -> Option<u8> {
        self.last_protocol
    }

    // ------------------------------------------------------------------------
    // Acquisition control
    // ------------------------------------------------------------------------

    /// Empty the device's spectrum buffer and the host-side stream buffer.
    pub fn clear_buffer(&mut self) -> Result<()> {
        self.transport
            .set_parameter(BUFFER_CONTROL_PARAMETER, BUFFER_CLEAR_ON);
        let response = self.transport.command(&[CLEAR_BUFFER_CMD])?;
        if response != 1 {
            return Err(DriverError::UnexpectedResponse {
                command: CLEAR_BUFFER_CMD,
                response,
            });
        }
        self.transport
            .set_parameter(BUFFER_CONTROL_PARAMETER, BUFFER_CLEAR_OFF);
        self.decoder.reset();
        Ok(())
    }

    pub fn start_acquisition(&mut self) -> Result<()> {
        self.clear_buffer()?;
        self.transport
            .set_parameter(ACQUISITION_MODE_PARAMETER, ACQUISITION_MODE);
        for (address, value) in START_SEQUENCE {
            self.transport.set_memory(address, value);
        }

        let e = self.transport.get_memory(MISC_CNTRL_PTR)?;
        self.transport.set_memory(MISC_CNTRL_PTR, e | UNKNOWN_START);
        self.transport.set_memory(MISC_CNTRL_PTR, e & !UNKNOWN_START);
        if !self.transport.set_memory(MISC_CNTRL_PTR, e | RUN_MASK) {
            return Err(DriverError::NotReady("device did not accept RUN".into()));
        }
        self.running = true;
        info!(
            "acquisition started (protocol {:?})",
            self.active_protocol
        );
        Ok(())
    }

    pub fn stop_acquisition(&mut self) -> Result<()> {
        let e = self.transport.get_memory(MISC_CNTRL_PTR)?;
        self.transport.set_memory(MISC_CNTRL_PTR, e & !RUN_MASK);
        if self.running {
            info!("acquisition stopped");
        }
        self.running = false;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stream recoveries since the driver was created.
    pub fn resync_count(&self) -> u64 {
        self.decoder.resync_count()
    }

    // ------------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------------

    /// Acquire `total_records` records of `sample_length` points, summed.
    pub fn take_sweep(&mut self, sample_length: usize, total_records: u32) -> Result<Sweep> {
        if sample_length == 0 || total_records == 0 {
            return Err(DriverError::InvalidArgument(format!(
                "sweep of {} records x {} points",
                total_records, sample_length
            )));
        }
        self.check_calibration(sample_length)?;

        let watchdog = self.sweep_timeout.map(Watchdog::start);
        // only slots configured below count records in this sweep
        self.slot_records = [0; MAX_PROTOCOL];
        let dithered = self.settings.precision_enhancer
            && self.dither.enabled
            && total_records > CHUNK_SIZE;
        let acquired = if dithered {
            self.sweep_dithered(sample_length, total_records, watchdog.as_ref())
        } else {
            self.sweep_chunked(sample_length, total_records, watchdog.as_ref())
        };
        let stopped = self.stop_acquisition();
        let (acc, records) = match acquired {
            Ok(result) => result,
            Err(e) => {
                error!("sweep of {} records failed: {}", total_records, e);
                return Err(e);
            }
        };
        stopped?;

        self.records_per_sweep = total_records;
        let mut samples: Vec<f64> = acc.sums().iter().map(|&s| s as f64).collect();
        if records != u64::from(total_records) {
            let factor = f64::from(total_records) / records as f64;
            warn!(
                "sweep summed {} records instead of {}, rescaling by {:.6}",
                records, total_records, factor
            );
            for s in samples.iter_mut() {
                *s *= factor;
            }
        }
        self.apply_background_calibration(&mut samples, total_records)?;

        info!(
            "sweep complete: {} records in {} spectra, {} points",
            records,
            acc.spectra(),
            acc.length()
        );
        Ok(Sweep {
            length: acc.length(),
            samples,
            records,
            spectra: acc.spectra(),
        })
    }

    fn sweep_chunked(
        &mut self,
        length: usize,
        total: u32,
        watchdog: Option<&Watchdog>,
    ) -> Result<(Accumulator, u64)> {
        let mut acc = Accumulator::new(length);
        let mut base = self.settings.clone();

        if total <= CHUNK_SIZE {
            base.records_per_spectrum = total;
            self.send_protocol(0, &mut base)?;
            self.select_protocol(0)?;
            self.start_acquisition()?;
            let spectrum = self.next_spectrum(length, watchdog)?;
            acc.add(&spectrum);
            return Ok((acc, u64::from(total)));
        }

        let remainder = total % CHUNK_SIZE;
        let last_chunk = if remainder == 0 { CHUNK_SIZE } else { remainder };
        let mut full = base.clone();
        full.records_per_spectrum = CHUNK_SIZE;
        self.send_protocol(0, &mut full)?;
        let mut tail = base;
        tail.records_per_spectrum = last_chunk;
        self.send_protocol(1, &mut tail)?;
        self.select_protocol(0)?;
        self.start_acquisition()?;

        let total = u64::from(total);
        let mut completed = 0u64;
        while completed < total {
            if let Some(w) = watchdog {
                w.check()?;
            }
            let spectrum = self.next_spectrum(length, watchdog)?;
            acc.add(&spectrum);
            completed += u64::from(self.records_of(&spectrum));

            let remaining = total.saturating_sub(completed);
            if remaining > 0 && remaining <= u64::from(last_chunk) && self.active_protocol != Some(1)
            {
                self.select_protocol(1)?;
            }
        }
        Ok((acc, completed))
    }

    fn sweep_dithered(
        &mut self,
        length: usize,
        total: u32,
        watchdog: Option<&Watchdog>,
    ) -> Result<(Accumulator, u64)> {
        let mut acc = Accumulator::new(length);
        let mut base = self.settings.clone();
        base.encode();
        let base_volts = base.voltage_offset;

        let full_chunks = (total / CHUNK_SIZE) as usize;
        let remainder = total % CHUNK_SIZE;
        let n_dither = self.dither.slots.clamp(1, MAX_PROTOCOL - 1).min(full_chunks);
        let step = self.dither.span / n_dither as f64;
        let final_slot = MAX_PROTOCOL - 1;

        // quantized offset of every dither slot relative to the base
        let mut deltas = [0.0f64; MAX_PROTOCOL];
        for (k, delta) in deltas.iter_mut().enumerate().take(n_dither) {
            let mut s = base.clone();
            s.records_per_spectrum = CHUNK_SIZE;
            s.voltage_offset = base_volts + k as f64 * step;
            self.send_protocol(k, &mut s)?;
            *delta = s.voltage_offset - base_volts;
        }
        if remainder > 0 {
            let mut s = base.clone();
            s.records_per_spectrum = remainder;
            self.send_protocol(final_slot, &mut s)?;
        }
        info!(
            "dithered sweep: {} slots, {:.6} V step, {} remainder records",
            n_dither, step, remainder
        );

        self.select_protocol(0)?;
        self.start_acquisition()?;

        let total = u64::from(total);
        let mut completed = 0u64;
        let mut compensation = 0i64;
        let mut next = 0usize;
        while completed < total {
            if let Some(w) = watchdog {
                w.check()?;
            }
            let spectrum = self.next_spectrum(length, watchdog)?;
            let slot = self.slot_of(&spectrum);
            let records = self.slot_records[slot];
            acc.add(&spectrum);
            if slot < n_dither && slot != final_slot {
                compensation +=
                    (deltas[slot] / VOLTS_PER_COUNT * f64::from(records)).round() as i64;
            }
            completed += u64::from(records);

            let remaining = total.saturating_sub(completed);
            if remaining == 0 {
                break;
            }
            if remaining >= u64::from(CHUNK_SIZE) || remainder == 0 {
                next = (next + 1) % n_dither;
                self.select_protocol(next)?;
            } else {
                self.select_protocol(final_slot)?;
            }
        }

        debug!("dither compensation {} counts per point", compensation);
        acc.offset(compensation);
        Ok((acc, completed))
    }

    fn next_spectrum(&mut self, length: usize, watchdog: Option<&Watchdog>) -> Result<Spectrum> {
        let spectrum = self
            .decoder
            .next_spectrum(&mut *self.transport, length, watchdog)?;
        self.last_protocol = spectrum
            .protocol
            .and_then(|p| u8::try_from(p).ok())
            .filter(|&p| usize::from(p) < MAX_PROTOCOL)
            .or(self.active_protocol);
        debug!(
            "spectrum {} from protocol {:?}: {} points, {} words",
            spectrum.index, self.last_protocol, spectrum.length, spectrum.declared_words
        );
        Ok(spectrum)
    }

    /// Slot a spectrum came from, falling back to the selected slot when the
    /// reported one is out of range or was not configured for this sweep.
    fn slot_of(&self, spectrum: &Spectrum) -> usize {
        let active = self.active_protocol.map(usize::from).unwrap_or(0);
        match spectrum.protocol {
            Some(p) if (p as usize) < MAX_PROTOCOL && self.slot_records[p as usize] > 0 => {
                p as usize
            }
            Some(slot) => {
                warn!(
                    "spectrum reports unconfigured protocol slot {}, counting it as slot {}",
                    slot, active
                );
                active
            }
            None => active,
        }
    }

    fn records_of(&self, spectrum: &Spectrum) -> u32 {
        self.slot_records[self.slot_of(spectrum)]
    }

    // ------------------------------------------------------------------------
    // Background calibration
    // ------------------------------------------------------------------------

    /// Install a background trace in volts, subtracted from every sweep.
    pub fn set_background_calibration(&mut self, calibration: Vec<f64>) {
        self.calibration = Some(calibration);
    }

    pub fn clear_background_calibration(&mut self) {
        self.calibration = None;
    }

    fn check_calibration(&self, requested: usize) -> Result<()> {
        match &self.calibration {
            Some(cal) if cal.len() < requested => Err(DriverError::CalibrationShape {
                requested,
                available: cal.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Subtract the installed background from `samples` summed over `records`.
    pub fn apply_background_calibration(&self, samples: &mut [f64], records: u32) -> Result<()> {
        let Some(cal) = &self.calibration else {
            return Ok(());
        };
        self.check_calibration(samples.len())?;
        let scale = VOLTS_PER_COUNT / f64::from(records.max(1));
        for (s, c) in samples.iter_mut().zip(cal) {
            *s -= c / scale;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::Emulator;
    use crate::transport::mock::ScriptedTransport;

    fn emulated() -> FastFlight {
        FastFlight::from_transport(Emulator::default(), UsbConfig::default())
    }

    #[test]
    fn accumulates_samplewise() {
        let mut acc = Accumulator::new(3);
        acc.add_samples(&[1, 2, 3], 3);
        acc.add_samples(&[4, 5, 6], 3);
        assert_eq!(acc.sums(), &[5, 7, 9]);
        assert_eq!(acc.spectra(), 2);
    }

    #[test]
    fn accumulator_tolerates_length_changes() {
        let mut acc = Accumulator::new(4);
        acc.add_samples(&[1, 1, 0, 0], 2);
        acc.add_samples(&[1, 1, 1, 1], 4);
        assert_eq!(acc.length(), 4);
        acc.offset(1);
        assert_eq!(acc.sums(), &[1, 1, 0, 0]);
    }

    #[test]
    fn calibration_shape_guard() {
        let mut ff = emulated();
        ff.set_background_calibration(vec![0.0; 50]);
        assert!(matches!(
            ff.take_sweep(100, 10),
            Err(DriverError::CalibrationShape {
                requested: 100,
                available: 50
            })
        ));

        let mut samples = vec![1.0; 100];
        assert!(ff.apply_background_calibration(&mut samples, 1).is_err());
        assert!(samples.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn calibration_subtracts_scaled_background() {
        let mut ff = emulated();
        let records = 4;
        let scale = VOLTS_PER_COUNT / records as f64;
        ff.set_background_calibration(vec![scale * 2.0, scale * 3.0, 0.0]);
        let mut samples = vec![10.0, 10.0];
        ff.apply_background_calibration(&mut samples, records).unwrap();
        assert!((samples[0] - 8.0).abs() < 1e-9);
        assert!((samples[1] - 7.0).abs() < 1e-9);
    }

    #[test]
    fn send_protocol_skips_identical_images() {
        let mut ff = emulated();
        let mut s = AcquisitionSettings::default();
        assert!(ff.send_protocol(2, &mut s).unwrap());
        assert!(!ff.send_protocol(2, &mut s.clone()).unwrap());
        s.records_per_spectrum += 1;
        assert!(ff.send_protocol(2, &mut s).unwrap());
        assert!(ff.send_protocol(MAX_PROTOCOL, &mut s).is_err());

        // images land at the slot's base address and 0x0e further
        let encoded = s.encode();
        let base = PROTOCOL_BASE + 2 * PROTOCOL_STEP;
        let t = ff.transport_mut();
        assert_eq!(t.get_memory(base + 5).unwrap(), encoded.b1[5]);
        assert_eq!(
            t.get_memory(base + PROTOCOL_B2_OFFSET + 0x10).unwrap(),
            encoded.b2[0x10]
        );
    }

    #[test]
    fn unacknowledged_protocol_selection_fails() {
        // memory writes succeed but no parameter response is ever queued
        let mut ff = FastFlight::from_transport(ScriptedTransport::default(), UsbConfig::default());
        let mut s = AcquisitionSettings::default();
        assert!(ff.send_protocol(1, &mut s).unwrap());
        assert!(matches!(
            ff.select_protocol(1),
            Err(DriverError::Protocol(_))
        ));
        assert!(matches!(
            ff.select_protocol(MAX_PROTOCOL),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn fixed_front_end_requests_are_ignored() {
        let mut ff = emulated();
        ff.set_trigger_50ohm(false);
        assert!(ff.is_trigger_50ohm());
        ff.set_sensitivity(0.25);
        assert_eq!(ff.sensitivity(), 0.5);
    }

    #[test]
    fn trigger_threshold_encoding() {
        let mut ff = emulated();
        // 0 V -> code 0x200
        ff.set_trigger_threshold(0.0).unwrap();
        let t = ff.transport_mut();
        assert_eq!(t.get_parameter(TRIGGER_THRESHOLD_LOW_PARAMETER).unwrap(), 0x00);
        assert_eq!(t.get_parameter(TRIGGER_THRESHOLD_HIGH_PARAMETER).unwrap(), 0x80);

        // -0.01 V -> ceil(514.048) = 0x203
        ff.set_trigger_threshold(-0.01).unwrap();
        assert_eq!(ff.trigger_threshold(), -0.01);
        let t = ff.transport_mut();
        assert_eq!(t.get_parameter(TRIGGER_THRESHOLD_LOW_PARAMETER).unwrap(), 0xc0);
        assert_eq!(t.get_parameter(TRIGGER_THRESHOLD_HIGH_PARAMETER).unwrap(), 0x80);
    }

    #[test]
    fn settings_accessors_quantize() {
        let mut ff = emulated();
        ff.set_time_per_point(0.9);
        assert_eq!(ff.time_per_point(), 1.0);
        ff.set_length(1000);
        assert_eq!(ff.length(), 1000);
        assert_eq!(ff.trace_length(), 1000.0);
        ff.set_trace_length(1000.4);
        assert_eq!(ff.trace_length(), 1000.0);
        ff.set_offset(0.25);
        assert_eq!(ff.offset(), 0.25);
        let (_, offset, tscale) = ff.scale();
        assert_eq!(offset, 0.25);
        assert!((tscale - 1e-9).abs() < 1e-18);
    }

    #[test]
    fn single_chunk_sweep_runs_slot_zero() {
        let mut ff = emulated();
        ff.set_length(64);
        ff.set_offset(0.0);
        let sweep = ff.take_sweep(64, 10).unwrap();
        assert_eq!(sweep.records, 10);
        assert_eq!(sweep.spectra, 1);
        assert_eq!(sweep.length, 64);
        assert_eq!(ff.last_protocol(), Some(0));
        assert!(!ff.is_running());
        // 10 records of 3 + (j % 50) counts; the 0 V offset is below one count.
        // The high byte of these points comes from a tag word whose byte is zero.
        assert_eq!(sweep.samples[0], 30.0);
        assert_eq!(sweep.samples[1], 40.0);
        assert_eq!(sweep.samples[49], 520.0);
    }

    fn reporting(protocol: Option<u32>) -> Spectrum {
        Spectrum {
            index: 1,
            samples: vec![0; 4],
            length: 4,
            declared_words: 3,
            protocol,
            timestamp: None,
            ion_count: None,
        }
    }

    #[test]
    fn reported_slot_must_be_in_range_and_configured() {
        let mut ff = emulated();
        let mut full = AcquisitionSettings {
            records_per_spectrum: CHUNK_SIZE,
            ..Default::default()
        };
        let mut tail = AcquisitionSettings {
            records_per_spectrum: 10,
            ..Default::default()
        };
        ff.send_protocol(0, &mut full).unwrap();
        ff.send_protocol(1, &mut tail).unwrap();
        ff.select_protocol(0).unwrap();

        assert_eq!(ff.records_of(&reporting(Some(1))), 10);
        assert_eq!(ff.records_of(&reporting(None)), CHUNK_SIZE);
        // 0x101 must not alias slot 1
        assert_eq!(ff.slot_of(&reporting(Some(0x101))), 0);
        assert_eq!(ff.records_of(&reporting(Some(0x101))), CHUNK_SIZE);
        // slot 5 was never configured
        assert_eq!(ff.slot_of(&reporting(Some(5))), 0);
    }

    #[test]
    fn invalid_sweep_arguments() {
        let mut ff = emulated();
        assert!(matches!(
            ff.take_sweep(0, 10),
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(matches!(
            ff.take_sweep(10, 0),
            Err(DriverError::InvalidArgument(_))
        ));
    }
}
