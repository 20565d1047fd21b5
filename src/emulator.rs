//! In-memory FastFlight-2 for running the driver without hardware.
//!
//! The emulator answers parameter and memory requests, reads back the
//! protocol slot images the driver writes, and while RUN is set produces one
//! spectrum per bulk read using the currently selected slot. Each record adds
//! `signal(point)` counts plus the slot's voltage offset expressed in counts.
//!
//! Every group of four points goes out as its own 24-bit data tag followed by
//! two words holding the middle and low bytes. The high byte of each point is
//! whatever the tag word has at that position, so the emulated counters wrap
//! at 16 bits; [`Emulator::reported_sum`] gives the value the host reads back.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, trace};

use crate::decoder::{code_word, CodeType, PAYLOAD_MASK};
use crate::errors::TransportError;
use crate::hardware::*;
use crate::transport::{ControlPayload, Transport};

const MEMORY_SIZE: usize = 0x10000;
const LOW_BITS: u32 = 0xffff;
const CLOCK_TICKS_PER_SPECTRUM: u64 = 0x0030_0000;

/// Per-record signal used when none is given.
pub fn default_signal(point: usize) -> u32 {
    3 + (point % 50) as u32
}

/// Bits a 24-bit data tag contributes to `point`: the tag word's byte at the
/// point's position in its group, shifted into the high byte.
pub fn tag_high_bits(point: usize) -> u32 {
    let start = point - point % 4;
    let tag = code_word(CodeType::Data24Bit, start as u32).unwrap_or(0);
    u32::from(tag.to_le_bytes()[point % 4]) << 16
}

/// What a protocol slot currently asks for, decoded from its images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotImage {
    pub records: u32,
    pub points: usize,
    pub volts: f64,
}

/// Simulated instrument implementing [`Transport`].
pub struct Emulator {
    parameters: [u8; 256],
    memory: Vec<u8>,
    responses: VecDeque<u8>,
    stream: VecDeque<u8>,
    signal: fn(usize) -> u32,
    next_index: u32,
    clock: u64,
    corrupt_pending: u32,
    reported_protocol: Option<u32>,
    spectra_emitted: u64,
    block_writes: Vec<(u16, usize)>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(default_signal)
    }
}

impl Emulator {
    pub fn new(signal: fn(usize) -> u32) -> Self {
        Self {
            parameters: [0u8; 256],
            memory: vec![0u8; MEMORY_SIZE],
            responses: VecDeque::new(),
            stream: VecDeque::new(),
            signal,
            next_index: 1,
            clock: 0,
            corrupt_pending: 0,
            reported_protocol: None,
            spectra_emitted: 0,
            block_writes: Vec::new(),
        }
    }

    /// Corrupt the next `n` spectra with a stray data word.
    pub fn corrupt_next(&mut self, n: u32) {
        self.corrupt_pending += n;
    }

    /// Put `protocol` in the PROTOCOL word of every spectrum instead of the
    /// slot that actually ran. `None` restores truthful reporting.
    pub fn report_protocol(&mut self, protocol: Option<u32>) {
        self.reported_protocol = protocol;
    }

    pub fn spectra_emitted(&self) -> u64 {
        self.spectra_emitted
    }

    pub fn parameter(&self, index: u8) -> u8 {
        self.parameters[index as usize]
    }

    pub fn memory(&self, address: u16) -> u8 {
        self.memory[address as usize]
    }

    pub fn running(&self) -> bool {
        self.memory(MISC_CNTRL_PTR) & RUN_MASK != 0
    }

    /// Multi-byte memory writes seen so far, as `(address, length)`.
    pub fn block_writes(&self) -> &[(u16, usize)] {
        &self.block_writes
    }

    /// Sum one point of a spectrum of `records` records at `volts` offset.
    pub fn expected_sum(&self, point: usize, records: u32, volts: f64) -> u32 {
        let signal = i64::from(records) * i64::from((self.signal)(point));
        let offset = (f64::from(records) * volts / VOLTS_PER_COUNT).round() as i64;
        (signal + offset).clamp(0, i64::from(u32::MAX)) as u32
    }

    /// The value a decoder reads for `point` out of the emitted stream.
    pub fn reported_sum(&self, point: usize, records: u32, volts: f64) -> u32 {
        let start = point - point % 4;
        let low = |p| self.expected_sum(p, records, volts) & LOW_BITS;
        if (start..start + 4).all(|p| low(p) == 0) {
            return 0;
        }
        tag_high_bits(point) | low(point)
    }

    pub fn slot_image(&self, slot: usize) -> SlotImage {
        let base = PROTOCOL_BASE as usize + slot * PROTOCOL_STEP as usize;
        let b1 = &self.memory[base..base + 0x0d];
        let b2_base = base + PROTOCOL_B2_OFFSET as usize;
        let b2 = &self.memory[b2_base..b2_base + 0x12];

        let records = u32::from(b1[5]) | u32::from(b1[6]) << 8;
        let code = u32::from(b1[8]) | u32::from(b1[9]) << 8;
        let volts = 0.5 * (f64::from(code) / 65535.0) - 0.25;
        let adjusted = u32::from(b2[9]) | u32::from(b2[10]) << 8 | u32::from(b2[11] & 0x1f) << 16;
        SlotImage {
            records,
            points: adjusted as usize + 2,
            volts,
        }
    }

    fn handle_command(&mut self, cmd: &[u8]) {
        let response = match cmd {
            [SET_CMD, index, value] => {
                self.parameters[*index as usize] = *value;
                1
            }
            [GET_CMD, index] => self.parameters[*index as usize],
            [CLEAR_BUFFER_CMD] => {
                self.stream.clear();
                1
            }
            _ => 0,
        };
        self.responses.push_back(response);
    }

    fn emit_spectrum(&mut self) {
        let slot = self.parameter(PROTOCOL_SELECT_PARAMETER) as usize % MAX_PROTOCOL;
        let image = self.slot_image(slot);
        if image.records == 0 {
            return;
        }

        let mut body = Vec::new();
        let word = |code, payload| code_word(code, payload).unwrap_or(0);
        body.push(word(CodeType::TimeLow, (self.clock & u64::from(PAYLOAD_MASK)) as u32));
        body.push(word(CodeType::TimeHigh, (self.clock >> 21) as u32 & PAYLOAD_MASK));
        let reported = self.reported_protocol.unwrap_or(slot as u32);
        body.push(word(CodeType::Protocol, reported));
        if self.corrupt_pending > 0 {
            self.corrupt_pending -= 1;
            body.push(0x0000_0000);
        }
        let ions = (self.spectra_emitted as u32 * 7) & 0x7fff;
        body.push(word(CodeType::IonCount, ions));
        body.extend_from_slice(&[ions, 0, 0]);

        let groups = image.points / 4;
        for g in 0..groups {
            let start = g * 4;
            let low: [u32; 4] = std::array::from_fn(|j| {
                self.expected_sum(start + j, image.records, image.volts) & LOW_BITS
            });
            if low.iter().all(|&s| s == 0) {
                continue;
            }
            body.push(word(CodeType::Data24Bit, start as u32));
            body.push(u32::from_le_bytes(low.map(|s| (s >> 8) as u8)));
            body.push(u32::from_le_bytes(low.map(|s| s as u8)));
        }

        let declared = body.len() as u32 + 3;
        let mut words = Vec::with_capacity(body.len() + 3);
        words.push(word(CodeType::SpectrumMark, self.next_index));
        words.push(word(CodeType::SpectrumMark, declared));
        words.extend(body);
        words.push(word(CodeType::SpectrumMark, declared));

        self.stream.extend([0xffu8; 8]);
        for w in words {
            self.stream.extend(w.to_le_bytes());
        }
        trace!(
            "emulated spectrum {} from slot {} ({} words)",
            self.next_index,
            slot,
            declared
        );

        // a trailing 0xff in the low byte would be eaten by the sync hunt
        self.next_index = (self.next_index + 1) & PAYLOAD_MASK;
        if self.next_index & 0xff == 0xff {
            self.next_index += 1;
        }
        self.clock += CLOCK_TICKS_PER_SPECTRUM;
        self.spectra_emitted += 1;
    }
}

impl Transport for Emulator {
    fn write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        match endpoint {
            CONTROL_OUT => self.handle_command(data),
            SPECTRA_OUT => {}
            other => {
                return Err(TransportError::Other(format!(
                    "no OUT endpoint 0x{:02x}",
                    other
                )))
            }
        }
        Ok(data.len())
    }

    fn read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        match endpoint {
            CONTROL_IN => {
                let byte = self.responses.pop_front().ok_or(TransportError::Timeout)?;
                match buf.first_mut() {
                    Some(slot) => {
                        *slot = byte;
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            SPECTRA_IN => {
                if self.stream.is_empty() && self.running() {
                    self.emit_spectrum();
                }
                if self.stream.is_empty() {
                    return Err(TransportError::Timeout);
                }
                let n = buf.len().min(self.stream.len());
                for (dst, src) in buf.iter_mut().zip(self.stream.drain(..n)) {
                    *dst = src;
                }
                Ok(n)
            }
            other => Err(TransportError::Other(format!(
                "no IN endpoint 0x{:02x}",
                other
            ))),
        }
    }

    fn control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        payload: ControlPayload<'_>,
        _timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        if request != MEMORY_REQUEST {
            return Err(TransportError::Other(format!(
                "unsupported request 0x{:02x} (type 0x{:02x})",
                request, request_type
            )));
        }
        let address = value as usize;
        match payload {
            ControlPayload::Out(data) => {
                let end = address + data.len();
                if end > MEMORY_SIZE {
                    return Err(TransportError::Other(format!(
                        "write past end of memory at 0x{:04x}",
                        value
                    )));
                }
                self.memory[address..end].copy_from_slice(data);
                if data.len() > 1 {
                    debug!("emulator memory block 0x{:04x} <- {} bytes", value, data.len());
                    self.block_writes.push((value, data.len()));
                }
                Ok(data.len())
            }
            ControlPayload::In(buf) => {
                let end = (address + buf.len()).min(MEMORY_SIZE);
                let n = end - address;
                buf[..n].copy_from_slice(&self.memory[address..end]);
                Ok(n)
            }
        }
    }
}
