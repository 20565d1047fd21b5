//! Spectrum stream decoder.
//!
//! The bulk stream is a sequence of little-endian 32-bit words. Words whose
//! top byte is `0xFF` are code words carrying a 3-bit tag in bits 21-23 and a
//! payload in the low 21 bits; all other words are raw sample bytes.
//!
//! A spectrum on the wire:
//!
//! ```text
//! FF FF FF FF FF FF FF FF          sync marker
//! [BEGIN | index]                  header word 1
//! [BEGIN | declared_words]         header word 2
//! ... TIME_LOW, TIME_HIGH, PROTOCOL, ION_COUNT + 3 words ...
//! [DATA_16BIT | start index]  low                  (4 samples per group)
//! [DATA_24BIT | start index]  mid  low             (4 samples per group)
//! [END | declared_words]
//! ```
//!
//! Byte `j` of the tag word is the high byte of sample `j`; byte `j` of each
//! following word supplies the next lower byte. A raw word anywhere else is
//! out of place.
//!
//! `declared_words` counts every word from the first header word through the
//! END word. Any inconsistency sends the decoder back to hunting for the sync
//! marker; those recoveries are logged and counted, never returned as errors.

use std::fmt::Display;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::buffer::DataBuffer;
use crate::errors::{DriverError, Result};
use crate::transport::Transport;

pub const CODE_MARK: u32 = 0xff00_0000;
pub const TAG_MASK: u32 = 0x00e0_0000;
pub const TAG_SHIFT: u32 = 21;
pub const PAYLOAD_MASK: u32 = 0x001f_ffff;
/// Payload bits that are all set in a sync word.
pub const SYNC_PAYLOAD_MASK: u32 = 0x0000_ffff;
/// Half of the sync marker, as seen when read as a word.
pub const SYNC_WORD: u32 = 0xffff_ffff;

const SYNC_RUN: u32 = 8;
const HEADER_WORDS: i64 = 2;
const MAX_HEADER_SYNC_WORDS: u32 = 4;
const WATCHDOG_POLL_BYTES: u64 = 0x10000;
const ION_OVERLOAD_BIT: u32 = 0x0000_8000;
const ION_UNDERLOAD_BIT: u32 = 0x8000_0000;

// ============================================================================
// Code words
// ============================================================================

/// Classification of a stream word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeType {
    Data16Bit,
    Data24Bit,
    DataStick,
    /// Tag 3: spectrum begin in the header, spectrum end in the body.
    SpectrumMark,
    TimeLow,
    TimeHigh,
    Protocol,
    /// Tag 7 without a sync payload.
    IonCount,
    /// Tag 7 with a sync payload.
    Sync,
    NotCode,
}

impl CodeType {
    /// Map a 3-bit tag to its code type. Tag 7 resolves to `IonCount`; callers
    /// that care about sync words go through [`classify`].
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(CodeType::Data16Bit),
            1 => Some(CodeType::Data24Bit),
            2 => Some(CodeType::DataStick),
            3 => Some(CodeType::SpectrumMark),
            4 => Some(CodeType::TimeLow),
            5 => Some(CodeType::TimeHigh),
            6 => Some(CodeType::Protocol),
            7 => Some(CodeType::IonCount),
            _ => None,
        }
    }

    /// Tag bits for code types that appear on the wire.
    pub fn tag(self) -> Option<u32> {
        match self {
            CodeType::Data16Bit => Some(0),
            CodeType::Data24Bit => Some(1),
            CodeType::DataStick => Some(2),
            CodeType::SpectrumMark => Some(3),
            CodeType::TimeLow => Some(4),
            CodeType::TimeHigh => Some(5),
            CodeType::Protocol => Some(6),
            CodeType::IonCount | CodeType::Sync => Some(7),
            CodeType::NotCode => None,
        }
    }
}

/// Classify a stream word.
pub fn classify(word: u32) -> Result<CodeType> {
    if word & CODE_MARK != CODE_MARK {
        return Ok(CodeType::NotCode);
    }
    let tag = (word & TAG_MASK) >> TAG_SHIFT;
    match CodeType::from_tag(tag) {
        Some(CodeType::IonCount) if word & SYNC_PAYLOAD_MASK == SYNC_PAYLOAD_MASK => {
            Ok(CodeType::Sync)
        }
        Some(code) => Ok(code),
        None => Err(DriverError::Protocol(format!("unknown code type 0x{:x}", tag))),
    }
}

/// Build a code word from a type and payload.
pub fn code_word(code: CodeType, payload: u32) -> Option<u32> {
    code.tag()
        .map(|tag| CODE_MARK | (tag << TAG_SHIFT) | (payload & PAYLOAD_MASK))
}

// ============================================================================
// Decoded data
// ============================================================================

/// Ion count block reported alongside a spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IonCount {
    pub count: u32,
    pub overload: bool,
    pub underload: bool,
    pub words: [u32; 3],
}

/// One decoded spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub index: u32,
    /// Sample sums, as long as the requested length.
    pub samples: Vec<u32>,
    /// One past the highest sample written.
    pub length: usize,
    pub declared_words: u32,
    /// Protocol slot that produced the spectrum, when reported. The raw
    /// payload is kept; it is not guaranteed to name a valid slot.
    pub protocol: Option<u32>,
    pub timestamp: Option<u64>,
    pub ion_count: Option<IonCount>,
}

/// Deadline for a whole sweep.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    deadline: Instant,
    limit: Duration,
}

impl Watchdog {
    pub fn start(limit: Duration) -> Self {
        Self {
            deadline: Instant::now() + limit,
            limit,
        }
    }

    pub fn check(&self) -> Result<()> {
        if Instant::now() > self.deadline {
            return Err(DriverError::Watchdog(self.limit));
        }
        Ok(())
    }
}

/// Why the decoder lost confidence in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Desync {
    BadHeader(u32),
    IndexOutOfRange { index: usize, length: usize },
    Overrun { cursor: usize, length: usize },
    OrphanData(u32),
    CountMismatch { declared: u32, trailing: u32 },
    ByteCountMismatch { expected: i64, consumed: i64 },
    StickData,
    StraySync(u32),
}

impl Display for Desync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Desync::BadHeader(w) => write!(f, "bad header word 0x{:08x}", w),
            Desync::IndexOutOfRange { index, length } => {
                write!(f, "data index {} outside trace of {} points", index, length)
            }
            Desync::Overrun { cursor, length } => {
                write!(f, "data at {} overruns trace of {} points", cursor, length)
            }
            Desync::OrphanData(w) => write!(f, "data word 0x{:08x} without data code", w),
            Desync::CountMismatch { declared, trailing } => write!(
                f,
                "trailing word count {} does not match header {}",
                trailing, declared
            ),
            Desync::ByteCountMismatch { expected, consumed } => write!(
                f,
                "consumed {} bytes for a spectrum of {} bytes",
                consumed, expected
            ),
            Desync::StickData => write!(f, "stick data is not supported"),
            Desync::StraySync(w) => write!(f, "out-of-phase sync word 0x{:08x}", w),
        }
    }
}

enum State {
    Synchronizing,
    Header,
    Streaming { index: u32, declared: u32 },
}

enum Body {
    Done(Spectrum),
    Restart,
    Lost(Desync),
}

// ============================================================================
// Decoder
// ============================================================================

/// Reassembles spectra from the bulk stream, resynchronizing as needed.
pub struct SpectrumDecoder {
    buffer: DataBuffer,
    aligned: bool,
    resyncs: u64,
}

impl SpectrumDecoder {
    pub fn new(buffer: DataBuffer) -> Self {
        Self {
            buffer,
            aligned: false,
            resyncs: 0,
        }
    }

    /// Forget the stream position; the next spectrum starts with a sync hunt.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.aligned = false;
    }

    /// Number of recoveries since the decoder was created.
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// Consume bytes until eight consecutive `0xFF` bytes have been seen.
    ///
    /// The byte after the marker is pushed back unless it is itself `0xFF`,
    /// which is taken to be left over from an earlier command.
    pub fn synchronize(
        &mut self,
        transport: &mut dyn Transport,
        watchdog: Option<&Watchdog>,
    ) -> Result<()> {
        let mut run = 0;
        let mut scanned: u64 = 0;
        loop {
            let byte = self.buffer.take_byte(transport, -1)?;
            scanned += 1;
            if scanned % WATCHDOG_POLL_BYTES == 0 {
                if let Some(w) = watchdog {
                    w.check()?;
                }
            }
            if byte != 0xff {
                run = 0;
                continue;
            }
            run += 1;
            if run == SYNC_RUN {
                let next = self.buffer.take_byte(transport, -1)?;
                if next != 0xff {
                    self.buffer.pushback(next);
                }
                trace!("sync marker found after {} bytes", scanned);
                return Ok(());
            }
        }
    }

    /// Assemble one little-endian word.
    pub fn read_word(&mut self, transport: &mut dyn Transport, target: i64) -> Result<u32> {
        let mut bytes = [0u8; 4];
        for b in bytes.iter_mut() {
            *b = self.buffer.take_byte(transport, target)?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// Decode the next spectrum into `length` samples.
    ///
    /// Only transport failures and watchdog expiry are returned as errors.
    pub fn next_spectrum(
        &mut self,
        transport: &mut dyn Transport,
        length: usize,
        watchdog: Option<&Watchdog>,
    ) -> Result<Spectrum> {
        let mut state = if self.aligned {
            State::Header
        } else {
            State::Synchronizing
        };

        loop {
            state = match state {
                State::Synchronizing => {
                    if let Some(w) = watchdog {
                        w.check()?;
                    }
                    self.synchronize(transport, watchdog)?;
                    State::Header
                }
                State::Header => match self.decode_header(transport)? {
                    Ok((index, declared)) => {
                        self.buffer.reset_count();
                        State::Streaming { index, declared }
                    }
                    Err(reason) => self.resync(reason),
                },
                State::Streaming { index, declared } => {
                    match self.decode_body(transport, index, declared, length)? {
                        Body::Done(spectrum) => {
                            self.aligned = true;
                            return Ok(spectrum);
                        }
                        Body::Restart => {
                            debug!("sync marker inside spectrum {}, restarting header", index);
                            State::Header
                        }
                        Body::Lost(reason) => self.resync(reason),
                    }
                }
            };
        }
    }

    fn resync(&mut self, reason: Desync) -> State {
        warn!("lost spectrum stream: {}; resynchronizing", reason);
        self.resyncs += 1;
        self.reset();
        State::Synchronizing
    }

    /// Read the two header words, skipping any sync words in front of them.
    fn decode_header(
        &mut self,
        transport: &mut dyn Transport,
    ) -> Result<std::result::Result<(u32, u32), Desync>> {
        let mut skipped = 0;
        let first = loop {
            let word = self.read_word(transport, -1)?;
            if word != SYNC_WORD {
                break word;
            }
            skipped += 1;
            if skipped > MAX_HEADER_SYNC_WORDS {
                return Ok(Err(Desync::BadHeader(word)));
            }
        };
        if !matches!(classify(first), Ok(CodeType::SpectrumMark)) {
            return Ok(Err(Desync::BadHeader(first)));
        }
        let second = self.read_word(transport, -1)?;
        if !matches!(classify(second), Ok(CodeType::SpectrumMark)) {
            return Ok(Err(Desync::BadHeader(second)));
        }
        Ok(Ok((first & PAYLOAD_MASK, second & PAYLOAD_MASK)))
    }

    fn decode_body(
        &mut self,
        transport: &mut dyn Transport,
        index: u32,
        declared: u32,
        length: usize,
    ) -> Result<Body> {
        let target = declared as i64 * 4 - HEADER_WORDS * 4;
        let mut samples = vec![0u32; length];
        let mut cursor = 0usize;
        let mut extent = 0usize;
        let mut protocol = None;
        let mut time_low: Option<u32> = None;
        let mut time_high: Option<u32> = None;
        let mut ion_count = None;

        loop {
            let word = self.read_word(transport, target)?;
            let code = match classify(word) {
                Ok(code) => code,
                Err(e) => {
                    warn!("{} in spectrum {}; skipping word", e, index);
                    continue;
                }
            };
            trace!("word 0x{:08x} -> {:?}", word, code);

            match code {
                CodeType::Data16Bit | CodeType::Data24Bit => {
                    let at = (word & PAYLOAD_MASK) as usize;
                    if at != cursor {
                        if at > length {
                            return Ok(Body::Lost(Desync::IndexOutOfRange { index: at, length }));
                        }
                        debug!("data index jump {} -> {}", cursor, at);
                        cursor = at;
                    }
                    if cursor + 4 > length {
                        return Ok(Body::Lost(Desync::Overrun { cursor, length }));
                    }
                    // high bytes from the tag word, lower bytes from the words after it
                    let extra = if code == CodeType::Data16Bit { 1 } else { 2 };
                    let mut group = word.to_le_bytes().map(u32::from);
                    for _ in 0..extra {
                        let low = self.read_word(transport, target)?.to_le_bytes();
                        for (sample, byte) in group.iter_mut().zip(low) {
                            *sample = (*sample << 8) | u32::from(byte);
                        }
                    }
                    samples[cursor..cursor + 4].copy_from_slice(&group);
                    cursor += 4;
                    extent = extent.max(cursor);
                }
                CodeType::NotCode => return Ok(Body::Lost(Desync::OrphanData(word))),
                CodeType::SpectrumMark => {
                    let trailing = word & PAYLOAD_MASK;
                    if trailing != declared {
                        return Ok(Body::Lost(Desync::CountMismatch {
                            declared,
                            trailing,
                        }));
                    }
                    let consumed = HEADER_WORDS * 4 + self.buffer.consumed();
                    let expected = declared as i64 * 4;
                    if consumed != expected {
                        return Ok(Body::Lost(Desync::ByteCountMismatch { expected, consumed }));
                    }
                    let timestamp = match (time_high, time_low) {
                        (Some(high), Some(low)) => {
                            Some((u64::from(high) << TAG_SHIFT) | u64::from(low))
                        }
                        _ => None,
                    };
                    return Ok(Body::Done(Spectrum {
                        index,
                        samples,
                        length: extent,
                        declared_words: declared,
                        protocol,
                        timestamp,
                        ion_count,
                    }));
                }
                CodeType::DataStick => return Ok(Body::Lost(Desync::StickData)),
                CodeType::TimeLow => {
                    time_low = Some(word & PAYLOAD_MASK);
                }
                CodeType::TimeHigh => {
                    time_high = Some(word & PAYLOAD_MASK);
                }
                CodeType::Protocol => {
                    protocol = Some(word & PAYLOAD_MASK);
                }
                CodeType::IonCount => {
                    let mut words = [0u32; 3];
                    for w in words.iter_mut() {
                        *w = self.read_word(transport, target)?;
                    }
                    ion_count = Some(IonCount {
                        count: word & PAYLOAD_MASK,
                        overload: words[1] & ION_OVERLOAD_BIT != 0,
                        underload: words[1] & ION_UNDERLOAD_BIT != 0,
                        words,
                    });
                }
                CodeType::Sync => {
                    if word == SYNC_WORD {
                        return Ok(Body::Restart);
                    }
                    return Ok(Body::Lost(Desync::StraySync(word)));
                }
            }
        }
    }
}
