//! Fixed FastFlight-2 hardware constants: endpoints, command bytes, memory
//! addresses and the bit masks of the control registers.

// ============================================================================
// USB identity and endpoints
// ============================================================================

pub const FF2_VID: u16 = 0x0a2d;
pub const FF2_PID: u16 = 0x0019;

/// Command channel (parameter get/set).
pub const CONTROL_OUT: u8 = 0x01;
pub const CONTROL_IN: u8 = 0x81;

/// Spectrum data channel.
pub const SPECTRA_OUT: u8 = 0x02;
pub const SPECTRA_IN: u8 = 0x86;

// ============================================================================
// Command bytes
// ============================================================================

pub const SET_CMD: u8 = 0x11;
pub const GET_CMD: u8 = 0x10;
pub const CLEAR_BUFFER_CMD: u8 = 0x12;

/// Bulk request issued on `SPECTRA_OUT` before every bulk read.
pub const BULK_START_CMD: [u8; 2] = [0xff, 0x03];

/// Vendor request used for firmware memory access (EZ-USB style).
pub const MEMORY_REQUEST: u8 = 0xa0;
pub const REQ_TYPE_VENDOR_OUT: u8 = 0x40;
pub const REQ_TYPE_VENDOR_IN: u8 = 0xc0;

// ============================================================================
// Parameters
// ============================================================================

pub const TRIGGER_PARAMETER: u8 = 0x08;
pub const TRIGGER_POLARITY_MASK: u8 = 0x01;
pub const TRIGGER_RISING_MASK: u8 = 0x02;

pub const TRIGGER_THRESHOLD_LOW_PARAMETER: u8 = 0x14;
pub const TRIGGER_THRESHOLD_HIGH_PARAMETER: u8 = 0x15;

pub const BUFFER_CONTROL_PARAMETER: u8 = 0x07;
pub const ACQUISITION_MODE_PARAMETER: u8 = 0x05;
pub const PROTOCOL_SELECT_PARAMETER: u8 = 0x06;

// ============================================================================
// Memory map
// ============================================================================

pub const MISC_CNTRL_PTR: u16 = 0xa1fd;
pub const EXT_TRIGGER_MASK: u8 = 0x01;
pub const RAPID_PROTOCOL_MASK: u8 = 0x02;
pub const TIMER_RESET_MASK: u8 = 0x04;
pub const UNKNOWN_START: u8 = 0x40;
pub const RUN_MASK: u8 = 0x80;

/// Acquisition arming sequence written before RUN is raised.
pub const START_SEQUENCE: [(u16, u8); 10] = [
    (0xa1fc, 0x00),
    (0xa1fc, 0x00),
    (0xa1fc, 0x10),
    (0xa1fc, 0x10),
    (0xa1fc, 0x00),
    (0xa1fc, 0x00),
    (0xa1fc, 0x50),
    (0xa1fb, 0x08),
    (0xa1fb, 0x18),
    (0xa1fe, 0x00),
];

/// Protocol slot `n` lives at `PROTOCOL_BASE + n * PROTOCOL_STEP`; its second
/// image starts `PROTOCOL_B2_OFFSET` bytes further.
pub const PROTOCOL_BASE: u16 = 0xa000;
pub const PROTOCOL_STEP: u16 = 0x20;
pub const PROTOCOL_B2_OFFSET: u16 = 0x0e;

// ============================================================================
// Limits
// ============================================================================

pub const MAX_PROTOCOL: usize = 8;
pub const MAX_BULK_SIZE: usize = 0x10000;

/// Most records the device sums into one reported spectrum.
pub const CHUNK_SIZE: u32 = 0xffff;

/// Volts per ADC count for a single record.
pub const VOLTS_PER_COUNT: f64 = 0.5 / 256.0;
