//! Read-ahead buffer over the bulk spectrum stream.
//!
//! The decoder pulls one byte at a time; the buffer turns that into bulk
//! requests sized to what the decoder still expects to receive.

use log::{trace, warn};

use crate::errors::{Result, TransportError};
use crate::hardware::{BULK_START_CMD, MAX_BULK_SIZE, SPECTRA_IN, SPECTRA_OUT};
use crate::transport::{Transport, UsbConfig};

/// Request up to `buf.len()` bytes of spectrum data.
///
/// The bulk-start command is written first (partial writes are continued, a
/// timeout ends the attempt), then the read is retried on timeout. Returns
/// the number of bytes placed in `buf`, which is never zero.
pub fn fetch_bulk(
    transport: &mut dyn Transport,
    buf: &mut [u8],
    config: &UsbConfig,
) -> std::result::Result<usize, TransportError> {
    let mut off = 0;
    for _ in 0..config.write_retries {
        match transport.write(SPECTRA_OUT, &BULK_START_CMD[off..], config.command_timeout) {
            Ok(n) if n == BULK_START_CMD.len() - off => break,
            Ok(0) => break,
            Ok(n) => {
                warn!(
                    "incomplete command write ({}/{}), continuing",
                    n,
                    BULK_START_CMD.len()
                );
                off += n;
            }
            Err(TransportError::Timeout) => break,
            Err(e) => {
                warn!("error from bulk command write: {}", e);
                break;
            }
        }
    }

    for attempt in 0..=config.read_retries {
        if attempt != 0 {
            warn!("retry {} on bulk read", attempt);
        }
        match transport.read(SPECTRA_IN, buf, config.bulk_timeout) {
            Ok(0) | Err(TransportError::Timeout) => continue,
            Ok(n) => return Ok(n),
            Err(e) => return Err(e),
        }
    }
    Err(TransportError::Timeout)
}

/// Bounded byte window with one byte of pushback.
pub struct DataBuffer {
    data: Vec<u8>,
    index: usize,
    filled: usize,
    total_consumed: i64,
    pushback: Option<u8>,
    config: UsbConfig,
}

impl DataBuffer {
    pub fn new(config: UsbConfig) -> Self {
        Self::with_capacity(MAX_BULK_SIZE, config)
    }

    pub fn with_capacity(capacity: usize, config: UsbConfig) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)],
            index: 0,
            filled: 0,
            total_consumed: 0,
            pushback: None,
            config,
        }
    }

    /// Next byte of the stream.
    ///
    /// `target_total` is the consumed count the caller expects to reach; it
    /// sizes the bulk request when the buffer runs dry. Negative means unknown.
    pub fn take_byte(&mut self, transport: &mut dyn Transport, target_total: i64) -> Result<u8> {
        if let Some(byte) = self.pushback.take() {
            self.total_consumed += 1;
            return Ok(byte);
        }
        if self.index < self.filled {
            return Ok(self.advance());
        }

        self.index = 0;
        self.filled = 0;
        let capacity = self.data.len();
        let remaining = target_total - self.total_consumed;
        let to_take = if target_total < 0 || remaining <= 0 || remaining > capacity as i64 {
            capacity
        } else {
            remaining as usize
        };
        trace!("refilling data buffer with up to {} bytes", to_take);

        let n = fetch_bulk(transport, &mut self.data[..to_take], &self.config)?;
        self.filled = n;
        Ok(self.advance())
    }

    /// Return one byte to the stream; the next `take_byte` yields it.
    pub fn pushback(&mut self, byte: u8) {
        self.pushback = Some(byte);
        self.total_consumed -= 1;
    }

    /// Drop buffered data and pushback and zero the consumed counter.
    pub fn reset(&mut self) {
        self.index = 0;
        self.filled = 0;
        self.pushback = None;
        self.total_consumed = 0;
    }

    /// Zero the consumed counter, keeping buffered data.
    pub fn reset_count(&mut self) {
        self.total_consumed = 0;
    }

    /// Net bytes handed to the caller since the last reset.
    pub fn consumed(&self) -> i64 {
        self.total_consumed
    }

    /// Bytes available without touching the transport.
    pub fn buffered(&self) -> usize {
        self.filled - self.index + usize::from(self.pushback.is_some())
    }

    fn advance(&mut self) -> u8 {
        let byte = self.data[self.index];
        self.index += 1;
        self.total_consumed += 1;
        byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DriverError;
    use crate::transport::mock::ScriptedTransport;

    fn buffer(capacity: usize) -> DataBuffer {
        DataBuffer::with_capacity(capacity, UsbConfig::default())
    }

    #[test]
    fn pushback_is_returned_first_and_counted_once() {
        let mut t = ScriptedTransport::default();
        t.queue_read(&[1, 2, 3]);
        let mut db = buffer(16);

        assert_eq!(db.take_byte(&mut t, -1).unwrap(), 1);
        assert_eq!(db.take_byte(&mut t, -1).unwrap(), 2);
        assert_eq!(db.consumed(), 2);
        db.pushback(2);
        assert_eq!(db.consumed(), 1);
        assert_eq!(db.take_byte(&mut t, -1).unwrap(), 2);
        assert_eq!(db.take_byte(&mut t, -1).unwrap(), 3);
        assert_eq!(db.consumed(), 3);
    }

    #[test]
    fn refill_is_sized_to_target() {
        let mut t = ScriptedTransport::default();
        t.queue_read(&[0; 10]);
        t.queue_read(&[0; 10]);
        t.queue_read(&[0; 10]);
        let mut db = buffer(64);

        db.take_byte(&mut t, 10).unwrap();
        for _ in 0..9 {
            db.take_byte(&mut t, 10).unwrap();
        }
        // unknown target takes a whole chunk
        db.take_byte(&mut t, -1).unwrap();
        // target more than one chunk away also takes a whole chunk
        db.reset();
        db.take_byte(&mut t, 1000).unwrap();
        assert_eq!(t.read_sizes, vec![10, 64, 64]);
        assert_eq!(t.writes_to(SPECTRA_OUT), vec![BULK_START_CMD.to_vec(); 3]);
    }

    #[test]
    fn refill_gives_up_after_bounded_retries() {
        let mut t = ScriptedTransport::default();
        t.queue_timeout();
        t.queue_timeout();
        t.queue_timeout();
        t.queue_read(&[9]);
        let mut db = buffer(8);
        assert!(matches!(
            db.take_byte(&mut t, -1),
            Err(DriverError::Transport(TransportError::Timeout))
        ));
        assert_eq!(t.read_sizes.len(), 3);
        assert_eq!(db.take_byte(&mut t, -1).unwrap(), 9);
    }

    #[test]
    fn reset_drops_everything() {
        let mut t = ScriptedTransport::default();
        t.queue_read(&[1, 2, 3, 4]);
        t.queue_read(&[5]);
        let mut db = buffer(8);
        db.take_byte(&mut t, -1).unwrap();
        db.pushback(1);
        assert_eq!(db.buffered(), 4);
        db.reset();
        assert_eq!(db.buffered(), 0);
        assert_eq!(db.consumed(), 0);
        assert_eq!(db.take_byte(&mut t, -1).unwrap(), 5);
    }
}
