//! One-byte parameter and memory access on top of any [`Transport`].
//!
//! Parameters go through the command endpoints as `{SET, index, value}` /
//! `{GET, index}` followed by a single response byte. Memory is reached with
//! vendor control transfers addressed by the `value` field.

use std::time::Duration;

use log::{debug, warn};

use crate::errors::{DriverError, Result, TransportError};
use crate::hardware::*;
use crate::transport::{ControlPayload, Transport};

const REGISTER_TIMEOUT: Duration = Duration::from_millis(1000);
const PARAMETER_READ_RETRIES: u32 = 2;

/// Register access available on every transport.
pub trait RegisterAccess: Transport {
    /// Send a command on the control endpoint and read the single response byte.
    fn command(&mut self, cmd: &[u8]) -> Result<u8> {
        self.write(CONTROL_OUT, cmd, REGISTER_TIMEOUT)?;
        let mut response = [0u8; 1];
        let n = self.read(CONTROL_IN, &mut response, REGISTER_TIMEOUT)?;
        if n != 1 {
            return Err(DriverError::ShortTransfer {
                expected: 1,
                actual: n,
            });
        }
        Ok(response[0])
    }

    /// Set a parameter. Returns true when the device acknowledges with 1.
    fn set_parameter(&mut self, index: u8, value: u8) -> bool {
        match self.command(&[SET_CMD, index, value]) {
            Ok(response) => {
                if response > 1 {
                    warn!(
                        "never-before-seen response code 0x{:02x} setting parameter 0x{:02x} to 0x{:02x}",
                        response, index, value
                    );
                }
                response == 1
            }
            Err(e) => {
                warn!("set_parameter(0x{:02x}, 0x{:02x}) failed: {}", index, value, e);
                false
            }
        }
    }

    /// Read a parameter, retrying on timeout.
    fn get_parameter(&mut self, index: u8) -> Result<u8> {
        let mut attempt = 0;
        loop {
            match self.command(&[GET_CMD, index]) {
                Ok(value) => return Ok(value),
                Err(DriverError::Transport(TransportError::Timeout))
                    if attempt < PARAMETER_READ_RETRIES =>
                {
                    attempt += 1;
                    warn!("retry {} reading parameter 0x{:02x}", attempt, index);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write one byte of firmware memory. Returns true when one byte was accepted.
    fn set_memory(&mut self, address: u16, value: u8) -> bool {
        match self.control(
            REQ_TYPE_VENDOR_OUT,
            MEMORY_REQUEST,
            address,
            0,
            ControlPayload::Out(&[value]),
            REGISTER_TIMEOUT,
        ) {
            Ok(n) => n == 1,
            Err(e) => {
                warn!("set_memory(0x{:04x}, 0x{:02x}) failed: {}", address, value, e);
                false
            }
        }
    }

    fn get_memory(&mut self, address: u16) -> Result<u8> {
        let mut buf = [0u8; 1];
        let n = self.control(
            REQ_TYPE_VENDOR_IN,
            MEMORY_REQUEST,
            address,
            0,
            ControlPayload::In(&mut buf),
            REGISTER_TIMEOUT,
        )?;
        if n != 1 {
            return Err(DriverError::ShortTransfer {
                expected: 1,
                actual: n,
            });
        }
        Ok(buf[0])
    }

    /// Write a contiguous block of firmware memory in one transfer.
    fn write_memory_block(&mut self, address: u16, data: &[u8]) -> Result<()> {
        let n = self.control(
            REQ_TYPE_VENDOR_OUT,
            MEMORY_REQUEST,
            address,
            0,
            ControlPayload::Out(data),
            REGISTER_TIMEOUT,
        )?;
        if n != data.len() {
            return Err(DriverError::ShortTransfer {
                expected: data.len(),
                actual: n,
            });
        }
        debug!("wrote {} bytes at 0x{:04x}", n, address);
        Ok(())
    }

    /// Set or clear `mask` in a parameter, writing only when the value changes.
    fn update_parameter_bits(&mut self, index: u8, mask: u8, state: bool) -> Result<()> {
        let current = self.get_parameter(index)?;
        let next = if state { current | mask } else { current & !mask };
        if next != current && !self.set_parameter(index, next) {
            return Err(DriverError::Protocol(format!(
                "parameter 0x{:02x} rejected value 0x{:02x}",
                index, next
            )));
        }
        Ok(())
    }

    /// Set or clear `mask` at a memory address, writing only when the value changes.
    fn update_memory_bits(&mut self, address: u16, mask: u8, state: bool) -> Result<()> {
        let current = self.get_memory(address)?;
        let next = if state { current | mask } else { current & !mask };
        if next != current && !self.set_memory(address, next) {
            return Err(DriverError::Protocol(format!(
                "memory 0x{:04x} rejected value 0x{:02x}",
                address, next
            )));
        }
        Ok(())
    }

    fn set_external_trigger(&mut self, state: bool) -> Result<()> {
        self.update_memory_bits(MISC_CNTRL_PTR, EXT_TRIGGER_MASK, state)
    }

    fn external_trigger(&mut self) -> Result<bool> {
        Ok(self.get_memory(MISC_CNTRL_PTR)? & EXT_TRIGGER_MASK != 0)
    }

    fn set_trigger_enable_high(&mut self, high: bool) -> Result<()> {
        self.update_parameter_bits(TRIGGER_PARAMETER, TRIGGER_POLARITY_MASK, high)
    }

    fn trigger_enable_high(&mut self) -> Result<bool> {
        Ok(self.get_parameter(TRIGGER_PARAMETER)? & TRIGGER_POLARITY_MASK != 0)
    }

    fn set_trigger_rising(&mut self, rising: bool) -> Result<()> {
        self.update_parameter_bits(TRIGGER_PARAMETER, TRIGGER_RISING_MASK, rising)
    }

    fn trigger_rising(&mut self) -> Result<bool> {
        Ok(self.get_parameter(TRIGGER_PARAMETER)? & TRIGGER_RISING_MASK != 0)
    }

    fn set_rapid_protocol_selection(&mut self, state: bool) -> Result<()> {
        self.update_memory_bits(MISC_CNTRL_PTR, RAPID_PROTOCOL_MASK, state)
    }

    fn rapid_protocol_selection(&mut self) -> Result<bool> {
        Ok(self.get_memory(MISC_CNTRL_PTR)? & RAPID_PROTOCOL_MASK != 0)
    }

    /// Pulse the timer-reset bit.
    fn reset_timer(&mut self) -> Result<()> {
        let m = self.get_memory(MISC_CNTRL_PTR)?;
        self.set_memory(MISC_CNTRL_PTR, m | TIMER_RESET_MASK);
        self.set_memory(MISC_CNTRL_PTR, m & !TIMER_RESET_MASK);
        Ok(())
    }
}

impl<T: Transport + ?Sized> RegisterAccess for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{ScriptedTransport, Sent};

    #[test]
    fn set_parameter_accepts_only_one() {
        let mut t = ScriptedTransport::default();
        t.queue_read(&[1]);
        t.queue_read(&[0]);
        t.queue_read(&[7]);
        assert!(t.set_parameter(0x05, 0xd0));
        assert!(!t.set_parameter(0x05, 0xd0));
        assert!(!t.set_parameter(0x05, 0xd0));
        assert_eq!(t.writes_to(CONTROL_OUT)[0], vec![SET_CMD, 0x05, 0xd0]);
    }

    #[test]
    fn set_parameter_transport_failure_is_false() {
        let mut t = ScriptedTransport::default();
        assert!(!t.set_parameter(0x05, 0xd0));
    }

    #[test]
    fn get_parameter_retries_timeouts() {
        let mut t = ScriptedTransport::default();
        t.queue_timeout();
        t.queue_read(&[0x42]);
        assert_eq!(t.get_parameter(0x10).unwrap(), 0x42);
        assert_eq!(t.writes_to(CONTROL_OUT).len(), 2);

        let mut t = ScriptedTransport::default();
        assert!(matches!(
            t.get_parameter(0x10),
            Err(DriverError::Transport(TransportError::Timeout))
        ));
        assert_eq!(t.writes_to(CONTROL_OUT).len(), 3);
    }

    #[test]
    fn memory_round_trip_uses_vendor_request() {
        let mut t = ScriptedTransport::default();
        t.control_reads.push_back(vec![0x5a]);
        assert!(t.set_memory(0xa1fc, 0x10));
        assert_eq!(t.get_memory(0xa1fd).unwrap(), 0x5a);
        assert_eq!(
            t.sent,
            vec![
                Sent::ControlOut {
                    request: MEMORY_REQUEST,
                    value: 0xa1fc,
                    data: vec![0x10]
                },
                Sent::ControlIn {
                    request: MEMORY_REQUEST,
                    value: 0xa1fd
                },
            ]
        );
    }

    #[test]
    fn flag_helpers_write_only_on_change() {
        let mut t = ScriptedTransport::default();
        t.control_reads.push_back(vec![EXT_TRIGGER_MASK]);
        t.set_external_trigger(true).unwrap();
        assert_eq!(t.sent.len(), 1);

        t.control_reads.push_back(vec![EXT_TRIGGER_MASK | RUN_MASK]);
        t.set_external_trigger(false).unwrap();
        assert_eq!(
            t.sent.last(),
            Some(&Sent::ControlOut {
                request: MEMORY_REQUEST,
                value: MISC_CNTRL_PTR,
                data: vec![RUN_MASK]
            })
        );
    }

    #[test]
    fn trigger_polarity_read_modify_write() {
        let mut t = ScriptedTransport::default();
        t.queue_read(&[TRIGGER_RISING_MASK]);
        t.queue_read(&[1]);
        t.set_trigger_enable_high(true).unwrap();
        let writes = t.writes_to(CONTROL_OUT);
        assert_eq!(
            writes[1],
            vec![
                SET_CMD,
                TRIGGER_PARAMETER,
                TRIGGER_RISING_MASK | TRIGGER_POLARITY_MASK
            ]
        );
    }
}
