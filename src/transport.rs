//! Transport abstraction over the instrument's USB interface.
//!
//! Everything above this module reaches hardware through the three primitive
//! operations of [`Transport`]; [`UsbTransport`] implements them over `rusb`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info};

use crate::errors::{DriverError, Result, TransportError};
use crate::hardware::{CONTROL_IN, CONTROL_OUT, FF2_PID, FF2_VID};

const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 1000;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 50;
const DEFAULT_BULK_TIMEOUT_MS: u64 = 1000;
const DEFAULT_WRITE_RETRIES: u32 = 3;
const DEFAULT_READ_RETRIES: u32 = 2;

/// Data phase of a control transfer. The direction bit of the request type
/// must agree with the variant.
pub enum ControlPayload<'a> {
    Out(&'a [u8]),
    In(&'a mut [u8]),
}

/// Primitive transfers every other component is built on.
pub trait Transport: Send {
    /// Write `data` to `endpoint`, returning the number of bytes written.
    fn write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError>;

    /// Read into `buf` from `endpoint`, returning the number of bytes read.
    fn read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError>;

    /// Issue a control transfer, returning the size of the data phase.
    fn control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        payload: ControlPayload<'_>,
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError>;
}

/// USB connection parameters and the retry policy for bulk transfers.
#[derive(Debug, Clone)]
pub struct UsbConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
    pub control_timeout: Duration,
    pub command_timeout: Duration,
    pub bulk_timeout: Duration,
    pub write_retries: u32,
    pub read_retries: u32,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vendor_id: FF2_VID,
            product_id: FF2_PID,
            interface: 0,
            control_timeout: Duration::from_millis(DEFAULT_CONTROL_TIMEOUT_MS),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            bulk_timeout: Duration::from_millis(DEFAULT_BULK_TIMEOUT_MS),
            write_retries: DEFAULT_WRITE_RETRIES,
            read_retries: DEFAULT_READ_RETRIES,
        }
    }
}

/// `rusb` backed transport for a claimed FastFlight-2 interface.
pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    interface: u8,
}

impl UsbTransport {
    /// Open the first device matching the configured VID/PID and claim its interface.
    pub fn open(config: &UsbConfig) -> Result<Self> {
        let context = rusb::Context::new().map_err(TransportError::from)?;
        let mut handle = rusb::UsbContext::open_device_with_vid_pid(
            &context,
            config.vendor_id,
            config.product_id,
        )
        .ok_or_else(|| {
            DriverError::NotReady(format!(
                "no device with VID 0x{:04x} PID 0x{:04x}",
                config.vendor_id, config.product_id
            ))
        })?;

        // Not every platform can report or detach kernel drivers.
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle
            .claim_interface(config.interface)
            .map_err(TransportError::from)?;
        for endpoint in [CONTROL_OUT, CONTROL_IN] {
            if let Err(e) = handle.clear_halt(endpoint) {
                debug!("clear_halt(0x{:02x}) failed: {}", endpoint, e);
            }
        }

        info!(
            "opened FastFlight-2 (VID 0x{:04x}, PID 0x{:04x}, interface {})",
            config.vendor_id, config.product_id, config.interface
        );
        Ok(Self {
            handle,
            interface: config.interface,
        })
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface);
    }
}

impl Transport for UsbTransport {
    fn write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        Ok(self.handle.write_bulk(endpoint, data, timeout)?)
    }

    fn read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        Ok(self.handle.read_bulk(endpoint, buf, timeout)?)
    }

    fn control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        payload: ControlPayload<'_>,
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        let n = match payload {
            ControlPayload::Out(data) => {
                self.handle
                    .write_control(request_type, request, value, index, data, timeout)?
            }
            ControlPayload::In(buf) => {
                self.handle
                    .read_control(request_type, request, value, index, buf, timeout)?
            }
        };
        Ok(n)
    }
}

/// A transport shared with another owner, e.g. a monitor holding the same
/// emulator the driver runs on.
impl<T: Transport> Transport for Arc<Mutex<T>> {
    fn write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        lock(self)?.write(endpoint, data, timeout)
    }

    fn read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        lock(self)?.read(endpoint, buf, timeout)
    }

    fn control(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        payload: ControlPayload<'_>,
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        lock(self)?.control(request_type, request, value, index, payload, timeout)
    }
}

fn lock<T>(shared: &Mutex<T>) -> std::result::Result<MutexGuard<'_, T>, TransportError> {
    shared
        .lock()
        .map_err(|_| TransportError::Other("shared transport lock poisoned".into()))
}

/// Scripted transport double shared by the unit tests.
#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::{ControlPayload, Transport};
    use crate::errors::TransportError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Write { endpoint: u8, data: Vec<u8> },
        ControlOut { request: u8, value: u16, data: Vec<u8> },
        ControlIn { request: u8, value: u16 },
    }

    /// Replays queued responses and records everything sent to it.
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub reads: VecDeque<std::result::Result<Vec<u8>, TransportError>>,
        pub control_reads: VecDeque<Vec<u8>>,
        pub sent: Vec<Sent>,
        pub read_sizes: Vec<usize>,
    }

    impl ScriptedTransport {
        pub fn queue_read(&mut self, bytes: &[u8]) {
            self.reads.push_back(Ok(bytes.to_vec()));
        }

        pub fn queue_timeout(&mut self) {
            self.reads.push_back(Err(TransportError::Timeout));
        }

        pub fn writes_to(&self, endpoint: u8) -> Vec<Vec<u8>> {
            self.sent
                .iter()
                .filter_map(|s| match s {
                    Sent::Write { endpoint: e, data } if *e == endpoint => Some(data.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl Transport for ScriptedTransport {
        fn write(
            &mut self,
            endpoint: u8,
            data: &[u8],
            _timeout: Duration,
        ) -> std::result::Result<usize, TransportError> {
            self.sent.push(Sent::Write {
                endpoint,
                data: data.to_vec(),
            });
            Ok(data.len())
        }

        fn read(
            &mut self,
            _endpoint: u8,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> std::result::Result<usize, TransportError> {
            self.read_sizes.push(buf.len());
            match self.reads.pop_front() {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.reads.push_front(Ok(bytes[n..].to_vec()));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(TransportError::Timeout),
            }
        }

        fn control(
            &mut self,
            _request_type: u8,
            request: u8,
            value: u16,
            _index: u16,
            payload: ControlPayload<'_>,
            _timeout: Duration,
        ) -> std::result::Result<usize, TransportError> {
            match payload {
                ControlPayload::Out(data) => {
                    self.sent.push(Sent::ControlOut {
                        request,
                        value,
                        data: data.to_vec(),
                    });
                    Ok(data.len())
                }
                ControlPayload::In(buf) => {
                    self.sent.push(Sent::ControlIn { request, value });
                    let bytes = self.control_reads.pop_front().ok_or(TransportError::Timeout)?;
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
            }
        }
    }
}
