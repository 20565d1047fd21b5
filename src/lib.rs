//! FastFlight-2 time-of-flight digitizer driver with optional Python bindings.
//!
//! The crate talks to the instrument over USB through `rusb`, configures its
//! protocol slots, and decodes the spectrum stream it returns into summed
//! sample traces.
//!
//! # Layers
//!
//! 1. [`Transport`]: bulk and control transfers ([`UsbTransport`], or the
//!    in-memory [`Emulator`]).
//! 2. [`RegisterAccess`]: one-byte parameters and firmware memory.
//! 3. [`DataBuffer`] and [`SpectrumDecoder`]: framing, validation and
//!    recovery on the bulk stream.
//! 4. [`FastFlight`]: settings, triggers, protocol slots and sweeps.
//!
//! # Record counts
//!
//! The device sums at most 65535 records per spectrum. Sweeps beyond that are
//! split across protocol slots and added up on the host; see
//! [`FastFlight::take_sweep`].

pub mod buffer;
pub mod decoder;
pub mod emulator;
mod errors;
mod fastflight;
pub mod hardware;
pub mod logging;
pub mod registers;
pub mod settings;
pub mod transport;

pub use buffer::{fetch_bulk, DataBuffer};
pub use decoder::{classify, CodeType, IonCount, Spectrum, SpectrumDecoder, Watchdog};
pub use emulator::Emulator;
pub use errors::*;
pub use fastflight::{Accumulator, DitherConfig, FastFlight, Sweep};
pub use registers::RegisterAccess;
pub use settings::{AcquisitionSettings, Compression, EncodedSettings, Sensitivity, TimePerPoint};
pub use transport::{ControlPayload, Transport, UsbConfig, UsbTransport};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::time::Duration;

    use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    use crate::{DitherConfig, DriverError, Emulator, FastFlight, Sweep, UsbConfig};

    fn to_py_err(e: DriverError) -> PyErr {
        match e {
            DriverError::Transport(_) | DriverError::ShortTransfer { .. } => {
                PyIOError::new_err(e.to_string())
            }
            DriverError::Watchdog(_) => PyTimeoutError::new_err(e.to_string()),
            DriverError::InvalidArgument(_) | DriverError::CalibrationShape { .. } => {
                PyValueError::new_err(e.to_string())
            }
            _ => PyRuntimeError::new_err(e.to_string()),
        }
    }

    /// Summed result of one sweep.
    ///
    /// Attributes:
    ///     length: Trace length reported by the device, in points.
    ///     samples: Summed counts per point, background-corrected.
    ///     records: Records actually summed.
    ///     spectra: Device spectra that made up the sweep.
    #[pyclass(name = "Sweep", frozen)]
    #[derive(Clone)]
    struct PySweep {
        #[pyo3(get)]
        length: usize,
        #[pyo3(get)]
        samples: Vec<f64>,
        #[pyo3(get)]
        records: u64,
        #[pyo3(get)]
        spectra: usize,
    }

    #[pymethods]
    impl PySweep {
        fn __repr__(&self) -> String {
            format!(
                "Sweep(length={}, records={}, spectra={})",
                self.length, self.records, self.spectra
            )
        }

        fn __len__(&self) -> usize {
            self.samples.len()
        }

        fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
            let dict = PyDict::new(py);
            dict.set_item("length", self.length)?;
            dict.set_item("samples", self.samples.clone())?;
            dict.set_item("records", self.records)?;
            dict.set_item("spectra", self.spectra)?;
            Ok(dict)
        }
    }

    impl From<Sweep> for PySweep {
        fn from(s: Sweep) -> Self {
            PySweep {
                length: s.length,
                samples: s.samples,
                records: s.records,
                spectra: s.spectra,
            }
        }
    }

    /// FastFlight-2 digitizer.
    ///
    /// Example:
    ///     >>> ff = FastFlight()
    ///     >>> ff.time_per_point = 0.5
    ///     >>> ff.trace_length = 20000.0
    ///     >>> sweep = ff.take_sweep(ff.length, 100000)
    ///     >>> vscale, voffset, tscale = ff.scale()
    #[pyclass(name = "FastFlight", unsendable)]
    struct PyFastFlight {
        inner: FastFlight,
    }

    #[pymethods]
    impl PyFastFlight {
        /// Open the first FastFlight-2 on the USB bus.
        #[new]
        #[pyo3(signature = (vid=None, pid=None))]
        fn new(vid: Option<u16>, pid: Option<u16>) -> PyResult<Self> {
            let defaults = UsbConfig::default();
            let config = UsbConfig {
                vendor_id: vid.unwrap_or(defaults.vendor_id),
                product_id: pid.unwrap_or(defaults.product_id),
                ..defaults
            };
            FastFlight::open(&config)
                .map(|inner| PyFastFlight { inner })
                .map_err(to_py_err)
        }

        /// Driver backed by the in-memory instrument, for use without hardware.
        #[staticmethod]
        fn emulated() -> Self {
            PyFastFlight {
                inner: FastFlight::from_transport(Emulator::default(), UsbConfig::default()),
            }
        }

        /// Acquire and sum `records` records of `length` points.
        ///
        /// Raises:
        ///     TimeoutError: If the sweep timeout expires.
        ///     ValueError: If the background calibration is shorter than `length`.
        fn take_sweep(&mut self, length: usize, records: u32) -> PyResult<PySweep> {
            self.inner
                .take_sweep(length, records)
                .map(PySweep::from)
                .map_err(to_py_err)
        }

        fn start_acquisition(&mut self) -> PyResult<()> {
            self.inner.start_acquisition().map_err(to_py_err)
        }

        fn stop_acquisition(&mut self) -> PyResult<()> {
            self.inner.stop_acquisition().map_err(to_py_err)
        }

        fn clear_buffer(&mut self) -> PyResult<()> {
            self.inner.clear_buffer().map_err(to_py_err)
        }

        /// `(volts per count, volt offset, seconds per point)`.
        fn scale(&self) -> (f64, f64, f64) {
            self.inner.scale()
        }

        #[getter]
        fn get_time_per_point(&self) -> f64 {
            self.inner.time_per_point()
        }

        #[setter]
        fn set_time_per_point(&mut self, ns: f64) {
            self.inner.set_time_per_point(ns);
        }

        #[getter]
        fn get_trace_length(&self) -> f64 {
            self.inner.trace_length()
        }

        #[setter]
        fn set_trace_length(&mut self, ns: f64) {
            self.inner.set_trace_length(ns);
        }

        #[getter]
        fn get_length(&self) -> usize {
            self.inner.length()
        }

        #[setter]
        fn set_length(&mut self, points: usize) {
            self.inner.set_length(points);
        }

        #[getter]
        fn get_offset(&self) -> f64 {
            self.inner.offset()
        }

        #[setter]
        fn set_offset(&mut self, volts: f64) {
            self.inner.set_offset(volts);
        }

        #[getter]
        fn get_trigger_threshold(&self) -> f64 {
            self.inner.trigger_threshold()
        }

        #[setter]
        fn set_trigger_threshold(&mut self, volts: f64) -> PyResult<()> {
            self.inner.set_trigger_threshold(volts).map_err(to_py_err)
        }

        fn set_external_trigger(&mut self, state: bool) -> PyResult<()> {
            self.inner.set_external_trigger(state).map_err(to_py_err)
        }

        fn set_trigger_rising(&mut self, rising: bool) -> PyResult<()> {
            self.inner.set_trigger_rising(rising).map_err(to_py_err)
        }

        fn set_trigger_enable_high(&mut self, high: bool) -> PyResult<()> {
            self.inner.set_trigger_enable_high(high).map_err(to_py_err)
        }

        fn reset_timer(&mut self) -> PyResult<()> {
            self.inner.reset_timer().map_err(to_py_err)
        }

        /// Enable voltage dithering for sweeps above 65535 records.
        #[pyo3(signature = (enabled=true, span=0.004, slots=7))]
        fn set_dither(&mut self, enabled: bool, span: f64, slots: usize) {
            self.inner.set_dither(DitherConfig {
                enabled,
                span,
                slots,
            });
        }

        /// Bound every sweep to `seconds`; `None` waits indefinitely.
        #[pyo3(signature = (seconds=None))]
        fn set_sweep_timeout(&mut self, seconds: Option<f64>) -> PyResult<()> {
            let timeout = seconds
                .map(|s| {
                    Duration::try_from_secs_f64(s)
                        .map_err(|e| PyValueError::new_err(e.to_string()))
                })
                .transpose()?;
            self.inner.set_sweep_timeout(timeout);
            Ok(())
        }

        /// Background trace in volts, subtracted from every later sweep.
        fn set_background_calibration(&mut self, calibration: Vec<f64>) {
            self.inner.set_background_calibration(calibration);
        }

        fn clear_background_calibration(&mut self) {
            self.inner.clear_background_calibration();
        }

        #[getter]
        fn resync_count(&self) -> u64 {
            self.inner.resync_count()
        }

        #[getter]
        fn last_protocol(&self) -> Option<u8> {
            self.inner.last_protocol()
        }

        fn __repr__(&self) -> String {
            format!(
                "FastFlight(tpp={}ns, length={}, offset={:.4}V)",
                self.inner.time_per_point(),
                self.inner.length(),
                self.inner.offset()
            )
        }
    }

    /// Send Rust log records to Python's `logging` module.
    #[pyfunction]
    fn init_logging(py: Python<'_>) -> PyResult<()> {
        crate::logging::init_python_logging(py)
    }

    /// Change the bridge level (`"debug"`, `"info"`, ...).
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        crate::logging::set_python_log_level_str(py, level)
    }

    /// Extension module; its name matches the library so the built file imports as `fastflight`.
    #[pymodule]
    #[pyo3(name = "fastflight")]
    fn fastflight_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_class::<PyFastFlight>()?;
        m.add_class::<PySweep>()?;
        m.add_function(wrap_pyfunction!(init_logging, m)?)?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

        m.add("CHUNK_SIZE", crate::hardware::CHUNK_SIZE)?;
        m.add("VOLTS_PER_COUNT", crate::hardware::VOLTS_PER_COUNT)?;
        m.add("TIME_PER_POINT_NS", vec![0.25f64, 0.5, 1.0, 2.0])?;
        Ok(())
    }
}
