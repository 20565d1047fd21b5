//! Log setup for the demo binary and, with the `python` feature, a bridge
//! that forwards `log` records into Python's `logging` module.
//!
//! The level comes from `FASTFLIGHT_LOG`, then `RUST_LOG`, then `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

const LEVEL_VAR: &str = "FASTFLIGHT_LOG";

/// Level requested by the environment.
pub fn env_level() -> LevelFilter {
    std::env::var(LEVEL_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| parse_level(Some(v)))
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Install the stderr logger. Later calls are no-ops.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(env_level().as_str().to_ascii_lowercase());
        // another logger may already be installed by an embedding application
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use python::{init_python_logging, reset_python_logging_cache, set_python_log_level_str};

#[cfg(feature = "python")]
mod python {
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::{PyAny, PyModule, PyTuple};

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Python logger per dotted target, with the most verbose level it accepts.
    type LoggerCache = HashMap<String, (LevelFilter, Py<PyAny>)>;

    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        cache: Mutex<LoggerCache>,
    }

    fn python_level(level: Level) -> usize {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
            let logging = py.import("logging")?;
            Ok(Self {
                top_filter: Mutex::new(top_filter),
                logging_mod: logging.into(),
                cache: Mutex::new(HashMap::new()),
            })
        }

        fn top(&self) -> LevelFilter {
            self.top_filter
                .lock()
                .map(|l| *l)
                .unwrap_or(LevelFilter::Info)
        }

        fn accepted_level(logger: &Bound<'_, PyAny>) -> PyResult<LevelFilter> {
            for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
                if logger
                    .call_method1("isEnabledFor", (python_level(level),))?
                    .is_truthy()?
                {
                    return Ok(level.to_level_filter());
                }
            }
            Ok(LevelFilter::Off)
        }

        /// Look up (and cache) the Python logger for `target`.
        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<(LevelFilter, Py<PyAny>)> {
            if let Ok(cache) = self.cache.lock() {
                if let Some((level, logger)) = cache.get(target) {
                    return Ok((*level, logger.clone_ref(py)));
                }
            }
            let logger = self
                .logging_mod
                .bind(py)
                .getattr("getLogger")?
                .call1((target,))?;
            let level = Self::accepted_level(&logger).unwrap_or(LevelFilter::Off);
            let logger = logger.unbind();
            if let Ok(mut cache) = self.cache.lock() {
                cache.insert(target.to_string(), (level, logger.clone_ref(py)));
            }
            Ok((level, logger))
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let (accepted, logger) = self.logger_for(py, &target)?;
            let level = record.level().to_level_filter();
            if level > accepted || level > self.top() {
                return Ok(());
            }

            let logger = logger.bind(py);
            let none = py.None();
            let entry = logger.call_method1(
                "makeRecord",
                (
                    &target,
                    python_level(record.level()),
                    record.file(),
                    record.line().unwrap_or_default(),
                    record.args().to_string(),
                    PyTuple::empty(py),
                    &none,
                    &none,
                    &none,
                ),
            )?;
            logger.call_method1("handle", (entry,))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.top()
        }

        fn log(&self, record: &Record) {
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust log records into Python's `logging`. Later calls are no-ops.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
            Ok(logger) => {
                let leaked: &'static PyLogger = Box::leak(Box::new(logger));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(leaked);
                }
            }
            Err(e) => e.restore(py),
        });
        Ok(())
    }

    /// Forget cached Python loggers, e.g. after reconfiguring `logging`.
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut cache) = logger.cache.lock() {
                cache.clear();
            }
        }
    }

    /// Set the bridge's level from a name such as `"debug"`; `None` re-reads
    /// the environment.
    pub fn set_python_log_level_str(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        init_python_logging(py)?;
        let level = parse_level(level).unwrap_or_else(env_level);
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut top) = logger.top_filter.lock() {
                *top = level;
            }
        }
        reset_python_logging_cache();
        log::set_max_level(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level(Some("debug")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some(" WARN ")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn init_is_idempotent() {
        init_rust_logging();
        init_rust_logging();
        log::info!("logging initialised twice");
    }
}
