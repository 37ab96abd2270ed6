//! Severity-leveled logging for the processing path.
//!
//! The engine reports every non-fatal condition through a [`Log`] handle
//! rather than returning errors: severity 0 is a warning, 1 is
//! informational, 2 is trace-level detail. The default sink forwards to
//! the `log` crate facade; embedders with their own diagnostics can
//! install a custom [`LogSink`].

use std::sync::Arc;

/// Message severity. Lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Severity 0: warnings and recoverable errors.
    Warn,
    /// Severity 1: informational.
    Info,
    /// Severity 2: per-frame trace detail.
    Trace,
}

/// Destination for engine diagnostics.
///
/// Implementations should avoid blocking: messages can originate from the
/// processing thread. The engine only ever passes static message strings
/// and a short slice of numeric values, so a realtime-safe sink can defer
/// formatting entirely.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, values: &[f64]);
}

/// Default sink forwarding to the `log` crate facade.
#[derive(Debug, Default)]
pub struct FacadeSink;

impl LogSink for FacadeSink {
    fn log(&self, level: LogLevel, message: &str, values: &[f64]) {
        match level {
            LogLevel::Warn => log::warn!("{}: {:?}", message, values),
            LogLevel::Info => log::info!("{}: {:?}", message, values),
            LogLevel::Trace => log::trace!("{}: {:?}", message, values),
        }
    }
}

/// Cheap-to-clone handle to the installed sink.
#[derive(Clone)]
pub struct Log {
    sink: Arc<dyn LogSink>,
}

impl Log {
    /// Creates a log handle with the default facade sink.
    pub fn new() -> Self {
        Self {
            sink: Arc::new(FacadeSink),
        }
    }

    /// Creates a log handle with a custom sink.
    pub fn with_sink(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    #[inline]
    pub fn warn(&self, message: &str, values: &[f64]) {
        self.sink.log(LogLevel::Warn, message, values);
    }

    #[inline]
    pub fn info(&self, message: &str, values: &[f64]) {
        self.sink.log(LogLevel::Info, message, values);
    }

    #[inline]
    pub fn trace(&self, message: &str, values: &[f64]) {
        self.sink.log(LogLevel::Trace, message, values);
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log").finish_non_exhaustive()
    }
}
