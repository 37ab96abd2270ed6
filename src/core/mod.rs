//! Core primitives: parameter types, FFT, ring buffer, windows,
//! resampling, and logging.

pub mod fft;
pub mod log;
pub mod resample;
pub mod ring_buffer;
pub mod types;
pub mod window;

pub use self::log::{Log, LogLevel, LogSink};
pub use types::*;
