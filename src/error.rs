//! Error types for the pitchstretch crate.

use std::fmt;

/// Errors that can occur while constructing a stretcher.
///
/// After construction the engine never fails across the API boundary;
/// misuse and degenerate parameters are reported through the log sink
/// and the offending call returns without effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StretchError {
    /// Sample rate was zero.
    InvalidSampleRate(u32),
    /// Channel count was zero.
    InvalidChannelCount(usize),
}

impl fmt::Display for StretchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StretchError::InvalidSampleRate(rate) => {
                write!(f, "invalid sample rate: {} Hz", rate)
            }
            StretchError::InvalidChannelCount(channels) => {
                write!(f, "invalid channel count: {}", channels)
            }
        }
    }
}

impl std::error::Error for StretchError {}
