#![forbid(unsafe_code)]
//! Phase-vocoder audio time stretching and pitch shifting.
//!
//! `pitchstretch` changes the duration of multichannel PCM audio by a
//! time ratio and its pitch by a pitch scale, independently of one
//! another, with optional formant preservation. Analysis runs at three
//! FFT sizes at once, so tonal bass keeps its frequency resolution
//! while transients keep their timing; detected onsets are deferred and
//! re-injected on the correct frame rather than smeared.
//!
//! Two transports are supported: offline (study or declare the input
//! first, process, retrieve) and realtime (stream blocks in with
//! bounded latency, adjusting ratios on the fly from a control thread).
//!
//! # Offline
//!
//! ```no_run
//! use pitchstretch::{Parameters, Stretcher};
//!
//! let input: Vec<f32> = (0..48000)
//!     .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48000.0).sin())
//!     .collect();
//!
//! let mut stretcher = Stretcher::new(Parameters::new(48000, 1)).unwrap();
//! stretcher.set_time_ratio(1.5);
//! stretcher.set_expected_input_duration(input.len());
//! stretcher.process(&[&input], true);
//!
//! let mut output = Vec::new();
//! let mut block = vec![0.0f32; 4096];
//! while let Some(available) = stretcher.available() {
//!     let take = available.min(block.len());
//!     if take == 0 {
//!         break;
//!     }
//!     let got = stretcher.retrieve(&mut [&mut block[..take]]);
//!     output.extend_from_slice(&block[..got]);
//! }
//! ```
//!
//! # Realtime
//!
//! Build with [`TransportMode::RealTime`], feed fixed-size blocks, and
//! drop [`Stretcher::start_delay`] samples from the head of the output.
//! [`Stretcher::set_time_ratio`] and [`Stretcher::set_pitch_scale`]
//! take `&self` and store through lock-free atomics, so a control
//! thread can adjust them between blocks.

pub mod analysis;
pub mod core;
pub mod error;
pub mod stretch;

pub use crate::core::log::{Log, LogLevel, LogSink};
pub use crate::core::types::{
    ChannelOption, FormantOption, Options, Parameters, PitchOption, Sample, TransportMode,
};
pub use error::StretchError;
pub use stretch::Stretcher;
