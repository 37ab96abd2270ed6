//! Output-hop calculation.
//!
//! Two pieces: the hop-proposal curve that the scheduler uses to pick an
//! integer input hop from the effective ratio, and the per-frame
//! calculator that turns the input hop into this frame's output hop. The
//! calculator carries the fractional part of the ideal hop across frames
//! so the long-run mean output rate is exact, which is what keeps total
//! durations within a sample of the requested ratio.

use crate::core::log::Log;

/// Smallest and largest acceptable output hops.
pub const MIN_OUTPUT_HOP: f64 = 128.0;
pub const MAX_OUTPUT_HOP: f64 = 512.0;
/// Largest acceptable input hop.
pub const MAX_INPUT_HOP: f64 = 1024.0;

/// Proposes an output hop for the given effective ratio.
///
/// Around unity the target is 256: small enough to keep the 1024-bin
/// FFT's overlap viable, large enough for throughput. Far above unity
/// the hop grows toward 512; far below it shrinks toward 128.
pub fn proposed_output_hop(effective_ratio: f64) -> f64 {
    let proposed = if effective_ratio > 1.5 {
        2.0f64.powf(8.0 + 2.0 * (effective_ratio - 0.5).log10())
    } else if effective_ratio < 1.0 {
        2.0f64.powf(8.0 + 2.0 * effective_ratio.log10())
    } else {
        256.0
    };
    proposed.clamp(MIN_OUTPUT_HOP, MAX_OUTPUT_HOP)
}

/// Per-frame output-hop calculator (single-shot mode).
#[derive(Debug)]
pub struct StretchCalculator {
    log: Log,
    /// Fractional hop error carried to the next frame.
    fraction: f64,
}

impl StretchCalculator {
    pub fn new(log: Log) -> Self {
        Self { log, fraction: 0.0 }
    }

    /// Returns the output hop for one frame.
    ///
    /// `effective_pitch_ratio` is the resampler's achievable ratio (the
    /// reciprocal of the pitch scale, quantized); the output hop must
    /// account for it so that hop pacing and resampling together realise
    /// `time_ratio`. `phase_reset_strength` and `group_mode` belong to
    /// the segmenting mode of the calculator and are accepted but unused
    /// in single-shot operation.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_single(
        &mut self,
        time_ratio: f64,
        effective_pitch_ratio: f64,
        _phase_reset_strength: f64,
        inhop: usize,
        _fft_size: usize,
        _longest_fft: usize,
        _group_mode: bool,
    ) -> usize {
        let mut pitch_ratio = effective_pitch_ratio;
        if pitch_ratio <= 0.0 {
            self.log
                .warn("calculator: non-positive pitch ratio", &[pitch_ratio]);
            pitch_ratio = 1.0;
        }

        let ideal = inhop as f64 * time_ratio / pitch_ratio;
        let total = ideal + self.fraction;
        let out = total.floor();
        if out < 1.0 {
            self.log.warn("calculator: output hop below 1", &[total]);
            self.fraction = 0.0;
            return 1;
        }
        self.fraction = total - out;
        out as usize
    }

    /// Clears the fractional carry.
    pub fn reset(&mut self) {
        self.fraction = 0.0;
    }
}
