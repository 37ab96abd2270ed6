//! Guided phase advance for one FFT scale, synchronized across channels.
//!
//! Each bin's synthesis phase is advanced by its measured instantaneous
//! frequency over the hop distances actually used for the previous
//! frame, then pulled toward the phase rotation of the nearest spectral
//! peak with a per-band strength, reset outright where the guidance asks
//! for it, and finally locked across channels in the low band so stereo
//! bass does not drift apart.
//!
//! All working storage is allocated at construction; a frame is three
//! passes over that storage (per-channel advance, cross-channel lead
//! selection folded into the first pass, per-channel write-back) with no
//! allocation in between.

use crate::analysis::guide::{bin_for_frequency, FftBandLimit, Guidance};
use std::f64::consts::PI;

const TWO_PI: f64 = 2.0 * PI;

/// Bins quieter than this cannot anchor a peak.
const PEAK_FLOOR: f64 = 1.0e-10;

/// Wraps a phase to [-PI, PI).
#[inline]
pub fn wrap_phase(phase: f64) -> f64 {
    let p = phase + PI;
    p - (p / TWO_PI).floor() * TWO_PI - PI
}

/// Per-scale guided phase advance state.
#[derive(Debug)]
pub struct GuidedPhaseAdvance {
    fft_size: usize,
    bin_count: usize,
    sample_rate: f64,
    channels: usize,
    /// Previous frame's analysis phases, per channel.
    prev_phase: Vec<Vec<f64>>,
    /// This frame's computed output phases, per channel.
    out_scratch: Vec<Vec<f64>>,
    /// Bins whose phase was reset this frame, per channel.
    reset_flags: Vec<Vec<bool>>,
    /// Greatest magnitude seen per bin across channels this frame.
    lead_mag: Vec<f64>,
    /// Phase increment of the leading channel per bin.
    lead_inc: Vec<f64>,
    /// Peak-index scratch.
    peaks: Vec<usize>,
    /// Whether `prev_phase` holds a real frame yet, per channel.
    seeded: Vec<bool>,
}

impl GuidedPhaseAdvance {
    pub fn new(fft_size: usize, sample_rate: f64, channels: usize) -> Self {
        let bin_count = fft_size / 2 + 1;
        Self {
            fft_size,
            bin_count,
            sample_rate,
            channels,
            prev_phase: (0..channels).map(|_| vec![0.0; bin_count]).collect(),
            out_scratch: (0..channels).map(|_| vec![0.0; bin_count]).collect(),
            reset_flags: (0..channels).map(|_| vec![false; bin_count]).collect(),
            lead_mag: vec![0.0; bin_count],
            lead_inc: vec![0.0; bin_count],
            peaks: Vec::with_capacity(bin_count / 4),
            seeded: vec![false; channels],
        }
    }

    /// Forgets all phase history.
    pub fn reset(&mut self) {
        for c in 0..self.channels {
            self.prev_phase[c].fill(0.0);
            self.out_scratch[c].fill(0.0);
            self.reset_flags[c].fill(false);
            self.seeded[c] = false;
        }
        self.lead_mag.fill(0.0);
        self.lead_inc.fill(0.0);
    }

    /// Starts a frame: clears the cross-channel lead tracking.
    pub fn begin_frame(&mut self) {
        self.lead_mag.fill(0.0);
        self.lead_inc.fill(0.0);
    }

    /// Computes this channel's advanced phases into internal scratch.
    ///
    /// `prev_out` is the channel's advanced-phase buffer from the
    /// previous frame, still unmodified. `prev_inhop` and `prev_outhop`
    /// are the hop distances used to produce the last emitted frame, not
    /// the upcoming ones: phase deltas span the advance that has already
    /// happened.
    #[allow(clippy::too_many_arguments)]
    pub fn advance_channel(
        &mut self,
        channel: usize,
        mag: &[f64],
        phase: &[f64],
        prev_out: &[f64],
        guidance: &Guidance,
        limits: &FftBandLimit,
        prev_inhop: usize,
        prev_outhop: usize,
    ) {
        let b0 = limits.b0_min;
        let b1 = limits.b1_max.min(self.bin_count - 1);

        self.mark_resets(channel, guidance, b0, b1);

        if !self.seeded[channel] {
            // First frame after construction or reset: no previous phase
            // to difference against, so seed output phases directly from
            // the analysis.
            for i in b0..=b1 {
                self.out_scratch[channel][i] = phase[i];
                self.reset_flags[channel][i] = true;
            }
            self.finish_advance(channel, mag, phase, prev_out, b0, b1);
            self.seeded[channel] = true;
            return;
        }

        let hop_ratio = prev_outhop as f64 / prev_inhop as f64;
        let expected_factor = TWO_PI * prev_inhop as f64 / self.fft_size as f64;

        // Independent instantaneous-frequency advance for every bin.
        for i in b0..=b1 {
            let expected = expected_factor * i as f64;
            let deviation = wrap_phase(phase[i] - self.prev_phase[channel][i] - expected);
            let increment = (expected + deviation) * hop_ratio;
            self.out_scratch[channel][i] = wrap_phase(prev_out[i] + increment);
        }

        // Peak locking, per phase-lock band.
        for band in &guidance.phase_lock_bands {
            if band.f1 <= band.f0 || band.beta <= 0.0 {
                continue;
            }
            let lo = bin_for_frequency(band.f0, self.fft_size, self.sample_rate).max(b0);
            let hi = bin_for_frequency(band.f1, self.fft_size, self.sample_rate).min(b1);
            if hi <= lo {
                continue;
            }
            find_peaks(&mag[..=b1], lo, hi, band.p, &mut self.peaks);
            if self.peaks.is_empty() {
                continue;
            }
            for i in lo..=hi {
                let peak = match self.peaks.binary_search(&i) {
                    Ok(_) => continue, // peaks keep their own advance
                    Err(idx) => {
                        let lower = idx.checked_sub(1).map(|k| self.peaks[k]);
                        let upper = self.peaks.get(idx).copied();
                        match (lower, upper) {
                            (Some(l), Some(u)) => {
                                if i - l <= u - i {
                                    l
                                } else {
                                    u
                                }
                            }
                            (Some(l), None) => l,
                            (None, Some(u)) => u,
                            (None, None) => continue,
                        }
                    }
                };
                let locked = self.out_scratch[channel][peak] + (phase[i] - phase[peak]);
                let independent = self.out_scratch[channel][i];
                self.out_scratch[channel][i] =
                    wrap_phase(independent + band.beta * wrap_phase(locked - independent));
            }
        }

        // Guidance-driven resets override everything computed above.
        for i in b0..=b1 {
            if self.reset_flags[channel][i] {
                self.out_scratch[channel][i] = phase[i];
            }
        }

        self.finish_advance(channel, mag, phase, prev_out, b0, b1);
    }

    /// Applies the cross-channel lock and writes this channel's advanced
    /// phases into `out`, whose current contents are the previous
    /// frame's advanced phases. Call after every channel has advanced.
    pub fn finish_channel(
        &mut self,
        channel: usize,
        guidance: &Guidance,
        limits: &FftBandLimit,
        out: &mut [f64],
    ) {
        let b0 = limits.b0_min;
        let b1 = limits.b1_max.min(self.bin_count - 1);

        let (lock_lo, lock_hi) = if self.channels > 1 && guidance.channel_lock.present {
            (
                bin_for_frequency(guidance.channel_lock.f0, self.fft_size, self.sample_rate)
                    .max(b0),
                bin_for_frequency(guidance.channel_lock.f1, self.fft_size, self.sample_rate)
                    .min(b1),
            )
        } else {
            (1, 0)
        };

        for i in b0..=b1 {
            let previous = out[i];
            let mut value = self.out_scratch[channel][i];
            if i >= lock_lo && i <= lock_hi && !self.reset_flags[channel][i] {
                // Follow the loudest channel's increment so coupled bass
                // content advances in step, preserving each channel's own
                // phase offset.
                value = wrap_phase(previous + self.lead_inc[i]);
            }
            out[i] = value;
        }
    }

    fn mark_resets(&mut self, channel: usize, guidance: &Guidance, b0: usize, b1: usize) {
        let flags = &mut self.reset_flags[channel];
        flags[b0..=b1].fill(false);
        if guidance.phase_reset.present {
            let lo = bin_for_frequency(guidance.phase_reset.f0, self.fft_size, self.sample_rate)
                .max(b0);
            let hi = bin_for_frequency(guidance.phase_reset.f1, self.fft_size, self.sample_rate)
                .min(b1);
            if hi >= lo {
                flags[lo..=hi].fill(true);
            }
        }
    }

    /// Records per-bin increments for the channel lock and rolls the
    /// previous-phase buffer forward.
    fn finish_advance(
        &mut self,
        channel: usize,
        mag: &[f64],
        phase: &[f64],
        prev_out: &[f64],
        b0: usize,
        b1: usize,
    ) {
        for i in b0..=b1 {
            if mag[i] > self.lead_mag[i] {
                self.lead_mag[i] = mag[i];
                self.lead_inc[i] = wrap_phase(self.out_scratch[channel][i] - prev_out[i]);
            }
            self.prev_phase[channel][i] = phase[i];
        }
    }
}

/// Collects local maxima in `[lo, hi]` into `peaks` (sorted ascending).
/// A peak must exceed its immediate neighbours and be no smaller than
/// anything within `p` bins.
fn find_peaks(mag: &[f64], lo: usize, hi: usize, p: usize, peaks: &mut Vec<usize>) {
    peaks.clear();
    for i in lo..=hi {
        let value = mag[i];
        if value <= PEAK_FLOOR {
            continue;
        }
        if i > 0 && mag[i - 1] >= value {
            continue;
        }
        if i + 1 < mag.len() && mag[i + 1] > value {
            continue;
        }
        let neighbourhood_lo = i.saturating_sub(p);
        let neighbourhood_hi = (i + p).min(mag.len() - 1);
        if (neighbourhood_lo..=neighbourhood_hi).any(|j| j != i && mag[j] > value) {
            continue;
        }
        peaks.push(i);
    }
}
