//! Per-frame frequency guidance.
//!
//! The guide decides, for every frame, which FFT scale resynthesises
//! which frequency range, where phases may be locked to spectral peaks
//! and how tightly, whether a transient is imminent or arriving, and
//! where phases should be reset outright. Decisions are driven by the
//! classification-scale magnitudes (current and one hop ahead) and the
//! bin segmentation.

use super::segmenter::Segmentation;
use crate::core::log::Log;

/// Default crossover between the longest and classification scales (Hz).
const DEFAULT_LOWER_CROSSOVER: f64 = 700.0;
/// Default crossover between the classification and shortest scales (Hz).
const DEFAULT_HIGHER_CROSSOVER: f64 = 4800.0;
/// Clamp range for the lower crossover (Hz).
const LOWER_CROSSOVER_MIN: f64 = 350.0;
const LOWER_CROSSOVER_MAX: f64 = 1400.0;
/// Clamp range for the higher crossover (Hz).
const HIGHER_CROSSOVER_MIN: f64 = 2400.0;
const HIGHER_CROSSOVER_MAX: f64 = 9600.0;
/// Output hop above which the shortest FFT no longer has enough overlap
/// and its band is dropped.
const SHORTEST_FFT_MAX_OUTHOP: usize = 256;
/// Frequency range inspected for kick onsets (Hz).
const KICK_F0: f64 = 40.0;
const KICK_F1: f64 = 240.0;
/// Readahead low-band energy must exceed this multiple of the current
/// frame's to count as an onset.
const KICK_RISE_RATIO: f64 = 2.0;
/// ...and this multiple of the frame's mean magnitude.
const KICK_MEAN_RATIO: f64 = 4.0;
/// Absolute guard against near-silence false triggers.
const KICK_ABS_FLOOR: f64 = 1.0e-6;
/// Channel phase locking covers this range unless channels are locked
/// together across the whole spectrum.
const CHANNEL_LOCK_DEFAULT_F1: f64 = 600.0;

/// Maps a frequency to the nearest bin of an `fft_size` transform.
#[inline]
pub fn bin_for_frequency(frequency: f64, fft_size: usize, sample_rate: f64) -> usize {
    (frequency * fft_size as f64 / sample_rate).round() as usize
}

/// Bin range a scale may touch during analysis and phase advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FftBandLimit {
    pub fft_size: usize,
    pub b0_min: usize,
    pub b1_max: usize,
}

/// The fixed multi-scale layout, decided at construction.
#[derive(Debug, Clone)]
pub struct GuideConfiguration {
    pub longest_fft_size: usize,
    pub shortest_fft_size: usize,
    pub classification_fft_size: usize,
    /// Ordered by FFT size, ascending.
    pub band_limits: [FftBandLimit; 3],
}

impl GuideConfiguration {
    pub fn new(sample_rate: f64) -> Self {
        let longest = 4096;
        let classification = 2048;
        let shortest = 1024;
        Self {
            longest_fft_size: longest,
            shortest_fft_size: shortest,
            classification_fft_size: classification,
            band_limits: [
                FftBandLimit {
                    fft_size: shortest,
                    b0_min: bin_for_frequency(HIGHER_CROSSOVER_MIN, shortest, sample_rate)
                        .min(shortest / 2),
                    b1_max: shortest / 2,
                },
                FftBandLimit {
                    fft_size: classification,
                    b0_min: bin_for_frequency(LOWER_CROSSOVER_MIN, classification, sample_rate),
                    b1_max: classification / 2,
                },
                FftBandLimit {
                    fft_size: longest,
                    b0_min: 0,
                    b1_max: bin_for_frequency(LOWER_CROSSOVER_MAX, longest, sample_rate)
                        .min(longest / 2),
                },
            ],
        }
    }

    /// Returns the bin limits for one FFT size.
    #[inline]
    pub fn limits_for(&self, fft_size: usize) -> Option<&FftBandLimit> {
        self.band_limits.iter().find(|b| b.fft_size == fft_size)
    }
}

/// A frequency range that may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FreqRange {
    pub present: bool,
    pub f0: f64,
    pub f1: f64,
}

impl FreqRange {
    fn spanning(f0: f64, f1: f64) -> Self {
        Self {
            present: true,
            f0,
            f1,
        }
    }

    fn absent() -> Self {
        Self::default()
    }
}

/// Frequency range resynthesised by one FFT scale this frame. A
/// zero-width range means the scale contributes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FftBand {
    pub fft_size: usize,
    pub f0: f64,
    pub f1: f64,
}

/// Peak-locking behavior over one frequency range: peaks are searched
/// with a ±`p` bin neighbourhood, and non-peak bins are pulled toward
/// their peak's phase rotation with strength `beta`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseLockBand {
    pub p: usize,
    pub beta: f64,
    pub f0: f64,
    pub f1: f64,
}

/// Everything the rest of the frame pipeline needs to know, per channel
/// per frame. Ordering of `fft_bands` is lowest frequency range first.
#[derive(Debug, Clone, Default)]
pub struct Guidance {
    pub fft_bands: [FftBand; 3],
    pub phase_lock_bands: [PhaseLockBand; 5],
    pub kick: FreqRange,
    pub pre_kick: FreqRange,
    pub phase_reset: FreqRange,
    pub channel_lock: FreqRange,
}

/// Per-frame guidance generator. The guide itself is stateless across
/// frames; onset state lives in each channel's `Guidance` record.
#[derive(Debug)]
pub struct Guide {
    sample_rate: f64,
    configuration: GuideConfiguration,
    log: Log,
}

impl Guide {
    pub fn new(sample_rate: f64, log: Log) -> Self {
        Self {
            sample_rate,
            configuration: GuideConfiguration::new(sample_rate),
            log,
        }
    }

    pub fn configuration(&self) -> &GuideConfiguration {
        &self.configuration
    }

    /// Produces guidance for the frame whose classification-scale
    /// magnitudes are `mag`, with `readahead_mag` one input hop ahead.
    ///
    /// `guidance` holds the previous frame's record on entry; the onset
    /// detector reads its pre-kick state before overwriting.
    #[allow(clippy::too_many_arguments)]
    pub fn update_guidance(
        &self,
        ratio: f64,
        prev_outhop: usize,
        mag: &[f64],
        _prev_mag: &[f64],
        readahead_mag: &[f64],
        segmentation: &Segmentation,
        _prev_segmentation: &Segmentation,
        _next_segmentation: &Segmentation,
        mean_mag: f64,
        unity_count: usize,
        _realtime: bool,
        tighter_channel_lock: bool,
        guidance: &mut Guidance,
    ) {
        let nyquist = self.sample_rate / 2.0;
        let classify = self.configuration.classification_fft_size;

        // Onset state machine: a rise detected in the readahead marks
        // this frame pre-kick; the following frame is the kick itself.
        let was_pre_kick = guidance.pre_kick.present;
        let kick_from = bin_for_frequency(KICK_F0, classify, self.sample_rate).max(1);
        let kick_to = bin_for_frequency(KICK_F1, classify, self.sample_rate).min(classify / 2);
        let current_energy = band_mean(mag, kick_from, kick_to);
        let readahead_energy = band_mean(readahead_mag, kick_from, kick_to);
        let onset_ahead = readahead_energy > KICK_ABS_FLOOR
            && readahead_energy > KICK_RISE_RATIO * current_energy
            && readahead_energy > KICK_MEAN_RATIO * mean_mag;

        // The kick range always mirrors the pre-kick range; the deferral
        // stage derives its bin range from the pre-kick record in both
        // branches, so the frequencies stay put and only `present`
        // toggles.
        guidance.kick = FreqRange {
            present: was_pre_kick,
            f0: KICK_F0,
            f1: KICK_F1,
        };
        let pre_kick_now = !was_pre_kick && onset_ahead;
        if pre_kick_now {
            self.log.trace(
                "guide: onset ahead, deferring pre-kick energy",
                &[readahead_energy, current_energy],
            );
        }
        guidance.pre_kick = FreqRange {
            present: pre_kick_now,
            f0: KICK_F0,
            f1: KICK_F1,
        };

        // Band crossovers, pulled around by the segmentation: percussive
        // content wants the shorter FFTs, tonal bass wants the longest.
        let mut lower = DEFAULT_LOWER_CROSSOVER;
        if segmentation.percussive_below > 0.0 {
            lower = segmentation
                .percussive_below
                .clamp(LOWER_CROSSOVER_MIN, LOWER_CROSSOVER_MAX);
        }
        let mut higher = DEFAULT_HIGHER_CROSSOVER;
        if segmentation.percussive_above > 0.0 {
            higher = segmentation
                .percussive_above
                .clamp(HIGHER_CROSSOVER_MIN, HIGHER_CROSSOVER_MAX);
        }
        higher = higher.min(nyquist);
        lower = lower.min(higher);

        // Above this output hop the shortest FFT's overlap is too thin;
        // collapse its band and let the classification scale carry the
        // top of the spectrum.
        let drop_shortest = prev_outhop > SHORTEST_FFT_MAX_OUTHOP;
        if drop_shortest {
            higher = nyquist;
        }

        guidance.fft_bands = [
            FftBand {
                fft_size: self.configuration.longest_fft_size,
                f0: 0.0,
                f1: lower,
            },
            FftBand {
                fft_size: self.configuration.classification_fft_size,
                f0: lower,
                f1: higher,
            },
            FftBand {
                fft_size: self.configuration.shortest_fft_size,
                f0: higher,
                f1: if drop_shortest { higher } else { nyquist },
            },
        ];

        guidance.phase_lock_bands = phase_lock_bands(nyquist);

        // Unity passthrough and transient onsets both want phases pinned
        // to the analysis values across the board.
        if unity_count > 0 && (ratio - 1.0).abs() < 1.0e-7 {
            guidance.phase_reset = FreqRange::spanning(0.0, nyquist);
        } else if guidance.kick.present {
            guidance.phase_reset = FreqRange::spanning(0.0, nyquist);
        } else {
            guidance.phase_reset = FreqRange::absent();
        }

        guidance.channel_lock = if tighter_channel_lock {
            FreqRange::spanning(0.0, nyquist)
        } else {
            FreqRange::spanning(0.0, CHANNEL_LOCK_DEFAULT_F1.min(nyquist))
        };
    }
}

fn phase_lock_bands(nyquist: f64) -> [PhaseLockBand; 5] {
    let edges = [0.0, 100.0, 400.0, 1600.0, 6400.0, nyquist];
    let p = [1usize, 2, 3, 4, 5];
    let beta = [1.0, 0.9, 0.75, 0.6, 0.4];
    let mut bands = [PhaseLockBand::default(); 5];
    for i in 0..5 {
        bands[i] = PhaseLockBand {
            p: p[i],
            beta: beta[i],
            f0: edges[i].min(nyquist),
            f1: edges[i + 1].min(nyquist),
        };
    }
    bands
}

fn band_mean(magnitudes: &[f64], from: usize, to: usize) -> f64 {
    if to <= from || from >= magnitudes.len() {
        return 0.0;
    }
    let to = to.min(magnitudes.len() - 1);
    let slice = &magnitudes[from..=to];
    slice.iter().sum::<f64>() / slice.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: f64 = 48000.0;

    fn guide() -> Guide {
        Guide::new(SAMPLE_RATE, Log::new())
    }

    fn flat_mags(value: f64) -> Vec<f64> {
        vec![value; 1025]
    }

    fn update(
        guide: &Guide,
        guidance: &mut Guidance,
        mag: &[f64],
        readahead: &[f64],
        prev_outhop: usize,
        unity: usize,
    ) {
        let seg = Segmentation::default();
        let mean = mag.iter().sum::<f64>() / mag.len() as f64;
        guide.update_guidance(
            1.5, prev_outhop, mag, mag, readahead, &seg, &seg, &seg, mean, unity, false, false,
            guidance,
        );
    }

    #[test]
    fn configuration_band_limits_are_ordered_and_bounded() {
        let config = GuideConfiguration::new(SAMPLE_RATE);
        assert_eq!(config.longest_fft_size, 4096);
        assert_eq!(config.classification_fft_size, 2048);
        assert_eq!(config.shortest_fft_size, 1024);
        for limit in &config.band_limits {
            assert!(limit.b0_min <= limit.b1_max);
            assert!(limit.b1_max <= limit.fft_size / 2);
        }
        // The longest scale covers DC.
        assert_eq!(config.limits_for(4096).unwrap().b0_min, 0);
    }

    #[test]
    fn default_bands_use_all_three_scales() {
        let g = guide();
        let mut guidance = Guidance::default();
        let mags = flat_mags(1.0e-4);
        update(&g, &mut guidance, &mags, &mags, 256, 0);

        assert_eq!(guidance.fft_bands[0].fft_size, 4096);
        assert_eq!(guidance.fft_bands[1].fft_size, 2048);
        assert_eq!(guidance.fft_bands[2].fft_size, 1024);
        assert_eq!(guidance.fft_bands[0].f0, 0.0);
        assert!((guidance.fft_bands[0].f1 - DEFAULT_LOWER_CROSSOVER).abs() < 1.0);
        assert!((guidance.fft_bands[1].f1 - DEFAULT_HIGHER_CROSSOVER).abs() < 1.0);
        assert!(guidance.fft_bands[2].f1 > guidance.fft_bands[2].f0);
    }

    #[test]
    fn large_outhop_drops_shortest_band() {
        let g = guide();
        let mut guidance = Guidance::default();
        let mags = flat_mags(1.0e-4);
        update(&g, &mut guidance, &mags, &mags, 384, 0);

        let top = guidance.fft_bands[2];
        assert_eq!(top.f0, top.f1, "shortest band should collapse");
        assert!((guidance.fft_bands[1].f1 - SAMPLE_RATE / 2.0).abs() < 1.0);
    }

    #[test]
    fn onset_raises_pre_kick_then_kick() {
        let g = guide();
        let mut guidance = Guidance::default();
        let quiet = flat_mags(1.0e-5);
        let mut loud = flat_mags(1.0e-5);
        for bin in 2..11 {
            loud[bin] = 2.0e-2;
        }

        update(&g, &mut guidance, &quiet, &loud, 256, 0);
        assert!(guidance.pre_kick.present);
        assert!(!guidance.kick.present);

        update(&g, &mut guidance, &loud, &loud, 256, 0);
        assert!(guidance.kick.present);
        assert!(!guidance.pre_kick.present);
        assert_eq!(guidance.kick.f0, KICK_F0);
        assert_eq!(guidance.kick.f1, KICK_F1);
    }

    #[test]
    fn unity_requests_full_phase_reset() {
        let g = guide();
        let mut guidance = Guidance::default();
        let mags = flat_mags(1.0e-4);
        let seg = Segmentation::default();
        let mean = 1.0e-4;
        g.update_guidance(
            1.0, 256, &mags, &mags, &mags, &seg, &seg, &seg, mean, 3, false, false, &mut guidance,
        );
        assert!(guidance.phase_reset.present);
        assert_eq!(guidance.phase_reset.f0, 0.0);
        assert!((guidance.phase_reset.f1 - SAMPLE_RATE / 2.0).abs() < 1.0);
    }

    #[test]
    fn channels_together_widens_channel_lock() {
        let g = guide();
        let mut guidance = Guidance::default();
        let mags = flat_mags(1.0e-4);
        let seg = Segmentation::default();
        g.update_guidance(
            1.5, 256, &mags, &mags, &mags, &seg, &seg, &seg, 1.0e-4, 0, false, true, &mut guidance,
        );
        assert!((guidance.channel_lock.f1 - SAMPLE_RATE / 2.0).abs() < 1.0);

        g.update_guidance(
            1.5, 256, &mags, &mags, &mags, &seg, &seg, &seg, 1.0e-4, 0, false, false,
            &mut guidance,
        );
        assert!((guidance.channel_lock.f1 - CHANNEL_LOCK_DEFAULT_F1).abs() < 1.0);
    }

    #[test]
    fn percussive_segmentation_moves_crossovers() {
        let g = guide();
        let mut guidance = Guidance::default();
        let mags = flat_mags(1.0e-4);
        let seg = Segmentation {
            percussive_below: 900.0,
            percussive_above: 3000.0,
            residual_above: 3000.0,
        };
        g.update_guidance(
            1.5, 256, &mags, &mags, &mags, &seg, &seg, &seg, 1.0e-4, 0, false, false,
            &mut guidance,
        );
        assert!((guidance.fft_bands[0].f1 - 900.0).abs() < 1.0);
        assert!((guidance.fft_bands[1].f1 - 3000.0).abs() < 1.0);
    }
}
