//! Streaming sample-rate conversion for the pitch-shift stage.
//!
//! The resampler consumes fixed hop-sized blocks and emits a varying
//! number of samples per block, carrying a fractional read position
//! across calls so the long-run output rate is exact. All channels share
//! one position accumulator, guaranteeing identical output counts per
//! channel; interpolation history is kept per channel.
//!
//! Two kernels are available: 4-point Hermite interpolation and a 16-tap
//! Kaiser-windowed sinc for the high-quality option.

/// Ratio quantization grid. The effective ratio reported to callers and
/// the ratio actually driving interpolation are the same quantized value.
const RATIO_QUANTUM: f64 = 1.0 / 16384.0;

/// Per-block smoothing coefficient applied to ratio changes when smooth
/// updates are requested.
const RATIO_SMOOTHING: f64 = 0.2;

/// Ratio bounds; values outside are clamped.
const MIN_RATIO: f64 = 1.0 / 32.0;
const MAX_RATIO: f64 = 32.0;

/// Number of sinc lobes for the high-quality kernel.
const SINC_LOBES: usize = 8;
/// Kaiser beta for the sinc kernel window (~60 dB stopband).
const SINC_KAISER_BETA: f64 = 6.0;

/// Interpolation kernel quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleQuality {
    /// 4-point Hermite interpolation.
    FastestTolerable,
    /// 16-tap Kaiser-windowed sinc.
    Best,
}

/// Resampler configuration, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct ResamplerConfig {
    pub channels: usize,
    pub quality: ResampleQuality,
    /// Slew ratio changes over several blocks instead of jumping.
    pub smooth_ratio_changes: bool,
}

/// Streaming fractional resampler.
#[derive(Debug)]
pub struct Resampler {
    config: ResamplerConfig,
    taps: usize,
    half: usize,
    /// Per-channel tail of the previous block, most recent sample last.
    history: Vec<Vec<f32>>,
    /// Read position of the next output sample, relative to the start of
    /// the current input block. May be negative (reading the history).
    position: f64,
    /// Current (possibly slewed) quantized ratio; 0.0 before first use.
    ratio: f64,
    planned_out: usize,
    planned_step: f64,
    planned_in: usize,
}

impl Resampler {
    /// Creates a resampler for the given configuration.
    pub fn new(config: ResamplerConfig) -> Self {
        let taps = match config.quality {
            ResampleQuality::FastestTolerable => 4,
            ResampleQuality::Best => 2 * SINC_LOBES,
        };
        Self {
            config,
            taps,
            half: taps / 2,
            history: (0..config.channels).map(|_| vec![0.0; taps]).collect(),
            position: 0.0,
            ratio: 0.0,
            planned_out: 0,
            planned_step: 1.0,
            planned_in: 0,
        }
    }

    /// Quantizes a requested ratio to the grid the resampler actually
    /// runs at.
    pub fn effective_ratio(&self, requested: f64) -> f64 {
        let clamped = requested.clamp(MIN_RATIO, MAX_RATIO);
        ((clamped / RATIO_QUANTUM).round() * RATIO_QUANTUM).max(RATIO_QUANTUM)
    }

    /// Plans one block: returns the number of output samples that
    /// [`run`](Resampler::run) will produce for each channel.
    ///
    /// When `final_block` is set the tail is flushed instead of being
    /// held back for kernel lookahead.
    pub fn begin(&mut self, in_count: usize, requested_ratio: f64, final_block: bool) -> usize {
        let target = self.effective_ratio(requested_ratio);
        self.ratio = if self.ratio == 0.0 || !self.config.smooth_ratio_changes {
            target
        } else {
            self.effective_ratio(self.ratio + (target - self.ratio) * RATIO_SMOOTHING)
        };
        let step = 1.0 / self.ratio;

        let limit = if final_block {
            in_count as f64 - 1.0
        } else {
            in_count as f64 - 1.0 - self.half as f64
        };

        self.planned_in = in_count;
        self.planned_step = step;
        self.planned_out = if in_count == 0 || self.position > limit {
            0
        } else {
            ((limit - self.position) / step).floor() as usize + 1
        };
        self.planned_out
    }

    /// Resamples one channel of the planned block.
    ///
    /// `input` must hold the `in_count` passed to `begin`; `output` must
    /// have room for the planned output count. Returns the number of
    /// samples written.
    pub fn run(&mut self, channel: usize, input: &[f32], output: &mut [f32]) -> usize {
        let produced = self.planned_out;
        {
            let history = &self.history[channel];
            for (k, out) in output.iter_mut().enumerate().take(produced) {
                let x = self.position + k as f64 * self.planned_step;
                let i0 = x.floor() as isize;
                let frac = x - i0 as f64;
                *out = match self.config.quality {
                    ResampleQuality::FastestTolerable => {
                        hermite(i0, frac, input, history, self.taps)
                    }
                    ResampleQuality::Best => {
                        windowed_sinc(i0, frac, input, history, self.taps, self.half)
                    }
                };
            }
        }

        // Roll the per-channel history forward over this block.
        let history = &mut self.history[channel];
        if input.len() >= self.taps {
            history.copy_from_slice(&input[input.len() - self.taps..]);
        } else {
            history.rotate_left(input.len());
            let keep = self.taps - input.len();
            history[keep..].copy_from_slice(input);
        }
        produced
    }

    /// Advances the shared read position past the planned block. Call
    /// once per block, after every channel has run.
    pub fn commit(&mut self) {
        self.position += self.planned_out as f64 * self.planned_step - self.planned_in as f64;
        self.planned_out = 0;
        self.planned_in = 0;
    }

    /// Returns state to that of a freshly constructed resampler.
    pub fn reset(&mut self) {
        for history in &mut self.history {
            history.fill(0.0);
        }
        self.position = 0.0;
        self.ratio = 0.0;
        self.planned_out = 0;
        self.planned_in = 0;
    }
}

#[inline]
fn sample_at(idx: isize, input: &[f32], history: &[f32]) -> f64 {
    if idx < 0 {
        let back = history.len() as isize + idx;
        if back >= 0 {
            history[back as usize] as f64
        } else {
            0.0
        }
    } else if (idx as usize) < input.len() {
        input[idx as usize] as f64
    } else {
        0.0
    }
}

/// 4-point Hermite interpolation around `i0 + frac`.
#[inline]
fn hermite(i0: isize, frac: f64, input: &[f32], history: &[f32], _taps: usize) -> f32 {
    let s0 = sample_at(i0 - 1, input, history);
    let s1 = sample_at(i0, input, history);
    let s2 = sample_at(i0 + 1, input, history);
    let s3 = sample_at(i0 + 2, input, history);

    let c0 = s1;
    let c1 = 0.5 * (s2 - s0);
    let c2 = s0 - 2.5 * s1 + 2.0 * s2 - 0.5 * s3;
    let c3 = 0.5 * (s3 - s0) + 1.5 * (s1 - s2);

    (((c3 * frac + c2) * frac + c1) * frac + c0) as f32
}

/// Kaiser-windowed sinc interpolation around `i0 + frac`.
#[inline]
fn windowed_sinc(
    i0: isize,
    frac: f64,
    input: &[f32],
    history: &[f32],
    _taps: usize,
    half: usize,
) -> f32 {
    let bessel_beta = bessel_i0(SINC_KAISER_BETA);
    let mut acc = 0.0f64;
    let mut weight_sum = 0.0f64;

    let start = -(half as isize) + 1;
    let end = half as isize;
    for j in start..=end {
        let x = frac - j as f64;
        let sinc_val = if x.abs() < 1e-10 {
            1.0
        } else {
            let pi_x = std::f64::consts::PI * x;
            pi_x.sin() / pi_x
        };
        let t = (j as f64 - frac) / SINC_LOBES as f64;
        let window = if t.abs() <= 1.0 {
            bessel_i0(SINC_KAISER_BETA * (1.0 - t * t).max(0.0).sqrt()) / bessel_beta
        } else {
            0.0
        };
        let w = sinc_val * window;
        acc += sample_at(i0 + j, input, history) * w;
        weight_sum += w;
    }

    if weight_sum.abs() > 1e-10 {
        acc /= weight_sum;
    }
    acc as f32
}

/// Modified Bessel function of the first kind, order zero, via power
/// series.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0f64;
    let mut term = 1.0f64;
    let half_x = x * 0.5;
    for k in 1..=25 {
        term *= (half_x / k as f64) * (half_x / k as f64);
        sum += term;
        if term < sum * 1e-16 {
            break;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn run_stream(
        resampler: &mut Resampler,
        input: &[f32],
        block: usize,
        ratio: f64,
    ) -> Vec<f32> {
        let mut output = Vec::new();
        let mut scratch = vec![0.0f32; block * 40 + 64];
        let blocks: Vec<&[f32]> = input.chunks(block).collect();
        for (idx, chunk) in blocks.iter().enumerate() {
            let final_block = idx + 1 == blocks.len();
            let produced = resampler.begin(chunk.len(), ratio, final_block);
            resampler.run(0, chunk, &mut scratch[..produced]);
            resampler.commit();
            output.extend_from_slice(&scratch[..produced]);
        }
        output
    }

    #[test]
    fn unity_ratio_preserves_length() {
        let mut resampler = Resampler::new(ResamplerConfig {
            channels: 1,
            quality: ResampleQuality::FastestTolerable,
            smooth_ratio_changes: false,
        });
        let input = vec![0.25f32; 1000];
        let output = run_stream(&mut resampler, &input, 250, 1.0);
        assert_eq!(output.len(), 1000);
    }

    #[test]
    fn output_count_tracks_ratio() {
        for &ratio in &[0.5f64, 0.75, 1.5, 2.0] {
            let mut resampler = Resampler::new(ResamplerConfig {
                channels: 1,
                quality: ResampleQuality::FastestTolerable,
                smooth_ratio_changes: false,
            });
            let input = vec![0.5f32; 2048];
            let output = run_stream(&mut resampler, &input, 256, ratio);
            let expected = (2048.0 * ratio).round() as isize;
            assert!(
                (output.len() as isize - expected).abs() <= 2,
                "ratio {}: got {}, expected ~{}",
                ratio,
                output.len(),
                expected
            );
        }
    }

    #[test]
    fn sine_survives_upsampling() {
        let mut resampler = Resampler::new(ResamplerConfig {
            channels: 1,
            quality: ResampleQuality::Best,
            smooth_ratio_changes: false,
        });
        let n = 4096;
        let input: Vec<f32> = (0..n)
            .map(|i| (2.0 * PI * 20.0 * i as f64 / n as f64).sin() as f32)
            .collect();
        let output = run_stream(&mut resampler, &input, 512, 2.0);

        // Interior samples should match the same sine at half the phase
        // increment, shifted by the kernel delay.
        let mut max_err = 0.0f64;
        for (k, &v) in output.iter().enumerate().skip(64).take(output.len() - 128) {
            let expected = (2.0 * PI * 20.0 * (k as f64 / 2.0) / n as f64).sin();
            max_err = max_err.max((v as f64 - expected).abs());
        }
        assert!(max_err < 0.05, "sinc upsample error too high: {}", max_err);
    }

    #[test]
    fn channels_always_agree_on_count() {
        let mut resampler = Resampler::new(ResamplerConfig {
            channels: 2,
            quality: ResampleQuality::FastestTolerable,
            smooth_ratio_changes: false,
        });
        let left = vec![1.0f32; 300];
        let right = vec![-1.0f32; 300];
        let mut out_l = vec![0.0f32; 1024];
        let mut out_r = vec![0.0f32; 1024];
        for chunk in 0..3 {
            let produced = resampler.begin(100, 1.37, chunk == 2);
            let l = resampler.run(0, &left[chunk * 100..(chunk + 1) * 100], &mut out_l);
            let r = resampler.run(1, &right[chunk * 100..(chunk + 1) * 100], &mut out_r);
            resampler.commit();
            assert_eq!(l, produced);
            assert_eq!(r, produced);
        }
    }

    #[test]
    fn effective_ratio_is_quantized() {
        let resampler = Resampler::new(ResamplerConfig {
            channels: 1,
            quality: ResampleQuality::FastestTolerable,
            smooth_ratio_changes: false,
        });
        let effective = resampler.effective_ratio(0.70000001);
        assert!((effective * 16384.0).fract().abs() < 1e-9);
        assert!((effective - 0.7).abs() < RATIO_QUANTUM);
        // Identity stays exact: 1.0 lies on the grid.
        assert_eq!(resampler.effective_ratio(1.0), 1.0);
    }

    #[test]
    fn smooth_ratio_changes_slew() {
        let mut resampler = Resampler::new(ResamplerConfig {
            channels: 1,
            quality: ResampleQuality::FastestTolerable,
            smooth_ratio_changes: true,
        });
        let input = vec![0.0f32; 256];
        let mut scratch = vec![0.0f32; 1024];
        resampler.begin(256, 1.0, false);
        resampler.run(0, &input, &mut scratch);
        resampler.commit();
        // Request a jump; the very next block must not land on the target.
        resampler.begin(256, 2.0, false);
        assert!(resampler.ratio > 1.0 && resampler.ratio < 2.0);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut resampler = Resampler::new(ResamplerConfig {
            channels: 1,
            quality: ResampleQuality::FastestTolerable,
            smooth_ratio_changes: false,
        });
        let input = vec![0.9f32; 128];
        let mut scratch = vec![0.0f32; 512];
        resampler.begin(128, 0.8, false);
        resampler.run(0, &input, &mut scratch);
        resampler.commit();
        resampler.reset();
        assert_eq!(resampler.position, 0.0);
        assert!(resampler.history[0].iter().all(|&s| s == 0.0));
    }
}
