//! Frequency-range segmentation of a classified frame.
//!
//! Reduces a per-bin label vector to three boundary frequencies: the top
//! of the percussive region anchored at DC, the bottom of the percussive
//! region anchored at Nyquist, and the bottom of the non-harmonic
//! (residual) region anchored at Nyquist. Boundaries are median-smoothed
//! over recent frames so the guide's band crossovers do not flutter.

use super::classifier::BinLabel;

/// Sliding-window width for the dominance vote, in bins.
const VOTE_WINDOW: usize = 5;
/// Votes within the window needed to extend a region.
const VOTE_MAJORITY: usize = 3;
/// A DC- or Nyquist-anchored region shorter than this many bins is
/// treated as absent.
const MIN_REGION_BINS: usize = 2;

/// Frequency-range boundaries for one frame, in Hz. A value of zero
/// means the corresponding region is absent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Segmentation {
    /// Everything below this is percussive (DC-anchored region).
    pub percussive_below: f64,
    /// Everything above this is percussive (Nyquist-anchored region).
    pub percussive_above: f64,
    /// Everything above this is non-harmonic (Nyquist-anchored region).
    pub residual_above: f64,
}

/// Segmenter tuning.
#[derive(Debug, Clone, Copy)]
pub struct SegmenterParameters {
    /// Classification FFT size (for the bin→Hz conversion).
    pub fft_size: usize,
    /// Number of classified bins.
    pub bin_count: usize,
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Frames of boundary history for the median smoothing.
    pub filter_length: usize,
}

impl SegmenterParameters {
    pub fn new(fft_size: usize, bin_count: usize, sample_rate: f64) -> Self {
        Self {
            fft_size,
            bin_count,
            sample_rate,
            filter_length: 18,
        }
    }
}

/// Stateful per-channel segmenter.
#[derive(Debug)]
pub struct BinSegmenter {
    parameters: SegmenterParameters,
    below_history: BoundaryFilter,
    above_history: BoundaryFilter,
    residual_history: BoundaryFilter,
}

impl BinSegmenter {
    pub fn new(parameters: SegmenterParameters) -> Self {
        let len = parameters.filter_length.max(1);
        Self {
            parameters,
            below_history: BoundaryFilter::new(len),
            above_history: BoundaryFilter::new(len),
            residual_history: BoundaryFilter::new(len),
        }
    }

    /// Segments one frame of labels.
    pub fn segment(&mut self, labels: &[BinLabel]) -> Segmentation {
        let bins = self.parameters.bin_count.min(labels.len());
        let hz_per_bin = self.parameters.sample_rate / self.parameters.fft_size as f64;

        let below_bins = region_from_bottom(labels, bins, is_percussive);
        let above_bins = region_from_top(labels, bins, is_percussive);
        let residual_bins = region_from_top(labels, bins, is_non_harmonic);

        let raw = Segmentation {
            percussive_below: if below_bins >= MIN_REGION_BINS {
                below_bins as f64 * hz_per_bin
            } else {
                0.0
            },
            percussive_above: if above_bins >= MIN_REGION_BINS {
                (bins - above_bins) as f64 * hz_per_bin
            } else {
                0.0
            },
            residual_above: if residual_bins >= MIN_REGION_BINS {
                (bins - residual_bins) as f64 * hz_per_bin
            } else {
                0.0
            },
        };

        Segmentation {
            percussive_below: self.below_history.push(raw.percussive_below),
            percussive_above: self.above_history.push(raw.percussive_above),
            residual_above: self.residual_history.push(raw.residual_above),
        }
    }

    /// Clears the boundary history.
    pub fn reset(&mut self) {
        self.below_history.reset();
        self.above_history.reset();
        self.residual_history.reset();
    }
}

#[inline]
fn is_percussive(label: BinLabel) -> bool {
    label == BinLabel::Percussive
}

#[inline]
fn is_non_harmonic(label: BinLabel) -> bool {
    !matches!(label, BinLabel::Harmonic)
}

/// Length in bins of the region anchored at DC where `predicate` keeps a
/// windowed majority.
fn region_from_bottom(labels: &[BinLabel], bins: usize, predicate: fn(BinLabel) -> bool) -> usize {
    let mut extent = 0;
    for bin in 0..bins {
        let lo = bin.saturating_sub(VOTE_WINDOW / 2);
        let hi = (bin + VOTE_WINDOW / 2 + 1).min(bins);
        let votes = labels[lo..hi].iter().filter(|&&l| predicate(l)).count();
        let needed = VOTE_MAJORITY.min(hi - lo);
        if votes >= needed {
            extent = bin + 1;
        } else {
            break;
        }
    }
    extent
}

/// Length in bins of the region anchored at Nyquist where `predicate`
/// keeps a windowed majority.
fn region_from_top(labels: &[BinLabel], bins: usize, predicate: fn(BinLabel) -> bool) -> usize {
    let mut extent = 0;
    for offset in 0..bins {
        let bin = bins - 1 - offset;
        let lo = bin.saturating_sub(VOTE_WINDOW / 2);
        let hi = (bin + VOTE_WINDOW / 2 + 1).min(bins);
        let votes = labels[lo..hi].iter().filter(|&&l| predicate(l)).count();
        let needed = VOTE_MAJORITY.min(hi - lo);
        if votes >= needed {
            extent = offset + 1;
        } else {
            break;
        }
    }
    extent
}

/// Median filter over the most recent boundary values.
#[derive(Debug)]
struct BoundaryFilter {
    values: Vec<f64>,
    write: usize,
    filled: usize,
    scratch: Vec<f64>,
}

impl BoundaryFilter {
    fn new(length: usize) -> Self {
        Self {
            values: vec![0.0; length],
            write: 0,
            filled: 0,
            scratch: Vec::with_capacity(length),
        }
    }

    fn push(&mut self, value: f64) -> f64 {
        self.values[self.write] = value;
        self.write = (self.write + 1) % self.values.len();
        self.filled = (self.filled + 1).min(self.values.len());
        self.scratch.clear();
        self.scratch.extend_from_slice(&self.values[..self.filled]);
        self.scratch
            .sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.scratch[self.scratch.len() / 2]
    }

    fn reset(&mut self) {
        self.values.fill(0.0);
        self.write = 0;
        self.filled = 0;
    }
}
