//! Per-bin spectral classification.
//!
//! Each classification-scale bin is labelled by comparing its magnitude
//! against a horizontal (time) median and a vertical (frequency) median:
//! energy that suddenly exceeds its own recent history is percussive,
//! energy that stands clear of its spectral neighbourhood is harmonic.

/// Spectral category of a single bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinLabel {
    /// Below the silence floor.
    Silent,
    /// Neither clearly tonal nor clearly transient.
    #[default]
    Residual,
    /// Stable narrow-band energy.
    Harmonic,
    /// Sudden broadband energy rise.
    Percussive,
}

/// Magnitudes below this are silent. Magnitudes here are already
/// normalized by FFT size, so full-scale tones sit well above this.
const SILENCE_FLOOR: f64 = 1.0e-8;

/// Classifier tuning.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierParameters {
    /// Number of bins to classify.
    pub bin_count: usize,
    /// Frames of magnitude history for the time median.
    pub horizontal_filter_length: usize,
    /// Bins each side of centre for the frequency median.
    pub vertical_filter_length: usize,
    /// Ratio over the frequency median that marks a bin harmonic.
    pub harmonic_threshold: f64,
    /// Ratio over the time median that marks a bin percussive.
    pub percussive_threshold: f64,
}

impl ClassifierParameters {
    pub fn new(bin_count: usize) -> Self {
        Self {
            bin_count,
            horizontal_filter_length: 9,
            vertical_filter_length: 10,
            harmonic_threshold: 2.0,
            percussive_threshold: 2.0,
        }
    }
}

/// Stateful per-channel bin classifier.
#[derive(Debug)]
pub struct BinClassifier {
    parameters: ClassifierParameters,
    /// Ring of past magnitude frames, `horizontal_filter_length` rows.
    history: Vec<Vec<f64>>,
    write_row: usize,
    filled: usize,
    median_scratch: Vec<f64>,
}

impl BinClassifier {
    pub fn new(parameters: ClassifierParameters) -> Self {
        let rows = parameters.horizontal_filter_length.max(1);
        Self {
            parameters,
            history: (0..rows).map(|_| vec![0.0; parameters.bin_count]).collect(),
            write_row: 0,
            filled: 0,
            median_scratch: Vec::with_capacity(
                rows.max(2 * parameters.vertical_filter_length + 1),
            ),
        }
    }

    /// Classifies one frame of magnitudes into `labels`.
    ///
    /// The history the time median sees lags the current frame by one,
    /// so a rising attack registers against its past rather than itself.
    pub fn classify(&mut self, magnitudes: &[f64], labels: &mut [BinLabel]) {
        let bins = self
            .parameters
            .bin_count
            .min(magnitudes.len())
            .min(labels.len());
        let vertical_half = self.parameters.vertical_filter_length / 2;

        for bin in 0..bins {
            let mag = magnitudes[bin];
            if mag < SILENCE_FLOOR {
                labels[bin] = BinLabel::Silent;
                continue;
            }

            let horizontal = self.horizontal_median(bin);
            if self.filled > 0 && mag > self.parameters.percussive_threshold * horizontal {
                labels[bin] = BinLabel::Percussive;
                continue;
            }

            let lo = bin.saturating_sub(vertical_half);
            let hi = (bin + vertical_half + 1).min(bins);
            let vertical = self.median_of(&magnitudes[lo..hi]);
            if mag > self.parameters.harmonic_threshold * vertical {
                labels[bin] = BinLabel::Harmonic;
            } else {
                labels[bin] = BinLabel::Residual;
            }
        }
        for label in labels.iter_mut().skip(bins) {
            *label = BinLabel::Silent;
        }

        self.history[self.write_row][..bins].copy_from_slice(&magnitudes[..bins]);
        self.write_row = (self.write_row + 1) % self.history.len();
        self.filled = (self.filled + 1).min(self.history.len());
    }

    /// Clears the magnitude history.
    pub fn reset(&mut self) {
        for row in &mut self.history {
            row.fill(0.0);
        }
        self.write_row = 0;
        self.filled = 0;
    }

    fn horizontal_median(&mut self, bin: usize) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.median_scratch.clear();
        for row in 0..self.filled {
            self.median_scratch.push(self.history[row][bin]);
        }
        median_in_place(&mut self.median_scratch)
    }

    fn median_of(&mut self, values: &[f64]) -> f64 {
        self.median_scratch.clear();
        self.median_scratch.extend_from_slice(values);
        median_in_place(&mut self.median_scratch)
    }
}

fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values[values.len() / 2]
}
