//! Window functions for spectral analysis and resynthesis.
//!
//! Provides the periodic Hann window used at the longer FFT sizes and an
//! asymmetric forward/reverse pair used at the shorter ones. The reverse
//! shape is always generated by time-reversing the forward shape; the two
//! are designed as a pair and the overlap-add normalization relies on
//! their product, so the reverse window must never be replaced with an
//! independent taper.

use std::f64::consts::PI;

/// Warp exponent for the asymmetric window pair. Values above 1.0 push
/// the forward window's peak past the midpoint, which after reversal
/// gives the synthesis window a fast attack and keeps pre-echo ahead of
/// transients short.
const ASYMMETRIC_WARP: f64 = 1.3;

/// Window shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowShape {
    /// Periodic Hann.
    Hann,
    /// Forward-asymmetric analysis window (Niemitalo-style pair).
    NiemitaloForward,
    /// Time-reversed counterpart of [`WindowShape::NiemitaloForward`].
    NiemitaloReverse,
}

/// A precomputed window of a given shape and length.
#[derive(Debug, Clone)]
pub struct Window {
    shape: WindowShape,
    data: Vec<f64>,
    value_sum: f64,
}

impl Window {
    /// Creates a window of the given shape and length.
    pub fn new(shape: WindowShape, size: usize) -> Self {
        let data = match shape {
            WindowShape::Hann => hann(size),
            WindowShape::NiemitaloForward => asymmetric_forward(size),
            WindowShape::NiemitaloReverse => {
                let mut w = asymmetric_forward(size);
                w.reverse();
                w
            }
        };
        let value_sum = data.iter().sum();
        Self {
            shape,
            data,
            value_sum,
        }
    }

    /// Returns the window length.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns the shape this window was built from.
    #[inline]
    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    /// Returns the sum of the window samples.
    #[inline]
    pub fn value_sum(&self) -> f64 {
        self.value_sum
    }

    /// Returns the window sample at index `i`.
    #[inline]
    pub fn value(&self, i: usize) -> f64 {
        self.data[i]
    }

    /// Windows `input` into `output`.
    #[inline]
    pub fn cut(&self, input: &[f64], output: &mut [f64]) {
        for ((out, &sample), &w) in output.iter_mut().zip(input).zip(&self.data) {
            *out = sample * w;
        }
    }

    /// Windows `buffer` in place.
    #[inline]
    pub fn cut_in_place(&self, buffer: &mut [f64]) {
        for (sample, &w) in buffer.iter_mut().zip(&self.data) {
            *sample *= w;
        }
    }

    /// Windows `input` and adds the result into `output`.
    #[inline]
    pub fn cut_and_add(&self, input: &[f64], output: &mut [f64]) {
        for ((out, &sample), &w) in output.iter_mut().zip(input).zip(&self.data) {
            *out += sample * w;
        }
    }
}

/// Periodic Hann window (zero at index 0, period equal to the length).
fn hann(size: usize) -> Vec<f64> {
    if size == 0 {
        return vec![];
    }
    let n = size as f64;
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / n).cos()))
        .collect()
}

/// Forward-asymmetric window: a raised cosine on a warped time axis.
/// The warp keeps both ends at zero with quadratic tangency, so the
/// spectral sidelobe decay matches the Hann family.
fn asymmetric_forward(size: usize) -> Vec<f64> {
    if size == 0 {
        return vec![];
    }
    let n = size as f64;
    (0..size)
        .map(|i| {
            let x = (i as f64 / n).powf(ASYMMETRIC_WARP);
            let s = (PI * x).sin();
            s * s
        })
        .collect()
}
