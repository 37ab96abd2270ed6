//! Real-signal FFT built on `rustfft`, with the cepstral transform used
//! for formant analysis.
//!
//! The inverse transforms are unnormalized: the engine folds the 1/N
//! factor into its magnitude scaling at analysis time, so applying it
//! here as well would double-normalize.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::sync::Arc;

/// Zero-valued complex number, used for FFT buffer initialization.
pub const COMPLEX_ZERO: Complex<f64> = Complex::new(0.0, 0.0);

/// Magnitude floor applied before taking logs in the cepstral transform.
const CEPSTRUM_FLOOR: f64 = 1e-12;

/// Fixed-size FFT engine with cached plans and reusable scratch.
pub struct Fft {
    size: usize,
    forward: Arc<dyn rustfft::Fft<f64>>,
    inverse: Arc<dyn rustfft::Fft<f64>>,
    buffer: Vec<Complex<f64>>,
}

impl Fft {
    /// Creates an FFT engine for transforms of length `size`.
    ///
    /// `size` must be even; the engine only ever uses power-of-two sizes.
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            size,
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
            buffer: vec![COMPLEX_ZERO; size],
        }
    }

    /// Returns the transform length.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Forward transform of a real signal.
    ///
    /// Writes the non-negative-frequency spectrum into `real` and `imag`
    /// (`size/2 + 1` bins each).
    pub fn forward(&mut self, time: &[f64], real: &mut [f64], imag: &mut [f64]) {
        for (slot, &sample) in self.buffer.iter_mut().zip(time) {
            *slot = Complex::new(sample, 0.0);
        }
        self.forward.process(&mut self.buffer);
        let bins = self.size / 2 + 1;
        for i in 0..bins {
            real[i] = self.buffer[i].re;
            imag[i] = self.buffer[i].im;
        }
    }

    /// Inverse transform from a half spectrum back to a real signal.
    ///
    /// The negative frequencies are reconstructed by conjugate symmetry.
    /// The output is unnormalized (scaled by `size` relative to the
    /// original signal).
    pub fn inverse(&mut self, real: &[f64], imag: &[f64], time: &mut [f64]) {
        let bins = self.size / 2 + 1;
        for i in 0..bins {
            self.buffer[i] = Complex::new(real[i], imag[i]);
        }
        for i in 1..bins - 1 {
            self.buffer[self.size - i] = self.buffer[i].conj();
        }
        self.inverse.process(&mut self.buffer);
        for (out, slot) in time.iter_mut().zip(&self.buffer) {
            *out = slot.re;
        }
    }

    /// Real cepstrum of a magnitude spectrum.
    ///
    /// Takes logs of the `size/2 + 1` magnitudes (floored to avoid
    /// log-of-zero), mirrors them, and inverse-transforms. The output is
    /// the unnormalized real cepstrum of length `size`; the caller owns
    /// the 1/size factor.
    pub fn inverse_cepstral(&mut self, magnitudes: &[f64], cepstrum: &mut [f64]) {
        let bins = self.size / 2 + 1;
        for i in 0..bins {
            let log_mag = magnitudes[i].max(CEPSTRUM_FLOOR).ln();
            self.buffer[i] = Complex::new(log_mag, 0.0);
        }
        for i in 1..bins - 1 {
            self.buffer[self.size - i] = self.buffer[i];
        }
        self.inverse.process(&mut self.buffer);
        for (out, slot) in cepstrum.iter_mut().zip(&self.buffer) {
            *out = slot.re;
        }
    }
}

impl std::fmt::Debug for Fft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft").field("size", &self.size).finish()
    }
}

/// Rotates a time-domain frame by half its length, aligning the window
/// centre with the transform origin so phases are measured from the
/// frame centre.
pub fn fft_shift(buffer: &mut [f64]) {
    let half = buffer.len() / 2;
    for i in 0..half {
        buffer.swap(i, i + half);
    }
}
