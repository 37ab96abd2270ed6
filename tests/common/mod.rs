// Shared helpers; each integration test uses its own subset.
#![allow(dead_code)]

use std::f32::consts::PI;

use pitchstretch::Stretcher;

/// Generates a mono sine wave.
pub fn sine(freq: f32, sample_rate: u32, amplitude: f32, num_samples: usize) -> Vec<f32> {
    (0..num_samples)
        .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// Generates deterministic white noise in [-1, 1) via xorshift.
pub fn white_noise(num_samples: usize, mut seed: u32) -> Vec<f32> {
    (0..num_samples)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect()
}

/// Generates an impulse train with one unit impulse every `period`
/// samples.
pub fn impulse_train(period: usize, num_samples: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; num_samples];
    for i in (0..num_samples).step_by(period.max(1)) {
        out[i] = 1.0;
    }
    out
}

/// Root-mean-square level of a signal.
pub fn rms(signal: &[f32]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    (signal.iter().map(|&x| x as f64 * x as f64).sum::<f64>() / signal.len() as f64).sqrt()
}

/// Signal energy at one frequency via a single-bin DFT.
pub fn spectral_energy_at(signal: &[f32], sample_rate: u32, freq: f32) -> f64 {
    let n = signal.len();
    if n == 0 {
        return 0.0;
    }
    let mut real = 0.0f64;
    let mut imag = 0.0f64;
    for (i, &s) in signal.iter().enumerate() {
        let angle = 2.0 * std::f64::consts::PI * freq as f64 * i as f64 / sample_rate as f64;
        real += s as f64 * angle.cos();
        imag += s as f64 * angle.sin();
    }
    ((real * real + imag * imag) / n as f64).sqrt()
}

/// Drains every available output sample, per channel.
pub fn drain(stretcher: &mut Stretcher, channels: usize) -> Vec<Vec<f32>> {
    let mut output = vec![Vec::new(); channels];
    let mut blocks = vec![vec![0.0f32; 4096]; channels];
    loop {
        match stretcher.available() {
            None => break,
            Some(0) => break,
            Some(available) => {
                let take = available.min(4096);
                let mut refs: Vec<&mut [f32]> = blocks
                    .iter_mut()
                    .map(|block| &mut block[..take])
                    .collect();
                let got = stretcher.retrieve(&mut refs);
                if got == 0 {
                    break;
                }
                for (out, block) in output.iter_mut().zip(&blocks) {
                    out.extend_from_slice(&block[..got]);
                }
            }
        }
    }
    output
}
