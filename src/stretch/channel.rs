//! Per-channel and per-scale working state.
//!
//! `ScaleData` holds what is shared across channels for one FFT size:
//! the windows, the FFT engine, and the guided phase-advance state.
//! `ChannelScaleData` holds one channel's buffers at that size, and
//! `ChannelData` gathers a channel's rings, classification state,
//! formant workspace, and mixdown buffers. Everything is sized at
//! construction; the processing loop never allocates.

use std::collections::BTreeMap;

use crate::analysis::{
    BinClassifier, BinLabel, BinSegmenter, ClassifierParameters, Guidance, GuideConfiguration,
    Segmentation, SegmenterParameters,
};
use crate::core::fft::Fft;
use crate::core::ring_buffer::RingBuffer;
use crate::core::window::{Window, WindowShape};

use super::calculator::MAX_OUTPUT_HOP;
use super::phase_advance::GuidedPhaseAdvance;

/// FFT sizes above this use Hann windows with a half-length synthesis
/// window; at or below, the asymmetric analysis/synthesis pair applies.
const ASYMMETRIC_WINDOW_MAX_FFT: usize = 2048;

/// One channel's buffers at one FFT size.
#[derive(Debug)]
pub(crate) struct ChannelScaleData {
    pub fft_size: usize,
    /// Windowed time-domain frame.
    pub time_domain: Vec<f64>,
    /// Spectrum halves, `fft_size/2 + 1` bins.
    pub real: Vec<f64>,
    pub imag: Vec<f64>,
    pub mag: Vec<f64>,
    pub phase: Vec<f64>,
    /// Magnitudes of the previous synthesised frame.
    pub prev_mag: Vec<f64>,
    /// Output phases from the guided advance.
    pub advanced_phase: Vec<f64>,
    /// Energy withheld between a pre-kick frame and its kick.
    pub pending_kick: Vec<f64>,
    /// Overlap-add accumulator, as long as the longest FFT.
    pub accumulator: Vec<f64>,
    pub accumulator_fill: usize,
}

impl ChannelScaleData {
    pub fn new(fft_size: usize, longest_fft_size: usize) -> Self {
        let bins = fft_size / 2 + 1;
        Self {
            fft_size,
            time_domain: vec![0.0; fft_size],
            real: vec![0.0; bins],
            imag: vec![0.0; bins],
            mag: vec![0.0; bins],
            phase: vec![0.0; bins],
            prev_mag: vec![0.0; bins],
            advanced_phase: vec![0.0; bins],
            pending_kick: vec![0.0; bins],
            accumulator: vec![0.0; longest_fft_size],
            accumulator_fill: 0,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2 + 1
    }

    pub fn reset(&mut self) {
        self.time_domain.fill(0.0);
        self.real.fill(0.0);
        self.imag.fill(0.0);
        self.mag.fill(0.0);
        self.phase.fill(0.0);
        self.prev_mag.fill(0.0);
        self.advanced_phase.fill(0.0);
        self.pending_kick.fill(0.0);
        self.accumulator.fill(0.0);
        self.accumulator_fill = 0;
    }
}

/// Shared per-scale state: windows, FFT, and phase-advance.
#[derive(Debug)]
pub(crate) struct ScaleData {
    pub fft_size: usize,
    pub fft: Fft,
    pub analysis_window: Window,
    pub synthesis_window: Window,
    /// Sum of analysis×synthesis over the synthesis support; dividing
    /// the output hop by this normalizes overlap-add gain to unity.
    pub window_scale_factor: f64,
    pub guided: GuidedPhaseAdvance,
}

impl ScaleData {
    pub fn new(fft_size: usize, sample_rate: f64, channels: usize) -> Self {
        let analysis_window = Window::new(Self::analysis_shape(fft_size), fft_size);
        let synthesis_window = Window::new(
            Self::synthesis_shape(fft_size),
            Self::synthesis_length(fft_size),
        );

        let offset = (analysis_window.size() - synthesis_window.size()) / 2;
        let mut window_scale_factor = 0.0;
        for i in 0..synthesis_window.size() {
            window_scale_factor += analysis_window.value(i + offset) * synthesis_window.value(i);
        }

        Self {
            fft_size,
            fft: Fft::new(fft_size),
            analysis_window,
            synthesis_window,
            window_scale_factor,
            guided: GuidedPhaseAdvance::new(fft_size, sample_rate, channels),
        }
    }

    pub fn analysis_shape(fft_size: usize) -> WindowShape {
        if fft_size > ASYMMETRIC_WINDOW_MAX_FFT {
            WindowShape::Hann
        } else {
            WindowShape::NiemitaloForward
        }
    }

    pub fn synthesis_shape(fft_size: usize) -> WindowShape {
        if fft_size > ASYMMETRIC_WINDOW_MAX_FFT {
            WindowShape::Hann
        } else {
            WindowShape::NiemitaloReverse
        }
    }

    pub fn synthesis_length(fft_size: usize) -> usize {
        if fft_size > ASYMMETRIC_WINDOW_MAX_FFT {
            fft_size / 2
        } else {
            fft_size
        }
    }
}

/// Time-domain readahead at the classification scale, one input hop
/// ahead of the current frame, with its converted spectrum.
#[derive(Debug)]
pub(crate) struct ClassificationReadahead {
    pub time_domain: Vec<f64>,
    pub mag: Vec<f64>,
    pub phase: Vec<f64>,
}

impl ClassificationReadahead {
    pub fn new(fft_size: usize) -> Self {
        let bins = fft_size / 2 + 1;
        Self {
            time_domain: vec![0.0; fft_size],
            mag: vec![0.0; bins],
            phase: vec![0.0; bins],
        }
    }

    pub fn reset(&mut self) {
        self.time_domain.fill(0.0);
        self.mag.fill(0.0);
        self.phase.fill(0.0);
    }
}

/// Cepstral formant workspace for one channel.
#[derive(Debug)]
pub(crate) struct FormantData {
    pub fft_size: usize,
    pub cepstra: Vec<f64>,
    pub envelope: Vec<f64>,
    pub spare: Vec<f64>,
}

impl FormantData {
    pub fn new(fft_size: usize) -> Self {
        let bins = fft_size / 2 + 1;
        Self {
            fft_size,
            cepstra: vec![0.0; fft_size],
            envelope: vec![0.0; bins],
            spare: vec![0.0; bins],
        }
    }

    pub fn reset(&mut self) {
        self.cepstra.fill(0.0);
        self.envelope.fill(0.0);
        self.spare.fill(0.0);
    }

    /// Linearly interpolated envelope lookup; out-of-range positions
    /// clamp to the nearest endpoint.
    pub fn envelope_at(&self, position: f64) -> f64 {
        if self.envelope.is_empty() {
            return 0.0;
        }
        let last = self.envelope.len() - 1;
        if position <= 0.0 {
            return self.envelope[0];
        }
        if position >= last as f64 {
            return self.envelope[last];
        }
        let idx = position.floor() as usize;
        let frac = position - idx as f64;
        self.envelope[idx] * (1.0 - frac) + self.envelope[idx + 1] * frac
    }
}

/// Everything owned by one audio channel.
#[derive(Debug)]
pub(crate) struct ChannelData {
    pub inbuf: RingBuffer<f32>,
    pub outbuf: RingBuffer<f32>,
    pub scales: BTreeMap<usize, ChannelScaleData>,
    pub readahead: ClassificationReadahead,
    pub have_readahead: bool,
    pub classifier: BinClassifier,
    pub segmenter: BinSegmenter,
    pub classification: Vec<BinLabel>,
    pub next_classification: Vec<BinLabel>,
    pub prev_segmentation: Segmentation,
    pub segmentation: Segmentation,
    pub next_segmentation: Segmentation,
    pub guidance: Guidance,
    pub formant: FormantData,
    /// f32 staging for ring-buffer peeks.
    pub peek_scratch: Vec<f32>,
    /// Unwindowed longest frame all scales cut from.
    pub frame: Vec<f64>,
    pub mixdown: Vec<f32>,
    pub resampled: Vec<f32>,
}

impl ChannelData {
    pub fn new(
        configuration: &GuideConfiguration,
        classification_bins: usize,
        sample_rate: f64,
        in_ring_size: usize,
        out_ring_size: usize,
    ) -> Self {
        let longest = configuration.longest_fft_size;
        let classify = configuration.classification_fft_size;

        let mut scales = BTreeMap::new();
        for limit in &configuration.band_limits {
            scales.insert(limit.fft_size, ChannelScaleData::new(limit.fft_size, longest));
        }

        Self {
            inbuf: RingBuffer::new(in_ring_size),
            outbuf: RingBuffer::new(out_ring_size),
            scales,
            readahead: ClassificationReadahead::new(classify),
            have_readahead: false,
            classifier: BinClassifier::new(ClassifierParameters::new(classification_bins)),
            segmenter: BinSegmenter::new(SegmenterParameters::new(
                classify,
                classification_bins,
                sample_rate,
            )),
            classification: vec![BinLabel::default(); classification_bins],
            next_classification: vec![BinLabel::default(); classification_bins],
            prev_segmentation: Segmentation::default(),
            segmentation: Segmentation::default(),
            next_segmentation: Segmentation::default(),
            guidance: Guidance::default(),
            formant: FormantData::new(longest),
            peek_scratch: vec![0.0; longest],
            frame: vec![0.0; longest],
            mixdown: vec![0.0; MAX_OUTPUT_HOP as usize],
            resampled: vec![0.0; longest * 4],
        }
    }

    pub fn reset(&mut self) {
        self.inbuf.clear();
        self.outbuf.clear();
        for scale in self.scales.values_mut() {
            scale.reset();
        }
        self.readahead.reset();
        self.have_readahead = false;
        self.classifier.reset();
        self.segmenter.reset();
        self.classification.fill(BinLabel::default());
        self.next_classification.fill(BinLabel::default());
        self.prev_segmentation = Segmentation::default();
        self.segmentation = Segmentation::default();
        self.next_segmentation = Segmentation::default();
        self.guidance = Guidance::default();
        self.formant.reset();
        self.peek_scratch.fill(0.0);
        self.frame.fill(0.0);
        self.mixdown.fill(0.0);
        self.resampled.fill(0.0);
    }
}
