//! The streaming phase-vocoder engine.
//!
//! A `Stretcher` owns per-channel ring buffers and spectral state at
//! three FFT sizes, and couples an input-rate hop to an output-rate hop
//! through the time ratio. Each frame: multi-scale windowed analysis
//! with a one-hop classification readahead, per-bin classification and
//! segmentation, guidance, guided phase advance synchronized across
//! channels, transient deferral, optional formant adjustment,
//! per-scale resynthesis into overlap-add accumulators, mixdown, and an
//! optional resampling stage for pitch shifts.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use atomic_float::AtomicF64;

use crate::analysis::{bin_for_frequency, Guide, GuideConfiguration};
use crate::core::fft::fft_shift;
use crate::core::log::Log;
use crate::core::resample::{ResampleQuality, Resampler, ResamplerConfig};
use crate::core::types::{ChannelOption, FormantOption, Parameters, PitchOption};
use crate::error::StretchError;

use super::calculator::{proposed_output_hop, StretchCalculator, MAX_INPUT_HOP};
use super::channel::{ChannelData, ScaleData};

/// Bin classification stops at this frequency.
const MAX_CLASSIFIER_FREQUENCY: f64 = 16000.0;
/// Effective ratios within this of 1.0 count as unity.
const UNITY_RATIO_EPSILON: f64 = 1.0e-7;
/// The cepstral lifter keeps quefrencies below sampleRate divided by
/// this, separating envelope from harmonic fine structure.
const FORMANT_CUTOFF_DIVISOR: f64 = 650.0;
/// Formant magnitude correction is clamped into
/// [1/FORMANT_MAX_RATIO, FORMANT_MAX_RATIO].
const FORMANT_MAX_RATIO: f64 = 60.0;
/// Upper clamp for the spectral envelope.
const ENVELOPE_CLAMP: f64 = 1.0e10;
/// Formant adjustment stops at this frequency.
const FORMANT_TOP_FREQUENCY: f64 = 10000.0;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessMode {
    JustCreated = 0,
    Studying = 1,
    Processing = 2,
    Finished = 3,
}

/// Phase-vocoder time stretcher and pitch shifter.
///
/// Constructed over fixed parameters; the time ratio, pitch scale, and
/// formant scale are stored in lock-free atomics so that in realtime
/// mode a control thread may adjust them while the audio thread
/// processes.
pub struct Stretcher {
    parameters: Parameters,
    log: Log,
    time_ratio: AtomicF64,
    pitch_scale: AtomicF64,
    formant_scale: AtomicF64,
    inhop: AtomicUsize,
    mode: AtomicU8,
    guide: Guide,
    configuration: GuideConfiguration,
    channel_data: Vec<ChannelData>,
    scale_data: BTreeMap<usize, ScaleData>,
    calculator: StretchCalculator,
    resampler: Option<Resampler>,
    key_frame_map: BTreeMap<usize, usize>,
    prev_inhop: usize,
    prev_outhop: usize,
    unity_count: usize,
    start_skip: usize,
    study_input_duration: usize,
    supplied_input_duration: usize,
    total_target_duration: usize,
    consumed_input_duration: usize,
    last_key_frame_surpassed: usize,
    total_output_duration: usize,
    /// Realtime only: sum of input advances times the ratio in force,
    /// bounding the drain after the final chunk.
    expected_output_duration: f64,
}

impl Stretcher {
    /// Creates a stretcher with the default log sink.
    pub fn new(parameters: Parameters) -> Result<Self, StretchError> {
        Self::with_log(parameters, Log::new())
    }

    /// Creates a stretcher reporting diagnostics to `log`.
    pub fn with_log(parameters: Parameters, log: Log) -> Result<Self, StretchError> {
        if parameters.sample_rate == 0 {
            return Err(StretchError::InvalidSampleRate(parameters.sample_rate));
        }
        if parameters.channels == 0 {
            return Err(StretchError::InvalidChannelCount(parameters.channels));
        }

        let sample_rate = parameters.sample_rate as f64;
        let guide = Guide::new(sample_rate, log.clone());
        let configuration = guide.configuration().clone();
        let longest = configuration.longest_fft_size;
        let classify = configuration.classification_fft_size;

        let max_classifier_frequency = MAX_CLASSIFIER_FREQUENCY.min(sample_rate / 2.0);
        let classification_bins =
            (classify as f64 * max_classifier_frequency / sample_rate).floor() as usize;

        let in_ring_size = longest * 2;
        let out_ring_size = longest * 16;

        let channel_data = (0..parameters.channels)
            .map(|_| {
                ChannelData::new(
                    &configuration,
                    classification_bins,
                    sample_rate,
                    in_ring_size,
                    out_ring_size,
                )
            })
            .collect();

        let mut scale_data = BTreeMap::new();
        for limit in &configuration.band_limits {
            scale_data.insert(
                limit.fft_size,
                ScaleData::new(limit.fft_size, sample_rate, parameters.channels),
            );
        }

        let mut stretcher = Self {
            parameters,
            calculator: StretchCalculator::new(log.clone()),
            log,
            time_ratio: AtomicF64::new(1.0),
            pitch_scale: AtomicF64::new(1.0),
            formant_scale: AtomicF64::new(0.0),
            inhop: AtomicUsize::new(1),
            mode: AtomicU8::new(ProcessMode::JustCreated as u8),
            guide,
            configuration,
            channel_data,
            scale_data,
            resampler: None,
            key_frame_map: BTreeMap::new(),
            prev_inhop: 1,
            prev_outhop: 1,
            unity_count: 0,
            start_skip: 0,
            study_input_duration: 0,
            supplied_input_duration: 0,
            total_target_duration: 0,
            consumed_input_duration: 0,
            last_key_frame_surpassed: 0,
            total_output_duration: 0,
            expected_output_duration: 0.0,
        };

        if stretcher.parameters.options.is_realtime() {
            stretcher.create_resampler();
        }

        stretcher.calculate_hop();
        stretcher.prev_inhop = stretcher.inhop.load(Ordering::Relaxed);
        stretcher.prev_outhop =
            (stretcher.prev_inhop as f64 * stretcher.effective_ratio()).round() as usize;

        if !cfg!(target_has_atomic = "64") {
            stretcher
                .log
                .warn("platform lacks lock-free 64-bit atomics for ratio control", &[]);
        }

        Ok(stretcher)
    }

    /// Number of channels this stretcher processes.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.parameters.channels
    }

    #[inline]
    pub fn time_ratio(&self) -> f64 {
        self.time_ratio.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn pitch_scale(&self) -> f64 {
        self.pitch_scale.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn formant_scale(&self) -> f64 {
        self.formant_scale.load(Ordering::Relaxed)
    }

    /// Sets the duration scaling factor: 2.0 doubles the duration.
    ///
    /// In offline mode this is rejected once studying or processing has
    /// begun; in realtime mode it may be called from a control thread at
    /// any time.
    pub fn set_time_ratio(&self, ratio: f64) {
        if !(ratio > 0.0) {
            self.log.warn("set_time_ratio: ratio must be positive", &[ratio]);
            return;
        }
        if !self.is_realtime()
            && matches!(
                self.mode(),
                ProcessMode::Studying | ProcessMode::Processing
            )
        {
            self.log.warn(
                "set_time_ratio: cannot set time ratio while studying or processing in offline mode",
                &[],
            );
            return;
        }
        if ratio == self.time_ratio.load(Ordering::Relaxed) {
            return;
        }
        self.time_ratio.store(ratio, Ordering::Relaxed);
        self.calculate_hop();
    }

    /// Sets the pitch scaling factor: 2.0 shifts up an octave.
    pub fn set_pitch_scale(&self, scale: f64) {
        if !(scale > 0.0) {
            self.log.warn("set_pitch_scale: scale must be positive", &[scale]);
            return;
        }
        if !self.is_realtime()
            && matches!(
                self.mode(),
                ProcessMode::Studying | ProcessMode::Processing
            )
        {
            self.log.warn(
                "set_pitch_scale: cannot set pitch scale while studying or processing in offline mode",
                &[],
            );
            return;
        }
        if scale == self.pitch_scale.load(Ordering::Relaxed) {
            return;
        }
        self.pitch_scale.store(scale, Ordering::Relaxed);
        self.calculate_hop();
    }

    /// Sets the formant scaling factor; 0.0 derives it from the pitch
    /// scale so formants stay put during pitch shifts.
    pub fn set_formant_scale(&self, scale: f64) {
        if !self.is_realtime()
            && matches!(
                self.mode(),
                ProcessMode::Studying | ProcessMode::Processing
            )
        {
            self.log.warn(
                "set_formant_scale: cannot set formant scale while studying or processing in offline mode",
                &[],
            );
            return;
        }
        self.formant_scale.store(scale, Ordering::Relaxed);
    }

    /// Switches between shifted and preserved formants.
    pub fn set_formant_option(&mut self, option: FormantOption) {
        self.parameters.options.formant = option;
    }

    /// Pitch options are fixed at construction in this engine.
    pub fn set_pitch_option(&mut self, _option: PitchOption) {
        self.log.warn(
            "set_pitch_option: pitch option changes after construction are not supported",
            &[],
        );
    }

    /// Installs the offline key-frame map: an ordered input-sample to
    /// output-sample mapping defining piecewise time ratios.
    pub fn set_key_frame_map(&mut self, map: BTreeMap<usize, usize>) {
        if self.is_realtime() {
            self.log
                .warn("set_key_frame_map: not available in realtime mode", &[]);
            return;
        }
        if matches!(self.mode(), ProcessMode::Processing | ProcessMode::Finished) {
            self.log.warn(
                "set_key_frame_map: cannot set a key frame map after processing has begun",
                &[],
            );
            return;
        }
        self.key_frame_map = map;
    }

    /// Declares the total input duration ahead of offline processing, as
    /// an alternative to a study pass.
    pub fn set_expected_input_duration(&mut self, samples: usize) {
        self.supplied_input_duration = samples;
    }

    /// Grows the input buffers for process blocks of up to `n` samples.
    pub fn set_max_process_size(&mut self, n: usize) {
        let old_size = self.channel_data[0].inbuf.size();
        let new_size = self.configuration.longest_fft_size + n;
        if new_size > old_size {
            self.log.info(
                "set_max_process_size: resizing input buffers",
                &[old_size as f64, new_size as f64],
            );
            for cd in &mut self.channel_data {
                cd.inbuf = cd.inbuf.resized(new_size);
            }
        } else {
            self.log.info(
                "set_max_process_size: nothing to do",
                &[old_size as f64, new_size as f64],
            );
        }
    }

    /// Accumulates input duration during the offline study pass. The
    /// sample data itself is not inspected.
    pub fn study(&mut self, input: &[&[f32]], _final_chunk: bool) {
        if self.is_realtime() {
            self.log.warn("study: not meaningful in realtime mode", &[]);
            return;
        }
        if matches!(self.mode(), ProcessMode::Processing | ProcessMode::Finished) {
            self.log.warn("study: cannot study after processing", &[]);
            return;
        }
        if self.mode() == ProcessMode::JustCreated {
            self.study_input_duration = 0;
        }
        self.set_mode(ProcessMode::Studying);
        let samples = input.first().map(|channel| channel.len()).unwrap_or(0);
        self.study_input_duration += samples;
    }

    /// Feeds one block of input, one slice per channel; `final_chunk`
    /// marks the end of the stream and switches the engine to draining.
    pub fn process(&mut self, input: &[&[f32]], final_chunk: bool) {
        if self.mode() == ProcessMode::Finished {
            self.log
                .warn("process: cannot process again after the final chunk", &[]);
            return;
        }
        if input.len() < self.parameters.channels {
            self.log.warn(
                "process: too few channel slices",
                &[input.len() as f64, self.parameters.channels as f64],
            );
            return;
        }
        let samples = input[..self.parameters.channels]
            .iter()
            .map(|channel| channel.len())
            .min()
            .unwrap_or(0);

        if !self.is_realtime() {
            let time_ratio = self.time_ratio();
            match self.mode() {
                ProcessMode::Studying => {
                    self.total_target_duration = self.target_for(self.study_input_duration, time_ratio);
                    self.log.info(
                        "study duration and target duration",
                        &[
                            self.study_input_duration as f64,
                            self.total_target_duration as f64,
                        ],
                    );
                }
                ProcessMode::JustCreated => {
                    if self.supplied_input_duration != 0 {
                        self.total_target_duration =
                            self.target_for(self.supplied_input_duration, time_ratio);
                        self.log.info(
                            "supplied duration and target duration",
                            &[
                                self.supplied_input_duration as f64,
                                self.total_target_duration as f64,
                            ],
                        );
                    }
                }
                _ => {}
            }

            // Checked every round: the ratio switches as key frames are
            // surpassed. Must follow the target calculation above (which
            // uses the global ratio) and precede any other ratio use.
            if !self.key_frame_map.is_empty() {
                self.update_ratio_from_map();
            }

            if matches!(
                self.mode(),
                ProcessMode::JustCreated | ProcessMode::Studying
            ) {
                if self.pitch_scale() != 1.0 && self.resampler.is_none() {
                    self.create_resampler();
                }
                // Pad to half the longest frame so the first analysis
                // frame centres on the first input sample. Realtime mode
                // skips this: better a swoosh than more latency.
                let pad = self.configuration.longest_fft_size / 2;
                self.log.info("offline mode: prefilling with", &[pad as f64]);
                for cd in &mut self.channel_data {
                    cd.inbuf.zero(pad);
                }
                self.start_skip = (pad as f64 / self.pitch_scale()).round() as usize;
                self.log.info("start skip is", &[self.start_skip as f64]);
            }
        }

        if final_chunk {
            // Draining and finished are the same state internally; the
            // distinction only affects what available() reports once the
            // output buffer empties.
            self.set_mode(ProcessMode::Finished);
        } else {
            self.set_mode(ProcessMode::Processing);
        }

        let write_space = self.channel_data[0].inbuf.write_space();
        if samples > write_space {
            self.log.warn(
                "process: forced to grow input buffer; set_max_process_size was not called or retrieve is lagging",
                &[write_space as f64, samples as f64],
            );
            let new_size = self.channel_data[0].inbuf.size() - write_space + samples;
            for cd in &mut self.channel_data {
                cd.inbuf = cd.inbuf.resized(new_size);
            }
        }

        for (cd, channel) in self.channel_data.iter_mut().zip(input) {
            cd.inbuf.write(&channel[..samples]);
        }

        self.consume();
    }

    /// Returns the samples ready to retrieve, or `None` once the final
    /// chunk has been processed and the output is fully drained.
    pub fn available(&self) -> Option<usize> {
        let available = self.channel_data[0].outbuf.read_space();
        if available == 0 && self.mode() == ProcessMode::Finished {
            None
        } else {
            Some(available)
        }
    }

    /// Reads processed output, one slice per channel, returning the
    /// number of samples written to each. Frees output space, so more of
    /// the stream is processed before returning.
    pub fn retrieve(&mut self, output: &mut [&mut [f32]]) -> usize {
        let channels = self.parameters.channels.min(output.len());
        let mut got = output
            .iter()
            .take(channels)
            .map(|channel| channel.len())
            .min()
            .unwrap_or(0);

        for (c, channel) in output.iter_mut().take(channels).enumerate() {
            let got_here = self.channel_data[c].outbuf.read(&mut channel[..got]);
            if got_here < got {
                if c > 0 {
                    self.log
                        .warn("retrieve: channel imbalance detected", &[c as f64]);
                }
                got = got_here;
            }
        }

        if matches!(self.mode(), ProcessMode::Processing | ProcessMode::Finished) {
            self.consume();
        }
        got
    }

    /// Returns how many more input samples must arrive before more
    /// output can be produced; 0 whenever output is already available.
    pub fn samples_required(&self) -> usize {
        if self.available() != Some(0) {
            return 0;
        }
        let longest = self.configuration.longest_fft_size;
        let read_space = self.channel_data[0].inbuf.read_space();
        longest.saturating_sub(read_space)
    }

    /// Recommended zero padding ahead of the first realtime block.
    pub fn preferred_start_pad(&self) -> usize {
        if self.is_realtime() {
            self.configuration.longest_fft_size / 2
        } else {
            0
        }
    }

    /// Output samples of ramp-in latency to drop in realtime mode.
    pub fn start_delay(&self) -> usize {
        if self.is_realtime() {
            let factor = 0.5 / self.pitch_scale();
            (self.configuration.longest_fft_size as f64 * factor).ceil() as usize
        } else {
            0
        }
    }

    /// Returns the engine to its just-created state.
    pub fn reset(&mut self) {
        self.calculator.reset();
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
        for scale in self.scale_data.values_mut() {
            scale.guided.reset();
        }
        for cd in &mut self.channel_data {
            cd.reset();
        }

        self.prev_inhop = self.inhop.load(Ordering::Relaxed);
        self.prev_outhop = (self.prev_inhop as f64 * self.effective_ratio()).round() as usize;

        self.unity_count = 0;
        self.start_skip = 0;
        self.study_input_duration = 0;
        self.supplied_input_duration = 0;
        self.total_target_duration = 0;
        self.consumed_input_duration = 0;
        self.last_key_frame_surpassed = 0;
        self.total_output_duration = 0;
        self.expected_output_duration = 0.0;
        self.key_frame_map.clear();
        self.set_mode(ProcessMode::JustCreated);
    }

    // ---- internals ----

    #[inline]
    fn is_realtime(&self) -> bool {
        self.parameters.options.is_realtime()
    }

    #[inline]
    fn mode(&self) -> ProcessMode {
        match self.mode.load(Ordering::Relaxed) {
            0 => ProcessMode::JustCreated,
            1 => ProcessMode::Studying,
            2 => ProcessMode::Processing,
            _ => ProcessMode::Finished,
        }
    }

    #[inline]
    fn set_mode(&self, mode: ProcessMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    #[inline]
    fn effective_ratio(&self) -> f64 {
        self.time_ratio() * self.pitch_scale()
    }

    fn create_resampler(&mut self) {
        let quality = match self.parameters.options.pitch {
            PitchOption::HighQuality => ResampleQuality::Best,
            _ => ResampleQuality::FastestTolerable,
        };
        self.resampler = Some(Resampler::new(ResamplerConfig {
            channels: self.parameters.channels,
            quality,
            smooth_ratio_changes: self.is_realtime(),
        }));
    }

    /// Picks the input hop from the effective ratio. Pacing is
    /// output-hop-first: the synthesis overlap fixes quality, so the
    /// output hop is proposed and the input hop derived from it.
    fn calculate_hop(&self) {
        let ratio = self.effective_ratio();
        let proposed = proposed_output_hop(ratio);
        self.log
            .info("calculate_hop: ratio and proposed outhop", &[ratio, proposed]);

        let mut inhop = proposed / ratio;
        if inhop < 1.0 {
            self.log.warn(
                "calculate_hop: extreme ratio yields ideal inhop < 1, results may be suspect",
                &[ratio, inhop],
            );
            inhop = 1.0;
        }
        if inhop > MAX_INPUT_HOP {
            self.log.warn(
                "calculate_hop: extreme ratio yields ideal inhop > 1024, results may be suspect",
                &[ratio, inhop],
            );
            inhop = MAX_INPUT_HOP;
        }

        self.inhop.store(inhop.floor() as usize, Ordering::Relaxed);
        self.log.info(
            "calculate_hop: inhop and mean outhop",
            &[inhop.floor(), inhop.floor() * ratio],
        );
    }

    /// Offline output target for a known input duration: the global
    /// ratio, or the key-frame map's piecewise projection when one is
    /// installed.
    fn target_for(&self, input_duration: usize, time_ratio: f64) -> usize {
        if self.key_frame_map.is_empty() {
            return (input_duration as f64 * time_ratio).round() as usize;
        }
        let mut prev_in = 0usize;
        let mut prev_out = 0usize;
        for (&key_in, &key_out) in &self.key_frame_map {
            if input_duration <= key_in && key_in > prev_in {
                let slope = (key_out.saturating_sub(prev_out)) as f64 / (key_in - prev_in) as f64;
                return prev_out + ((input_duration - prev_in) as f64 * slope).round() as usize;
            }
            prev_in = key_in;
            prev_out = key_out;
        }
        prev_out + ((input_duration.saturating_sub(prev_in)) as f64 * time_ratio).round() as usize
    }

    /// Switches the ratio as key frames are surpassed.
    fn update_ratio_from_map(&mut self) {
        if self.key_frame_map.is_empty() {
            return;
        }

        if self.consumed_input_duration == 0 {
            let mut entries = self.key_frame_map.iter();
            let Some((&in0, &out0)) = entries.next() else {
                return;
            };
            let ratio = if in0 > 0 {
                out0 as f64 / in0 as f64
            } else if let Some((&in1, &out1)) = entries.next() {
                // A map anchored at the origin takes its initial ratio
                // from the first span instead.
                if in1 > in0 {
                    (out1.saturating_sub(out0)) as f64 / (in1 - in0) as f64
                } else {
                    return;
                }
            } else {
                return;
            };
            if ratio > 0.0 {
                self.log.info("initial key-frame ratio", &[ratio]);
                self.time_ratio.store(ratio, Ordering::Relaxed);
                self.calculate_hop();
            }
            self.last_key_frame_surpassed = 0;
            return;
        }

        let pending = self
            .key_frame_map
            .range((Excluded(self.last_key_frame_surpassed), Unbounded))
            .next();
        let Some((&pending_in, &pending_out)) = pending else {
            return;
        };

        if self.consumed_input_duration < pending_in {
            return;
        }
        self.log.info(
            "input duration surpasses pending key frame",
            &[self.consumed_input_duration as f64, pending_in as f64],
        );

        let (key_in, key_out) = match self
            .key_frame_map
            .range((Excluded(self.consumed_input_duration), Unbounded))
            .next()
        {
            Some((&key_in, &key_out)) => (key_in, key_out),
            None => (self.study_input_duration, self.total_target_duration),
        };

        let ratio = if key_in > pending_in {
            let to_key_in = key_in - pending_in;
            let to_key_out = if key_out > pending_out {
                key_out - pending_out
            } else {
                self.log.info(
                    "previous target key frame overruns next key frame",
                    &[pending_out as f64, key_out as f64],
                );
                1
            };
            to_key_out as f64 / to_key_in as f64
        } else {
            self.log.info(
                "source key frame overruns following key frame or total input duration",
                &[pending_in as f64, key_in as f64],
            );
            1.0
        };

        self.log.info("new key-frame ratio", &[ratio]);
        self.time_ratio.store(ratio, Ordering::Relaxed);
        self.calculate_hop();
        self.last_key_frame_surpassed = pending_in;
    }

    /// The per-frame loop: runs as long as there is a frame of input to
    /// analyse and room for a hop of output.
    fn consume(&mut self) {
        let longest = self.configuration.longest_fft_size;
        let channels = self.parameters.channels;
        let inhop = self.inhop.load(Ordering::Relaxed);
        let time_ratio = self.time_ratio();
        let pitch_scale = self.pitch_scale();
        let finished = self.mode() == ProcessMode::Finished;
        let realtime = self.is_realtime();

        let mut effective_pitch_ratio = 1.0 / pitch_scale;
        if let Some(resampler) = &self.resampler {
            effective_pitch_ratio = resampler.effective_ratio(effective_pitch_ratio);
        }

        let outhop = self.calculator.calculate_single(
            time_ratio,
            effective_pitch_ratio,
            1.0,
            inhop,
            longest,
            longest,
            true,
        );

        // inhop is the distance the input advances after the current
        // frame; outhop the distance the output advances after emission.
        // Phase adjustments use the previous frame's values: they span
        // the advances that have already happened, not the upcoming
        // ones.
        if inhop != self.prev_inhop {
            self.log.trace(
                "change in inhop",
                &[self.prev_inhop as f64, inhop as f64],
            );
        }
        if outhop != self.prev_outhop {
            self.log.trace(
                "change in outhop",
                &[self.prev_outhop as f64, outhop as f64],
            );
        }

        let resampling = self.resampler.is_some()
            && (pitch_scale != 1.0
                || self.parameters.options.pitch == PitchOption::HighConsistency);

        loop {
            if self.channel_data[0].outbuf.write_space() < outhop {
                break;
            }

            let read_space = self.channel_data[0].inbuf.read_space();
            if read_space < longest {
                if finished {
                    if read_space == 0 {
                        let fill = self.channel_data[0]
                            .scales
                            .get(&longest)
                            .map(|scale| scale.accumulator_fill)
                            .unwrap_or(0);
                        if fill == 0 {
                            break;
                        }
                        self.log.trace(
                            "finished reading input, draining accumulator",
                            &[fill as f64],
                        );
                    }
                } else {
                    // Await more input.
                    break;
                }
            }

            let ratio = time_ratio * pitch_scale;
            if (ratio - 1.0).abs() < UNITY_RATIO_EPSILON {
                self.unity_count += 1;
            } else {
                self.unity_count = 0;
            }

            // Analysis.
            for c in 0..channels {
                self.analyse_channel(c, inhop, ratio);
            }

            // Phase update, synchronized across channels.
            self.advance_phases();

            for c in 0..channels {
                self.adjust_pre_kick(c);
            }

            // Resynthesis.
            let draining = read_space == 0;
            for c in 0..channels {
                self.synthesise_channel(c, outhop, draining);
            }

            // Resample.
            let mut write_count = outhop;
            if resampling {
                if let Some(resampler) = &mut self.resampler {
                    let final_block = finished && read_space < inhop;
                    let mut produced =
                        resampler.begin(outhop, 1.0 / pitch_scale, final_block);
                    let capacity = self.channel_data[0].resampled.len();
                    if produced > capacity {
                        self.log.warn(
                            "consume: resampled block exceeds buffer",
                            &[produced as f64, capacity as f64],
                        );
                        produced = capacity;
                    }
                    for c in 0..channels {
                        let cd = &mut self.channel_data[c];
                        resampler.run(c, &cd.mixdown[..outhop], &mut cd.resampled);
                    }
                    resampler.commit();
                    write_count = produced;
                }
            }

            // Emit.
            if !realtime {
                if self.total_target_duration > 0
                    && self.total_output_duration + write_count > self.total_target_duration
                {
                    let reduced = self.total_target_duration - self.total_output_duration;
                    self.log.info(
                        "write count would exceed target duration, truncating",
                        &[write_count as f64, reduced as f64],
                    );
                    write_count = reduced;
                }
            } else if finished {
                let target = self.expected_output_duration.round() as usize + self.start_delay();
                if self.total_output_duration + write_count > target {
                    write_count = target.saturating_sub(self.total_output_duration);
                }
            }

            let mut advance_count = inhop;
            if advance_count > read_space {
                // Expected only while draining.
                if !finished {
                    self.log.warn(
                        "consume: read space less than inhop while not finished",
                        &[read_space as f64, inhop as f64],
                    );
                }
                advance_count = read_space;
            }

            for cd in &mut self.channel_data {
                if resampling {
                    cd.outbuf.write(&cd.resampled[..write_count]);
                } else {
                    cd.outbuf.write(&cd.mixdown[..write_count]);
                }
                cd.inbuf.skip(advance_count);
            }

            self.consumed_input_duration += advance_count;
            self.total_output_duration += write_count;
            self.expected_output_duration += advance_count as f64 * time_ratio;

            if self.start_skip > 0 {
                // The padding created invalid leading output; drop it as
                // it appears.
                let read_space = self.channel_data[0].outbuf.read_space();
                let to_skip = self.start_skip.min(read_space);
                for cd in &mut self.channel_data {
                    cd.outbuf.skip(to_skip);
                }
                self.start_skip -= to_skip;
                self.total_output_duration = read_space - to_skip;
            }

            self.prev_inhop = inhop;
            self.prev_outhop = outhop;
        }
    }

    /// Windowed multi-scale analysis for one channel, including the
    /// classification readahead, classification, segmentation, and
    /// guidance.
    fn analyse_channel(&mut self, c: usize, inhop: usize, ratio: f64) {
        let longest = self.configuration.longest_fft_size;
        let classify = self.configuration.classification_fft_size;
        let prev_inhop = self.prev_inhop;
        let prev_outhop = self.prev_outhop;
        let realtime = self.is_realtime();
        let formant_preserved = self.parameters.options.formant == FormantOption::Preserved;

        let cd = &mut self.channel_data[c];
        let scale_data = &mut self.scale_data;

        // One unwindowed frame at the longest scale; shorter scales are
        // windowed out of its centre. Zero-pad while draining.
        let got = cd.inbuf.peek(&mut cd.peek_scratch);
        for i in 0..longest {
            cd.frame[i] = if i < got { cd.peek_scratch[i] as f64 } else { 0.0 };
        }

        for (&fft_size, scale) in cd.scales.iter_mut() {
            if fft_size == classify || fft_size == longest {
                continue;
            }
            if let Some(sdata) = scale_data.get(&fft_size) {
                let offset = (longest - fft_size) / 2;
                sdata
                    .analysis_window
                    .cut(&cd.frame[offset..offset + fft_size], &mut scale.time_domain);
            }
        }

        // The classification scale reads one hop ahead.
        if let Some(sdata) = scale_data.get(&classify) {
            let offset = (longest - classify) / 2 + inhop;
            sdata.analysis_window.cut(
                &cd.frame[offset..offset + classify],
                &mut cd.readahead.time_domain,
            );
        }

        // If the input hop changed, the stored readahead no longer sits
        // one hop ahead of this frame and must be regenerated.
        let mut have_valid_readahead = cd.have_readahead;
        if inhop != prev_inhop {
            have_valid_readahead = false;
        }

        if !have_valid_readahead {
            if let (Some(sdata), Some(scale)) =
                (scale_data.get(&classify), cd.scales.get_mut(&classify))
            {
                let offset = (longest - classify) / 2;
                sdata
                    .analysis_window
                    .cut(&cd.frame[offset..offset + classify], &mut scale.time_domain);
            }
        }

        if let (Some(sdata), Some(scale)) = (scale_data.get(&longest), cd.scales.get_mut(&longest))
        {
            sdata
                .analysis_window
                .cut(&cd.frame[..longest], &mut scale.time_domain);
        }

        // The previous readahead becomes this frame's classification
        // spectrum; only the new readahead needs a transform.
        if have_valid_readahead {
            if let Some(scale) = cd.scales.get_mut(&classify) {
                scale.mag.copy_from_slice(&cd.readahead.mag);
                scale.phase.copy_from_slice(&cd.readahead.phase);
            }
        }

        if let (Some(sdata), Some(scale)) = (
            scale_data.get_mut(&classify),
            cd.scales.get_mut(&classify),
        ) {
            fft_shift(&mut cd.readahead.time_domain);
            sdata
                .fft
                .forward(&cd.readahead.time_domain, &mut scale.real, &mut scale.imag);
            if let Some(limits) = self.configuration.limits_for(classify) {
                convert_to_polar(
                    &mut cd.readahead.mag,
                    &mut cd.readahead.phase,
                    &scale.real,
                    &scale.imag,
                    0,
                    classify / 2 + 1,
                    limits.b0_min,
                    limits.b1_max - limits.b0_min + 1,
                );
                let norm = 1.0 / classify as f64;
                for value in cd.readahead.mag.iter_mut() {
                    *value *= norm;
                }
            }
        }

        cd.have_readahead = true;

        // Forward transforms and polar conversion for the rest, each
        // restricted to its band limits.
        for (&fft_size, scale) in cd.scales.iter_mut() {
            if fft_size == classify && have_valid_readahead {
                continue;
            }
            let Some(sdata) = scale_data.get_mut(&fft_size) else {
                continue;
            };
            let Some(limits) = self.configuration.limits_for(fft_size) else {
                continue;
            };

            fft_shift(&mut scale.time_domain);
            sdata
                .fft
                .forward(&scale.time_domain, &mut scale.real, &mut scale.imag);

            // The cepstral envelope reads the formant scale's whole
            // magnitude spectrum, so formant preservation needs the
            // full range there; otherwise the band limits suffice.
            let (mag_from, mag_count) = if fft_size == classify {
                (0, classify / 2 + 1)
            } else if formant_preserved && fft_size == cd.formant.fft_size {
                (0, fft_size / 2 + 1)
            } else {
                (limits.b0_min, limits.b1_max - limits.b0_min + 1)
            };
            convert_to_polar(
                &mut scale.mag,
                &mut scale.phase,
                &scale.real,
                &scale.imag,
                mag_from,
                mag_count,
                limits.b0_min,
                limits.b1_max - limits.b0_min + 1,
            );
            let norm = 1.0 / fft_size as f64;
            for value in scale.mag[mag_from..mag_from + mag_count].iter_mut() {
                *value *= norm;
            }
        }

        if self.parameters.options.formant == FormantOption::Preserved {
            self.analyse_formant(c);
            self.adjust_formant(c);
        }

        // Classification and segmentation advance one hop behind the
        // readahead, giving the guide aligned previous/current/next
        // views.
        let cd = &mut self.channel_data[c];
        std::mem::swap(&mut cd.classification, &mut cd.next_classification);
        cd.classifier
            .classify(&cd.readahead.mag, &mut cd.next_classification);
        cd.prev_segmentation = cd.segmentation;
        cd.segmentation = cd.next_segmentation;
        cd.next_segmentation = cd.segmenter.segment(&cd.next_classification);

        let Some(classify_scale) = cd.scales.get(&classify) else {
            return;
        };
        let mean_mag = classify_scale.mag[1..=classify / 2]
            .iter()
            .sum::<f64>()
            / (classify / 2) as f64;

        let tighter_channel_lock =
            self.parameters.options.channels == ChannelOption::Together;
        self.guide.update_guidance(
            ratio,
            prev_outhop,
            &classify_scale.mag,
            &classify_scale.prev_mag,
            &cd.readahead.mag,
            &cd.segmentation,
            &cd.prev_segmentation,
            &cd.next_segmentation,
            mean_mag,
            self.unity_count,
            realtime,
            tighter_channel_lock,
            &mut cd.guidance,
        );
    }

    /// Cepstral envelope extraction at the formant scale.
    fn analyse_formant(&mut self, c: usize) {
        let sample_rate = self.parameters.sample_rate as f64;
        let cd = &mut self.channel_data[c];
        let fft_size = cd.formant.fft_size;
        let bin_count = fft_size / 2 + 1;

        let Some(scale) = cd.scales.get(&fft_size) else {
            return;
        };
        let Some(sdata) = self.scale_data.get_mut(&fft_size) else {
            return;
        };

        sdata.fft.inverse_cepstral(&scale.mag, &mut cd.formant.cepstra);

        let mut cutoff = (sample_rate / FORMANT_CUTOFF_DIVISOR).floor() as usize;
        if cutoff < 1 {
            cutoff = 1;
        }
        cutoff = cutoff.min(fft_size);

        // Lifter: halve the end points of the kept quefrency range, zero
        // the rest, fold in the transform's 1/N.
        cd.formant.cepstra[0] /= 2.0;
        cd.formant.cepstra[cutoff - 1] /= 2.0;
        for value in cd.formant.cepstra[cutoff..].iter_mut() {
            *value = 0.0;
        }
        let norm = 1.0 / fft_size as f64;
        for value in cd.formant.cepstra[..cutoff].iter_mut() {
            *value *= norm;
        }

        sdata.fft.forward(
            &cd.formant.cepstra,
            &mut cd.formant.envelope,
            &mut cd.formant.spare,
        );

        for value in cd.formant.envelope[..bin_count].iter_mut() {
            let e = value.exp();
            *value = (e * e).min(ENVELOPE_CLAMP);
        }
    }

    /// Rescales magnitudes at every scale so the spectral envelope lands
    /// where the formant scale dictates.
    fn adjust_formant(&mut self, c: usize) {
        let sample_rate = self.parameters.sample_rate as f64;
        let mut formant_scale = self.formant_scale();
        if formant_scale == 0.0 {
            formant_scale = 1.0 / self.pitch_scale();
        }

        let cd = &mut self.channel_data[c];
        let formant = &cd.formant;

        for (&fft_size, scale) in cd.scales.iter_mut() {
            let Some(limits) = self.configuration.limits_for(fft_size) else {
                continue;
            };
            let high_bin = (fft_size as f64 * FORMANT_TOP_FREQUENCY / sample_rate).floor() as usize;
            let target_factor = formant.fft_size as f64 / fft_size as f64;
            let source_factor = target_factor / formant_scale;
            let min_ratio = 1.0 / FORMANT_MAX_RATIO;

            let mut i = limits.b0_min;
            while i < limits.b1_max && i < high_bin {
                let source = formant.envelope_at(i as f64 * source_factor);
                let target = formant.envelope_at(i as f64 * target_factor);
                if target > 0.0 {
                    let ratio = (source / target).clamp(min_ratio, FORMANT_MAX_RATIO);
                    scale.mag[i] *= ratio;
                }
                i += 1;
            }
        }
    }

    /// Guided phase advance per scale, gathering all channels.
    fn advance_phases(&mut self) {
        let channels = self.parameters.channels;
        let prev_inhop = self.prev_inhop;
        let prev_outhop = self.prev_outhop;
        let configuration = &self.configuration;

        for (&fft_size, sdata) in self.scale_data.iter_mut() {
            let Some(limits) = configuration.limits_for(fft_size) else {
                continue;
            };
            sdata.guided.begin_frame();
            for c in 0..channels {
                let cd = &self.channel_data[c];
                let Some(scale) = cd.scales.get(&fft_size) else {
                    continue;
                };
                sdata.guided.advance_channel(
                    c,
                    &scale.mag,
                    &scale.phase,
                    &scale.advanced_phase,
                    &cd.guidance,
                    limits,
                    prev_inhop,
                    prev_outhop,
                );
            }
            for c in 0..channels {
                let cd = &mut self.channel_data[c];
                let Some(scale) = cd.scales.get_mut(&fft_size) else {
                    continue;
                };
                sdata.guided.finish_channel(
                    c,
                    &cd.guidance,
                    limits,
                    &mut scale.advanced_phase,
                );
            }
        }
    }

    /// Withholds a rising low-band magnitude one frame before a detected
    /// transient and re-adds it on the transient frame, so the onset
    /// arrives without a leading energy ramp.
    fn adjust_pre_kick(&mut self, c: usize) {
        let sample_rate = self.parameters.sample_rate as f64;
        let cd = &mut self.channel_data[c];
        let fft_size = cd.guidance.fft_bands[0].fft_size;

        if cd.guidance.pre_kick.present {
            let Some(scale) = cd.scales.get_mut(&fft_size) else {
                return;
            };
            let from = bin_for_frequency(cd.guidance.pre_kick.f0, fft_size, sample_rate);
            let to = bin_for_frequency(cd.guidance.pre_kick.f1, fft_size, sample_rate)
                .min(scale.bin_count() - 1);
            for i in from..=to {
                let diff = scale.mag[i] - scale.prev_mag[i];
                if diff > 0.0 {
                    scale.pending_kick[i] = diff;
                    scale.mag[i] -= diff;
                }
            }
        } else if cd.guidance.kick.present {
            // Bin range from the pre-kick record, matching the frame
            // that withheld the energy.
            let Some(scale) = cd.scales.get_mut(&fft_size) else {
                return;
            };
            let from = bin_for_frequency(cd.guidance.pre_kick.f0, fft_size, sample_rate);
            let to = bin_for_frequency(cd.guidance.pre_kick.f1, fft_size, sample_rate)
                .min(scale.bin_count() - 1);
            for i in from..=to {
                scale.mag[i] += scale.pending_kick[i];
                scale.pending_kick[i] = 0.0;
            }
        }
    }

    /// Per-band resynthesis and overlap-add, then mixdown of the first
    /// hop of every accumulator.
    fn synthesise_channel(&mut self, c: usize, outhop: usize, draining: bool) {
        let longest = self.configuration.longest_fft_size;
        let sample_rate = self.parameters.sample_rate as f64;
        let cd = &mut self.channel_data[c];
        let scale_data = &mut self.scale_data;

        for band_index in 0..cd.guidance.fft_bands.len() {
            let band = cd.guidance.fft_bands[band_index];
            let fft_size = band.fft_size;
            let Some(scale) = cd.scales.get_mut(&fft_size) else {
                continue;
            };
            let Some(sdata) = scale_data.get_mut(&fft_size) else {
                continue;
            };
            let bin_count = scale.bin_count();

            // Next frame's phase advance differences this frame's
            // magnitudes, captured before the band filter edits them.
            scale.prev_mag.copy_from_slice(&scale.mag);

            let winscale = outhop as f64 / sdata.window_scale_factor;

            // The band filter is applied naively in the frequency
            // domain; the shorter synthesis window limits the aliasing.
            // Each scale is resynthesised alone and summed afterwards.
            let low_bin = bin_for_frequency(band.f0, fft_size, sample_rate).min(bin_count - 1);
            let mut high_bin = bin_for_frequency(band.f1, fft_size, sample_rate).min(bin_count - 1);
            if high_bin % 2 == 0 && high_bin > 0 {
                high_bin -= 1;
            }
            let high_bin = high_bin.max(low_bin);

            for i in 0..low_bin {
                scale.real[i] = 0.0;
                scale.imag[i] = 0.0;
            }
            for i in low_bin..high_bin {
                let magnitude = scale.mag[i] * winscale;
                let phase = scale.advanced_phase[i];
                scale.real[i] = magnitude * phase.cos();
                scale.imag[i] = magnitude * phase.sin();
            }
            for i in high_bin..bin_count {
                scale.real[i] = 0.0;
                scale.imag[i] = 0.0;
            }

            sdata
                .fft
                .inverse(&scale.real, &scale.imag, &mut scale.time_domain);
            fft_shift(&mut scale.time_domain);

            // The synthesis window may be shorter than the frame, and
            // the accumulator is as long as the longest scale, so both
            // sides need a centring offset.
            let synthesis_size = sdata.synthesis_window.size();
            let from_offset = (fft_size - synthesis_size) / 2;
            let to_offset = (longest - synthesis_size) / 2;
            sdata.synthesis_window.cut_and_add(
                &scale.time_domain[from_offset..from_offset + synthesis_size],
                &mut scale.accumulator[to_offset..to_offset + synthesis_size],
            );
        }

        // Mix the first hop of every accumulator and slide them along.
        for value in cd.mixdown[..outhop].iter_mut() {
            *value = 0.0;
        }
        for scale in cd.scales.values_mut() {
            for i in 0..outhop {
                cd.mixdown[i] += scale.accumulator[i] as f32;
            }
            let keep = scale.accumulator.len() - outhop;
            scale.accumulator.copy_within(outhop.., 0);
            for value in scale.accumulator[keep..].iter_mut() {
                *value = 0.0;
            }
            if draining {
                scale.accumulator_fill = scale.accumulator_fill.saturating_sub(outhop);
            } else {
                scale.accumulator_fill = scale.accumulator.len();
            }
        }
    }
}

impl std::fmt::Debug for Stretcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stretcher")
            .field("sample_rate", &self.parameters.sample_rate)
            .field("channels", &self.parameters.channels)
            .field("time_ratio", &self.time_ratio())
            .field("pitch_scale", &self.pitch_scale())
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

/// Cartesian to polar over restricted ranges: magnitudes for
/// `[mag_from, mag_from + mag_count)`, phases for
/// `[polar_from, polar_from + polar_count)`. Other indices are left
/// untouched.
#[allow(clippy::too_many_arguments)]
fn convert_to_polar(
    mag: &mut [f64],
    phase: &mut [f64],
    real: &[f64],
    imag: &[f64],
    mag_from: usize,
    mag_count: usize,
    polar_from: usize,
    polar_count: usize,
) {
    for i in mag_from..(mag_from + mag_count).min(mag.len()) {
        mag[i] = (real[i] * real[i] + imag[i] * imag[i]).sqrt();
    }
    for i in polar_from..(polar_from + polar_count).min(phase.len()) {
        phase[i] = imag[i].atan2(real[i]);
    }
}
