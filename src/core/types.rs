//! Core parameter types shared across the crate.

/// A single audio sample (32-bit float, nominal range -1.0 to 1.0).
pub type Sample = f32;

/// Offline versus streaming operation.
///
/// Offline mode may study the whole input first and pads the start so the
/// output aligns with the input; realtime mode trades that alignment for
/// bounded latency and allows ratio changes from a control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    #[default]
    Offline,
    RealTime,
}

/// Formant handling during pitch shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormantOption {
    /// Formants shift along with the pitch.
    #[default]
    Shifted,
    /// The spectral envelope is extracted and restored, keeping formants
    /// in place.
    Preserved,
}

/// Resampler configuration for the pitch-shift stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PitchOption {
    /// Fastest interpolation kernel.
    #[default]
    HighSpeed,
    /// Higher-quality interpolation kernel.
    HighQuality,
    /// Smoother ratio updates; keeps the resampler permanently in-circuit
    /// so ratio changes never splice between resampled and dry paths.
    HighConsistency,
}

/// Cross-channel phase coherence policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOption {
    /// Channels are phase-locked only in the low band.
    #[default]
    Apart,
    /// Channels are phase-locked across the whole spectrum.
    Together,
}

/// Option flags, fixed at construction except where noted.
///
/// `formant` may later be changed with
/// [`Stretcher::set_formant_option`](crate::Stretcher::set_formant_option).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options {
    pub transport: TransportMode,
    pub formant: FormantOption,
    pub pitch: PitchOption,
    pub channels: ChannelOption,
}

impl Options {
    /// Returns true in realtime (streaming) mode.
    #[inline]
    pub fn is_realtime(&self) -> bool {
        self.transport == TransportMode::RealTime
    }
}

/// Immutable construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameters {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of audio channels (non-interleaved processing).
    pub channels: usize,
    /// Option flags.
    pub options: Options,
}

impl Parameters {
    /// Creates parameters with default options.
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            options: Options::default(),
        }
    }

    /// Sets the option flags.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }
}
