//! Spectral analysis: per-bin classification, frequency segmentation,
//! and the per-frame guidance that drives the multi-scale pipeline.

pub mod classifier;
pub mod guide;
pub mod segmenter;

pub use classifier::{BinClassifier, BinLabel, ClassifierParameters};
pub use guide::{
    bin_for_frequency, FftBand, FftBandLimit, FreqRange, Guidance, Guide, GuideConfiguration,
    PhaseLockBand,
};
pub use segmenter::{BinSegmenter, Segmentation, SegmenterParameters};
