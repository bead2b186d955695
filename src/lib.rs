#![doc = include_str!("../README.md")]

// private mods (will be partly re-exported)
mod error;
mod pitch;
mod sample;

// public, flat re-exports
pub use error::Error;

pub use pitch::{Pitch, PitchClass, PitchMap, Transient};
pub use sample::SampleBuffer;

pub use analysis::{
    fft::{FramerConfig, Spectrogram},
    pitch::{PitchAnalysis, PitchDetectorConfig},
    task::CancellationToken,
    transient::TransientConfig,
    AnalysisEvent, Analyzer, AnalyzerConfig,
};

pub use synth::{
    envelope::AdsrStage,
    grain::{Grain, GrainEnvelope},
    params::{PositionParameters, SynthConfig, MAX_CANDIDATES, MAX_GRAINS, NUM_COLOURS},
    positions::{GrainPosition, PitchPositionFinder, PositionFinder},
    GrainEngine, GrainNote, GrainProcessor, GrainSnapshot, GranularSynth,
};

// public mods
pub mod analysis;
pub mod parameter;
pub mod synth;
pub mod utils;
