//! Pitch detection: HPCP computation followed by pitch segmentation.

use super::{
    fft::{FramerConfig, SpectralFramer},
    hpcp::{HarmonicProfile, HpcpCalculator},
    segmentation::{segmented_pitch_buffer, PitchSegmenter},
    task::{CancellationToken, Progress},
};
use crate::{pitch::PitchMap, Error};

// -------------------------------------------------------------------------------------------------

/// Parameters of a [`PitchDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchDetectorConfig {
    /// FFT size of the pitch analysis. Larger than the spectrogram's to resolve low notes.
    pub fft_size: usize,
    pub hop_size: usize,
    /// Number of HPCP bins per octave. Must be a multiple of 12.
    pub num_hpcp_bins: usize,
    /// Number of strongest spectral peaks per frame which feed the HPCP.
    pub max_spectral_peaks: usize,
    /// Spectral peaks outside of `min_freq..=max_freq` Hz are ignored.
    pub min_freq: f32,
    pub max_freq: f32,
    /// Tuning reference of pitch class A in Hz.
    pub ref_freq: f32,
    /// Width of the cosine lobe a peak contributes to neighbouring HPCP bins.
    pub hpcp_window_semitones: f32,
    /// Number of overtones which get folded onto the fundamental.
    pub num_harmonics: usize,
    /// HPCP frames with a lower average raw energy are treated as silent.
    pub min_avg_frame_energy: f32,
    /// Minimum linear magnitude of a spectral peak.
    pub peak_threshold: f32,
    /// Minimum HPCP value of a peak which may start or continue a pitch segment.
    pub segment_peak_threshold: f32,
    /// Maximum number of simultaneously tracked pitch segments.
    pub num_active_segments: usize,
    /// Maximum HPCP bin distance a segment may move between two frames.
    pub max_deviation_bins: f32,
    pub max_idle_ms: f32,
    pub min_note_ms: f32,
    pub lookahead_ms: f32,
    /// Whiten spectral peaks against the spectrum's noise floor before computing the HPCP.
    pub whitening: bool,
}

impl Default for PitchDetectorConfig {
    fn default() -> Self {
        Self {
            fft_size: 4096,
            hop_size: 1024,
            num_hpcp_bins: 36,
            max_spectral_peaks: 20,
            min_freq: 100.0,
            max_freq: 3000.0,
            ref_freq: 440.0,
            hpcp_window_semitones: 1.0,
            num_harmonics: 3,
            min_avg_frame_energy: 1e-4,
            peak_threshold: 1e-4,
            segment_peak_threshold: 0.2,
            num_active_segments: 10,
            max_deviation_bins: 2.0,
            max_idle_ms: 60.0,
            min_note_ms: 120.0,
            lookahead_ms: 50.0,
            whitening: false,
        }
    }
}

impl PitchDetectorConfig {
    pub fn framer_config(&self) -> FramerConfig {
        FramerConfig::new(self.fft_size, self.hop_size)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.framer_config().validate()?;
        if self.num_hpcp_bins == 0 || self.num_hpcp_bins % 12 != 0 {
            return Err(Error::ParameterError(format!(
                "number of HPCP bins must be a multiple of 12, but is {}",
                self.num_hpcp_bins
            )));
        }
        let is_positive = |value: f32| value > 0.0;
        if !is_positive(self.min_freq) || !is_positive(self.max_freq - self.min_freq) {
            return Err(Error::ParameterError(format!(
                "invalid pitch frequency range: {}..{} Hz",
                self.min_freq, self.max_freq
            )));
        }
        if !is_positive(self.ref_freq) || !is_positive(self.hpcp_window_semitones) {
            return Err(Error::ParameterError(
                "reference frequency and HPCP window must be > 0".to_string(),
            ));
        }
        if self.num_active_segments == 0 || self.max_spectral_peaks == 0 {
            return Err(Error::ParameterError(
                "number of segments and spectral peaks must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// Result of a complete pitch detection run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PitchAnalysis {
    pub harmonic_profile: HarmonicProfile,
    pub pitches: PitchMap,
    /// Finalized pitches, rendered into HPCP shaped frames for visualization.
    pub segmented_pitches: HarmonicProfile,
}

/// Detects pitches in a mono sample buffer.
///
/// Runs in two phases: the spectrum is calculated at a resolution dedicated to pitch detection
/// and folded into HPCP frames, then the frames get segmented into [`Pitch`](crate::Pitch)
/// events.
///
/// Results only depend on the input samples and config, so running the detector twice on the
/// same buffer yields the same pitches.
pub struct PitchDetector {
    config: PitchDetectorConfig,
    framer: SpectralFramer,
    hpcp: HpcpCalculator,
}

impl PitchDetector {
    pub fn new(config: PitchDetectorConfig) -> Result<Self, Error> {
        config.validate()?;
        let framer = SpectralFramer::new(config.framer_config())?;
        let hpcp = HpcpCalculator::new(config);
        Ok(Self {
            config,
            framer,
            hpcp,
        })
    }

    pub fn config(&self) -> &PitchDetectorConfig {
        &self.config
    }

    /// Run both phases. Returns `None` when cancelled.
    pub fn process(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Option<PitchAnalysis> {
        let harmonic_profile =
            self.harmonic_profile(samples, sample_rate, &progress.sub_range(0.0, 0.8), cancel)?;
        let (pitches, segmented_pitches) = self.pitches(
            &harmonic_profile,
            sample_rate,
            &progress.sub_range(0.8, 1.0),
            cancel,
        )?;
        Some(PitchAnalysis {
            harmonic_profile,
            pitches,
            segmented_pitches,
        })
    }

    /// First phase: calculate the spectrum and HPCP frames.
    pub fn harmonic_profile(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Option<HarmonicProfile> {
        let spectrogram = self
            .framer
            .process(samples, &progress.sub_range(0.0, 0.5), cancel)?;
        let profile = self.hpcp.compute(
            &spectrogram,
            sample_rate,
            &progress.sub_range(0.5, 1.0),
            cancel,
        )?;
        log::debug!("Computed HPCP of {} frames", profile.len());
        Some(profile)
    }

    /// Second phase: segment the HPCP into pitches. Returns the pitch map and the segmented pitch
    /// visualization buffer.
    pub fn pitches(
        &self,
        profile: &HarmonicProfile,
        sample_rate: u32,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Option<(PitchMap, HarmonicProfile)> {
        let segmenter = PitchSegmenter::new(&self.config, sample_rate);
        let pitches = segmenter.segment(profile, progress, cancel)?;
        let segmented = segmented_pitch_buffer(&pitches, profile.len(), self.config.num_hpcp_bins);
        log::debug!("Found {} pitches in {} HPCP frames", pitches.len(), profile.len());
        Some((pitches, segmented))
    }
}

// -------------------------------------------------------------------------------------------------
