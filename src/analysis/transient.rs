//! Onset detection from spectral energy changes.

use std::collections::VecDeque;

use super::{
    fft::{FramerConfig, SpectralFramer, Spectrogram},
    task::{CancellationToken, Progress},
};
use crate::{pitch::Transient, Error};

// -------------------------------------------------------------------------------------------------

/// Parameters of a [`TransientDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransientConfig {
    pub fft_size: usize,
    pub hop_size: usize,
    /// Energy ratio against the rolling baseline above which a frame counts as an attack.
    pub threshold: f32,
    /// Number of preceding frames the rolling energy baseline is averaged from.
    pub spread: usize,
    /// Minimum number of frames between two detected transients.
    pub attack_lock: usize,
}

impl Default for TransientConfig {
    fn default() -> Self {
        Self {
            fft_size: 1024,
            hop_size: 512,
            threshold: 2.5,
            spread: 3,
            attack_lock: 10,
        }
    }
}

impl TransientConfig {
    pub fn framer_config(&self) -> FramerConfig {
        FramerConfig::new(self.fft_size, self.hop_size)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.framer_config().validate()?;
        if self.threshold.is_nan() || self.threshold <= 1.0 {
            return Err(Error::ParameterError(format!(
                "transient threshold must be > 1, but is {}",
                self.threshold
            )));
        }
        if self.spread == 0 {
            return Err(Error::ParameterError(
                "transient spread must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

/// Flags frames whose spectral energy jumps above the energy of the preceding frames.
///
/// Energies are calculated from raw FFT magnitudes, so the running max normalization of the
/// spectrogram does not hide attacks which follow quieter passages.
pub struct TransientDetector {
    config: TransientConfig,
    framer: SpectralFramer,
}

impl TransientDetector {
    /// Energy below which a frame counts as silent.
    const SILENCE_ENERGY: f32 = 1e-6;

    pub fn new(config: TransientConfig) -> Result<Self, Error> {
        config.validate()?;
        let framer = SpectralFramer::new(config.framer_config())?;
        Ok(Self { config, framer })
    }

    pub fn config(&self) -> &TransientConfig {
        &self.config
    }

    /// Detect transients in the given mono samples. Returns `None` when cancelled.
    pub fn process(
        &mut self,
        samples: &[f32],
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Option<Vec<Transient>> {
        let spectrogram = self
            .framer
            .process(samples, &progress.sub_range(0.0, 0.8), cancel)?;
        self.detect(&spectrogram, &progress.sub_range(0.8, 1.0), cancel)
    }

    /// Detect transients in an existing spectrogram. Returns `None` when cancelled.
    pub fn detect(
        &self,
        spectrogram: &Spectrogram,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Option<Vec<Transient>> {
        let TransientConfig {
            threshold,
            spread,
            attack_lock,
            ..
        } = self.config;
        let frame_count = spectrogram.len();

        let mut transients = Vec::new();
        // history starts out silent, so attacks at the very beginning are detected too
        let mut energies = VecDeque::from(vec![0.0f32; spread]);
        let mut frames_since_attack = attack_lock;
        for (index, frame) in spectrogram.frames().iter().enumerate() {
            if cancel.is_cancelled() {
                return None;
            }
            progress.update(index as f64 / frame_count as f64);

            let scale = spectrogram.frame_scale(index);
            let energy = frame
                .iter()
                .map(|magnitude| (magnitude * scale).powi(2))
                .sum::<f32>()
                / frame.len().max(1) as f32;
            let baseline = energies.iter().sum::<f32>() / spread as f32;
            let ratio = if baseline > Self::SILENCE_ENERGY {
                energy / baseline
            } else if energy > Self::SILENCE_ENERGY * threshold {
                f32::INFINITY
            } else {
                0.0
            };

            if ratio > threshold && frames_since_attack >= attack_lock {
                let confidence = 1.0 - threshold / ratio;
                transients.push(Transient::new(
                    index as f32 / frame_count as f32,
                    confidence,
                ));
                frames_since_attack = 0;
            }
            frames_since_attack = frames_since_attack.saturating_add(1);

            energies.pop_front();
            energies.push_back(energy);
        }
        progress.update(1.0);

        log::debug!("Found {} transients in {} frames", transients.len(), frame_count);
        Some(transients)
    }
}

// -------------------------------------------------------------------------------------------------
