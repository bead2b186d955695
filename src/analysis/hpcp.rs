//! Harmonic Pitch Class Profile (HPCP) computation.

use super::{
    fft::Spectrogram,
    peaks::{find_peaks, whiten_peaks, NoiseFloor, PeakInterpolation},
    pitch::PitchDetectorConfig,
    task::{CancellationToken, Progress},
};

// -------------------------------------------------------------------------------------------------

/// Octave folded harmonic energy per analysis frame. Each frame holds `num_hpcp_bins` values
/// in range `0.0..=1.0`, starting at pitch class C.
pub type HarmonicProfile = Vec<Vec<f32>>;

// -------------------------------------------------------------------------------------------------

/// Contribution of a harmonic, folded into a single octave.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicWeight {
    /// Semitone offset of the harmonic relative to the fundamental, in range `0..12`.
    pub semitone: f32,
    pub gain: f32,
}

/// Tolerance within which folded harmonics are treated as the same semitone.
const HARMONIC_PRECISION: f32 = 1e-5;

/// Build the harmonic weight table for the fundamental and `num_harmonics` overtones.
///
/// Harmonics which fold onto the same semitone sum their weights. Higher octaves get weighted
/// by `1 / max(1, octave / 2)`.
pub fn harmonic_weights(num_harmonics: usize) -> Vec<HarmonicWeight> {
    let mut weights: Vec<HarmonicWeight> = Vec::with_capacity(num_harmonics + 1);
    for harmonic in 0..=num_harmonics {
        let mut semitone = 12.0 * (harmonic as f32 + 1.0).log2();
        let octave_weight = (semitone / 12.0 * 0.5).max(1.0);
        while semitone >= 12.0 - HARMONIC_PRECISION {
            semitone -= 12.0;
        }
        match weights
            .iter_mut()
            .find(|w| (w.semitone - semitone).abs() < HARMONIC_PRECISION)
        {
            Some(weight) => weight.gain += 1.0 / octave_weight,
            None => weights.push(HarmonicWeight {
                semitone,
                gain: 1.0 / octave_weight,
            }),
        }
    }
    weights
}

// -------------------------------------------------------------------------------------------------

/// Computes a [`HarmonicProfile`] from a magnitude spectrogram.
pub struct HpcpCalculator {
    config: PitchDetectorConfig,
    weights: Vec<HarmonicWeight>,
    /// Index of the reference frequency's bin, so that bin 0 is C when the reference is A.
    reference_bin: usize,
}

impl HpcpCalculator {
    pub fn new(config: PitchDetectorConfig) -> Self {
        let weights = harmonic_weights(config.num_harmonics);
        let reference_bin = 9 * config.num_hpcp_bins / 12;
        Self {
            config,
            weights,
            reference_bin,
        }
    }

    pub fn weights(&self) -> &[HarmonicWeight] {
        &self.weights
    }

    /// Compute the profile of all spectrogram frames. Returns `None` when cancelled.
    pub fn compute(
        &self,
        spectrogram: &Spectrogram,
        sample_rate: u32,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Option<HarmonicProfile> {
        let frame_count = spectrogram.len();
        let hz_per_bin = spectrogram.bin_frequency(1.0, sample_rate);
        let mut profile = Vec::with_capacity(frame_count);
        for (index, frame) in spectrogram.frames().iter().enumerate() {
            if cancel.is_cancelled() {
                return None;
            }
            progress.update(index as f64 / frame_count as f64);
            profile.push(self.compute_frame(frame, hz_per_bin, sample_rate));
        }
        progress.update(1.0);
        Some(profile)
    }

    /// Compute the profile of a single magnitude spectrum.
    pub fn compute_frame(&self, spectrum: &[f32], hz_per_bin: f32, sample_rate: u32) -> Vec<f32> {
        let config = &self.config;
        let num_bins = config.num_hpcp_bins;
        let window = config.hpcp_window_semitones;

        let mut peaks = find_peaks(
            spectrum,
            config.max_spectral_peaks,
            config.peak_threshold,
            PeakInterpolation::Decibel,
        );
        if config.whitening {
            let floor = NoiseFloor::from_spectrum(spectrum, sample_rate, config.max_freq);
            peaks = whiten_peaks(&peaks, &floor, hz_per_bin);
        }

        let mut hpcp = vec![0.0f32; num_bins];
        for peak in &peaks {
            let freq = peak.bin * hz_per_bin;
            if freq < config.min_freq || freq > config.max_freq {
                continue;
            }
            let peak_energy = peak.gain * peak.gain;
            for bin in 0..num_bins {
                let center = config.ref_freq * 2f32.powf(bin as f32 / num_bins as f32);
                let target = (bin + self.reference_bin) % num_bins;
                for weight in &self.weights {
                    let harmonic_freq = freq * 2f32.powf(-weight.semitone / 12.0);
                    // distance in semitones, wrapped into -6..6
                    let distance =
                        (12.0 * (harmonic_freq / center).log2() + 6.0).rem_euclid(12.0) - 6.0;
                    if distance.abs() <= 0.5 * window {
                        let lobe = (std::f32::consts::PI * distance / window).cos().powi(2);
                        hpcp[target] += lobe * peak_energy * weight.gain * weight.gain;
                    }
                }
            }
        }

        let max = hpcp.iter().copied().fold(0.0, f32::max);
        let average_energy = hpcp.iter().sum::<f32>() / num_bins as f32;
        if max <= 0.0 || average_energy < config.min_avg_frame_energy {
            hpcp.fill(0.0);
        } else {
            for value in &mut hpcp {
                *value /= max;
            }
        }
        hpcp
    }
}

// -------------------------------------------------------------------------------------------------
