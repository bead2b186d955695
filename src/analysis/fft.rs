//! Sliding window STFT, producing normalized magnitude spectra.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use super::task::{CancellationToken, Progress};
use crate::Error;

// -------------------------------------------------------------------------------------------------

/// Window and hop size of a [`SpectralFramer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerConfig {
    /// FFT and analysis window size in samples. Must be a power of two.
    pub window_size: usize,
    /// Distance between two consecutive frames in samples.
    pub hop_size: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            window_size: 1024,
            hop_size: 512,
        }
    }
}

impl FramerConfig {
    pub fn new(window_size: usize, hop_size: usize) -> Self {
        Self {
            window_size,
            hop_size,
        }
    }

    /// Validate all parameters.
    pub fn validate(&self) -> Result<(), Error> {
        if self.window_size < 4 || !self.window_size.is_power_of_two() {
            return Err(Error::ParameterError(format!(
                "FFT window size must be a power of two >= 4, but is {}",
                self.window_size
            )));
        }
        if self.hop_size == 0 || self.hop_size > self.window_size {
            return Err(Error::ParameterError(format!(
                "FFT hop size must be in range 1..={}, but is {}",
                self.window_size, self.hop_size
            )));
        }
        Ok(())
    }

    /// Number of frames a framer emits for the given number of input samples.
    ///
    /// Buffers shorter than one window produce no frames. The last frame may extend past the
    /// end of the buffer and then gets zero padded.
    pub fn frame_count(&self, sample_count: usize) -> usize {
        if sample_count < self.window_size {
            0
        } else {
            (sample_count - self.window_size).div_ceil(self.hop_size) + 1
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// An ordered sequence of magnitude spectra, each holding `window_size / 2` bins in range
/// `0.0..=1.0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spectrogram {
    frames: Vec<Vec<f32>>,
    scales: Vec<f32>,
    window_size: usize,
    hop_size: usize,
}

impl Spectrogram {
    pub fn new(window_size: usize, hop_size: usize) -> Self {
        Self {
            frames: Vec::new(),
            scales: Vec::new(),
            window_size,
            hop_size,
        }
    }

    #[inline]
    pub fn frames(&self) -> &[Vec<f32>] {
        &self.frames
    }

    /// The running maximum magnitude a frame got normalized with. Multiply a frame's bins with
    /// it to get the raw, windowed FFT magnitudes.
    #[inline]
    pub fn frame_scale(&self, index: usize) -> f32 {
        self.scales[index]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of bins in each frame.
    #[inline]
    pub fn bin_count(&self) -> usize {
        self.window_size / 2
    }

    #[inline]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    #[inline]
    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Center frequency of a (fractional) bin in Hz.
    #[inline]
    pub fn bin_frequency(&self, bin: f32, sample_rate: u32) -> f32 {
        bin * sample_rate as f32 / self.window_size as f32
    }

    /// Append a normalized frame along with the scale it got normalized with.
    pub(crate) fn push_frame(&mut self, magnitudes: Vec<f32>, scale: f32) {
        debug_assert_eq!(magnitudes.len(), self.bin_count());
        self.frames.push(magnitudes);
        self.scales.push(scale);
    }
}

// -------------------------------------------------------------------------------------------------

/// Turns a mono sample buffer into a [`Spectrogram`] of Blackman-Harris windowed magnitude
/// spectra.
///
/// Frames are normalized by the maximum magnitude seen *so far* in the run, not by a global
/// maximum: early frames may thus be scaled differently than they would be in a two pass
/// normalization.
pub struct SpectralFramer {
    config: FramerConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    frame: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectralFramer {
    /// Create a new framer. Fails when the given config is invalid.
    pub fn new(config: FramerConfig) -> Result<Self, Error> {
        config.validate()?;
        let fft = FftPlanner::<f32>::new().plan_fft_forward(config.window_size);
        let window = blackman_harris_window(config.window_size);
        let frame = vec![Complex::default(); config.window_size];
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        Ok(Self {
            config,
            fft,
            window,
            frame,
            scratch,
        })
    }

    pub fn config(&self) -> FramerConfig {
        self.config
    }

    /// Run the framer on the given mono samples.
    ///
    /// Returns `None` when the run got cancelled. Reports progress proportional to the number of
    /// consumed samples.
    pub fn process(
        &mut self,
        samples: &[f32],
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Option<Spectrogram> {
        let FramerConfig {
            window_size,
            hop_size,
        } = self.config;
        let frame_count = self.config.frame_count(samples.len());
        let bin_count = window_size / 2;

        let mut spectrogram = Spectrogram::new(window_size, hop_size);
        spectrogram.frames.reserve_exact(frame_count);
        spectrogram.scales.reserve_exact(frame_count);

        let mut running_max = 0.0f32;
        for frame_index in 0..frame_count {
            if cancel.is_cancelled() {
                return None;
            }
            let start = frame_index * hop_size;
            progress.update(start as f64 / samples.len() as f64);

            // window, zero padding the last frame when needed
            let end = (start + window_size).min(samples.len());
            for (index, value) in self.frame.iter_mut().enumerate() {
                let sample = if start + index < end {
                    samples[start + index]
                } else {
                    0.0
                };
                *value = Complex::new(sample * self.window[index], 0.0);
            }
            self.fft
                .process_with_scratch(&mut self.frame, &mut self.scratch);

            let mut magnitudes: Vec<f32> =
                self.frame[..bin_count].iter().map(|c| c.norm()).collect();
            let frame_max = magnitudes.iter().copied().fold(0.0, f32::max);
            running_max = running_max.max(frame_max);
            if running_max > 0.0 {
                for magnitude in &mut magnitudes {
                    *magnitude = (*magnitude / running_max).min(1.0);
                }
            }
            spectrogram.push_frame(magnitudes, running_max);
        }
        progress.update(1.0);
        Some(spectrogram)
    }
}

// -------------------------------------------------------------------------------------------------

/// 4-term Blackman-Harris window (-92 dB side lobes).
fn blackman_harris_window(size: usize) -> Vec<f32> {
    const A0: f32 = 0.35875;
    const A1: f32 = 0.48829;
    const A2: f32 = 0.14128;
    const A3: f32 = 0.01168;
    let denominator = (size - 1).max(1) as f32;
    (0..size)
        .map(|i| {
            let phase = 2.0 * std::f32::consts::PI * i as f32 / denominator;
            A0 - A1 * phase.cos() + A2 * (2.0 * phase).cos() - A3 * (3.0 * phase).cos()
        })
        .collect()
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn config_validation() {
        assert!(FramerConfig::default().validate().is_ok());
        assert!(FramerConfig::new(1000, 500).validate().is_err());
        assert!(FramerConfig::new(1024, 0).validate().is_err());
        assert!(FramerConfig::new(1024, 2048).validate().is_err());
        assert!(SpectralFramer::new(FramerConfig::new(100, 10)).is_err());
    }

    #[test]
    fn frame_counts() -> Result<(), Error> {
        let config = FramerConfig::new(256, 64);
        let mut framer = SpectralFramer::new(config)?;
        for len in [0, 100, 255, 256, 257, 320, 321, 1000, 4096] {
            let samples = sine(1000.0, 44100, len);
            let spectrogram = framer
                .process(&samples, &Progress::none(), &CancellationToken::new())
                .unwrap();
            let expected = if len < 256 {
                0
            } else {
                ((len - 256) as f64 / 64.0).ceil() as usize + 1
            };
            assert_eq!(spectrogram.len(), expected, "length {len}");
            for frame in spectrogram.frames() {
                assert_eq!(frame.len(), 128);
                assert!(frame.iter().all(|v| (0.0..=1.0).contains(v)));
            }
        }
        Ok(())
    }

    #[test]
    fn sine_peak_bin() -> Result<(), Error> {
        let mut framer = SpectralFramer::new(FramerConfig::new(1024, 512))?;
        // 44100 / 1024 * 40 = ~1722.6 Hz: exactly on bin 40
        let freq = 44100.0 / 1024.0 * 40.0;
        let samples = sine(freq, 44100, 8192);
        let spectrogram = framer
            .process(&samples, &Progress::none(), &CancellationToken::new())
            .unwrap();
        assert!(!spectrogram.is_empty());
        let frame = &spectrogram.frames()[2];
        let (peak_bin, peak_value) = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_eq!(peak_bin, 40);
        assert!((peak_value - 1.0).abs() < 0.05);
        assert!((spectrogram.bin_frequency(40.0, 44100) - freq).abs() < 0.001);
        Ok(())
    }

    #[test]
    fn running_max_normalization() -> Result<(), Error> {
        let mut framer = SpectralFramer::new(FramerConfig::new(256, 256))?;
        // quiet first frame, loud second frame
        let mut samples = sine(2000.0, 44100, 512);
        for sample in &mut samples[..256] {
            *sample *= 0.25;
        }
        let spectrogram = framer
            .process(&samples, &Progress::none(), &CancellationToken::new())
            .unwrap();
        assert_eq!(spectrogram.len(), 2);
        let first_max = spectrogram.frames()[0].iter().copied().fold(0.0, f32::max);
        let second_max = spectrogram.frames()[1].iter().copied().fold(0.0, f32::max);
        // the first frame is normalized by its own max, as nothing louder was seen yet
        assert!((first_max - 1.0).abs() < 1e-6);
        assert!((second_max - 1.0).abs() < 1e-6);
        assert!(spectrogram.frame_scale(1) > spectrogram.frame_scale(0) * 3.0);
        Ok(())
    }

    #[test]
    fn silence_and_cancellation() -> Result<(), Error> {
        let mut framer = SpectralFramer::new(FramerConfig::new(256, 128))?;
        let silence = vec![0.0; 1024];
        let spectrogram = framer
            .process(&silence, &Progress::none(), &CancellationToken::new())
            .unwrap();
        assert!(spectrogram
            .frames()
            .iter()
            .all(|frame| frame.iter().all(|v| *v == 0.0)));

        let token = CancellationToken::new();
        token.cancel();
        assert!(framer.process(&silence, &Progress::none(), &token).is_none());
        Ok(())
    }
}
