//! Spectral peak picking and peak whitening.

use crate::utils::{db_to_linear, linear_to_db};

// -------------------------------------------------------------------------------------------------

/// A local maximum in a spectrum or HPCP frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Fractional bin position.
    pub bin: f32,
    /// Interpolated magnitude at `bin`.
    pub gain: f32,
}

impl Peak {
    pub fn new(bin: f32, gain: f32) -> Self {
        Self { bin, gain }
    }
}

// -------------------------------------------------------------------------------------------------

/// Scale on which peaks get quadratically interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakInterpolation {
    /// Fit the parabola through the log magnitudes of the neighbouring bins. A windowed sinusoid's
    /// main lobe is close to a parabola on a dB scale, so this is used for magnitude spectra.
    Decibel,
    /// Fit the parabola through the raw values, as used for HPCP frames.
    Linear,
}

/// Find up to `max_peaks` local maxima above `threshold` in the given frame.
///
/// Plateaus are reported at their center. The first and last bin count as peaks when they are
/// larger than their only neighbour. Returned peaks are sorted by descending gain; peaks with
/// equal gain keep their bin order.
pub fn find_peaks(
    frame: &[f32],
    max_peaks: usize,
    threshold: f32,
    interpolation: PeakInterpolation,
) -> Vec<Peak> {
    let size = frame.len();
    if size < 2 || max_peaks == 0 {
        return Vec::new();
    }

    let mut peaks = Vec::new();
    if frame[0] > frame[1] && frame[0] > threshold {
        peaks.push(Peak::new(0.0, frame[0]));
    }

    let mut i = 1;
    while i + 1 < size {
        if frame[i] > frame[i - 1] {
            // walk over plateaus
            let mut j = i;
            while j + 1 < size - 1 && frame[j + 1] == frame[i] {
                j += 1;
            }
            if frame[j + 1] < frame[j] && frame[j] > threshold {
                if i == j {
                    peaks.push(interpolate_peak(frame, i, interpolation));
                } else {
                    peaks.push(Peak::new((i + j) as f32 * 0.5, frame[i]));
                }
            }
            i = j + 1;
        } else {
            i += 1;
        }
    }

    if frame[size - 1] > frame[size - 2] && frame[size - 1] > threshold {
        peaks.push(Peak::new((size - 1) as f32, frame[size - 1]));
    }

    peaks.sort_by(|a, b| b.gain.total_cmp(&a.gain));
    peaks.truncate(max_peaks);
    peaks
}

/// Find up to `max_peaks` local maxima above `threshold` in a frame whose bins wrap around, such
/// as an HPCP frame: the first and the last bin are neighbours.
///
/// Peak positions lie in `0.0..frame.len()`. Plateaus are reported at their center. Returned
/// peaks are sorted by descending gain.
pub fn find_circular_peaks(frame: &[f32], max_peaks: usize, threshold: f32) -> Vec<Peak> {
    let size = frame.len();
    if size < 3 || max_peaks == 0 {
        return find_peaks(frame, max_peaks, threshold, PeakInterpolation::Linear);
    }

    let mut peaks = Vec::new();
    for i in 0..size {
        let value = frame[i];
        // only rising edges start a peak or plateau
        if value <= frame[(i + size - 1) % size] || value <= threshold {
            continue;
        }
        let mut width = 1;
        while width < size && frame[(i + width) % size] == value {
            width += 1;
        }
        if frame[(i + width) % size] >= value {
            continue;
        }
        if width == 1 {
            let (delta, gain) = parabolic_peak(
                frame[(i + size - 1) % size],
                value,
                frame[(i + 1) % size],
                PeakInterpolation::Linear,
            );
            peaks.push(Peak::new((i as f32 + delta).rem_euclid(size as f32), gain));
        } else {
            let center = i as f32 + (width - 1) as f32 * 0.5;
            peaks.push(Peak::new(center.rem_euclid(size as f32), value));
        }
    }

    peaks.sort_by(|a, b| b.gain.total_cmp(&a.gain));
    peaks.truncate(max_peaks);
    peaks
}

/// Estimate the true position and magnitude of the local maximum at `bin` by fitting a parabola
/// through the bin and its two neighbours.
fn interpolate_peak(frame: &[f32], bin: usize, interpolation: PeakInterpolation) -> Peak {
    let (delta, gain) = parabolic_peak(frame[bin - 1], frame[bin], frame[bin + 1], interpolation);
    Peak::new(bin as f32 + delta, gain)
}

/// Bin offset and magnitude of the parabola's vertex through three neighbouring values.
fn parabolic_peak(
    left: f32,
    middle: f32,
    right: f32,
    interpolation: PeakInterpolation,
) -> (f32, f32) {
    let (left, middle, right) = match interpolation {
        PeakInterpolation::Decibel => (
            linear_to_db(left),
            linear_to_db(middle),
            linear_to_db(right),
        ),
        PeakInterpolation::Linear => (left, middle, right),
    };
    let denominator = left - 2.0 * middle + right;
    let delta = if denominator != 0.0 {
        (0.5 * (left - right) / denominator).clamp(-0.5, 0.5)
    } else {
        0.0
    };
    let value = middle - 0.25 * (left - right) * delta;
    let gain = match interpolation {
        PeakInterpolation::Decibel => db_to_linear(value).clamp(0.0, 1.0),
        PeakInterpolation::Linear => value,
    };
    (delta, gain)
}

// -------------------------------------------------------------------------------------------------

/// Piecewise linear function, defined by break points with ascending x values.
///
/// Values outside of the break point range are clamped to the first or last point's value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BreakPointFunction {
    points: Vec<(f32, f32)>,
}

impl BreakPointFunction {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        debug_assert!(
            points.windows(2).all(|w| w[0].0 <= w[1].0),
            "Break points must be sorted by x"
        );
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Evaluate the function at `x`.
    pub fn value(&self, x: f32) -> f32 {
        let Some(&(first_x, first_y)) = self.points.first() else {
            return 0.0;
        };
        if x <= first_x {
            return first_y;
        }
        for window in self.points.windows(2) {
            let (x0, y0) = window[0];
            let (x1, y1) = window[1];
            if x <= x1 {
                if x1 == x0 {
                    return y1;
                }
                return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
            }
        }
        self.points.last().map_or(0.0, |(_, y)| *y)
    }
}

// -------------------------------------------------------------------------------------------------

/// Smoothed, frequency dependent noise floor of a magnitude spectrum in dB.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseFloor {
    envelope: BreakPointFunction,
    resolution: f32,
    max_frequency: f32,
}

impl NoiseFloor {
    /// Distance between the floor's break points in Hz.
    pub const RESOLUTION: f32 = 100.0;

    /// Estimate the noise floor of `spectrum` up to `max_frequency`.
    ///
    /// Each break point is an energy weighted average of a window around its frequency, which
    /// grows with the frequency: from `freq - max(50, 0.34 * freq)` to `freq + max(50, 0.58 *
    /// freq)`.
    pub fn from_spectrum(spectrum: &[f32], sample_rate: u32, max_frequency: f32) -> Self {
        let bin_count = spectrum.len();
        let nyquist = sample_rate as f32 / 2.0;
        let mut points = Vec::new();
        if bin_count > 0 {
            let to_bin = |freq: f32| (freq / nyquist * bin_count as f32 + 0.5) as isize;
            let mut freq = 0.0f32;
            while freq <= max_frequency && freq <= nyquist {
                let start = to_bin(freq - (freq * 0.34).max(50.0)).clamp(0, bin_count as isize - 1);
                let end = to_bin(freq + (freq * 0.58).max(50.0))
                    .max(start + 1)
                    .min(bin_count as isize);
                let center = (start + end) as f32 / 2.0;
                let half_width = end as f32 - center;

                let mut weighted_sum = 0.0;
                let mut weight_sum = 0.0;
                for (index, magnitude) in spectrum
                    .iter()
                    .enumerate()
                    .take(end as usize)
                    .skip(start as usize)
                {
                    let energy = magnitude * magnitude;
                    let weight = (1.0 - (index as f32 - center).abs() / half_width).powi(4) * energy;
                    weighted_sum += energy * weight;
                    weight_sum += weight;
                }
                let average = if weight_sum > 0.0 {
                    weighted_sum / weight_sum
                } else {
                    0.0
                };
                points.push((freq, average));
                freq += Self::RESOLUTION;
            }
        }
        // the last window is truncated: reuse its predecessor
        if points.len() >= 2 {
            let last = points.len() - 1;
            points[last].1 = points[last - 1].1;
        }
        for (_, value) in &mut points {
            *value = linear_to_db(value.sqrt());
        }
        Self {
            envelope: BreakPointFunction::new(points),
            resolution: Self::RESOLUTION,
            max_frequency,
        }
    }

    /// Floor level in dB at the given frequency.
    pub fn level_db(&self, frequency: f32) -> f32 {
        self.envelope.value(frequency)
    }
}

/// Rescale the given peak gains relative to a noise floor.
///
/// Peaks above the floor are capped to full gain, peaks up to 30 dB below the floor are
/// attenuated by their distance to it, everything below gets silenced. All peaks are tilted by
/// -20 dB per 4 kHz. Peaks above the floor's frequency range keep their gain.
///
/// `hz_per_bin` converts peak bins to frequencies.
pub fn whiten_peaks(peaks: &[Peak], floor: &NoiseFloor, hz_per_bin: f32) -> Vec<Peak> {
    peaks
        .iter()
        .map(|peak| {
            let freq = peak.bin * hz_per_bin;
            if freq > floor.max_frequency - floor.resolution {
                return *peak;
            }
            let amp = linear_to_db(peak.gain);
            let floor_amp = floor.level_db(freq);
            let mut gain = if amp > floor_amp {
                0.0
            } else if amp > floor_amp - 30.0 {
                amp - floor_amp
            } else {
                -200.0
            };
            gain -= 20.0 * freq / 4000.0;
            Peak::new(peak.bin, db_to_linear(gain))
        })
        .collect()
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_maxima() {
        let frame = [0.0, 0.5, 0.2, 0.2, 0.8, 0.8, 0.8, 0.1, 0.3];
        let peaks = find_peaks(&frame, 10, 0.0, PeakInterpolation::Linear);
        // sorted by gain: plateau, interpolated, upper boundary
        assert_eq!(peaks.len(), 3);
        assert_eq!(peaks[0], Peak::new(5.0, 0.8));
        assert!(peaks[1].bin > 0.5 && peaks[1].bin < 1.5);
        assert!(peaks[1].gain >= 0.5);
        assert_eq!(peaks[2], Peak::new(8.0, 0.3));

        let limited = find_peaks(&frame, 1, 0.0, PeakInterpolation::Linear);
        assert_eq!(limited, vec![Peak::new(5.0, 0.8)]);
        let thresholded = find_peaks(&frame, 10, 0.4, PeakInterpolation::Linear);
        assert_eq!(thresholded.len(), 2);
    }

    #[test]
    fn boundaries_and_degenerate_frames() {
        assert!(find_peaks(&[], 10, 0.0, PeakInterpolation::Linear).is_empty());
        assert!(find_peaks(&[1.0], 10, 0.0, PeakInterpolation::Linear).is_empty());
        assert!(find_peaks(&[0.0; 16], 10, 0.0, PeakInterpolation::Linear).is_empty());
        let peaks = find_peaks(&[1.0, 0.5, 0.25], 10, 0.0, PeakInterpolation::Linear);
        assert_eq!(peaks, vec![Peak::new(0.0, 1.0)]);
    }

    #[test]
    fn symmetric_interpolation() {
        let frame = [0.1, 0.25, 1.0, 0.25, 0.1];
        for interpolation in [PeakInterpolation::Linear, PeakInterpolation::Decibel] {
            let peaks = find_peaks(&frame, 10, 0.0, interpolation);
            assert_eq!(peaks.len(), 1);
            assert!((peaks[0].bin - 2.0).abs() < 1e-6);
            assert!((peaks[0].gain - 1.0).abs() < 1e-5);
        }
        // skewed neighbours move the peak towards the larger one
        let peaks = find_peaks(&[0.0, 0.2, 1.0, 0.6, 0.0], 10, 0.0, PeakInterpolation::Decibel);
        assert!(peaks[0].bin > 2.0 && peaks[0].bin < 2.5);
    }

    #[test]
    fn circular_peaks() {
        // lobe of a peak at bin 0 spreads into the last bin
        let mut frame = vec![0.0f32; 36];
        frame[0] = 1.0;
        frame[1] = 0.257;
        frame[35] = 0.243;
        frame[27] = 0.5;
        let peaks = find_circular_peaks(&frame, 10, 0.2);
        assert_eq!(peaks.len(), 2);
        assert!(peaks[0].bin < 0.5 || peaks[0].bin > 35.5);
        assert!(peaks[0].gain >= 1.0);
        assert_eq!(peaks[1], Peak::new(27.0, 0.5));
        // the straight line picker reports the lobe as an extra boundary peak
        assert_eq!(find_peaks(&frame, 10, 0.2, PeakInterpolation::Linear).len(), 3);

        // peaks left of bin 0 wrap to the end of the frame
        let mut frame = vec![0.0f32; 36];
        frame[0] = 0.6;
        frame[35] = 1.0;
        frame[34] = 0.2;
        let peaks = find_circular_peaks(&frame, 10, 0.0);
        assert_eq!(peaks.len(), 1);
        assert!(peaks[0].bin > 35.0 && peaks[0].bin < 36.0);

        // plateaus across the boundary
        let mut frame = vec![0.0f32; 12];
        frame[11] = 0.7;
        frame[0] = 0.7;
        let peaks = find_circular_peaks(&frame, 10, 0.0);
        assert_eq!(peaks, vec![Peak::new(11.5, 0.7)]);

        assert!(find_circular_peaks(&[0.5; 36], 10, 0.0).is_empty());
    }

    #[test]
    fn break_point_function() {
        let bpf = BreakPointFunction::new(vec![(0.0, 0.0), (100.0, 10.0), (200.0, -10.0)]);
        assert_eq!(bpf.value(-50.0), 0.0);
        assert_eq!(bpf.value(50.0), 5.0);
        assert_eq!(bpf.value(150.0), 0.0);
        assert_eq!(bpf.value(500.0), -10.0);
        assert_eq!(BreakPointFunction::default().value(1.0), 0.0);
    }

    #[test]
    fn whitening() {
        // flat noise with one strong and one buried peak
        let mut spectrum = vec![0.01f32; 512];
        spectrum[40] = 1.0;
        spectrum[60] = 0.0001;
        let sample_rate = 44100;
        let hz_per_bin = sample_rate as f32 / 1024.0;
        let floor = NoiseFloor::from_spectrum(&spectrum, sample_rate, 3000.0);
        let peaks = [Peak::new(40.0, 1.0), Peak::new(60.0, 0.0001)];
        let whitened = whiten_peaks(&peaks, &floor, hz_per_bin);
        assert_eq!(whitened.len(), 2);
        assert!(whitened.iter().all(|p| (0.0..=1.0).contains(&p.gain)));
        assert_eq!(whitened[0].bin, 40.0);
        assert!(whitened[0].gain > 0.1);
        assert!(whitened[1].gain < 1e-6);

        // peaks above the floor's range are passed through
        let high = [Peak::new(400.0, 0.5)];
        assert_eq!(whiten_peaks(&high, &floor, hz_per_bin), high.to_vec());
    }
}
