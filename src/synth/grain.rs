//! Grains, grain envelopes and grain mixing.

use std::sync::Arc;

use assume::assume;

use super::params::ENV_LUT_SIZE;
use crate::SampleBuffer;

// -------------------------------------------------------------------------------------------------

/// Precomputed grain amplitude envelope with [`ENV_LUT_SIZE`] entries.
#[derive(Debug, Clone, PartialEq)]
pub struct GrainEnvelope {
    lut: Arc<[f32]>,
}

impl GrainEnvelope {
    /// Generate a new envelope with the given shape and tilt, both in range `0.0..=1.0`.
    ///
    /// Each side of the envelope follows the cubic Bézier curve
    /// `3·s·x·(1-x)² + 3·s·x²·(1-x) + x³`: low shapes give narrow, pointed grains, high shapes
    /// give wide plateaus. The tilt moves the peak from the start (0.0) to the end (1.0) of the
    /// grain. With a tilt of 0.5 the envelope is symmetric around its midpoint.
    pub fn new(shape: f32, tilt: f32) -> Self {
        let shape = shape.clamp(0.0, 1.0);
        let peak = tilt.clamp(0.01, 0.99);
        let bezier = |x: f32| {
            3.0 * shape * x * (1.0 - x).powi(2) + 3.0 * shape * x.powi(2) * (1.0 - x) + x.powi(3)
        };
        let lut = (0..ENV_LUT_SIZE)
            .map(|index| {
                let x = index as f32 / (ENV_LUT_SIZE - 1) as f32;
                // fold into a 0 -> 1 -> 0 ramp which peaks at the tilt position
                let ramp = if x <= peak {
                    x / peak
                } else {
                    (1.0 - x) / (1.0 - peak)
                };
                bezier(ramp.clamp(0.0, 1.0)).clamp(0.0, 1.0)
            })
            .collect();
        Self { lut }
    }

    /// Read access to the raw lookup table.
    pub fn values(&self) -> &[f32] {
        &self.lut
    }

    /// Envelope value at the given grain progress in range `0.0..=1.0`.
    #[inline]
    pub fn sample(&self, phase: f32) -> f32 {
        let lut = &self.lut;
        assume!(unsafe: lut.len() == ENV_LUT_SIZE);
        let index = ((phase * (ENV_LUT_SIZE - 1) as f32) as usize).min(ENV_LUT_SIZE - 1);
        lut[index]
    }
}

impl Default for GrainEnvelope {
    fn default() -> Self {
        Self::new(0.5, 0.5)
    }
}

// -------------------------------------------------------------------------------------------------

/// A single, immutable grain: an enveloped snippet of the source buffer, played back at a given
/// rate from a given trigger time on.
#[derive(Debug, Clone, PartialEq)]
pub struct Grain {
    envelope: GrainEnvelope,
    /// Length in output samples.
    duration: u64,
    playback_rate: f32,
    /// Source buffer start frame.
    offset: f32,
    /// Output sample time at which the grain starts playing.
    trigger_time: u64,
    gain: f32,
}

impl Grain {
    pub fn new(
        envelope: GrainEnvelope,
        duration: u64,
        playback_rate: f32,
        offset: f32,
        trigger_time: u64,
        gain: f32,
    ) -> Self {
        debug_assert!(playback_rate > 0.0, "Invalid grain playback rate");
        Self {
            envelope,
            duration: duration.max(1),
            playback_rate,
            offset: offset.max(0.0),
            trigger_time,
            gain,
        }
    }

    #[inline]
    pub fn duration(&self) -> u64 {
        self.duration
    }

    #[inline]
    pub fn playback_rate(&self) -> f32 {
        self.playback_rate
    }

    #[inline]
    pub fn offset(&self) -> f32 {
        self.offset
    }

    #[inline]
    pub fn trigger_time(&self) -> u64 {
        self.trigger_time
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// True when the grain finished playing at the given sample time.
    #[inline]
    pub fn is_expired(&self, time: u64) -> bool {
        time > self.trigger_time + self.duration
    }

    /// Envelope amplitude and source frame position at the given sample time, or `None` when
    /// the grain is not playing at this time.
    #[inline]
    fn position_at(&self, time: u64) -> Option<(f32, f32)> {
        let elapsed = time.checked_sub(self.trigger_time)?;
        if elapsed >= self.duration {
            return None;
        }
        let amplitude = self.gain * self.envelope.sample(elapsed as f32 / self.duration as f32);
        let position = self.offset + elapsed as f32 * self.playback_rate;
        Some((amplitude, position))
    }
}

// -------------------------------------------------------------------------------------------------

/// Linearly interpolated sample of the given channel at a fractional frame position.
#[inline]
fn sample_at_position(samples: &[f32], position: f32) -> f32 {
    let index = position as usize;
    if index + 1 >= samples.len() {
        return samples.get(index).copied().unwrap_or(0.0);
    }
    let fraction = position - index as f32;
    assume!(unsafe: index + 1 < samples.len());
    samples[index] + (samples[index + 1] - samples[index]) * fraction
}

/// Add all grains, which play within the given interleaved output block, to the block.
///
/// `start_time` is the sample time of the block's first frame. Source channels are mapped to
/// output channels one by one; missing source channels repeat the last source channel.
pub fn mix_grains(
    grains: &[Grain],
    source: &SampleBuffer,
    output: &mut [f32],
    channel_count: usize,
    start_time: u64,
) {
    if grains.is_empty() || source.is_empty() || channel_count == 0 {
        return;
    }
    let last_source_channel = source.channel_count() - 1;
    match channel_count {
        1 => {
            let samples = source.channel(0);
            for (frame_index, sample) in output.iter_mut().enumerate() {
                let time = start_time + frame_index as u64;
                for grain in grains {
                    if let Some((amplitude, position)) = grain.position_at(time) {
                        *sample += amplitude * sample_at_position(samples, position);
                    }
                }
            }
        }
        _ => {
            for (frame_index, frame) in output.chunks_exact_mut(channel_count).enumerate() {
                let time = start_time + frame_index as u64;
                for grain in grains {
                    if let Some((amplitude, position)) = grain.position_at(time) {
                        for (channel, sample) in frame.iter_mut().enumerate() {
                            let samples = source.channel(channel.min(last_source_channel));
                            *sample += amplitude * sample_at_position(samples, position);
                        }
                    }
                }
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shapes() {
        let symmetric = GrainEnvelope::new(0.5, 0.5);
        let values = symmetric.values();
        assert_eq!(values.len(), ENV_LUT_SIZE);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[ENV_LUT_SIZE - 1], 0.0);
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        for i in 0..ENV_LUT_SIZE / 2 {
            assert!((values[i] - values[ENV_LUT_SIZE - 1 - i]).abs() < 1e-3);
        }
        let peak = values.iter().cloned().fold(0.0, f32::max);
        assert!(peak > 0.99);

        // wider shapes have more energy
        let energy = |env: &GrainEnvelope| env.values().iter().sum::<f32>();
        assert!(energy(&GrainEnvelope::new(1.0, 0.5)) > energy(&symmetric));
        assert!(energy(&GrainEnvelope::new(0.0, 0.5)) < energy(&symmetric));

        // tilted peaks
        let peak_index = |env: &GrainEnvelope| {
            env.values()
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap()
        };
        assert!(peak_index(&GrainEnvelope::new(0.5, 0.2)) < ENV_LUT_SIZE / 3);
        assert!(peak_index(&GrainEnvelope::new(0.5, 0.8)) > 2 * ENV_LUT_SIZE / 3);
    }

    #[test]
    fn grain_lifetime() {
        let grain = Grain::new(GrainEnvelope::default(), 100, 2.0, 10.0, 50, 0.5);
        assert!(grain.position_at(49).is_none());
        assert!(grain.position_at(150).is_none());
        let (amplitude, position) = grain.position_at(100).unwrap();
        assert!(amplitude > 0.49 && amplitude <= 0.5);
        assert_eq!(position, 110.0);
        assert!(!grain.is_expired(150));
        assert!(grain.is_expired(151));
    }

    #[test]
    fn mixing() {
        let source = SampleBuffer::new(vec![vec![1.0; 1000], vec![-1.0; 1000]], 1000).unwrap();
        let grains = vec![
            Grain::new(GrainEnvelope::new(1.0, 0.5), 200, 1.0, 0.0, 0, 1.0),
            Grain::new(GrainEnvelope::new(1.0, 0.5), 200, 0.5, 100.0, 0, 1.0),
        ];

        let mut mono = vec![0.0; 300];
        mix_grains(&grains, &source, &mut mono, 1, 0);
        assert_eq!(mono[0], 0.0);
        assert!((mono[100] - 2.0).abs() < 1e-3);
        assert!(mono[200..].iter().all(|v| *v == 0.0));

        // block offsets
        let mut late = vec![0.0; 100];
        mix_grains(&grains, &source, &mut late, 1, 50);
        assert_eq!(late[50], mono[100]);

        let mut stereo = vec![0.0; 600];
        mix_grains(&grains, &source, &mut stereo, 2, 0);
        assert!((stereo[200] - 2.0).abs() < 1e-3);
        assert!((stereo[201] + 2.0).abs() < 1e-3);

        let mut silent = vec![0.0; 100];
        mix_grains(&[], &source, &mut silent, 2, 0);
        assert!(silent.iter().all(|v| *v == 0.0));
    }
}
