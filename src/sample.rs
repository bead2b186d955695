//! Decoded, read-only sample data as handed over from a file loader.

use crate::{
    utils::buffer::{interleaved_to_planar, planar_to_mono},
    Error,
};

// -------------------------------------------------------------------------------------------------

/// A planar, multi-channel sample buffer with a fixed sample rate.
///
/// Buffers are created by an external file loader and shared read-only via `Arc` with the
/// analyzers and the synth. An absent buffer (`None`) means "nothing loaded".
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl SampleBuffer {
    /// Create a new buffer from planar channel data. All channels must have the same length.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self, Error> {
        if sample_rate == 0 {
            return Err(Error::InvalidBuffer("sample rate must be > 0".to_string()));
        }
        if channels.is_empty() {
            return Err(Error::InvalidBuffer(
                "buffer needs at least one channel".to_string(),
            ));
        }
        let frame_count = channels[0].len();
        if channels.iter().any(|c| c.len() != frame_count) {
            return Err(Error::InvalidBuffer(
                "all channels must have the same length".to_string(),
            ));
        }
        Ok(Self {
            channels,
            sample_rate,
        })
    }

    /// Create a new mono buffer.
    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self, Error> {
        Self::new(vec![samples], sample_rate)
    }

    /// Create a new buffer from interleaved sample data.
    pub fn from_interleaved(
        interleaved: &[f32],
        channel_count: usize,
        sample_rate: u32,
    ) -> Result<Self, Error> {
        if channel_count == 0 {
            return Err(Error::InvalidBuffer(
                "buffer needs at least one channel".to_string(),
            ));
        }
        Self::new(interleaved_to_planar(interleaved, channel_count), sample_rate)
    }

    /// The buffer's sample rate in Hz.
    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of channels in the buffer.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of sample frames in the buffer.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.channels[0].len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    /// Read access to a single channel's samples.
    #[inline]
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    /// Mixed down mono version of the buffer, as used by the analyzers.
    pub fn to_mono(&self) -> Vec<f32> {
        planar_to_mono(&self.channels)
    }
}

// -------------------------------------------------------------------------------------------------
