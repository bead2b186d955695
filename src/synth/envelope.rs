//! ADSR amplitude envelopes of grain positions.

use super::params::PositionParameters;

// -------------------------------------------------------------------------------------------------

/// Current processing stage of an [`AdsrEnvelope`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AdsrStage {
    #[default]
    Attack,
    Decay,
    Sustain,
    Release,
}

// -------------------------------------------------------------------------------------------------

/// Envelope times in samples and the sustain level, as derived from [`PositionParameters`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdsrTimes {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl AdsrTimes {
    pub fn from_parameters(parameters: &PositionParameters, sample_rate: u32) -> Self {
        let sample_rate = sample_rate as f32;
        Self {
            attack: (parameters.attack * sample_rate).max(1.0),
            decay: (parameters.decay * sample_rate).max(1.0),
            sustain: parameters.sustain.clamp(0.0, 1.0),
            release: (parameters.release * sample_rate).max(1.0),
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Time based ADSR envelope state of a single grain position.
///
/// Levels are not advanced per sample but evaluated from the time elapsed since note-on or
/// note-off, whenever the scheduler updates the envelope. Stage transitions happen on the update
/// which reaches the stage's target level, so the attack always ends at exactly 1.0.
///
/// Releases fade out from the level at note-off, not from the sustain level. A note which gets
/// released during its attack or decay therefore never jumps to the sustain level first.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct AdsrEnvelope {
    stage: AdsrStage,
    level: f32,
    release_level: f32,
}

impl AdsrEnvelope {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stage(&self) -> AdsrStage {
        self.stage
    }

    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    /// Restart the envelope from the attack stage.
    pub fn note_on(&mut self) {
        *self = Self::new();
    }

    /// Enter the release stage. Releases start from the level at the time of the note-off.
    pub fn note_off(&mut self) {
        self.release_level = self.level;
        self.stage = AdsrStage::Release;
    }

    /// Update the envelope level. `since_note_off` is only used in the release stage.
    pub fn update(&mut self, since_note_on: u64, since_note_off: u64, times: &AdsrTimes) -> f32 {
        match self.stage {
            AdsrStage::Attack => {
                self.level = (since_note_on as f32 / times.attack).clamp(0.0, 1.0);
                if self.level >= 1.0 {
                    self.stage = AdsrStage::Decay;
                }
            }
            AdsrStage::Decay => {
                let decayed = (since_note_on as f32 - times.attack).max(0.0) / times.decay;
                self.level = (1.0 - decayed * (1.0 - times.sustain)).clamp(times.sustain, 1.0);
                if self.level <= times.sustain {
                    self.stage = AdsrStage::Sustain;
                }
            }
            AdsrStage::Sustain => {
                self.level = times.sustain;
            }
            AdsrStage::Release => {
                let released = since_note_off as f32 / times.release;
                self.level = (self.release_level * (1.0 - released)).clamp(0.0, self.release_level);
            }
        }
        self.level
    }
}

// -------------------------------------------------------------------------------------------------
