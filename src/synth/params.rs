//! Per-colour grain and envelope parameters and global synth settings.

use four_cc::FourCC;

use crate::{
    parameter::{
        BooleanParameter, FloatParameter, Parameter, ParameterScaling, ParameterValueUpdate,
    },
    utils::map_normalized,
    Error,
};

// -------------------------------------------------------------------------------------------------

/// Number of independently scheduled position colours per note.
pub const NUM_COLOURS: usize = 4;
/// Maximum number of ranked candidate positions per pitch class.
pub const MAX_CANDIDATES: usize = 6;
/// Default upper bound of simultaneously playing grains.
pub const MAX_GRAINS: usize = 100;
/// Size of a grain envelope lookup table.
pub const ENV_LUT_SIZE: usize = 512;

// -------------------------------------------------------------------------------------------------

/// Grain and ADSR envelope settings of a single position colour.
///
/// Values are stored as plain values in the units of their parameter descriptors: milliseconds
/// for the grain duration, seconds for envelope times and normalized values for everything else.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionParameters {
    pub enabled: bool,
    /// Width of the grain envelope's plateau.
    pub shape: f32,
    /// Peak position of the grain envelope. 0.5 is symmetric.
    pub tilt: f32,
    /// Grain trigger rate. Higher rates trigger more overlapping grains.
    pub rate: f32,
    /// Grain duration in milliseconds.
    pub duration: f32,
    pub gain: f32,
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for PositionParameters {
    fn default() -> Self {
        Self {
            enabled: Self::ENABLED.default_value(),
            shape: Self::SHAPE.default_value(),
            tilt: Self::TILT.default_value(),
            rate: Self::RATE.default_value(),
            duration: Self::DURATION.default_value(),
            gain: Self::GAIN.default_value(),
            attack: Self::ATTACK.default_value(),
            decay: Self::DECAY.default_value(),
            sustain: Self::SUSTAIN.default_value(),
            release: Self::RELEASE.default_value(),
        }
    }
}

impl PositionParameters {
    pub const MIN_DURATION_MS: f32 = 20.0;
    pub const MAX_DURATION_MS: f32 = 300.0;

    pub const ENABLED: BooleanParameter =
        BooleanParameter::new(FourCC(*b"GENA"), "Enabled", false);
    pub const SHAPE: FloatParameter =
        FloatParameter::new(FourCC(*b"GSHP"), "Shape", 0.0..=1.0, 0.5);
    pub const TILT: FloatParameter = FloatParameter::new(FourCC(*b"GTLT"), "Tilt", 0.0..=1.0, 0.5);
    pub const RATE: FloatParameter = FloatParameter::new(FourCC(*b"GRAT"), "Rate", 0.0..=1.0, 0.3);
    pub const DURATION: FloatParameter = FloatParameter::new(
        FourCC(*b"GDUR"),
        "Duration",
        Self::MIN_DURATION_MS..=Self::MAX_DURATION_MS,
        76.0,
    )
    .with_unit("ms");
    pub const GAIN: FloatParameter = FloatParameter::new(FourCC(*b"GGAI"), "Gain", 0.0..=1.0, 0.8);
    pub const ATTACK: FloatParameter =
        FloatParameter::new(FourCC(*b"EATK"), "Attack", 0.01..=2.0, 0.2).with_unit("s");
    pub const DECAY: FloatParameter =
        FloatParameter::new(FourCC(*b"EDCY"), "Decay", 0.01..=2.0, 0.3).with_unit("s");
    pub const SUSTAIN: FloatParameter =
        FloatParameter::new(FourCC(*b"ESUS"), "Sustain", 0.0..=1.0, 0.8);
    pub const RELEASE: FloatParameter =
        FloatParameter::new(FourCC(*b"EREL"), "Release", 0.05..=4.0, 0.5)
            .with_scaling(ParameterScaling::Exponential(2.0))
            .with_unit("s");

    /// Default parameters for the given colour: only the first colour is enabled.
    pub fn for_colour(colour: usize) -> Self {
        Self {
            enabled: colour == 0,
            ..Self::default()
        }
    }

    /// Descriptors of all position parameters.
    pub fn parameters() -> Vec<Box<dyn Parameter>> {
        vec![
            Self::ENABLED.into_box(),
            Self::SHAPE.into_box(),
            Self::TILT.into_box(),
            Self::RATE.into_box(),
            Self::DURATION.into_box(),
            Self::GAIN.into_box(),
            Self::ATTACK.into_box(),
            Self::DECAY.into_box(),
            Self::SUSTAIN.into_box(),
            Self::RELEASE.into_box(),
        ]
    }

    /// All parameter ids and their plain values, with booleans as 0.0 or 1.0.
    pub fn values(&self) -> [(FourCC, f32); 10] {
        [
            (Self::ENABLED.id(), Self::ENABLED.normalize_value(self.enabled)),
            (Self::SHAPE.id(), self.shape),
            (Self::TILT.id(), self.tilt),
            (Self::RATE.id(), self.rate),
            (Self::DURATION.id(), self.duration),
            (Self::GAIN.id(), self.gain),
            (Self::ATTACK.id(), self.attack),
            (Self::DECAY.id(), self.decay),
            (Self::SUSTAIN.id(), self.sustain),
            (Self::RELEASE.id(), self.release),
        ]
    }

    /// Apply a single parameter update. Returns the new plain value, with booleans as 0.0 or 1.0.
    pub fn set_parameter(
        &mut self,
        id: FourCC,
        update: &ParameterValueUpdate,
    ) -> Result<f32, Error> {
        let float_value = |descriptor: &FloatParameter| descriptor.update_value(update);
        let value = match id {
            _ if id == Self::ENABLED.id() => {
                self.enabled = Self::ENABLED.update_value(update)?;
                Self::ENABLED.normalize_value(self.enabled)
            }
            _ if id == Self::SHAPE.id() => {
                self.shape = float_value(&Self::SHAPE)?;
                self.shape
            }
            _ if id == Self::TILT.id() => {
                self.tilt = float_value(&Self::TILT)?;
                self.tilt
            }
            _ if id == Self::RATE.id() => {
                self.rate = float_value(&Self::RATE)?;
                self.rate
            }
            _ if id == Self::DURATION.id() => {
                self.duration = float_value(&Self::DURATION)?;
                self.duration
            }
            _ if id == Self::GAIN.id() => {
                self.gain = float_value(&Self::GAIN)?;
                self.gain
            }
            _ if id == Self::ATTACK.id() => {
                self.attack = float_value(&Self::ATTACK)?;
                self.attack
            }
            _ if id == Self::DECAY.id() => {
                self.decay = float_value(&Self::DECAY)?;
                self.decay
            }
            _ if id == Self::SUSTAIN.id() => {
                self.sustain = float_value(&Self::SUSTAIN)?;
                self.sustain
            }
            _ if id == Self::RELEASE.id() => {
                self.release = float_value(&Self::RELEASE)?;
                self.release
            }
            _ => {
                return Err(Error::ParameterError(format!(
                    "Unknown position parameter id: '{id}'"
                )))
            }
        };
        Ok(value)
    }

    /// Check that all values lie within their descriptor's range.
    pub fn validate(&self) -> Result<(), Error> {
        let check = |descriptor: &FloatParameter, value: f32| {
            if descriptor.range().contains(&value) {
                Ok(())
            } else {
                Err(Error::ParameterError(format!(
                    "{} must be in range {:?}, but is {}",
                    descriptor.name(),
                    descriptor.range(),
                    value
                )))
            }
        };
        check(&Self::SHAPE, self.shape)?;
        check(&Self::TILT, self.tilt)?;
        check(&Self::RATE, self.rate)?;
        check(&Self::DURATION, self.duration)?;
        check(&Self::GAIN, self.gain)?;
        check(&Self::ATTACK, self.attack)?;
        check(&Self::DECAY, self.decay)?;
        check(&Self::SUSTAIN, self.sustain)?;
        check(&Self::RELEASE, self.release)
    }

    /// Interval between two grain triggers of this colour in milliseconds.
    pub fn trigger_interval_ms(&self) -> f32 {
        map_normalized(1.0 - self.rate, self.duration / 8.0, self.duration / 2.0)
    }

    /// Grain duration in samples at the given sample rate, before applying a playback rate.
    pub fn duration_samples(&self, sample_rate: u32) -> f32 {
        sample_rate as f32 * self.duration / 1000.0
    }

    /// Release duration in samples at the given sample rate.
    pub fn release_samples(&self, sample_rate: u32) -> u64 {
        (sample_rate as f32 * self.release) as u64
    }
}

// -------------------------------------------------------------------------------------------------

/// Global [`GranularSynth`](crate::GranularSynth) settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthConfig {
    /// Upper bound of simultaneously playing grains. Triggers beyond it are skipped.
    pub max_grains: usize,
    /// Normalized control for the number of ranked candidate positions per pitch class.
    pub diversity: f32,
    /// Seed for the grain position jitter. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            max_grains: MAX_GRAINS,
            diversity: Self::DIVERSITY.default_value(),
            rng_seed: None,
        }
    }
}

impl SynthConfig {
    pub const DIVERSITY: FloatParameter =
        FloatParameter::new(FourCC(*b"DIVR"), "Diversity", 0.0..=1.0, 0.1);

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_grains == 0 {
            return Err(Error::ParameterError(
                "max grains must be > 0".to_string(),
            ));
        }
        if !Self::DIVERSITY.range().contains(&self.diversity) {
            return Err(Error::ParameterError(format!(
                "diversity must be in range [0, 1], but is {}",
                self.diversity
            )));
        }
        Ok(())
    }

    /// Number of candidate positions requested from the position finder.
    pub fn candidate_count(&self) -> usize {
        map_normalized(self.diversity.clamp(0.0, 1.0), 1.0, MAX_CANDIDATES as f32).round() as usize
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        for colour in 0..NUM_COLOURS {
            let params = PositionParameters::for_colour(colour);
            assert!(params.validate().is_ok());
            assert_eq!(params.enabled, colour == 0);
        }
        assert!(SynthConfig::default().validate().is_ok());
        assert_eq!(PositionParameters::parameters().len(), 10);
    }

    #[test]
    fn parameter_updates() {
        let mut params = PositionParameters::default();
        let value = params
            .set_parameter(
                PositionParameters::DURATION.id(),
                &ParameterValueUpdate::Normalized(1.0),
            )
            .unwrap();
        assert_eq!(value, PositionParameters::MAX_DURATION_MS);
        assert_eq!(params.duration, PositionParameters::MAX_DURATION_MS);

        params
            .set_parameter(
                PositionParameters::ENABLED.id(),
                &ParameterValueUpdate::Raw(Arc::new(true)),
            )
            .unwrap();
        assert!(params.enabled);

        // raw values get clamped
        params
            .set_parameter(
                PositionParameters::SUSTAIN.id(),
                &ParameterValueUpdate::Raw(Arc::new(2.0f32)),
            )
            .unwrap();
        assert_eq!(params.sustain, 1.0);

        assert!(params
            .set_parameter(FourCC(*b"XXXX"), &ParameterValueUpdate::Normalized(0.5))
            .is_err());
    }

    #[test]
    fn trigger_intervals() {
        let mut params = PositionParameters {
            duration: 80.0,
            rate: 1.0,
            ..Default::default()
        };
        assert_eq!(params.trigger_interval_ms(), 10.0);
        params.rate = 0.0;
        assert_eq!(params.trigger_interval_ms(), 40.0);
    }

    #[test]
    fn candidate_counts() {
        let config = |diversity| SynthConfig {
            diversity,
            ..Default::default()
        };
        assert_eq!(config(0.0).candidate_count(), 1);
        assert_eq!(config(1.0).candidate_count(), MAX_CANDIDATES);
        assert_eq!(config(0.5).candidate_count(), 4);
        assert!(config(1.5).validate().is_err());
    }
}
