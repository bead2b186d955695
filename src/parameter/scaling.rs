/// Scaling of float parameters, applied when converting normalized UI or automation values to
/// plain parameter values.
#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub enum ParameterScaling {
    /// `y = x`
    #[default]
    Linear,

    /// `y = x^factor`. Factor must be > 0.
    ///
    /// Factors > 1 give more resolution to the lower end of the range, which is what time
    /// parameters like attack or release usually want.
    Exponential(f32),
}

impl ParameterScaling {
    /// Apply scaling to a normalized value.
    pub fn scale(&self, value: f32) -> f32 {
        let value = value.clamp(0.0, 1.0);
        match *self {
            ParameterScaling::Linear => value,
            ParameterScaling::Exponential(factor) => value.powf(factor),
        }
    }

    /// Apply the inverse scaling to a normalized value.
    pub fn unscale(&self, value: f32) -> f32 {
        let value = value.clamp(0.0, 1.0);
        match *self {
            ParameterScaling::Linear => value,
            ParameterScaling::Exponential(factor) => value.powf(1.0 / factor.max(0.001)),
        }
    }

    pub(crate) const fn validate(&self) {
        match self {
            ParameterScaling::Linear => {}
            ParameterScaling::Exponential(factor) => {
                assert!(
                    *factor > 0.0,
                    "Invalid exponential parameter scaling factor (must be > 0)"
                );
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
