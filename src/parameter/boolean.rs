use four_cc::FourCC;

use super::{Parameter, ParameterType, ParameterValueUpdate};
use crate::Error;

// -------------------------------------------------------------------------------------------------

/// A boolean parameter descriptor.
#[derive(Debug, Clone)]
pub struct BooleanParameter {
    id: FourCC,
    name: &'static str,
    default: bool,
}

impl BooleanParameter {
    /// Create a new boolean parameter descriptor.
    pub const fn new(id: FourCC, name: &'static str, default: bool) -> Self {
        Self { id, name, default }
    }

    /// Wrap the descriptor into a dyn [`Parameter`] box.
    pub fn into_box(self) -> Box<dyn Parameter> {
        Box::new(self)
    }

    /// The parameter's identifier.
    pub const fn id(&self) -> FourCC {
        self.id
    }

    /// The parameter's display name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The parameter's default value.
    pub const fn default_value(&self) -> bool {
        self.default
    }

    pub const fn normalize_value(&self, value: bool) -> f32 {
        if value {
            1.0
        } else {
            0.0
        }
    }

    pub fn denormalize_value(&self, normalized: f32) -> bool {
        normalized >= 0.5
    }

    /// Resolve a [`ParameterValueUpdate`] into a plain value of this parameter.
    pub fn update_value(&self, update: &ParameterValueUpdate) -> Result<bool, Error> {
        match update {
            ParameterValueUpdate::Normalized(normalized) => Ok(self.denormalize_value(*normalized)),
            ParameterValueUpdate::Raw(raw) => raw.downcast_ref::<bool>().copied().ok_or_else(|| {
                Error::ParameterError(format!(
                    "Unsupported payload type for boolean parameter '{}'",
                    self.name
                ))
            }),
        }
    }

    pub fn value_to_string(&self, value: bool) -> String {
        if value { "ON" } else { "OFF" }.to_string()
    }

    /// Parse "on"/"off" or "true"/"false", ignoring case.
    pub fn string_to_value(&self, string: &str) -> Option<bool> {
        let string = string.trim();
        if string.eq_ignore_ascii_case("on") {
            Some(true)
        } else if string.eq_ignore_ascii_case("off") {
            Some(false)
        } else {
            string.to_ascii_lowercase().parse::<bool>().ok()
        }
    }
}

impl Parameter for BooleanParameter {
    fn id(&self) -> FourCC {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parameter_type(&self) -> ParameterType {
        ParameterType::Boolean
    }

    fn default_normalized_value(&self) -> f32 {
        self.normalize_value(self.default)
    }

    fn normalized_value_to_string(&self, normalized: f32, _include_unit: bool) -> String {
        self.value_to_string(self.denormalize_value(normalized))
    }

    fn string_to_normalized_value(&self, string: String) -> Option<f32> {
        let value = self.string_to_value(&string)?;
        Some(self.normalize_value(value))
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn boolean_updates() {
        const ENABLED: BooleanParameter = BooleanParameter::new(FourCC(*b"ENBL"), "Enabled", true);

        let update = |update| ENABLED.update_value(&update);
        assert!(!update(ParameterValueUpdate::Normalized(0.2)).unwrap());
        assert!(update(ParameterValueUpdate::Raw(Arc::new(true))).unwrap());
        assert!(update(ParameterValueUpdate::Raw(Arc::new(1.0f32))).is_err());
        assert_eq!(ENABLED.value_to_string(true), "ON");
        assert_eq!(ENABLED.normalized_value_to_string(0.2, true), "OFF");

        assert_eq!(ENABLED.string_to_normalized_value(" off ".into()), Some(0.0));
        assert_eq!(ENABLED.string_to_normalized_value("TRUE".into()), Some(1.0));
        assert_eq!(ENABLED.string_to_normalized_value("maybe".into()), None);
    }
}
