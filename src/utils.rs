//! Small, shared DSP helpers.

pub mod buffer;

// -------------------------------------------------------------------------------------------------

const MINUS_INF_IN_DB: f32 = -200.0f32;

const LIN_TO_DB_FACTOR: f32 = 20.0f32 / std::f32::consts::LN_10;
const DB_TO_LIN_FACTOR: f32 = std::f32::consts::LN_10 / 20.0f32;

// -------------------------------------------------------------------------------------------------

/// Convert a linear amplitude to decibels. Values below -200 dB are clamped to -200 dB.
pub fn linear_to_db(value: f32) -> f32 {
    if value == 1.0 {
        return 0.0; // avoid rounding errors at exactly 0 dB
    } else if value > 1e-10f32 {
        return (value.ln() * LIN_TO_DB_FACTOR).max(MINUS_INF_IN_DB);
    }
    MINUS_INF_IN_DB
}

/// Convert decibels to a linear amplitude. -200 dB and below result in 0.0.
pub fn db_to_linear(value: f32) -> f32 {
    if value == 0.0f32 {
        return 1.0f32; // avoid rounding errors at exactly 0 dB
    } else if value > MINUS_INF_IN_DB {
        return (value * DB_TO_LIN_FACTOR).exp();
    }
    0.0f32
}

// -------------------------------------------------------------------------------------------------

/// Linearly map a normalized `0.0..=1.0` value into the given target range.
#[inline]
pub fn map_normalized(value: f32, min: f32, max: f32) -> f32 {
    min + value * (max - min)
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lin_db_conversion() {
        assert_eq!(linear_to_db(1.0), 0.0);
        assert_eq!(linear_to_db(0.0), MINUS_INF_IN_DB);
        assert_eq!(db_to_linear(MINUS_INF_IN_DB), 0.0);
        assert_eq!(db_to_linear(0.0), 1.0);
        assert!((linear_to_db(db_to_linear(20.0)) - 20.0).abs() < 0.0001);
        assert!((linear_to_db(db_to_linear(-20.0)) + 20.0).abs() < 0.0001);
    }

    #[test]
    fn normalized_mapping() {
        assert_eq!(map_normalized(0.0, 10.0, 20.0), 10.0);
        assert_eq!(map_normalized(1.0, 10.0, 20.0), 20.0);
        assert_eq!(map_normalized(0.5, 20.0, 10.0), 15.0);
    }
}
