//! Volume clamping helpers.

use tracing::warn;

/// Clamps a volume to `[0.0, 1.0]`, logging when the input was out of range.
///
/// Non-finite input falls back to `default`.
pub fn clamp_unit(name: &str, value: f32, default: f32) -> f32 {
    if !value.is_finite() {
        warn!(name, value = %value, default, "Value is not a number, using default");
        return default;
    }
    if value < 0.0 {
        warn!(name, value, "Value below 0.0, clamping");
        return 0.0;
    }
    if value > 1.0 {
        warn!(name, value, "Value above 1.0, clamping");
        return 1.0;
    }
    value
}

/// Converts a unit volume to an integer percentage in `[0, 100]`.
pub fn clamp_percent(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_range_is_unchanged() {
        assert_eq!(clamp_unit("volume", 0.25, 1.0), 0.25);
    }

    #[test]
    fn out_of_range_is_clamped() {
        assert_eq!(clamp_unit("volume", -0.5, 1.0), 0.0);
        assert_eq!(clamp_unit("volume", 1.7, 1.0), 1.0);
    }

    #[test]
    fn nan_uses_default() {
        assert_eq!(clamp_unit("volume", f32::NAN, 0.5), 0.5);
    }

    #[test]
    fn percent_conversion() {
        assert_eq!(clamp_percent(0.5), 50);
        assert_eq!(clamp_percent(2.0), 100);
        assert_eq!(clamp_percent(-1.0), 0);
    }
}
