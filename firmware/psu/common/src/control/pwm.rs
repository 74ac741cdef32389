//! Maps the duty cycle to a PWM compare value.

/// PWM frequency of the power stage.
pub const PWM_FREQUENCY_HZ: u32 = 9_700;
/// PWM resolution.
pub const PWM_RESOLUTION_BITS: u8 = 12;
/// The compare value at 100 % duty cycle.
pub const PWM_MAX: u16 = (1 << PWM_RESOLUTION_BITS) - 1;

/// Convert a duty cycle in % to a compare value, optionally with inverted polarity.
///
/// The duty cycle is limited to 0..=100 %. The fraction of a compare step is truncated.
pub fn compare_value(duty_percent: f32, invert: bool) -> u16 {
    let duty_percent = duty_percent.max(0.0).min(100.0);
    let value = (duty_percent / 100.0 * PWM_MAX as f32) as u16;

    if invert { PWM_MAX - value } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_duty_to_compare() {
        assert_eq!(PWM_MAX, 4095);
        assert_eq!(compare_value(0.0, false), 0);
        assert_eq!(compare_value(100.0, false), 4095);
        assert_eq!(compare_value(50.0, false), 2047);
        assert_eq!(compare_value(5.0, false), 204);
    }

    #[test]
    fn inverts_polarity() {
        assert_eq!(compare_value(0.0, true), 4095);
        assert_eq!(compare_value(100.0, true), 0);
        assert_eq!(compare_value(5.0, true), 4095 - 204);
    }

    #[test]
    fn out_of_range_duty_is_limited() {
        assert_eq!(compare_value(150.0, false), 4095);
        assert_eq!(compare_value(-3.0, false), 0);
        assert_eq!(compare_value(f32::NAN, false), 0);
    }
}
