//! Automatic handoff between constant-voltage and constant-current regulation.

use crate::Mode;

/// Ramped current setpoints below this value use the minimum hysteresis.
const LOW_CURRENT_THRESHOLD_A: f32 = 0.1;
/// The smallest hysteresis width in A.
const MIN_HYSTERESIS_A: f32 = 0.002;
/// Hysteresis width relative to the current setpoint.
const RELATIVE_HYSTERESIS: f32 = 0.02;
/// The relative hysteresis is computed from at least this setpoint in A.
const MIN_HYSTERESIS_BASE_A: f32 = 0.25;
/// Below this measured current, voltage regulation is always selected.
const NO_LOAD_CURRENT_A: f32 = 0.005;
/// A measured voltage this far above the voltage setpoint forces voltage regulation.
const VOLTAGE_OVERRUN_V: f32 = 0.5;

/// The width of the hysteresis band around the current setpoint.
pub fn hysteresis_a(current_setpoint_a: f32) -> f32 {
    if current_setpoint_a >= LOW_CURRENT_THRESHOLD_A {
        (RELATIVE_HYSTERESIS * current_setpoint_a.max(MIN_HYSTERESIS_BASE_A)).max(MIN_HYSTERESIS_A)
    } else {
        MIN_HYSTERESIS_A
    }
}

/// Decides every tick whether voltage or current is regulated.
#[derive(Debug, Clone, Copy)]
pub struct ModeArbiter {
    /// The mode of the last tick.
    mode: Mode,
}

impl ModeArbiter {
    /// Start in voltage regulation.
    pub const fn new() -> Self {
        Self {
            mode: Mode::ConstantVoltage,
        }
    }

    /// Fall back to voltage regulation.
    pub fn reset(&mut self) {
        self.mode = Mode::ConstantVoltage;
    }

    /// The mode of the last tick.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Select the mode for this tick.
    ///
    /// - Current above the band: constant current.
    /// - Current below the band, no load, or voltage overrun: constant voltage.
    /// - Inside the band: keep the previous mode.
    pub fn decide(
        &mut self,
        measured_current_a: f32,
        measured_voltage_v: f32,
        ramped_current_a: f32,
        voltage_setpoint_v: f32,
    ) -> Mode {
        let hysteresis_a = hysteresis_a(ramped_current_a);

        let mode = if measured_current_a > ramped_current_a + hysteresis_a {
            Mode::ConstantCurrent
        } else if measured_current_a < ramped_current_a - hysteresis_a
            || measured_current_a < NO_LOAD_CURRENT_A
            || measured_voltage_v >= voltage_setpoint_v + VOLTAGE_OVERRUN_V
        {
            Mode::ConstantVoltage
        } else {
            self.mode
        };

        if mode != self.mode {
            info!(
                "Mode handoff {:?} -> {:?} at {} A",
                self.mode, mode, measured_current_a
            );
        }

        self.mode = mode;
        mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use micromath::F32Ext;

    #[test]
    fn hysteresis_width() {
        assert_eq!(hysteresis_a(0.05), 0.002);
        // Relative part is computed from at least 0.25 A.
        assert!((hysteresis_a(0.1) - 0.005).abs() < 1e-7);
        assert!((hysteresis_a(2.0) - 0.04).abs() < 1e-7);
    }

    #[test]
    fn switches_to_current_regulation_above_band() {
        let mut arbiter = ModeArbiter::new();

        assert_eq!(arbiter.decide(2.05, 4.0, 2.0, 5.0), Mode::ConstantCurrent);
        // Stays while above the band.
        assert_eq!(arbiter.decide(2.1, 3.5, 2.0, 5.0), Mode::ConstantCurrent);
    }

    #[test]
    fn stable_inside_band() {
        let mut arbiter = ModeArbiter::new();

        // Band is 2.0 A +/- 0.04 A.
        for current_a in [1.97, 2.0, 2.03, 1.99] {
            assert_eq!(
                arbiter.decide(current_a, 5.0, 2.0, 5.0),
                Mode::ConstantVoltage
            );
        }

        arbiter.decide(2.5, 4.0, 2.0, 5.0);
        for current_a in [1.97, 2.0, 2.03, 1.99] {
            assert_eq!(
                arbiter.decide(current_a, 4.0, 2.0, 5.0),
                Mode::ConstantCurrent
            );
        }
    }

    #[test]
    fn returns_to_voltage_regulation() {
        let mut arbiter = ModeArbiter::new();

        arbiter.decide(2.5, 4.0, 2.0, 5.0);
        assert_eq!(arbiter.decide(1.9, 4.0, 2.0, 5.0), Mode::ConstantVoltage);

        arbiter.decide(2.5, 4.0, 2.0, 5.0);
        assert_eq!(arbiter.decide(0.001, 4.0, 0.0, 5.0), Mode::ConstantVoltage);
    }

    #[test]
    fn voltage_overrun_forces_voltage_regulation() {
        let mut arbiter = ModeArbiter::new();
        arbiter.decide(2.5, 4.0, 2.0, 5.0);

        // Inside the band, but the output voltage runs away.
        assert_eq!(arbiter.decide(2.0, 5.5, 2.0, 5.0), Mode::ConstantVoltage);
    }

    #[test]
    fn reset_selects_voltage_regulation() {
        let mut arbiter = ModeArbiter::new();
        arbiter.decide(2.5, 4.0, 2.0, 5.0);
        arbiter.reset();

        assert_eq!(arbiter.mode(), Mode::ConstantVoltage);
    }
}
