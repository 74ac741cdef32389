//! Protection monitor: debounced fault detectors and the output switch gate.
//!
//! Every tick, the detectors run in a fixed order on the latest measurement and update their fault flags.
//! Afterwards, the gate decides whether the output switch may be closed. A safety-relevant fault opens the
//! switch and latches the user's enable request off, so the user has to re-enable the output explicitly.

mod debounce;
mod thermistor;

use debounce::Debounce;
use thermistor::Thermistor;
use uom::si::f32::ElectricPotential;
use uom::si::thermodynamic_temperature::degree_celsius;

use crate::{Fault, Mode, OperatingMode, SharedState};

/// Ticks of over-temperature until the fault is raised (~105 ms).
pub const OVER_TEMPERATURE_TICKS: u8 = 3;
/// Ticks above the current cutoff until the fuse blows (~70 ms).
pub const FUSE_TICKS: u8 = 2;
/// Ticks of voltage tracking error until the fault is raised (~105 ms).
pub const VOLTAGE_DEVIATION_TICKS: u8 = 3;
/// Ticks of current overshoot until the fault is raised (~105 ms).
pub const CURRENT_DEVIATION_TICKS: u8 = 3;
/// Ticks after a (re)start during which transients are tolerated (~1 s).
pub const STARTUP_GRACE_TICKS: u8 = 29;

/// The plausible range of the power stage temperature in °C.
const SENSOR_RANGE_DEG_C: core::ops::RangeInclusive<f32> = 0.0..=100.0;

/// The faults that the protection monitor owns.
pub const MONITORED_FAULTS: [Fault; 8] = [
    Fault::SensorFailure,
    Fault::OverTemperature,
    Fault::FuseBlown,
    Fault::OverCurrent,
    Fault::OverPower,
    Fault::VoltageOutOfRange,
    Fault::VoltageDeviation,
    Fault::CurrentDeviation,
];

/// Debounced fault detection and output gating.
#[derive(Debug, Clone, Copy)]
pub struct ProtectionMonitor {
    /// Temperature acquisition.
    thermistor: Thermistor,
    /// Over-temperature detector.
    over_temperature: Debounce,
    /// Electronic fuse.
    fuse: Debounce,
    /// Voltage tracking error detector.
    voltage_deviation: Debounce,
    /// Current overshoot detector.
    current_deviation: Debounce,
    /// Remaining startup grace ticks.
    grace_ticks: u8,
}

impl ProtectionMonitor {
    /// A monitor at the start of its grace period.
    pub const fn new() -> Self {
        Self {
            thermistor: Thermistor::new(),
            over_temperature: Debounce::new(OVER_TEMPERATURE_TICKS),
            fuse: Debounce::new(FUSE_TICKS),
            voltage_deviation: Debounce::new(VOLTAGE_DEVIATION_TICKS),
            current_deviation: Debounce::new(CURRENT_DEVIATION_TICKS),
            grace_ticks: STARTUP_GRACE_TICKS,
        }
    }

    /// Forget all debounce counts and restart the grace period.
    ///
    /// The temperature filter keeps its state.
    pub fn restart(&mut self) {
        *self = Self {
            thermistor: self.thermistor,
            ..Self::new()
        };
    }

    /// If true, the startup grace period is running.
    pub fn is_starting(&self) -> bool {
        self.grace_ticks > 0
    }

    /// Acquire the power stage temperature in °C from a thermistor divider sample.
    pub fn acquire_temperature(&mut self, ntc_potential: ElectricPotential) -> f32 {
        self.thermistor
            .sample(ntc_potential)
            .get::<degree_celsius>()
    }

    /// Run all detectors on the shared state's measurement, and update the fault flags.
    pub fn check(&mut self, state: &mut SharedState) {
        if self.grace_ticks > 0 {
            self.grace_ticks -= 1;
            if self.grace_ticks == 0 {
                debug!("Startup grace period over");
            }
        }
        let starting = self.is_starting();

        let settings = *state.settings();
        let measurement = state.measurement;
        let automatic = state.operating_mode == OperatingMode::Automatic;

        // Temperature
        let temperature_deg_c = measurement.temperature_deg_c;
        state.faults.set(
            Fault::SensorFailure,
            !SENSOR_RANGE_DEG_C.contains(&temperature_deg_c),
        );
        state.faults.set(
            Fault::OverTemperature,
            self.over_temperature
                .update(temperature_deg_c >= settings.temperature_limit_deg_c),
        );

        // Electronic fuse, disarmed without a cutoff. Invalid readings hold the previous state.
        let current_a = measurement.current_a;
        let cutoff_a = state.setpoint.cutoff_a;
        if cutoff_a <= 0.0 {
            self.fuse.reset();
            state.faults.set(Fault::FuseBlown, false);
        } else if !current_a.is_nan() && current_a >= 0.0 {
            state
                .faults
                .set(Fault::FuseBlown, self.fuse.update(current_a > cutoff_a));
        }

        // System limits
        let voltage_v = measurement.voltage_v;
        state.faults.set(
            Fault::OverCurrent,
            !starting && current_a > settings.system_current_max_a,
        );
        state.faults.set(
            Fault::OverPower,
            !starting && measurement.power_w > settings.system_power_max_w,
        );
        state.faults.set(
            Fault::VoltageOutOfRange,
            !starting
                && (voltage_v > settings.system_voltage_max_v
                    || voltage_v < settings.system_voltage_min_v),
        );

        // Voltage tracking, in automatic voltage regulation only.
        if !automatic || starting || state.mode == Mode::ConstantCurrent {
            self.voltage_deviation.reset();
            state.faults.set(Fault::VoltageDeviation, false);
        } else {
            let deviation_v = voltage_v - state.ramped.voltage_v;
            let exceeded = deviation_v > settings.voltage_deviation_limit_v
                || deviation_v < -settings.voltage_deviation_limit_v;
            state.faults.set(
                Fault::VoltageDeviation,
                self.voltage_deviation.update(exceeded),
            );
        }

        // Current overshoot, in automatic mode only. Invalid readings hold the previous state.
        if !automatic {
            self.current_deviation.reset();
            state.faults.set(Fault::CurrentDeviation, false);
        } else if !current_a.is_nan() && !state.setpoint.current_a.is_nan() {
            let limit_a = state.ramped.current_a * (1.0 + settings.current_deviation_limit);
            state.faults.set(
                Fault::CurrentDeviation,
                self.current_deviation.update(current_a > limit_a),
            );
        }
    }

    /// Decide whether the output switch may be closed, and latch the enable request off on a fault.
    pub fn gate(&self, state: &mut SharedState) {
        if !state.manual_enable {
            state.output_active = false;
            return;
        }

        if state.faults.any_safety_relevant() {
            if state.output_active {
                warn!("Output switched off by protection");
            } else {
                warn!("Output enable refused by protection");
            }

            state.output_active = false;
            state.manual_enable = false;
        } else {
            state.output_active = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ramp::RampedSetpoint;
    use crate::{FaultFlags, Measurement};
    use uom::si::electric_potential::volt;

    /// A healthy state: 5 V / 1 A output at 30 °C, automatic voltage regulation.
    fn healthy_state() -> SharedState {
        let mut state = SharedState::new();
        state.measurement = Measurement {
            voltage_v: 5.0,
            current_a: 1.0,
            power_w: 5.0,
            temperature_deg_c: 30.0,
        };
        state.ramped = RampedSetpoint {
            voltage_v: 5.0,
            current_a: 2.0,
        };
        state
    }

    /// A monitor with its grace period over.
    fn started_monitor(state: &mut SharedState) -> ProtectionMonitor {
        let mut monitor = ProtectionMonitor::new();
        for _ in 0..STARTUP_GRACE_TICKS {
            monitor.check(state);
        }
        assert!(!monitor.is_starting());
        monitor
    }

    #[test]
    fn healthy_state_has_no_faults() {
        let mut state = healthy_state();
        let mut monitor = started_monitor(&mut state);

        monitor.check(&mut state);
        assert_eq!(state.faults, FaultFlags::new());
    }

    #[test]
    fn grace_period_suppresses_system_limits() {
        let mut state = healthy_state();
        state.measurement.voltage_v = 0.0;
        state.measurement.current_a = 4.0;
        state.measurement.power_w = 150.0;
        state.setpoint.cutoff_a = 0.0;

        let mut monitor = ProtectionMonitor::new();
        for _ in 0..STARTUP_GRACE_TICKS - 1 {
            monitor.check(&mut state);
            assert!(!state.faults.is_set(Fault::OverCurrent));
            assert!(!state.faults.is_set(Fault::OverPower));
            assert!(!state.faults.is_set(Fault::VoltageOutOfRange));
        }

        monitor.check(&mut state);
        assert!(state.faults.is_set(Fault::OverCurrent));
        assert!(state.faults.is_set(Fault::OverPower));
        assert!(state.faults.is_set(Fault::VoltageOutOfRange));
    }

    #[test]
    fn sensor_failure_is_immediate() {
        let mut state = healthy_state();
        let mut monitor = started_monitor(&mut state);

        for temperature_deg_c in [-1.0, 100.5, f32::NAN] {
            state.measurement.temperature_deg_c = temperature_deg_c;
            monitor.check(&mut state);
            assert!(state.faults.is_set(Fault::SensorFailure));
        }

        state.measurement.temperature_deg_c = 100.0;
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::SensorFailure));
    }

    #[test]
    fn over_temperature_is_debounced() {
        let mut state = healthy_state();
        let mut monitor = started_monitor(&mut state);

        state.measurement.temperature_deg_c = 70.0;
        monitor.check(&mut state);
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::OverTemperature));

        monitor.check(&mut state);
        assert!(state.faults.is_set(Fault::OverTemperature));

        state.measurement.temperature_deg_c = 69.9;
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::OverTemperature));
    }

    #[test]
    fn fuse_blows_on_second_tick_and_clears() {
        let mut state = healthy_state();
        state.setpoint.cutoff_a = 2.0;
        state.ramped.current_a = 3.0;
        let mut monitor = started_monitor(&mut state);

        state.measurement.current_a = 2.5;
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::FuseBlown));

        monitor.check(&mut state);
        assert!(state.faults.is_set(Fault::FuseBlown));

        state.measurement.current_a = 1.0;
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::FuseBlown));
    }

    #[test]
    fn fuse_ignores_invalid_current() {
        let mut state = healthy_state();
        state.setpoint.cutoff_a = 2.0;
        state.ramped.current_a = 3.0;
        let mut monitor = started_monitor(&mut state);

        state.measurement.current_a = 2.5;
        monitor.check(&mut state);

        // Neither counts nor clears.
        state.measurement.current_a = f32::NAN;
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::FuseBlown));

        state.measurement.current_a = 2.5;
        monitor.check(&mut state);
        assert!(state.faults.is_set(Fault::FuseBlown));
    }

    #[test]
    fn fuse_disarmed_without_cutoff() {
        let mut state = healthy_state();
        state.setpoint.cutoff_a = 0.0;
        state.ramped.current_a = 3.0;
        let mut monitor = started_monitor(&mut state);

        state.measurement.current_a = 2.9;
        for _ in 0..5 {
            monitor.check(&mut state);
        }
        assert!(!state.faults.is_set(Fault::FuseBlown));
    }

    #[test]
    fn voltage_deviation_only_in_automatic_voltage_regulation() {
        let mut state = healthy_state();
        let mut monitor = started_monitor(&mut state);

        state.measurement.voltage_v = 6.5;
        monitor.check(&mut state);
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::VoltageDeviation));
        monitor.check(&mut state);
        assert!(state.faults.is_set(Fault::VoltageDeviation));

        state.mode = Mode::ConstantCurrent;
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::VoltageDeviation));

        state.mode = Mode::ConstantVoltage;
        state.operating_mode = OperatingMode::Manual;
        for _ in 0..5 {
            monitor.check(&mut state);
        }
        assert!(!state.faults.is_set(Fault::VoltageDeviation));
    }

    #[test]
    fn current_deviation_is_debounced() {
        let mut state = healthy_state();
        state.setpoint.cutoff_a = 0.0;
        let mut monitor = started_monitor(&mut state);

        // Ramped 2.0 A with 5 % tolerance.
        state.measurement.current_a = 2.11;
        monitor.check(&mut state);
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::CurrentDeviation));
        monitor.check(&mut state);
        assert!(state.faults.is_set(Fault::CurrentDeviation));

        state.measurement.current_a = 2.09;
        monitor.check(&mut state);
        assert!(!state.faults.is_set(Fault::CurrentDeviation));
    }

    #[test]
    fn gate_closes_switch_without_faults() {
        let mut state = healthy_state();
        let monitor = ProtectionMonitor::new();

        monitor.gate(&mut state);
        assert!(!state.output_active);

        state.manual_enable = true;
        monitor.gate(&mut state);
        assert!(state.output_active);
        assert!(state.manual_enable);
    }

    #[test]
    fn safety_fault_latches_enable_off() {
        let mut state = healthy_state();
        let monitor = ProtectionMonitor::new();
        state.manual_enable = true;
        monitor.gate(&mut state);

        state.faults.set(Fault::OverTemperature, true);
        monitor.gate(&mut state);
        assert!(!state.output_active);
        assert!(!state.manual_enable);

        // No automatic retry after the fault is gone.
        state.faults.set(Fault::OverTemperature, false);
        monitor.gate(&mut state);
        assert!(!state.output_active);
    }

    #[test]
    fn informational_fault_does_not_gate() {
        let mut state = healthy_state();
        let monitor = ProtectionMonitor::new();
        state.manual_enable = true;
        state.faults.set(Fault::WifiInitFailure, true);
        state.faults.set(Fault::VoltagePidDivergence, true);

        monitor.gate(&mut state);
        assert!(state.output_active);
    }

    #[test]
    fn restart_keeps_temperature_filter() {
        let mut monitor = ProtectionMonitor::new();
        let sample = ElectricPotential::new::<volt>(0.5);

        let first = monitor.acquire_temperature(sample);
        monitor.restart();
        let second = monitor.acquire_temperature(sample);

        assert!(monitor.is_starting());
        // Filter continues from its previous value, so the temperature keeps falling.
        assert!(second < first);
    }
}
