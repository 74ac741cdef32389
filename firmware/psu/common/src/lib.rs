//! A bench power supply control library.
//!
//! Regulates the output voltage or current with a dual-mode PID controller, and guards the output with a
//! protection monitor that can open the output switch.
#![no_std]
#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

mod fmt;

pub mod control;

use core::cell::RefCell;

use control::diagnostics::{DeviationReport, DeviationStats};
use control::measurement::PowerMeasurement;
use control::ramp::RampedSetpoint;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use serde::{Deserialize, Serialize};
use uom::si::electric_current::ampere;
use uom::si::electric_potential::volt;
use uom::si::power::watt;

pub use psu_protocol::{ErrorCode, Fault, FaultFlags, Mode, PidState, Status, Telemetry};

/// Gains and integral limit of one PID controller.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Gains {
    /// Proportional gain.
    pub kp: f32,
    /// Integral gain (per second).
    pub ki: f32,
    /// Derivative gain (seconds).
    pub kd: f32,
    /// The integral term is clamped to +/- this value.
    pub integral_limit: f32,
}

impl Gains {
    /// All values, for bulk checks.
    fn values(&self) -> [f32; 4] {
        [self.kp, self.ki, self.kd, self.integral_limit]
    }
}

/// Tunable gains, bounds and protection thresholds.
///
/// Loaded and stored by the settings collaborator. The control loop only reads them.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Settings {
    /// Voltage (CV) controller gains.
    pub voltage_gains: Gains,
    /// Current (CC) controller gains.
    pub current_gains: Gains,
    /// The lowest duty cycle in %.
    pub duty_min_percent: f32,
    /// The highest duty cycle in %.
    pub duty_max_percent: f32,
    /// If true, the PWM output polarity is inverted.
    pub invert_pwm: bool,
    /// Over-temperature threshold in °C.
    pub temperature_limit_deg_c: f32,
    /// The largest tolerated voltage tracking error in V.
    pub voltage_deviation_limit_v: f32,
    /// The largest tolerated current overshoot, as a fraction of the setpoint.
    pub current_deviation_limit: f32,
    /// The lowest valid output voltage in V.
    pub system_voltage_min_v: f32,
    /// The highest valid output voltage in V.
    pub system_voltage_max_v: f32,
    /// The absolute current limit in A.
    pub system_current_max_a: f32,
    /// The absolute power limit in W.
    pub system_power_max_w: f32,
}

/// Reasons for rejecting [`Settings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SettingsError {
    /// A value is NaN or infinite.
    #[error("a setting is not a finite number")]
    NotFinite,
    /// The duty cycle bounds are not within 0..=100 %, or inverted.
    #[error("duty cycle bounds must satisfy 0 <= min <= max <= 100")]
    DutyBounds,
    /// A gain, limit or threshold is negative.
    #[error("gains and limits must not be negative")]
    NegativeLimit,
    /// The system voltage range is inverted.
    #[error("the system voltage minimum exceeds the maximum")]
    VoltageRange,
}

impl Settings {
    /// Factory default settings.
    pub const fn default() -> Self {
        Self {
            voltage_gains: Gains {
                kp: 3.0,
                ki: 1.0,
                kd: 0.05,
                integral_limit: 50.0,
            },
            current_gains: Gains {
                kp: 3.0,
                ki: 1.0,
                kd: 0.1,
                integral_limit: 50.0,
            },
            duty_min_percent: 5.0,
            duty_max_percent: 100.0,
            invert_pwm: false,
            temperature_limit_deg_c: 70.0,
            voltage_deviation_limit_v: 1.0,
            current_deviation_limit: 0.05,
            system_voltage_min_v: 1.5,
            system_voltage_max_v: 36.0,
            system_current_max_a: 3.2,
            system_power_max_w: 100.0,
        }
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let values = [
            self.duty_min_percent,
            self.duty_max_percent,
            self.temperature_limit_deg_c,
            self.voltage_deviation_limit_v,
            self.current_deviation_limit,
            self.system_voltage_min_v,
            self.system_voltage_max_v,
            self.system_current_max_a,
            self.system_power_max_w,
        ];

        let gains = self
            .voltage_gains
            .values()
            .into_iter()
            .chain(self.current_gains.values());

        if !values.iter().copied().chain(gains.clone()).all(f32::is_finite) {
            return Err(SettingsError::NotFinite);
        }

        if self.duty_min_percent < 0.0
            || self.duty_max_percent > 100.0
            || self.duty_min_percent > self.duty_max_percent
        {
            return Err(SettingsError::DutyBounds);
        }

        let limits = [
            self.voltage_deviation_limit_v,
            self.current_deviation_limit,
            self.system_voltage_min_v,
            self.system_current_max_a,
            self.system_power_max_w,
        ];

        if gains.chain(limits).any(|value| value < 0.0) {
            return Err(SettingsError::NegativeLimit);
        }

        if self.system_voltage_min_v > self.system_voltage_max_v {
            return Err(SettingsError::VoltageRange);
        }

        Ok(())
    }
}

/// The user's target values.
///
/// Bounded to the system limits by the writer.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Setpoint {
    /// Target output voltage in V.
    pub voltage_v: f32,
    /// Target output current in A.
    pub current_a: f32,
    /// The electronic fuse trips above this current in A. Zero or less disarms the fuse.
    pub cutoff_a: f32,
}

impl Setpoint {
    /// Power-on setpoint.
    pub const fn default() -> Self {
        Self {
            voltage_v: 5.0,
            current_a: 2.0,
            cutoff_a: 2.0,
        }
    }
}

/// How the duty cycle is determined.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OperatingMode {
    /// The PID controllers regulate the output.
    #[default]
    Automatic,
    /// The duty cycle is fixed at its maximum.
    Manual,
}

/// The latest measurement of the output.
#[derive(Debug, Default, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurement {
    /// Output voltage in V.
    pub voltage_v: f32,
    /// Output current in A.
    pub current_a: f32,
    /// Output power in W.
    pub power_w: f32,
    /// Power stage temperature in °C.
    pub temperature_deg_c: f32,
}

impl Measurement {
    /// No measurement was taken yet.
    const fn new() -> Self {
        Self {
            voltage_v: 0.0,
            current_a: 0.0,
            power_w: 0.0,
            temperature_deg_c: f32::NAN,
        }
    }

    /// Take over the values of a power measurement. The temperature is kept.
    pub fn update(&mut self, power_measurement: &PowerMeasurement) {
        self.voltage_v = power_measurement.voltage.get::<volt>();
        self.current_a = power_measurement.current.get::<ampere>();
        self.power_w = power_measurement.power.get::<watt>();
    }
}

/// State that is shared between the control loop and its collaborators (UI, settings storage, telemetry).
///
/// Collaborators write the inputs (setpoint, settings, operating mode, manual enable, reported faults).
/// The control loop writes everything else, and may clear `manual_enable`.
#[derive(Debug, Clone)]
pub struct SharedState {
    /// The user's target values.
    pub setpoint: Setpoint,
    /// The operating mode.
    pub operating_mode: OperatingMode,
    /// The user's intent to energize the output.
    pub manual_enable: bool,

    /// Tunables, only replaced through [`SharedState::apply_settings`].
    settings: Settings,

    /// The latest measurement.
    pub measurement: Measurement,
    /// The ramped setpoint that the controllers follow.
    pub ramped: RampedSetpoint,
    /// The active regulation mode.
    pub mode: Mode,
    /// Voltage controller state.
    pub voltage_pid: PidState,
    /// Current controller state.
    pub current_pid: PidState,
    /// The commanded duty cycle in %.
    pub duty_percent: f32,
    /// The PWM compare value that corresponds to the duty cycle.
    pub pwm_compare: u16,
    /// All fault indicators.
    pub faults: FaultFlags,
    /// The aggregated fault code.
    pub error_code: ErrorCode,
    /// If true, the output protection switch is closed.
    pub output_active: bool,
    /// Tracking error statistics since the last report.
    pub deviation: DeviationStats,
}

impl SharedState {
    /// Create the power-on state. The output is off.
    pub const fn new() -> Self {
        Self {
            setpoint: Setpoint::default(),
            operating_mode: OperatingMode::Automatic,
            manual_enable: false,
            settings: Settings::default(),
            measurement: Measurement::new(),
            ramped: RampedSetpoint {
                voltage_v: 0.0,
                current_a: 0.0,
            },
            mode: Mode::ConstantVoltage,
            voltage_pid: PidState {
                integral: 0.0,
                previous_error: 0.0,
                derivative: 0.0,
            },
            current_pid: PidState {
                integral: 0.0,
                previous_error: 0.0,
                derivative: 0.0,
            },
            duty_percent: 0.0,
            pwm_compare: 0,
            faults: FaultFlags::new(),
            error_code: ErrorCode::NONE,
            output_active: false,
            deviation: DeviationStats::new(),
        }
    }

    /// The active settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replace the settings, if they are valid. Invalid settings are rejected, the previous ones stay active.
    pub fn apply_settings(&mut self, settings: Settings) -> Result<(), SettingsError> {
        if let Err(error) = settings.validate() {
            warn!("Rejected settings: {:?}", error);
            return Err(error);
        }

        self.settings = settings;
        Ok(())
    }

    /// Report a fault that a collaborator detected (e.g. an init failure).
    ///
    /// Faults that the control loop monitors itself are overwritten on the next tick.
    pub fn report_fault(&mut self, fault: Fault, active: bool) {
        self.faults.set(fault, active);
    }

    /// A snapshot of the device status.
    pub fn status(&self) -> Status {
        Status {
            error_code: self.error_code,
            mode: self.mode,
            output_active: self.output_active,
            manual_enable: self.manual_enable,
            duty_percent: self.duty_percent,
        }
    }

    /// A snapshot of measurement and controller data.
    ///
    /// Takes the accumulated tracking error statistics, so that the next report starts fresh.
    pub fn take_telemetry(&mut self) -> Telemetry {
        let DeviationReport {
            voltage_peak_v,
            voltage_rms_v,
            current_peak_a,
            current_rms_a,
        } = self.deviation.take();

        Telemetry {
            voltage_v: self.measurement.voltage_v,
            current_a: self.measurement.current_a,
            power_w: self.measurement.power_w,
            temperature_deg_c: self.measurement.temperature_deg_c,
            ramped_voltage_v: self.ramped.voltage_v,
            ramped_current_a: self.ramped.current_a,
            voltage_pid: self.voltage_pid,
            current_pid: self.current_pid,
            voltage_error_peak_v: voltage_peak_v,
            voltage_error_rms_v: voltage_rms_v,
            current_error_peak_a: current_peak_a,
            current_error_rms_a: current_rms_a,
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide shared state.
pub static SHARED_STATE_MUTEX: Mutex<CriticalSectionRawMutex, RefCell<SharedState>> =
    Mutex::new(RefCell::new(SharedState::new()));

/// Run a closure on the shared state.
pub fn with_shared_state<R>(f: impl FnOnce(&mut SharedState) -> R) -> R {
    SHARED_STATE_MUTEX.lock(|x| f(&mut x.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        assert_eq!(Settings::default().validate(), Ok(()));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut settings = Settings::default();
        settings.duty_min_percent = 80.0;
        settings.duty_max_percent = 20.0;
        assert_eq!(settings.validate(), Err(SettingsError::DutyBounds));

        let mut settings = Settings::default();
        settings.duty_max_percent = 101.0;
        assert_eq!(settings.validate(), Err(SettingsError::DutyBounds));

        let mut settings = Settings::default();
        settings.current_gains.ki = f32::NAN;
        assert_eq!(settings.validate(), Err(SettingsError::NotFinite));

        let mut settings = Settings::default();
        settings.voltage_gains.integral_limit = -1.0;
        assert_eq!(settings.validate(), Err(SettingsError::NegativeLimit));

        let mut settings = Settings::default();
        settings.system_voltage_min_v = 40.0;
        assert_eq!(settings.validate(), Err(SettingsError::VoltageRange));
    }

    #[test]
    fn rejected_settings_keep_previous() {
        let mut state = SharedState::new();

        let mut settings = Settings::default();
        settings.temperature_limit_deg_c = 60.0;
        assert_eq!(state.apply_settings(settings), Ok(()));
        assert_eq!(state.settings().temperature_limit_deg_c, 60.0);

        settings.temperature_limit_deg_c = f32::INFINITY;
        assert_eq!(
            state.apply_settings(settings),
            Err(SettingsError::NotFinite)
        );
        assert_eq!(state.settings().temperature_limit_deg_c, 60.0);
    }

    #[test]
    fn shared_state_is_reachable_through_mutex() {
        with_shared_state(|state| state.report_fault(Fault::DisplayInitFailure, true));

        let faults = with_shared_state(|state| state.faults);
        assert!(faults.is_set(Fault::DisplayInitFailure));

        with_shared_state(|state| state.report_fault(Fault::DisplayInitFailure, false));
    }

    #[test]
    fn status_reflects_state() {
        let mut state = SharedState::new();
        state.manual_enable = true;
        state.output_active = true;
        state.mode = Mode::ConstantCurrent;
        state.duty_percent = 42.0;
        state.error_code = ErrorCode(Fault::LowMemory.mask());

        let status = state.status();
        assert!(status.output_active);
        assert!(status.manual_enable);
        assert_eq!(status.mode, Mode::ConstantCurrent);
        assert_eq!(status.duty_percent, 42.0);
        assert!(status.error_code.contains(Fault::LowMemory));
    }
}
