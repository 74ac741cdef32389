//! Protocol for reporting the state of the power supply controller.
#![no_std]
#![warn(missing_docs)]

mod fault;

pub use fault::{ErrorCode, FAULT_COUNT, Fault, FaultFlags};

use postcard_schema::Schema;
use serde::{Deserialize, Serialize};

/// The active regulation mode.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Schema, Serialize, Deserialize, defmt::Format,
)]
pub enum Mode {
    /// The output voltage is regulated.
    #[default]
    ConstantVoltage,
    /// The output current is regulated.
    ConstantCurrent,
}

/// Internal state of one PID controller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Schema, Serialize, Deserialize, defmt::Format)]
pub struct PidState {
    /// Accumulated integral term.
    pub integral: f32,
    /// The error of the previous tick.
    pub previous_error: f32,
    /// The derivative term of the last tick.
    pub derivative: f32,
}

/// Device status info.
#[derive(Debug, Default, Clone, Copy, PartialEq, Schema, Serialize, Deserialize, defmt::Format)]
pub struct Status {
    /// The aggregated fault state.
    pub error_code: ErrorCode,
    /// The active regulation mode.
    pub mode: Mode,
    /// If true, the output protection switch is closed.
    pub output_active: bool,
    /// The user's enable request.
    pub manual_enable: bool,
    /// The commanded duty cycle in %.
    pub duty_percent: f32,
}

/// Periodic measurement and controller data from the device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Schema, Serialize, Deserialize, defmt::Format)]
pub struct Telemetry {
    /// Measured output voltage in V.
    pub voltage_v: f32,
    /// Measured output current in A.
    pub current_a: f32,
    /// Measured output power in W.
    pub power_w: f32,
    /// Power stage temperature in °C.
    pub temperature_deg_c: f32,
    /// The ramped voltage setpoint in V.
    pub ramped_voltage_v: f32,
    /// The ramped current setpoint in A.
    pub ramped_current_a: f32,
    /// Voltage controller state.
    pub voltage_pid: PidState,
    /// Current controller state.
    pub current_pid: PidState,
    /// Largest absolute voltage error since the last report in V.
    pub voltage_error_peak_v: f32,
    /// RMS voltage error since the last report in V.
    pub voltage_error_rms_v: f32,
    /// Largest absolute current error since the last report in A.
    pub current_error_peak_a: f32,
    /// RMS current error since the last report in A.
    pub current_error_rms_a: f32,
}
