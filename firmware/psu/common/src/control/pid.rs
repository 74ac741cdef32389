//! Dual PID engine with one controller per regulation mode.
//!
//! The output of the active controller is added to the duty cycle every tick (incremental form). The
//! controller of the inactive mode is held at zero.

use micromath::F32Ext;

use super::TICK_PERIOD_S;
use crate::{Gains, Mode, PidState, Settings};

/// Errors smaller than this (in V or A) are treated as zero.
pub const DEADBAND: f32 = 0.002;
/// A controller output above this multiple of the maximum duty cycle counts as divergence.
const DIVERGENCE_FACTOR: f32 = 1.5;
/// Above this multiple of the voltage setpoint, constant-current regulation limits the duty cycle.
const HIGH_VOLTAGE_FACTOR: f32 = 1.05;

/// Apply the deadband to a control error. Non-finite errors are zeroed.
pub fn apply_deadband(error: f32) -> f32 {
    if !error.is_finite() || error.abs() < DEADBAND {
        0.0
    } else {
        error
    }
}

/// A single PID controller.
#[derive(Debug, Clone, Copy)]
struct Pid {
    /// Integral, previous error and derivative.
    state: PidState,
    /// The integral increment of the last update.
    increment: f32,
}

impl Pid {
    /// A controller at rest.
    const fn new() -> Self {
        Self {
            state: PidState {
                integral: 0.0,
                previous_error: 0.0,
                derivative: 0.0,
            },
            increment: 0.0,
        }
    }

    /// Return to rest.
    fn reset(&mut self) {
        *self = Self::new();
    }

    /// Run one controller iteration and return its output.
    fn update(&mut self, error: f32, gains: &Gains) -> f32 {
        let proportional = gains.kp * error;

        self.increment = gains.ki * error * TICK_PERIOD_S;
        self.state.integral = (self.state.integral + self.increment)
            .max(-gains.integral_limit)
            .min(gains.integral_limit);

        self.state.derivative = gains.kd * (error - self.state.previous_error) / TICK_PERIOD_S;
        self.state.previous_error = error;

        proportional + self.state.integral + self.state.derivative
    }

    /// Take back this tick's integral increment (anti-windup).
    fn unwind(&mut self, gains: &Gains) {
        self.state.integral = (self.state.integral - self.increment)
            .max(-gains.integral_limit)
            .min(gains.integral_limit);
    }
}

/// Result of one regulation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Regulation {
    /// The new duty cycle in %.
    pub duty_percent: f32,
    /// The raw output of the active controller.
    pub output: f32,
    /// If true, the active controller diverged.
    pub diverged: bool,
}

/// Inputs of one regulation step.
#[derive(Debug, Clone, Copy)]
pub struct RegulationInput {
    /// The mode to regulate in.
    pub mode: Mode,
    /// Ramped voltage setpoint minus measured voltage.
    pub voltage_error: f32,
    /// Ramped current setpoint minus measured current.
    pub current_error: f32,
    /// The measured output voltage.
    pub measured_voltage_v: f32,
    /// The user's voltage setpoint (not ramped).
    pub voltage_setpoint_v: f32,
}

/// Voltage and current controllers, and the duty cycle they drive.
#[derive(Debug, Clone, Copy)]
pub struct DualPid {
    /// The voltage (CV) controller.
    voltage: Pid,
    /// The current (CC) controller.
    current: Pid,
    /// The commanded duty cycle in %.
    duty_percent: f32,
}

impl DualPid {
    /// Both controllers at rest, duty cycle zero.
    pub const fn new() -> Self {
        Self {
            voltage: Pid::new(),
            current: Pid::new(),
            duty_percent: 0.0,
        }
    }

    /// Reset both controllers and start from the lowest duty cycle.
    pub fn reset(&mut self, duty_min_percent: f32) {
        self.voltage.reset();
        self.current.reset();
        self.duty_percent = duty_min_percent;
    }

    /// The commanded duty cycle in %.
    pub fn duty_percent(&self) -> f32 {
        self.duty_percent
    }

    /// State of the voltage controller.
    pub fn voltage_state(&self) -> PidState {
        self.voltage.state
    }

    /// State of the current controller.
    pub fn current_state(&self) -> PidState {
        self.current.state
    }

    /// Manual operation: full duty cycle, both controllers at rest.
    pub fn force_max(&mut self, settings: &Settings) {
        self.reset(settings.duty_max_percent);
    }

    /// Run the controller of the given mode, and update the duty cycle.
    pub fn regulate(&mut self, input: &RegulationInput, settings: &Settings) -> Regulation {
        let duty_min = settings.duty_min_percent;
        let duty_max = settings.duty_max_percent;

        let (active, inactive, gains, error) = match input.mode {
            Mode::ConstantVoltage => (
                &mut self.voltage,
                &mut self.current,
                &settings.voltage_gains,
                apply_deadband(input.voltage_error),
            ),
            Mode::ConstantCurrent => (
                &mut self.current,
                &mut self.voltage,
                &settings.current_gains,
                apply_deadband(input.current_error),
            ),
        };

        inactive.reset();
        let output = active.update(error, gains);

        // Current regulation must not drive the voltage far above its setpoint.
        if input.mode == Mode::ConstantCurrent
            && input.measured_voltage_v > HIGH_VOLTAGE_FACTOR * input.voltage_setpoint_v
        {
            let ceiling = (input.voltage_setpoint_v / settings.system_voltage_max_v * 100.0)
                .max(duty_min);
            self.duty_percent = self.duty_percent.max(duty_min).min(ceiling);
            active.state.integral = 0.0;
        }

        let diverged = output.abs() > DIVERGENCE_FACTOR * duty_max;
        if diverged {
            warn!("{:?} controller diverged, output {}", input.mode, output);
            active.state.integral *= 0.5;
        }

        self.duty_percent = (self.duty_percent + output).max(duty_min).min(duty_max);

        if (self.duty_percent >= duty_max && error > 0.0)
            || (self.duty_percent <= duty_min && error < 0.0)
        {
            active.unwind(gains);
        }

        Regulation {
            duty_percent: self.duty_percent,
            output,
            diverged,
        }
    }
}
