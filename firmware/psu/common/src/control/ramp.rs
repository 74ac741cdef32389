//! Moves the controllers' setpoints toward the user's targets at a bounded rate.

use micromath::F32Ext;
use serde::{Deserialize, Serialize};

use crate::Setpoint;

/// Voltage ramp step per tick in µV (0.1 V).
pub const VOLTAGE_STEP_UV: i32 = 100_000;
/// Current ramp step per tick in µA (0.01 A).
pub const CURRENT_STEP_UA: i32 = 10_000;

/// Micro-units per unit.
const MICRO: f32 = 1_000_000.0;

/// The setpoint that the controllers follow.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RampedSetpoint {
    /// Ramped voltage in V.
    pub voltage_v: f32,
    /// Ramped current in A.
    pub current_a: f32,
}

/// One ramped quantity, tracked in integer micro-units.
///
/// Whole steps add up without rounding drift, so the ramp lands exactly on the target.
#[derive(Debug, Clone, Copy)]
struct Axis {
    /// Current value in micro-units.
    value: i32,
    /// Largest change per tick in micro-units.
    step: i32,
}

impl Axis {
    /// Start from zero.
    const fn new(step: i32) -> Self {
        Self { value: 0, step }
    }

    /// Convert to micro-units. Non-finite targets map to zero.
    fn to_micro(value: f32) -> i32 {
        if value.is_finite() {
            (value * MICRO).round() as i32
        } else {
            0
        }
    }

    /// Move one step toward the target, without overshooting it.
    fn advance(&mut self, target: f32) {
        let difference = Self::to_micro(target).saturating_sub(self.value);
        self.value += difference.clamp(-self.step, self.step);
    }

    /// The value in base units.
    fn get(&self) -> f32 {
        self.value as f32 / MICRO
    }
}

/// Soft setpoint changes for voltage and current.
#[derive(Debug, Clone, Copy)]
pub struct SetpointRamp {
    /// The voltage axis.
    voltage: Axis,
    /// The current axis.
    current: Axis,
}

impl SetpointRamp {
    /// A ramp that starts at zero.
    pub const fn new() -> Self {
        Self {
            voltage: Axis::new(VOLTAGE_STEP_UV),
            current: Axis::new(CURRENT_STEP_UA),
        }
    }

    /// Jump to the targets, so that a (re)start regulates to them right away.
    ///
    /// Later target changes are ramped again.
    pub fn seed(&mut self, target: &Setpoint) {
        self.voltage.value = Axis::to_micro(target.voltage_v);
        self.current.value = Axis::to_micro(target.current_a);
    }

    /// Move both axes one step toward the targets.
    pub fn advance(&mut self, target: &Setpoint) -> RampedSetpoint {
        self.voltage.advance(target.voltage_v);
        self.current.advance(target.current_a);
        self.setpoint()
    }

    /// The present ramped setpoint.
    pub fn setpoint(&self) -> RampedSetpoint {
        RampedSetpoint {
            voltage_v: self.voltage.get(),
            current_a: self.current.get(),
        }
    }
}
