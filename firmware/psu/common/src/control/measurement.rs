//! Output power measurements, as delivered by the meter.

use uom::ConstZero;
use uom::si::electric_current::ampere;
use uom::si::electric_potential::volt;
use uom::si::f32::{ElectricCurrent, ElectricPotential, Power};
use uom::si::power::watt;

/// Negative readings above this value (in V or A) are measurement noise.
const NEGATIVE_NOISE: f32 = -0.01;
/// Power readings with a smaller magnitude (in W) are measurement noise.
const POWER_NOISE_W: f32 = 0.01;

/// A measurement of the output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerMeasurement {
    /// The output voltage.
    pub voltage: ElectricPotential,
    /// The output current.
    pub current: ElectricCurrent,
    /// The output power.
    pub power: Power,
}

impl PowerMeasurement {
    /// Create a measurement from values in V, A and W.
    pub fn new(voltage_v: f32, current_a: f32, power_w: f32) -> Self {
        Self {
            voltage: ElectricPotential::new::<volt>(voltage_v),
            current: ElectricCurrent::new::<ampere>(current_a),
            power: Power::new::<watt>(power_w),
        }
    }

    /// Clamp small negative noise to zero.
    ///
    /// Voltage and current in (-0.01, 0) become zero, power in (-0.01, 0.01) becomes zero.
    pub fn sanitized(mut self) -> Self {
        if is_negative_noise(self.voltage.get::<volt>()) {
            self.voltage = ElectricPotential::ZERO;
        }

        if is_negative_noise(self.current.get::<ampere>()) {
            self.current = ElectricCurrent::ZERO;
        }

        let power_w = self.power.get::<watt>();
        if power_w > -POWER_NOISE_W && power_w < POWER_NOISE_W {
            self.power = Power::ZERO;
        }

        self
    }
}

/// If true, the value is a small negative reading.
fn is_negative_noise(value: f32) -> bool {
    value > NEGATIVE_NOISE && value < 0.0
}
