//! Power stage temperature from an NTC thermistor in a voltage divider.

use micromath::F32Ext;
use uom::si::electric_potential::volt;
use uom::si::f32::{ElectricPotential, ThermodynamicTemperature};
use uom::si::thermodynamic_temperature::kelvin;

/// The divider's supply voltage.
const SUPPLY_V: f32 = 3.3;
/// Samples below this voltage are implausible.
const SAMPLE_MIN_V: f32 = 0.01;
/// Samples above this voltage are implausible.
const SAMPLE_MAX_V: f32 = SUPPLY_V;
/// Substitute for implausible samples, and the filter's initial value.
const MID_SCALE_V: f32 = SUPPLY_V / 2.0;
/// Low-pass filter coefficient.
const FILTER_ALPHA: f32 = 0.05;

/// Series resistor of the divider.
const SERIES_RESISTANCE_OHM: f32 = 3300.0;
/// Thermistor resistance at the nominal temperature.
const NOMINAL_RESISTANCE_OHM: f32 = 10_000.0;
/// Nominal temperature (25 °C).
const NOMINAL_TEMPERATURE_K: f32 = 298.15;
/// Thermistor Beta coefficient.
const BETA_K: f32 = 3470.0;

/// Filters thermistor divider samples and converts them to temperature.
#[derive(Debug, Clone, Copy)]
pub struct Thermistor {
    /// The low-pass filtered divider voltage in V.
    filtered_v: f32,
}

impl Thermistor {
    /// A filter seeded at mid-scale.
    pub const fn new() -> Self {
        Self {
            filtered_v: MID_SCALE_V,
        }
    }

    /// Feed one divider sample and return the filtered temperature.
    pub fn sample(&mut self, potential: ElectricPotential) -> ThermodynamicTemperature {
        let mut sample_v = potential.get::<volt>();
        if !(SAMPLE_MIN_V..=SAMPLE_MAX_V).contains(&sample_v) {
            sample_v = MID_SCALE_V;
        }

        self.filtered_v = self.filtered_v * (1.0 - FILTER_ALPHA) + sample_v * FILTER_ALPHA;

        temperature(self.filtered_v)
    }
}

/// Convert a divider voltage to temperature, with the Beta equation.
fn temperature(divider_v: f32) -> ThermodynamicTemperature {
    let resistance_ohm = SERIES_RESISTANCE_OHM * (SUPPLY_V / divider_v - 1.0);
    let inverse_temperature =
        (resistance_ohm / NOMINAL_RESISTANCE_OHM).ln() / BETA_K + 1.0 / NOMINAL_TEMPERATURE_K;

    ThermodynamicTemperature::new::<kelvin>(1.0 / inverse_temperature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uom::si::electric_potential::millivolt;
    use uom::si::thermodynamic_temperature::degree_celsius;

    fn millivolts(value: f32) -> ElectricPotential {
        ElectricPotential::new::<millivolt>(value)
    }

    #[test]
    fn mid_scale_temperature() {
        let mut thermistor = Thermistor::new();
        let temperature_deg_c = thermistor.sample(millivolts(1650.0)).get::<degree_celsius>();

        // 3.3 kOhm thermistor resistance.
        assert!((temperature_deg_c - 56.4).abs() < 1.0);
    }

    #[test]
    fn converges_to_nominal_temperature() {
        let mut thermistor = Thermistor::new();

        // The divider voltage at 10 kOhm (25 °C).
        let nominal_mv = 3300.0 * 3300.0 / 13_300.0;
        let mut temperature_deg_c = 0.0;
        for _ in 0..300 {
            temperature_deg_c = thermistor.sample(millivolts(nominal_mv)).get::<degree_celsius>();
        }

        assert!((temperature_deg_c - 25.0).abs() < 1.0);
    }

    #[test]
    fn filter_moves_slowly() {
        let mut thermistor = Thermistor::new();
        thermistor.sample(millivolts(300.0));

        // 5 % of the step.
        assert!((thermistor.filtered_v - (1.65 * 0.95 + 0.3 * 0.05)).abs() < 1e-5);
    }

    #[test]
    fn implausible_samples_are_replaced() {
        let mut thermistor = Thermistor::new();

        for sample in [0.0, 5.0, 3400.0, f32::NAN] {
            thermistor.sample(millivolts(sample));
            assert!((thermistor.filtered_v - MID_SCALE_V).abs() < 1e-5);
        }
    }
}
