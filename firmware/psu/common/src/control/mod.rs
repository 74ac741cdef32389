//! Regulates the output and protects it, based on measured and set values.
//!
//! One tick runs these stages in order:
//! 1. Measurement acquisition (power and temperature).
//! 2. Setpoint ramp.
//! 3. Mode arbitration and the PID controllers (automatic mode), or full duty cycle (manual mode).
//! 4. Protection monitor and output gate.
//! 5. Error code aggregation.

pub mod aggregator;
pub mod diagnostics;
pub mod measurement;
pub mod mode;
pub mod pid;
pub mod protection;
pub mod pwm;
pub mod ramp;

use aggregator::Aggregator;
use embassy_time::{Duration, Ticker};
use measurement::PowerMeasurement;
use mode::ModeArbiter;
use pid::{DualPid, RegulationInput};
use protection::{MONITORED_FAULTS, ProtectionMonitor};
use ramp::SetpointRamp;
use uom::si::f32::ElectricPotential;

use crate::{ErrorCode, Fault, Mode, OperatingMode, SHARED_STATE_MUTEX, SharedState};

/// The control loop period in ms.
pub const TICK_PERIOD_MS: u64 = 35;
/// The control loop period in s.
pub const TICK_PERIOD_S: f32 = TICK_PERIOD_MS as f32 / 1000.0;

/// The faults that the controllers own.
const DIVERGENCE_FAULTS: [Fault; 2] = [Fault::VoltagePidDivergence, Fault::CurrentPidDivergence];

/// If true, the control loop owns the fault. Other faults are reported by collaborators.
pub fn is_control_fault(fault: Fault) -> bool {
    MONITORED_FAULTS.contains(&fault) || DIVERGENCE_FAULTS.contains(&fault)
}

/// Measures the output.
#[allow(async_fn_in_trait)]
pub trait Sensors {
    /// The error type of the power meter.
    type Error: core::fmt::Debug;

    /// Measure output voltage, current and power.
    async fn measure_power(&mut self) -> Result<PowerMeasurement, Self::Error>;

    /// Sample the voltage across the power stage's thermistor divider.
    async fn measure_ntc(&mut self) -> ElectricPotential;
}

/// Drives the power stage.
pub trait PowerStage {
    /// Set the PWM compare value of the power stage.
    fn set_pwm_compare(&mut self, compare: u16);

    /// Close (`true`) or open (`false`) the output protection switch.
    fn set_protection_switch(&mut self, closed: bool);
}

/// What the power stage is commanded to do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Actuation {
    /// The PWM compare value.
    pub pwm_compare: u16,
    /// If true, the output protection switch is closed.
    pub output_active: bool,
}

/// Top-level regulation and protection.
#[derive(Debug, Clone, Copy)]
pub struct Control {
    /// Soft setpoint changes.
    ramp: SetpointRamp,
    /// CV/CC handoff.
    arbiter: ModeArbiter,
    /// The controllers and the duty cycle.
    pid: DualPid,
    /// Fault detectors and the output gate.
    monitor: ProtectionMonitor,
    /// Error code and enable edge tracking.
    aggregator: Aggregator,
}

impl Control {
    /// Create a new control instance.
    pub const fn new() -> Self {
        Self {
            ramp: SetpointRamp::new(),
            arbiter: ModeArbiter::new(),
            pid: DualPid::new(),
            monitor: ProtectionMonitor::new(),
            aggregator: Aggregator::new(),
        }
    }

    /// Fresh start: reset all control state, and the faults that the control loop owns.
    ///
    /// The ramp starts at the present setpoint. Faults reported by collaborators and the temperature filter
    /// are kept.
    pub fn restart(&mut self, state: &mut SharedState) {
        info!("Fresh start");

        self.ramp.seed(&state.setpoint);
        self.arbiter.reset();
        self.pid.reset(state.settings().duty_min_percent);
        self.monitor.restart();

        state.faults.clear_where(is_control_fault);
        state.error_code = ErrorCode::NONE;
        self.publish(state);
    }

    /// Run one tick on the shared state.
    ///
    /// A missing power measurement keeps the previous one.
    pub fn step(
        &mut self,
        state: &mut SharedState,
        power: Option<PowerMeasurement>,
        ntc_potential: ElectricPotential,
    ) -> Actuation {
        if self.aggregator.is_enable_edge(state.manual_enable) {
            self.restart(state);
        }

        if let Some(power) = power {
            state.measurement.update(&power.sanitized());
        }
        state.measurement.temperature_deg_c = self.monitor.acquire_temperature(ntc_potential);

        state.ramped = self.ramp.advance(&state.setpoint);

        let settings = *state.settings();
        match state.operating_mode {
            OperatingMode::Manual => {
                self.pid.force_max(&settings);
                state.faults.clear_where(|fault| DIVERGENCE_FAULTS.contains(&fault));
            }
            OperatingMode::Automatic => {
                let measurement = state.measurement;

                let mode = self.arbiter.decide(
                    measurement.current_a,
                    measurement.voltage_v,
                    state.ramped.current_a,
                    state.setpoint.voltage_v,
                );

                let regulation = self.pid.regulate(
                    &RegulationInput {
                        mode,
                        voltage_error: state.ramped.voltage_v - measurement.voltage_v,
                        current_error: state.ramped.current_a - measurement.current_a,
                        measured_voltage_v: measurement.voltage_v,
                        voltage_setpoint_v: state.setpoint.voltage_v,
                    },
                    &settings,
                );

                state.faults.set(
                    Fault::VoltagePidDivergence,
                    regulation.diverged && mode == Mode::ConstantVoltage,
                );
                state.faults.set(
                    Fault::CurrentPidDivergence,
                    regulation.diverged && mode == Mode::ConstantCurrent,
                );

                state.deviation.record(
                    measurement.voltage_v - state.setpoint.voltage_v,
                    measurement.current_a - state.setpoint.current_a,
                );
            }
        }
        self.publish(state);

        self.monitor.check(state);
        self.monitor.gate(state);
        self.aggregator.finish(state);

        Actuation {
            pwm_compare: state.pwm_compare,
            output_active: state.output_active,
        }
    }

    /// Copy the control state into the shared state.
    fn publish(&self, state: &mut SharedState) {
        state.ramped = self.ramp.setpoint();
        state.mode = self.arbiter.mode();
        state.voltage_pid = self.pid.voltage_state();
        state.current_pid = self.pid.current_state();
        state.duty_percent = self.pid.duty_percent();
        state.pwm_compare = pwm::compare_value(state.duty_percent, state.settings().invert_pwm);
    }
}

/// Run the control loop forever.
///
/// Measures at the start of every tick, computes the tick with the shared state locked, and then drives
/// the power stage.
pub async fn run<S: Sensors, P: PowerStage>(sensors: &mut S, stage: &mut P) -> ! {
    let mut control = Control::new();

    let actuation = SHARED_STATE_MUTEX.lock(|x| {
        let mut state = x.borrow_mut();
        control.restart(&mut state);
        Actuation {
            pwm_compare: state.pwm_compare,
            output_active: false,
        }
    });
    stage.set_protection_switch(actuation.output_active);
    stage.set_pwm_compare(actuation.pwm_compare);

    // Only the first of consecutive measurement errors is logged.
    let mut meter_failing = false;

    let mut ticker = Ticker::every(Duration::from_millis(TICK_PERIOD_MS));
    loop {
        let power = match sensors.measure_power().await {
            Ok(power) => {
                if meter_failing {
                    info!("Power measurement recovered");
                }
                meter_failing = false;
                Some(power)
            }
            Err(error) => {
                if !meter_failing {
                    #[cfg(feature = "defmt")]
                    warn!("Power measurement failed: {:?}", defmt::Debug2Format(&error));
                    #[cfg(not(feature = "defmt"))]
                    warn!("Power measurement failed: {:?}", error);
                }
                meter_failing = true;
                None
            }
        };
        let ntc_potential = sensors.measure_ntc().await;

        let actuation =
            SHARED_STATE_MUTEX.lock(|x| control.step(&mut x.borrow_mut(), power, ntc_potential));

        // Open the switch before changing the duty cycle, close it afterwards.
        if !actuation.output_active {
            stage.set_protection_switch(false);
        }
        stage.set_pwm_compare(actuation.pwm_compare);
        if actuation.output_active {
            stage.set_protection_switch(true);
        }

        ticker.next().await;
    }
}
