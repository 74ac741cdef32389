//! Output measurement and the power stage of this board.

use defmt::trace;
use embassy_stm32::adc::{self, AnyAdcChannel};
use embassy_stm32::gpio::Output;
use embassy_stm32::i2c::{self, I2c};
use embassy_stm32::timer::simple_pwm::SimplePwm;
use embassy_stm32::{Peri, peripherals};
use psu::control::measurement::PowerMeasurement;
use psu::control::pwm::PWM_MAX;
use psu::control::{PowerStage, Sensors};
use uom::si::electric_potential::volt;
use uom::si::f32::ElectricPotential;

use crate::meter::{self, Meter};

/// ADC max. value (12 bit).
const ADC_MAX: f32 = 4095.0;
/// The ADC reference voltage, which also supplies the thermistor divider.
const ANALOG_SUPPLY_V: f32 = 3.3;
/// ADC sample time for the thermistor divider in cycles.
const ADC_SAMPLE_TIME_NTC: adc::SampleTime = adc::SampleTime::CYCLES92_5;

/// The I2C bus of the meter.
pub type MeterBus = I2c<'static, embassy_stm32::mode::Async, i2c::mode::Master>;

/// Measures the output and the power stage temperature.
pub struct OutputSensors {
    /// The output meter, if it could be initialized.
    pub meter: Option<Meter<MeterBus>>,
    /// The ADC.
    pub adc: adc::Adc<'static, peripherals::ADC1>,
    /// The ADC input of the thermistor divider.
    pub pin_ntc: AnyAdcChannel<peripherals::ADC1>,
    /// The DMA for the ADC.
    pub adc_dma: Peri<'static, peripherals::DMA1_CH3>,
}

impl Sensors for OutputSensors {
    type Error = meter::Error;

    async fn measure_power(&mut self) -> Result<PowerMeasurement, Self::Error> {
        match &mut self.meter {
            Some(meter) => meter.measure().await,
            None => Err(meter::Error::Missing),
        }
    }

    async fn measure_ntc(&mut self) -> ElectricPotential {
        let mut adc_buffer = [0u16; 1];

        self.adc
            .read(
                self.adc_dma.reborrow(),
                [(&mut self.pin_ntc, ADC_SAMPLE_TIME_NTC)].into_iter(),
                &mut adc_buffer,
            )
            .await;

        trace!("Measured thermistor, ADC value: {}", adc_buffer[0]);
        ElectricPotential::new::<volt>(ANALOG_SUPPLY_V * (adc_buffer[0] as f32) / ADC_MAX)
    }
}

/// Drives the buck converter's feedback PWM and the output protection MOSFET.
pub struct OutputStage {
    /// The feedback PWM.
    pub pwm: SimplePwm<'static, peripherals::TIM1>,
    /// The gate of the protection MOSFET, high when closed.
    pub pin_protection: Output<'static>,
}

impl OutputStage {
    /// Start the PWM with the output disconnected.
    pub fn init(&mut self) {
        self.pin_protection.set_low();
        self.pwm.ch1().set_duty_cycle_fully_off();
        self.pwm.ch1().enable();
    }
}

impl PowerStage for OutputStage {
    fn set_pwm_compare(&mut self, compare: u16) {
        // The timer counts at a finer resolution than the 12 bit compare value.
        self.pwm
            .ch1()
            .set_duty_cycle_fraction(compare.min(PWM_MAX), PWM_MAX);
    }

    fn set_protection_switch(&mut self, closed: bool) {
        if closed {
            self.pin_protection.set_high();
        } else {
            self.pin_protection.set_low();
        }
    }
}
