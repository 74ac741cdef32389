//! Firmware of the lab power supply board.
#![no_std]
#![no_main]
#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

mod meter;
mod stage;

use assign_resources::assign_resources;
use defmt::{info, warn};
use embassy_executor::Spawner;
use embassy_stm32::adc::{Adc, AdcChannel};
use embassy_stm32::gpio::{Level, Output, OutputType, Speed};
use embassy_stm32::i2c::{self, I2c};
use embassy_stm32::time::Hertz;
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use embassy_stm32::{Config, bind_interrupts, peripherals};
use meter::Meter;
use psu::Fault;
use psu::control::pwm::PWM_FREQUENCY_HZ;
use stage::{OutputSensors, OutputStage};
use {defmt_rtt as _, panic_probe as _};

bind_interrupts!(struct Irqs {
    I2C1_EV => i2c::EventInterruptHandler<peripherals::I2C1>;
    I2C1_ER => i2c::ErrorInterruptHandler<peripherals::I2C1>;
});

assign_resources! {
    #[allow(missing_docs)]
    meter: MeterResources {
        i2c: I2C1,
        pin_scl: PA15,
        pin_sda: PB7,
        tx_dma: DMA1_CH1,
        rx_dma: DMA1_CH2,
    }
    #[allow(missing_docs)]
    ntc: NtcResources {
        adc: ADC1,
        pin_ntc: PA1,
        adc_dma: DMA1_CH3,
    }
    #[allow(missing_docs)]
    stage: StageResources {
        pwm_timer: TIM1,
        pin_pwm: PA8,
        pin_protection: PB0,
    }
}

/// Runs the control loop.
#[embassy_executor::task]
async fn control_task(mut sensors: OutputSensors, mut stage: OutputStage) {
    psu::control::run(&mut sensors, &mut stage).await
}

/// Bring up the output meter. A failure is reported as a fault, so that the output cannot be enabled.
async fn init_meter(r: MeterResources) -> Option<Meter<stage::MeterBus>> {
    let mut i2c_config = i2c::Config::default();
    i2c_config.frequency = Hertz(400_000);

    let i2c = I2c::new(
        r.i2c,
        r.pin_scl,
        r.pin_sda,
        Irqs,
        r.tx_dma,
        r.rx_dma,
        i2c_config,
    );

    let meter = match Meter::new(i2c).await {
        Ok(meter) => Some(meter),
        Err(error) => {
            warn!("Meter initialization failed: {}", error);
            None
        }
    };

    psu::with_shared_state(|state| state.report_fault(Fault::MeterInitFailure, meter.is_none()));
    meter
}

/// Set up the output stage, with the protection MOSFET open.
fn init_stage(r: StageResources) -> OutputStage {
    let pwm = SimplePwm::new(
        r.pwm_timer,
        Some(PwmPin::new(r.pin_pwm, OutputType::PushPull)),
        None,
        None,
        None,
        Hertz(PWM_FREQUENCY_HZ),
        CountingMode::EdgeAlignedUp,
    );

    let mut stage = OutputStage {
        pwm,
        pin_protection: Output::new(r.pin_protection, Level::Low, Speed::Low),
    };
    stage.init();
    stage
}

/// Set up the thermistor measurement.
fn init_sensors(r: NtcResources, meter: Option<Meter<stage::MeterBus>>) -> OutputSensors {
    OutputSensors {
        meter,
        adc: Adc::new(r.adc),
        pin_ntc: r.pin_ntc.degrade_adc(),
        adc_dma: r.adc_dma,
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        config.rcc.hsi = true;
        config.rcc.hse = None;
        config.rcc.pll = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL85,
            divp: Some(PllPDiv::DIV20), // 17 MHz ADC clock
            divq: None,
            divr: Some(PllRDiv::DIV2), // 170 MHz system clock
        });
        config.rcc.mux.adc12sel = mux::Adcsel::PLL1_P;
        config.rcc.sys = Sysclk::PLL1_R;
        config.enable_debug_during_sleep = true;
    }
    let p = embassy_stm32::init(config);
    let r = split_resources!(p);

    info!("Power supply starting");

    // The stage comes first, so that the output is disconnected as early as possible.
    let stage = init_stage(r.stage);
    let meter = init_meter(r.meter).await;
    let sensors = init_sensors(r.ntc, meter);

    spawner.must_spawn(control_task(sensors, stage));
}
