//! Driver for the INA226 voltage/current/power meter on the output.

use defmt::{Format, debug};
use embedded_hal_async::i2c::I2c;
use psu::control::measurement::PowerMeasurement;
use uom::si::electric_current::ampere;
use uom::si::electric_potential::millivolt;
use uom::si::f32::{ElectricCurrent, ElectricPotential, Power};
use uom::si::power::watt;

/// The meter's I2C address.
pub const ADDRESS: u8 = 0x40;

/// The shunt resistance in Ω.
const SHUNT_RESISTANCE_OHM: f32 = 0.0053;
/// The largest current that is measured, in A.
const MAX_CURRENT_A: f32 = 3.2;
/// The current register's LSB in A.
const CURRENT_LSB_A: f32 = MAX_CURRENT_A / 32768.0;
/// The power register's LSB is a fixed multiple of the current LSB.
const POWER_LSB_W: f32 = 25.0 * CURRENT_LSB_A;
/// The bus voltage register's LSB in mV.
const BUS_VOLTAGE_LSB_MV: f32 = 1.25;

/// The calibration register value for the shunt and current range.
const CALIBRATION: u16 = (0.00512 / (CURRENT_LSB_A * SHUNT_RESISTANCE_OHM)) as u16;

/// The expected content of the manufacturer ID register ("TI").
const MANUFACTURER_ID: u16 = 0x5449;

/// Configuration: 16 averages, 1.1 ms bus and shunt conversion time, continuous shunt and bus measurement.
const CONFIGURATION: u16 = 0x4000 | (0b010 << 9) | (0b100 << 6) | (0b100 << 3) | 0b111;

/// Meter registers.
#[derive(Clone, Copy)]
#[repr(u8)]
#[allow(clippy::missing_docs_in_private_items)]
enum Register {
    Configuration = 0x00,
    BusVoltage = 0x02,
    Power = 0x03,
    Current = 0x04,
    Calibration = 0x05,
    ManufacturerId = 0xFE,
}

/// Meter errors.
#[derive(Debug, Format, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The I2C transfer failed.
    Bus,
    /// Another device answers on the meter's address.
    UnexpectedManufacturerId(u16),
    /// The meter failed to initialize and is not available.
    Missing,
}

/// The output meter.
pub struct Meter<I> {
    /// The I2C bus.
    i2c: I,
}

impl<I: I2c> Meter<I> {
    /// Identify and configure the meter.
    pub async fn new(i2c: I) -> Result<Self, Error> {
        let mut meter = Self { i2c };

        let manufacturer_id = meter.read(Register::ManufacturerId).await?;
        if manufacturer_id != MANUFACTURER_ID {
            return Err(Error::UnexpectedManufacturerId(manufacturer_id));
        }

        meter.write(Register::Configuration, CONFIGURATION).await?;
        meter.write(Register::Calibration, CALIBRATION).await?;
        debug!("Meter calibration: {}", CALIBRATION);

        Ok(meter)
    }

    /// Read the latest output voltage, current and power.
    pub async fn measure(&mut self) -> Result<PowerMeasurement, Error> {
        let bus_voltage = self.read(Register::BusVoltage).await?;
        let current = self.read(Register::Current).await? as i16;
        let power = self.read(Register::Power).await?;

        Ok(PowerMeasurement {
            voltage: ElectricPotential::new::<millivolt>(bus_voltage as f32 * BUS_VOLTAGE_LSB_MV),
            current: ElectricCurrent::new::<ampere>(current as f32 * CURRENT_LSB_A),
            power: Power::new::<watt>(power as f32 * POWER_LSB_W),
        })
    }

    /// Read a register.
    async fn read(&mut self, register: Register) -> Result<u16, Error> {
        let mut buffer = [0u8; 2];
        self.i2c
            .write_read(ADDRESS, &[register as u8], &mut buffer)
            .await
            .map_err(|_| Error::Bus)?;

        Ok(u16::from_be_bytes(buffer))
    }

    /// Write a register.
    async fn write(&mut self, register: Register, value: u16) -> Result<(), Error> {
        let [high, low] = value.to_be_bytes();
        self.i2c
            .write(ADDRESS, &[register as u8, high, low])
            .await
            .map_err(|_| Error::Bus)
    }
}
