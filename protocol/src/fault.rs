//! Fault indicators and the aggregated error code.
//!
//! Each [`Fault`] owns a fixed bit position in the [`ErrorCode`]. The positions never change, so the code
//! can be stored or transmitted as a plain `u32`.

use core::ops::{Index, IndexMut};

use postcard_schema::Schema;
use serde::{Deserialize, Serialize};
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{EnumCount as EnumCountMacro, EnumIter};

/// A single fault condition.
///
/// The discriminant is the bit position of the fault in the [`ErrorCode`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    EnumIter,
    EnumCountMacro,
    Schema,
    Serialize,
    Deserialize,
    defmt::Format,
)]
#[repr(u8)]
pub enum Fault {
    /// The power stage temperature reached its limit.
    OverTemperature = 0,
    /// The output current exceeds the absolute system limit.
    OverCurrent = 1,
    /// The output current exceeded the user's cutoff (electronic fuse).
    FuseBlown = 2,
    /// The temperature sensor delivers implausible values.
    SensorFailure = 3,
    /// The voltage/current meter could not be initialized.
    MeterInitFailure = 4,
    /// The wireless interface could not be initialized.
    WifiInitFailure = 5,
    /// The display could not be initialized.
    DisplayInitFailure = 6,
    /// The PWM peripheral could not be initialized.
    PwmInitFailure = 7,
    /// The output voltage left the system's voltage range.
    VoltageOutOfRange = 8,
    /// The output power exceeds the absolute system limit.
    OverPower = 9,
    /// The output voltage does not follow its setpoint.
    VoltageDeviation = 10,
    /// The output current overshoots its setpoint.
    CurrentDeviation = 11,
    /// The power limit was exceeded.
    PowerOverLimit = 12,
    /// The PWM output driver could not be initialized.
    PwmDriverInitFailure = 13,
    /// The voltage controller diverged.
    VoltagePidDivergence = 14,
    /// The system is low on memory.
    LowMemory = 15,
    /// The processor die is too hot.
    HighCpuTemperature = 16,
    /// The current controller diverged.
    CurrentPidDivergence = 17,
}

impl Fault {
    /// The fault's bit position in the error code.
    pub const fn position(self) -> u8 {
        self as u8
    }

    /// The fault's bit mask in the error code.
    pub const fn mask(self) -> u32 {
        1 << self.position()
    }

    /// If true, the fault forbids energizing the output.
    ///
    /// The remaining faults are informational only.
    pub const fn is_safety_relevant(self) -> bool {
        matches!(
            self,
            Fault::OverTemperature
                | Fault::FuseBlown
                | Fault::OverCurrent
                | Fault::OverPower
                | Fault::VoltageOutOfRange
                | Fault::VoltageDeviation
                | Fault::CurrentDeviation
                | Fault::SensorFailure
                | Fault::MeterInitFailure
                | Fault::PwmDriverInitFailure
        )
    }
}

/// The number of known faults.
pub const FAULT_COUNT: usize = Fault::COUNT;

/// One boolean per [`Fault`], indexed by the fault itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, defmt::Format)]
pub struct FaultFlags([bool; FAULT_COUNT]);

impl FaultFlags {
    /// No fault is set.
    pub const fn new() -> Self {
        Self([false; FAULT_COUNT])
    }

    /// Set or clear a fault.
    pub fn set(&mut self, fault: Fault, active: bool) {
        self[fault] = active;
    }

    /// If true, the fault is set.
    pub fn is_set(&self, fault: Fault) -> bool {
        self[fault]
    }

    /// Iterate over all faults that are set.
    pub fn active(&self) -> impl Iterator<Item = Fault> + '_ {
        Fault::iter().filter(|fault| self[*fault])
    }

    /// If true, at least one fault is set.
    pub fn any(&self) -> bool {
        self.0.iter().any(|active| *active)
    }

    /// If true, at least one fault is set that forbids energizing the output.
    pub fn any_safety_relevant(&self) -> bool {
        self.active().any(Fault::is_safety_relevant)
    }

    /// Faults whose state differs from `previous`, with their new state.
    pub fn changes_since<'a>(
        &'a self,
        previous: &'a FaultFlags,
    ) -> impl Iterator<Item = (Fault, bool)> + 'a {
        Fault::iter()
            .filter(move |fault| self[*fault] != previous[*fault])
            .map(move |fault| (fault, self[fault]))
    }

    /// Clear all faults for which `filter` returns true.
    pub fn clear_where(&mut self, filter: impl Fn(Fault) -> bool) {
        for fault in Fault::iter().filter(|fault| filter(*fault)) {
            self[fault] = false;
        }
    }
}

impl Index<Fault> for FaultFlags {
    type Output = bool;

    fn index(&self, fault: Fault) -> &Self::Output {
        &self.0[fault.position() as usize]
    }
}

impl IndexMut<Fault> for FaultFlags {
    fn index_mut(&mut self, fault: Fault) -> &mut Self::Output {
        &mut self.0[fault.position() as usize]
    }
}

/// The aggregated fault state, one bit per [`Fault`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Schema, Serialize, Deserialize, defmt::Format,
)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    /// The code without any fault.
    pub const NONE: Self = Self(0);

    /// Fold fault flags into a code.
    pub fn from_flags(flags: &FaultFlags) -> Self {
        Self(flags.active().fold(0, |code, fault| code | fault.mask()))
    }

    /// If true, the fault's bit is set.
    pub fn contains(&self, fault: Fault) -> bool {
        self.0 & fault.mask() != 0
    }

    /// If true, no fault bit is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The faults contained in this code, in bit order.
    ///
    /// Unknown bits are ignored.
    pub fn faults(&self) -> heapless::Vec<Fault, FAULT_COUNT> {
        Fault::iter().filter(|fault| self.contains(*fault)).collect()
    }
}

impl From<&FaultFlags> for ErrorCode {
    fn from(flags: &FaultFlags) -> Self {
        Self::from_flags(flags)
    }
}
