//! Tracking error statistics for tuning the controllers.

use micromath::F32Ext;

/// Peak and RMS tracking error since the last report.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviationReport {
    /// Largest absolute voltage error in V.
    pub voltage_peak_v: f32,
    /// RMS voltage error in V.
    pub voltage_rms_v: f32,
    /// Largest absolute current error in A.
    pub current_peak_a: f32,
    /// RMS current error in A.
    pub current_rms_a: f32,
}

/// Accumulates the deviation of the measured output from the user's setpoint.
#[derive(Debug, Clone, Copy)]
pub struct DeviationStats {
    /// Largest absolute voltage deviation.
    voltage_peak_v: f32,
    /// Largest absolute current deviation.
    current_peak_a: f32,
    /// Sum of squared voltage deviations.
    voltage_square_sum: f32,
    /// Sum of squared current deviations.
    current_square_sum: f32,
    /// Number of recorded samples.
    count: u32,
}

impl DeviationStats {
    /// No samples recorded.
    pub const fn new() -> Self {
        Self {
            voltage_peak_v: 0.0,
            current_peak_a: 0.0,
            voltage_square_sum: 0.0,
            current_square_sum: 0.0,
            count: 0,
        }
    }

    /// Record one sample of measured minus set values.
    ///
    /// Non-finite samples are skipped.
    pub fn record(&mut self, voltage_delta_v: f32, current_delta_a: f32) {
        if !voltage_delta_v.is_finite() || !current_delta_a.is_finite() {
            return;
        }

        self.voltage_peak_v = self.voltage_peak_v.max(voltage_delta_v.abs());
        self.current_peak_a = self.current_peak_a.max(current_delta_a.abs());
        self.voltage_square_sum += voltage_delta_v * voltage_delta_v;
        self.current_square_sum += current_delta_a * current_delta_a;
        self.count = self.count.saturating_add(1);
    }

    /// Report the statistics and start over.
    pub fn take(&mut self) -> DeviationReport {
        let report = if self.count == 0 {
            DeviationReport::default()
        } else {
            let count = self.count as f32;
            DeviationReport {
                voltage_peak_v: self.voltage_peak_v,
                voltage_rms_v: (self.voltage_square_sum / count).sqrt(),
                current_peak_a: self.current_peak_a,
                current_rms_a: (self.current_square_sum / count).sqrt(),
            }
        };

        *self = Self::new();
        report
    }
}
