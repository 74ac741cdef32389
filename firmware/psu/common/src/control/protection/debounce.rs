//! Consecutive-tick debouncing of fault conditions.

/// Raises after a condition held for a number of consecutive ticks, and clears as soon as it ends.
#[derive(Debug, Clone, Copy)]
pub struct Debounce {
    /// Consecutive qualifying ticks, saturating at the threshold.
    count: u8,
    /// Qualifying ticks until the fault is raised.
    threshold: u8,
}

impl Debounce {
    /// A debouncer that raises on the `threshold`th consecutive qualifying tick.
    pub const fn new(threshold: u8) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    /// Feed this tick's condition, and return whether the fault is raised.
    pub fn update(&mut self, condition: bool) -> bool {
        if condition {
            self.count = self.count.saturating_add(1).min(self.threshold);
            self.count >= self.threshold
        } else {
            self.count = 0;
            false
        }
    }

    /// Forget all qualifying ticks.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}
