//! Folds the fault flags into the error code, and watches the user's enable request.

use crate::{ErrorCode, FaultFlags, SharedState};

/// Tracks the enable request and fault transitions between ticks.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    /// The enable request at the end of the last tick.
    last_manual_enable: bool,
    /// The fault flags at the end of the last tick.
    last_faults: FaultFlags,
}

impl Aggregator {
    /// Nothing was enabled yet.
    pub const fn new() -> Self {
        Self {
            last_manual_enable: false,
            last_faults: FaultFlags::new(),
        }
    }

    /// If true, the user newly requests the output to be enabled.
    pub fn is_enable_edge(&self, manual_enable: bool) -> bool {
        manual_enable && !self.last_manual_enable
    }

    /// Recompute the error code from the fault flags, and remember this tick's state.
    ///
    /// Runs after the output gate, so that an enable request that was latched off is seen as a new edge
    /// when it is asserted again.
    pub fn finish(&mut self, state: &mut SharedState) {
        for (fault, raised) in state.faults.changes_since(&self.last_faults) {
            if raised {
                warn!("Fault raised: {:?}", fault);
            } else {
                info!("Fault cleared: {:?}", fault);
            }
        }

        state.error_code = ErrorCode::from_flags(&state.faults);
        self.last_faults = state.faults;
        self.last_manual_enable = state.manual_enable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Fault;

    #[test]
    fn code_follows_flags_every_tick() {
        let mut aggregator = Aggregator::new();
        let mut state = SharedState::new();

        state.faults.set(Fault::OverTemperature, true);
        state.faults.set(Fault::CurrentPidDivergence, true);
        aggregator.finish(&mut state);
        assert_eq!(state.error_code.0, (1 << 0) | (1 << 17));

        state.faults.set(Fault::OverTemperature, false);
        aggregator.finish(&mut state);
        assert_eq!(state.error_code.0, 1 << 17);
    }

    #[test]
    fn detects_enable_edges() {
        let mut aggregator = Aggregator::new();
        let mut state = SharedState::new();

        assert!(!aggregator.is_enable_edge(false));
        assert!(aggregator.is_enable_edge(true));

        state.manual_enable = true;
        aggregator.finish(&mut state);
        assert!(!aggregator.is_enable_edge(true));

        // Latched off by protection, then asserted again.
        state.manual_enable = false;
        aggregator.finish(&mut state);
        assert!(aggregator.is_enable_edge(true));
    }
}
