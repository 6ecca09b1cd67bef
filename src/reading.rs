use std::ops::AddAssign;

/// A single counter value with its enabled and running times, as returned by
/// the kernel for `PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING`.
///
/// `enabled` and `running` are nanoseconds summed over every CPU the slot
/// counts on; when `running < enabled` the hardware was time-shared with other
/// events and `counter` can be scaled by `enabled / running`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    /// Events counted.
    pub counter: u64,
    /// Nanoseconds the counter was enabled.
    pub enabled: u64,
    /// Nanoseconds the counter was actually on the PMU.
    pub running: u64,
}

impl CounterReading {
    /// Returns the counter value extrapolated over the full enabled time,
    /// saturating at `u64::MAX`.
    pub fn scaled(&self) -> u64 {
        if self.running == 0 || self.running >= self.enabled {
            return self.counter;
        }
        let scaled = self.counter as u128 * self.enabled as u128 / self.running as u128;
        u64::try_from(scaled).unwrap_or(u64::MAX)
    }
}

impl AddAssign for CounterReading {
    fn add_assign(&mut self, rhs: Self) {
        self.counter = self.counter.wrapping_add(rhs.counter);
        self.enabled = self.enabled.wrapping_add(rhs.enabled);
        self.running = self.running.wrapping_add(rhs.running);
    }
}
