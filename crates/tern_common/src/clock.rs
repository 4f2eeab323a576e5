//! Hybrid-logical clock shared by every transaction of a client process.
//!
//! `now()` is monotonic: when physical time does not advance between calls
//! the logical counter is bumped instead. `observe()` folds clock readings
//! propagated in server responses so the local clock never lags a server it
//! has talked to.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::types::HybridTime;

pub struct HybridClock {
    max_skew_us: u64,
    /// Last issued hybrid-time word.
    last: Mutex<u64>,
}

impl HybridClock {
    pub const DEFAULT_MAX_SKEW_US: u64 = 50_000;

    pub fn new(max_skew_us: u64) -> Self {
        Self {
            max_skew_us,
            last: Mutex::new(0),
        }
    }

    fn physical_now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    /// Current hybrid time. Monotonically increasing across calls.
    pub fn now(&self) -> HybridTime {
        let candidate = HybridTime::from_micros(Self::physical_now_micros());
        let mut last = self.last.lock();
        if candidate.0 > *last {
            *last = candidate.0;
        } else {
            *last += 1;
        }
        HybridTime(*last)
    }

    /// Fold a clock reading received from a server into the local clock.
    pub fn observe(&self, remote: HybridTime) {
        if !remote.is_valid() {
            return;
        }
        let physical_now = Self::physical_now_micros();
        if remote.physical_micros() > physical_now + self.max_skew_us {
            tracing::warn!(
                remote = %remote,
                local_physical_us = physical_now,
                max_skew_us = self.max_skew_us,
                "remote clock reading exceeds local time by more than the configured skew",
            );
        }
        let mut last = self.last.lock();
        if remote.0 > *last {
            *last = remote.0;
        }
    }

    pub fn max_skew_us(&self) -> u64 {
        self.max_skew_us
    }

    /// Upper bound of the current uncertainty window.
    pub fn global_limit(&self) -> HybridTime {
        self.now().add_micros(self.max_skew_us)
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_SKEW_US)
    }
}
