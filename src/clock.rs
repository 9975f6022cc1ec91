// SPDX-License-Identifier: Apache-2.0

//! Injectable time source.
//!
//! File idle detection, rotation re-checks, and retirement grace periods all
//! depend on elapsed time and on "today's" date. Routing those through a trait
//! lets tests simulate the passage of time and date boundaries without real
//! delays.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{Local, NaiveDate};

/// Time source used throughout the crate.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Today's date in local time, used to resolve date-templated file names.
    fn today(&self) -> NaiveDate;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration);
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_sleep_is_simulated() {
        let clock = testing::ManualClock::new(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let before = clock.now();
        clock.sleep(Duration::from_secs(3600));
        assert_eq!(
            clock.now().duration_since(before).unwrap(),
            Duration::from_secs(3600)
        );
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
    }
}
