//! Real-time clock utilities.
//!
//! Wraps the battery-backed wall clock with the helpers the rest of the
//! firmware needs: absolute difference from now, adjustment, and a
//! human-readable render for the operator console. Also owns the
//! `validated` flag: the device clock counts as validated only once the
//! remote server has confirmed it, and only a validated clock may be
//! pushed onto the weather station.

use alloc::string::String;
use alloc::string::ToString;
use chrono::DateTime;

use crate::hal::WallClock;

pub struct Rtc<W: WallClock> {
    clock: W,
    validated: bool,
}

impl<W: WallClock> Rtc<W> {
    pub fn new(clock: W) -> Self {
        Rtc {
            clock,
            validated: false,
        }
    }

    /// Current wall-clock time, seconds since the Unix epoch.
    pub fn now(&self) -> u32 {
        self.clock.now()
    }

    /// Adjusts the wall clock.
    pub fn set(&mut self, secs: u32) {
        self.clock.set(secs);
    }

    /// Absolute difference in seconds between `comp_val` and now.
    pub fn diff(&self, comp_val: u32) -> u32 {
        let now = self.clock.now();
        now.abs_diff(comp_val)
    }

    pub fn validated(&self) -> bool {
        self.validated
    }

    pub fn set_validated(&mut self, validated: bool) {
        self.validated = validated;
    }

    /// Current time as an asctime-style string (UTC, no trailing newline).
    pub fn timestamp_str(&self) -> String {
        match DateTime::from_timestamp(self.clock.now() as i64, 0) {
            Some(dt) => dt.format("%a %b %e %H:%M:%S %Y").to_string(),
            None => "(invalid time)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    pub(crate) struct TestWallClock {
        now: Cell<u32>,
    }

    impl TestWallClock {
        pub fn at(now: u32) -> Self {
            TestWallClock {
                now: Cell::new(now),
            }
        }
    }

    impl WallClock for TestWallClock {
        fn now(&self) -> u32 {
            self.now.get()
        }
        fn set(&mut self, secs: u32) {
            self.now.set(secs);
        }
    }

    #[test]
    fn diff_is_symmetric() {
        let rtc = Rtc::new(TestWallClock::at(1_700_000_000));
        assert_eq!(rtc.diff(1_700_000_030), 30);
        assert_eq!(rtc.diff(1_699_999_970), 30);
    }

    #[test]
    fn set_moves_the_clock() {
        let mut rtc = Rtc::new(TestWallClock::at(0));
        rtc.set(1_700_000_000);
        assert_eq!(rtc.now(), 1_700_000_000);
    }

    #[test]
    fn starts_unvalidated() {
        let rtc = Rtc::new(TestWallClock::at(0));
        assert!(!rtc.validated());
    }

    #[test]
    fn renders_asctime_style() {
        let rtc = Rtc::new(TestWallClock::at(1_700_000_000));
        // 2023-11-14 22:13:20 UTC
        assert_eq!(rtc.timestamp_str(), "Tue Nov 14 22:13:20 2023");
    }
}
