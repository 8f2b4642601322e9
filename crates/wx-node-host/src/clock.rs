use std::time::{Instant, SystemTime, UNIX_EPOCH};

use wx_node::hal::{MonotonicClock, WallClock};

/// Monotonic counters derived from `Instant`.
pub struct HostClock {
    start: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        HostClock {
            start: Instant::now(),
        }
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for HostClock {
    fn millis(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn seconds(&self) -> u32 {
        self.start.elapsed().as_secs() as u32
    }
}

/// Wall clock over the system time. Setting the clock does not touch the
/// system; the adjustment is held as an offset, the way a battery-backed
/// RTC would diverge from its crystal.
pub struct HostWallClock {
    offset: i64,
}

impl HostWallClock {
    pub fn new() -> Self {
        HostWallClock { offset: 0 }
    }

    fn system_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl Default for HostWallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for HostWallClock {
    fn now(&self) -> u32 {
        (Self::system_now() + self.offset).max(0) as u32
    }

    fn set(&mut self, secs: u32) {
        self.offset = secs as i64 - Self::system_now();
        log::debug!("wall clock adjusted, offset now {} s", self.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_counters_advance_together() {
        let clock = HostClock::new();
        let ms = clock.millis();
        let secs = clock.seconds();
        assert!(secs <= ms / 1000 + 1);
    }

    #[test]
    fn wall_clock_set_then_read_round_trips() {
        let mut clock = HostWallClock::new();
        clock.set(1_700_000_000);
        let now = clock.now();
        assert!((1_700_000_000..1_700_000_002).contains(&now));
    }
}
