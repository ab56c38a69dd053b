//! System clock adapter.
//!
//! - **`target_os = "espidf"`** — uptime from `esp_timer_get_time()`
//!   (microsecond, monotonic); wall clock from the RTC, valid once
//!   SNTP has synced it.
//! - **`not(target_os = "espidf")`** — `std::time::Instant` uptime and
//!   the host clock, for simulation and tests.

use std::time::{SystemTime, UNIX_EPOCH};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::app::ports::ClockPort;
use crate::config::TimeOfDay;

/// Wall-clock readings before this epoch are treated as "not synced"
/// (the RTC still counts from 1970).
const EPOCH_2020: i64 = 1_577_836_800;

pub struct SystemClock {
    #[cfg(not(target_os = "espidf"))]
    start: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            start: std::time::Instant::now(),
        }
    }

    fn epoch_secs() -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(_) => 0,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockPort for SystemClock {
    #[cfg(target_os = "espidf")]
    fn uptime_us(&self) -> u64 {
        (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64
    }

    #[cfg(not(target_os = "espidf"))]
    fn uptime_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn time_of_day(&self) -> Option<TimeOfDay> {
        let secs = Self::epoch_secs();
        if secs < EPOCH_2020 {
            return None;
        }
        let dt = OffsetDateTime::from_unix_timestamp(secs).ok()?;
        TimeOfDay::new(dt.hour(), dt.minute(), dt.second()).ok()
    }

    fn utc_timestamp(&self) -> String {
        let dt = OffsetDateTime::from_unix_timestamp(Self::epoch_secs())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        dt.format(&Rfc3339)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.uptime_us();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.uptime_us();
        assert!(b > a);
    }

    #[test]
    fn timestamp_is_second_precision_rfc3339() {
        let clock = SystemClock::new();
        let ts = clock.utc_timestamp();
        // YYYY-MM-DDTHH:MM:SSZ
        assert_eq!(ts.len(), 20, "unexpected token: {ts}");
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
    }
}
