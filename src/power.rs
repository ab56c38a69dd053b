//! Deep-sleep planning and the error-escalation policy.
//!
//! Sleep durations are compensated for the platform overhead (boot,
//! shutdown, wake-source settle) so the device wakes on schedule
//! rather than late by the boot time. A result below the minimum
//! viable sleep is a configuration error — scheduling it would
//! busy-loop wake cycles — and escalates into the failure ladder
//! instead.
//!
//! The ladder has exactly two rungs: restart now, or (once the
//! persisted counter reaches its ceiling) a fixed ten-minute cooldown
//! sleep. A field device with no back-channel gets nothing fancier.

use core::fmt;

use log::{error, warn};

use crate::app::ports::StoragePort;
use crate::config::TimeOfDay;

/// Boot latency compensated out of every sleep (~500 ms).
pub const BOOT_TIME_US: u64 = 500_000;
/// Time to enter deep sleep (~100 ms).
pub const SHUTDOWN_TIME_US: u64 = 100_000;
/// CONFIG_ESP32S3_DEEP_SLEEP_WAKEUP_DELAY.
pub const WAKEUP_DELAY_US: u64 = 2_000;
/// CONFIG_ESP_SLEEP_WAIT_FLASH_READY_EXTRA_DELAY.
pub const FLASH_READY_DELAY_US: u64 = 2_000;

pub const OVERHEAD_US: u64 =
    BOOT_TIME_US + SHUTDOWN_TIME_US + WAKEUP_DELAY_US + FLASH_READY_DELAY_US;

pub const OVERHEAD_MS: u64 = OVERHEAD_US / 1000;

/// Sleeps shorter than this are treated as configuration errors.
pub const MIN_SLEEP_US: i64 = 500_000;

/// Persisted failure counter ceiling; reaching it fires the cooldown
/// rung and resets the counter.
pub const FAILURE_CEILING: u32 = 15;

/// Cooldown sleep duration (10 minutes).
pub const COOLDOWN_SLEEP_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Sleep planning
// ---------------------------------------------------------------------------

/// What the device should sleep until.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepTarget {
    /// An absolute wake time of day (sleep-window end).
    Until(TimeOfDay),
    /// One capture period, measured from boot.
    For(u64),
}

/// The hardware mechanism that ends deep sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    /// RTC timer after the given duration.
    Timer { duration_us: u64 },
    /// Falling edge on the button pin; the timer stays disarmed.
    ButtonEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepPlanError {
    /// The compensated duration fell below [`MIN_SLEEP_US`].
    TooShort { remaining_us: i64 },
}

impl fmt::Display for SleepPlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { remaining_us } => {
                write!(f, "invalid sleep time: {remaining_us} us")
            }
        }
    }
}

/// Compute the timer-wake duration for `target`, subtracting the
/// platform overhead. `now` is the current wall time of day, `uptime_us`
/// the monotonic time since boot (already spent out of a period).
pub fn plan_sleep(
    target: SleepTarget,
    now: TimeOfDay,
    uptime_us: u64,
) -> Result<u64, SleepPlanError> {
    let remaining_us = match target {
        SleepTarget::Until(wake) => {
            let delta_s = i64::from(wake.to_seconds()) - i64::from(now.to_seconds());
            delta_s * 1_000_000 - OVERHEAD_US as i64
        }
        SleepTarget::For(period_s) => {
            period_s as i64 * 1_000_000 - uptime_us as i64 - OVERHEAD_US as i64
        }
    };

    if remaining_us < MIN_SLEEP_US {
        return Err(SleepPlanError::TooShort { remaining_us });
    }
    Ok(remaining_us as u64)
}

// ---------------------------------------------------------------------------
// Failure ladder
// ---------------------------------------------------------------------------

/// What the escalation decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAction {
    /// Restart immediately and retry.
    RestartNow,
    /// Ceiling reached: sleep [`COOLDOWN_SLEEP_SECS`] before retrying.
    Cooldown,
}

/// Read-increment-persist the failure counter and pick the rung.
/// Reaching the ceiling resets the counter, so one cooldown is
/// followed by a fresh run of immediate restarts.
pub fn escalate(storage: &mut dyn StoragePort) -> EscalationAction {
    let count = storage.read_failure_count().saturating_add(1);
    if count >= FAILURE_CEILING {
        error!("Escalation: failure #{count} reached ceiling, cooling down {COOLDOWN_SLEEP_SECS} s");
        if let Err(e) = storage.write_failure_count(0) {
            error!("Escalation: failed to reset failure counter: {e}");
        }
        EscalationAction::Cooldown
    } else {
        warn!("Escalation: failure #{count}, restarting");
        if let Err(e) = storage.write_failure_count(count) {
            error!("Escalation: failed to persist failure counter: {e}");
        }
        EscalationAction::RestartNow
    }
}

// ---------------------------------------------------------------------------
// Executors
// ---------------------------------------------------------------------------

/// Arm the wake source and enter deep sleep. Does not return on the
/// device; the simulation backend logs and exits the process.
#[cfg(target_os = "espidf")]
pub fn enter_deep_sleep(wake: WakeSource) -> ! {
    use esp_idf_svc::sys;

    isolate_camera_pins();
    unsafe {
        match wake {
            WakeSource::Timer { duration_us } => {
                warn!("Deep sleep: {} s (timer wake)", duration_us / 1_000_000);
                sys::esp_sleep_enable_timer_wakeup(duration_us);
            }
            WakeSource::ButtonEdge => {
                warn!("Deep sleep: until button press (ext0 wake)");
                sys::esp_sleep_disable_wakeup_source(sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_ALL);
                sys::esp_sleep_enable_ext0_wakeup(crate::pins::BUTTON_GPIO, 0);
            }
        }
        sys::esp_deep_sleep_start();
    }
    unreachable!("esp_deep_sleep_start returned");
}

#[cfg(not(target_os = "espidf"))]
pub fn enter_deep_sleep(wake: WakeSource) -> ! {
    match wake {
        WakeSource::Timer { duration_us } => {
            warn!("Deep sleep (sim): {} s, timer wake", duration_us / 1_000_000);
        }
        WakeSource::ButtonEdge => warn!("Deep sleep (sim): until button press"),
    }
    std::process::exit(0);
}

/// Hard restart.
#[cfg(target_os = "espidf")]
pub fn restart() -> ! {
    warn!("Restarting the device...");
    // Give the final log lines a chance to drain.
    std::thread::sleep(std::time::Duration::from_millis(2000));
    unsafe { esp_idf_svc::sys::esp_restart() };
    unreachable!("esp_restart returned");
}

#[cfg(not(target_os = "espidf"))]
pub fn restart() -> ! {
    warn!("Restarting the device (sim)...");
    std::process::exit(0);
}

/// Factory reset: erase every persisted key, then restart. Reached
/// only from the long-press `Reset` event.
pub fn factory_reset(storage: &mut dyn StoragePort) -> ! {
    warn!("Factory reset: erasing persisted configuration and credentials");
    if let Err(e) = storage.erase_all() {
        error!("Factory reset: erase failed: {e}");
    }
    restart();
}

/// Execute an escalation decision. Does not return.
pub fn apply_escalation(action: EscalationAction) -> ! {
    match action {
        EscalationAction::RestartNow => restart(),
        EscalationAction::Cooldown => enter_deep_sleep(WakeSource::Timer {
            duration_us: COOLDOWN_SLEEP_SECS * 1_000_000,
        }),
    }
}

/// Isolate the camera pin group so the sensor cannot back-power
/// through its data lines during deep sleep.
#[cfg(target_os = "espidf")]
fn isolate_camera_pins() {
    for pin in crate::pins::CAM_ISOLATE_PINS {
        unsafe {
            esp_idf_svc::sys::rtc_gpio_isolate(pin);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::StorageError;
    use std::collections::HashMap;

    struct MemStore {
        map: HashMap<String, Vec<u8>>,
        failures: u32,
    }

    impl MemStore {
        fn new() -> Self {
            Self {
                map: HashMap::new(),
                failures: 0,
            }
        }
    }

    impl StoragePort for MemStore {
        fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            self.map.get(key).cloned().ok_or(StorageError::NotFound)
        }
        fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
            self.map.insert(key.into(), data.into());
            Ok(())
        }
        fn delete(&mut self, key: &str) -> Result<(), StorageError> {
            self.map.remove(key);
            Ok(())
        }
        fn exists(&self, key: &str) -> bool {
            self.map.contains_key(key)
        }
        fn read_failure_count(&self) -> u32 {
            self.failures
        }
        fn write_failure_count(&mut self, count: u32) -> Result<(), StorageError> {
            self.failures = count;
            Ok(())
        }
        fn erase_all(&mut self) -> Result<(), StorageError> {
            self.map.clear();
            self.failures = 0;
            Ok(())
        }
    }

    fn tod(s: &str) -> TimeOfDay {
        TimeOfDay::parse(s).unwrap()
    }

    #[test]
    fn period_sleep_subtracts_uptime_and_overhead() {
        // 40 s period, 5 s already spent awake.
        let us = plan_sleep(SleepTarget::For(40), tod("10:00:00"), 5_000_000).unwrap();
        assert_eq!(us, 35_000_000 - OVERHEAD_US);
    }

    #[test]
    fn absolute_sleep_targets_window_end() {
        let us = plan_sleep(SleepTarget::Until(tod("07:00:00")), tod("03:00:00"), 0).unwrap();
        assert_eq!(us, 4 * 3600 * 1_000_000 - OVERHEAD_US);
    }

    #[test]
    fn near_zero_sleep_is_an_error() {
        let err = plan_sleep(SleepTarget::For(1), tod("10:00:00"), 900_000).unwrap_err();
        assert!(matches!(err, SleepPlanError::TooShort { .. }));
    }

    #[test]
    fn wake_time_in_the_past_is_an_error() {
        let err =
            plan_sleep(SleepTarget::Until(tod("03:00:00")), tod("07:00:00"), 0).unwrap_err();
        assert!(matches!(
            err,
            SleepPlanError::TooShort { remaining_us } if remaining_us < 0
        ));
    }

    #[test]
    fn escalation_restarts_below_ceiling() {
        let mut store = MemStore::new();
        assert_eq!(escalate(&mut store), EscalationAction::RestartNow);
        assert_eq!(store.read_failure_count(), 1);
    }

    #[test]
    fn escalation_cools_down_at_ceiling_and_resets() {
        let mut store = MemStore::new();
        store.write_failure_count(FAILURE_CEILING - 1).unwrap();
        assert_eq!(escalate(&mut store), EscalationAction::Cooldown);
        assert_eq!(store.read_failure_count(), 0);
    }

    #[test]
    fn ladder_runs_fresh_after_cooldown() {
        let mut store = MemStore::new();
        for _ in 0..FAILURE_CEILING - 1 {
            assert_eq!(escalate(&mut store), EscalationAction::RestartNow);
        }
        assert_eq!(escalate(&mut store), EscalationAction::Cooldown);
        assert_eq!(escalate(&mut store), EscalationAction::RestartNow);
        assert_eq!(store.read_failure_count(), 1);
    }
}
