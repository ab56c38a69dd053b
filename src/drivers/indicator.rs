//! Status LED patterns.
//!
//! The LED is the only user-facing signal on the device. Patterns map
//! to blink rates; `set_pattern` is fire-and-forget from any task and
//! a low-priority task drives the pin.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::info;

use crate::app::ports::IndicatorPort;
use crate::app::CancelToken;

const INDICATOR_TASK_PRIORITY: u8 = 2;
const INDICATOR_TASK_STACK_KB: usize = 2;

/// Task tick; pattern changes and stop are observed within one tick.
const TICK_MS: u64 = 50;

/// Blink patterns, by half-period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pattern {
    Off = 0,
    On = 1,
    /// 1 Hz — provisioning mode, no QR code found yet.
    SearchingBlink = 2,
    /// 2 Hz — static configuration saved.
    ConfigSavedBlink = 3,
    /// 2 Hz — broker session established.
    ConnectedBlink = 4,
    /// 4 Hz — error escalation in progress.
    ErrorBlink = 5,
}

impl Pattern {
    /// Toggle half-period, `None` for the steady patterns.
    pub fn half_period_ms(self) -> Option<u64> {
        match self {
            Self::Off | Self::On => None,
            Self::SearchingBlink => Some(1000),
            Self::ConfigSavedBlink | Self::ConnectedBlink => Some(500),
            Self::ErrorBlink => Some(250),
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::On,
            2 => Self::SearchingBlink,
            3 => Self::ConfigSavedBlink,
            4 => Self::ConnectedBlink,
            5 => Self::ErrorBlink,
            _ => Self::Off,
        }
    }
}

// ---------------------------------------------------------------------------
// LED pin
// ---------------------------------------------------------------------------

#[cfg(target_os = "espidf")]
struct LedPin {
    driver: esp_idf_svc::hal::gpio::PinDriver<
        'static,
        esp_idf_svc::hal::gpio::AnyOutputPin,
        esp_idf_svc::hal::gpio::Output,
    >,
}

#[cfg(target_os = "espidf")]
impl LedPin {
    fn set(&mut self, on: bool) {
        let _ = if on {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        };
    }
}

/// Simulation pin: records the level for tests.
#[cfg(not(target_os = "espidf"))]
struct LedPin {
    level: Arc<AtomicBool>,
}

#[cfg(not(target_os = "espidf"))]
impl LedPin {
    fn set(&mut self, on: bool) {
        self.level.store(on, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Indicator task
// ---------------------------------------------------------------------------

pub struct Indicator {
    pattern: Arc<AtomicU8>,
    cancel: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    #[cfg(not(target_os = "espidf"))]
    level: Arc<AtomicBool>,
}

impl Indicator {
    /// Construct and start the LED task.
    #[cfg(target_os = "espidf")]
    pub fn start(pin: esp_idf_svc::hal::gpio::AnyOutputPin) -> Self {
        let driver = esp_idf_svc::hal::gpio::PinDriver::output(pin)
            .expect("LED pin is dedicated and never claimed twice");
        let indicator = Self {
            pattern: Arc::new(AtomicU8::new(Pattern::Off as u8)),
            cancel: CancelToken::new(),
            handle: Mutex::new(None),
        };
        indicator.spawn(LedPin { driver });
        indicator
    }

    /// Construct and start the LED task (simulation backend).
    #[cfg(not(target_os = "espidf"))]
    pub fn start() -> Self {
        let level = Arc::new(AtomicBool::new(false));
        let indicator = Self {
            pattern: Arc::new(AtomicU8::new(Pattern::Off as u8)),
            cancel: CancelToken::new(),
            handle: Mutex::new(None),
            level: level.clone(),
        };
        indicator.spawn(LedPin { level });
        indicator
    }

    fn spawn(&self, mut pin: LedPin) {
        let pattern = self.pattern.clone();
        let cancel = self.cancel.clone();
        let handle = crate::drivers::task_spawn::spawn(
            "indicator\0",
            INDICATOR_TASK_PRIORITY,
            INDICATOR_TASK_STACK_KB,
            move || {
                let mut lit = false;
                let mut elapsed_ms: u64 = 0;
                loop {
                    if cancel.is_cancelled() {
                        pin.set(false);
                        break;
                    }
                    let current = Pattern::from_u8(pattern.load(Ordering::Relaxed));
                    match current.half_period_ms() {
                        None => {
                            lit = current == Pattern::On;
                            pin.set(lit);
                            elapsed_ms = 0;
                        }
                        Some(half) => {
                            if elapsed_ms >= half {
                                lit = !lit;
                                pin.set(lit);
                                elapsed_ms = 0;
                            }
                        }
                    }
                    std::thread::sleep(Duration::from_millis(TICK_MS));
                    elapsed_ms += TICK_MS;
                }
            },
        );
        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Stop the LED task and extinguish the LED. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
            info!("Indicator task stopped");
        }
    }

    /// Current simulated LED level (tests only).
    #[cfg(not(target_os = "espidf"))]
    pub fn is_lit(&self) -> bool {
        self.level.load(Ordering::Relaxed)
    }
}

impl IndicatorPort for Indicator {
    fn set_pattern(&self, pattern: Pattern) {
        self.pattern.store(pattern as u8, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
