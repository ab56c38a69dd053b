//! Debounced button input with short/long press classification.
//!
//! ## Hardware
//!
//! Active-low momentary switch with external pull-up on an RTC-capable
//! GPIO (it doubles as the deep-sleep wake pin). The any-edge ISR does
//! exactly one thing: capture a millisecond timestamp into a one-slot
//! mailbox. Depth one is intentional — only the *timing* of the latest
//! edge matters, never how many bounced in between — and a slow
//! consumer sees the newest timestamp.
//!
//! ## Classification
//!
//! The task re-samples the pin level on every wake (the mailbox entry
//! is a trigger, not a level) and honors a level change only when
//! [`DEBOUNCE_MS`] has passed since the last honored change:
//!
//! | Edge                 | Event                                     |
//! |----------------------|-------------------------------------------|
//! | Falling (press)      | `InputPressed`                            |
//! | Rising, held < 2.5 s | `SleepUntilInput`                         |
//! | Rising, held ≥ 2.5 s | `Reset`                                   |
//!
//! Either release ends the task — the duty cycle is over at that
//! point and the device is on its way to sleep or factory reset.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::app::CancelToken;
use crate::events::{Event, EventBroker};

pub const DEBOUNCE_MS: u32 = 50;
pub const LONG_PRESS_MS: u32 = 2500;

/// Task priority for the button consumer (above the workflow, below
/// the dispatcher).
const BUTTON_TASK_PRIORITY: u8 = 13;
const BUTTON_TASK_STACK_KB: usize = 4;

// ---------------------------------------------------------------------------
// Press tracking state machine (pure)
// ---------------------------------------------------------------------------

/// Outcome of one honored edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressOutcome {
    /// Honored falling edge.
    Pressed,
    /// Honored rising edge after a press shorter than [`LONG_PRESS_MS`].
    ShortRelease,
    /// Honored rising edge after a press of [`LONG_PRESS_MS`] or more.
    LongRelease,
}

impl PressOutcome {
    /// The broker event this outcome publishes.
    pub fn event(self) -> Event {
        match self {
            Self::Pressed => Event::InputPressed,
            Self::ShortRelease => Event::SleepUntilInput,
            Self::LongRelease => Event::Reset,
        }
    }
}

/// Debounce and press/release bookkeeping, owned exclusively by the
/// button task and mutated only in response to mailbox wakes.
pub struct PressTracker {
    last_level: u8,
    last_change_ms: Option<u32>,
    press_start_ms: u32,
    is_pressed: bool,
}

impl PressTracker {
    pub fn new() -> Self {
        Self {
            last_level: 1,
            last_change_ms: None,
            press_start_ms: 0,
            is_pressed: false,
        }
    }

    /// Feed one edge wake: the mailbox timestamp and the re-sampled
    /// pin level. Returns the classified outcome when the edge is
    /// honored; bounces and level repeats return `None` and leave the
    /// state untouched.
    pub fn on_edge(&mut self, now_ms: u32, level: u8) -> Option<PressOutcome> {
        if level == self.last_level {
            return None;
        }
        if let Some(last) = self.last_change_ms {
            if now_ms.wrapping_sub(last) < DEBOUNCE_MS {
                return None;
            }
        }

        self.last_change_ms = Some(now_ms);
        self.last_level = level;

        if level == 0 {
            self.press_start_ms = now_ms;
            self.is_pressed = true;
            return Some(PressOutcome::Pressed);
        }

        if !self.is_pressed {
            return None;
        }
        self.is_pressed = false;
        let duration = now_ms.wrapping_sub(self.press_start_ms);
        if duration >= LONG_PRESS_MS {
            Some(PressOutcome::LongRelease)
        } else {
            Some(PressOutcome::ShortRelease)
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.is_pressed
    }
}

impl Default for PressTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// One-slot edge mailbox
// ---------------------------------------------------------------------------

/// Newest-wins single-slot mailbox between the edge source and the
/// button task. Posting overwrites; waiting blocks until a timestamp
/// is present.
pub struct EdgeMailbox {
    slot: Mutex<Option<u32>>,
    wake: Condvar,
}

impl EdgeMailbox {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            wake: Condvar::new(),
        }
    }

    /// Deposit an edge timestamp, replacing any unconsumed one.
    pub fn post(&self, timestamp_ms: u32) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(timestamp_ms);
        self.wake.notify_one();
    }

    /// Block until a timestamp is available or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Option<u32> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(ts) = slot.take() {
                return Some(ts);
            }
            let (guard, result) = self
                .wake
                .wait_timeout(slot, timeout)
                .unwrap_or_else(|p| p.into_inner());
            slot = guard;
            if result.timed_out() {
                return slot.take();
            }
        }
    }
}

impl Default for EdgeMailbox {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Level source
// ---------------------------------------------------------------------------

/// Where the task re-samples the pin level on each wake.
pub trait LevelSource: Send + 'static {
    /// Current pin level: 1 = released (pull-up), 0 = pressed.
    fn level(&self) -> u8;
}

// ---------------------------------------------------------------------------
// Button input task
// ---------------------------------------------------------------------------

/// The button input subsystem: edge mailbox + consumer task.
pub struct ButtonInput {
    broker: Arc<EventBroker>,
    mailbox: Arc<EdgeMailbox>,
    cancel: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ButtonInput {
    pub fn new(broker: Arc<EventBroker>) -> Self {
        Self {
            broker,
            mailbox: Arc::new(EdgeMailbox::new()),
            cancel: CancelToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// The mailbox the edge source (ISR or simulation) posts into.
    pub fn mailbox(&self) -> Arc<EdgeMailbox> {
        self.mailbox.clone()
    }

    /// Spawn the consumer task against the given level source.
    pub fn start(&self, levels: impl LevelSource) {
        let broker = self.broker.clone();
        let mailbox = self.mailbox.clone();
        let cancel = self.cancel.clone();

        let handle = crate::drivers::task_spawn::spawn(
            "button\0",
            BUTTON_TASK_PRIORITY,
            BUTTON_TASK_STACK_KB,
            move || {
                info!("Button task started");
                let mut tracker = PressTracker::new();
                loop {
                    // The wait for the next edge is the task's entire
                    // purpose; only cancellation bounds it.
                    let Some(timestamp) = mailbox.wait(Duration::from_millis(500)) else {
                        if cancel.is_cancelled() {
                            break;
                        }
                        continue;
                    };
                    if cancel.is_cancelled() {
                        break;
                    }

                    let Some(outcome) = tracker.on_edge(timestamp, levels.level()) else {
                        continue;
                    };
                    match outcome {
                        PressOutcome::Pressed => {
                            info!("Button pressed");
                            broker.publish(outcome.event());
                        }
                        PressOutcome::ShortRelease => {
                            warn!("Short press detected - entering deep sleep");
                            broker.publish(outcome.event());
                            break;
                        }
                        PressOutcome::LongRelease => {
                            warn!("Long press detected - resetting device");
                            broker.publish(outcome.event());
                            break;
                        }
                    }
                }
                info!("Button task finished");
            },
        );
        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Stop the consumer task. Idempotent: a second call (or a call
    /// after the task ended itself) is a no-op.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.mailbox.post(0);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Button task panicked before stop");
            }
            info!("Button task stopped");
        }
    }
}

// ---------------------------------------------------------------------------
// ESP-IDF edge source
// ---------------------------------------------------------------------------

/// GPIO-backed consumer task: the any-edge ISR stores a timestamp
/// into an atomic (no heap, no locks in interrupt context) and raises
/// a FreeRTOS task notification; the task re-samples the pin level
/// and runs the same [`PressTracker`] as the host backend.
#[cfg(target_os = "espidf")]
impl ButtonInput {
    pub fn start_on_gpio(&self, pin: esp_idf_svc::hal::gpio::AnyIOPin) {
        use core::num::NonZeroU32;
        use esp_idf_svc::hal::gpio::{InterruptType, PinDriver, Pull};
        use esp_idf_svc::hal::task::notification::Notification;
        use std::sync::atomic::{AtomicU32, Ordering};

        let broker = self.broker.clone();
        let cancel = self.cancel.clone();

        let handle = crate::drivers::task_spawn::spawn(
            "button\0",
            BUTTON_TASK_PRIORITY,
            BUTTON_TASK_STACK_KB,
            move || {
                let mut driver = match PinDriver::input(pin) {
                    Ok(d) => d,
                    Err(e) => {
                        log::error!("Button: pin init failed: {e}");
                        return;
                    }
                };
                let _ = driver.set_pull(Pull::Up);
                let _ = driver.set_interrupt_type(InterruptType::AnyEdge);

                // Notification belongs to this task; the notifier is the
                // ISR-safe half handed to the interrupt.
                let notification = Notification::new();
                let notifier = notification.notifier();
                let edge_ms = Arc::new(AtomicU32::new(0));
                let isr_edge_ms = edge_ms.clone();

                // SAFETY: ISR body is an atomic store plus a FreeRTOS
                // task notification; both are interrupt-safe and O(1).
                let subscribed = unsafe {
                    driver.subscribe(move || {
                        let now_ms =
                            (esp_idf_svc::sys::esp_timer_get_time() / 1000) as u32;
                        isr_edge_ms.store(now_ms, Ordering::Release);
                        notifier.notify_and_yield(NonZeroU32::new(1).unwrap());
                    })
                };
                if let Err(e) = subscribed {
                    log::error!("Button: ISR install failed: {e}");
                    return;
                }

                info!("Button task started");
                let mut tracker = PressTracker::new();
                loop {
                    // The hal disarms the interrupt after each fire.
                    let _ = driver.enable_interrupt();
                    if notification.wait(500).is_none() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        continue;
                    }
                    if cancel.is_cancelled() {
                        break;
                    }

                    let timestamp = edge_ms.load(Ordering::Acquire);
                    let level = u8::from(driver.is_high());
                    let Some(outcome) = tracker.on_edge(timestamp, level) else {
                        continue;
                    };
                    match outcome {
                        PressOutcome::Pressed => {
                            info!("Button pressed on GPIO {}", crate::pins::BUTTON_GPIO);
                            broker.publish(outcome.event());
                        }
                        PressOutcome::ShortRelease => {
                            warn!("Short press detected - entering deep sleep");
                            broker.publish(outcome.event());
                            break;
                        }
                        PressOutcome::LongRelease => {
                            warn!("Long press detected - resetting device");
                            broker.publish(outcome.event());
                            break;
                        }
                    }
                }
                info!("Button task finished");
            },
        );
        *self.handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
