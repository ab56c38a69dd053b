//! Cross-task event broker.
//!
//! Producers (the button task, the capture workflow) publish control
//! events into a bounded mailbox; a single consumer loop drains it and
//! runs the registered callbacks. This is the only channel between
//! tasks — they never share mutable state directly.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Button task  │────▶│              │     │              │
//! │ Capture task │────▶│   Mailbox    │────▶│  Dispatcher  │
//! │ Provisioning │────▶│  (depth 10)  │     │  (one loop)  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! The broker is an explicitly constructed object shared by `Arc`
//! handle; exactly one instance exists per boot because exactly one is
//! constructed in `main`.
//!
//! `publish` must never block a producer for long: a full mailbox is
//! retried briefly and then the event is dropped with a warning.
//! Degraded operation beats a deadlocked time-critical task.

use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

/// Mailbox depth; overflow drops the newest event.
const MAILBOX_DEPTH: usize = 10;

/// Total bounded wait for a slot when publishing into a full mailbox.
const PUBLISH_WAIT_MS: u64 = 100;

/// Bounded wait in `process_next` before returning a heartbeat `false`.
const PROCESS_WAIT_MS: u64 = 1000;

/// Bounded wait for the subscriber registry lock.
const REGISTRY_WAIT_MS: u64 = 5000;

const RETRY_STEP_MS: u64 = 10;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Control events exchanged between tasks. Identity is the variant;
/// there is no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Event {
    /// The button was pressed (falling edge honored by debounce).
    InputPressed = 0,
    /// Stop the button input task.
    StopInput = 1,
    /// Long press: factory reset the device.
    Reset = 2,
    /// Short press: deep sleep until the next button press.
    SleepUntilInput = 3,
    /// Cycle finished: deep sleep until the next capture period.
    SleepUntilNextPeriod = 4,
    /// Sleep window active: deep sleep until the window's end.
    SleepUntilNextWindow = 5,
}

impl Event {
    pub const COUNT: usize = 6;

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::InputPressed => "input-pressed",
            Self::StopInput => "stop-input",
            Self::Reset => "reset",
            Self::SleepUntilInput => "sleep-until-input",
            Self::SleepUntilNextPeriod => "sleep-until-next-period",
            Self::SleepUntilNextWindow => "sleep-until-next-window",
        }
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerError {
    /// The subscriber registry lock could not be acquired in time.
    RegistryBusy,
}

impl core::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::RegistryBusy => write!(f, "subscriber registry busy"),
        }
    }
}

type Callback = Box<dyn FnMut(Event) + Send>;

struct Subscription {
    id: u32,
    callback: Callback,
}

struct Registry {
    next_id: u32,
    lists: [Vec<Subscription>; Event::COUNT],
}

/// Publish/subscribe broker with a bounded mailbox and a single
/// authoritative dispatcher.
pub struct EventBroker {
    registry: Mutex<Registry>,
    tx: SyncSender<Event>,
    rx: Mutex<Receiver<Event>>,
}

impl EventBroker {
    pub fn new() -> Self {
        let (tx, rx) = sync_channel(MAILBOX_DEPTH);
        Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                lists: core::array::from_fn(|_| Vec::new()),
            }),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Register a callback for one event variant. Within a variant,
    /// callbacks run in subscription order. Returns a subscription id
    /// (monotonically increasing from 1).
    pub fn subscribe(
        &self,
        event: Event,
        callback: impl FnMut(Event) + Send + 'static,
    ) -> Result<u32, BrokerError> {
        let mut reg = self
            .lock_registry(REGISTRY_WAIT_MS)
            .ok_or(BrokerError::RegistryBusy)?;
        let id = reg.next_id;
        reg.next_id += 1;
        reg.lists[event.index()].push(Subscription {
            id,
            callback: Box::new(callback),
        });
        debug!("Broker: subscription {id} for {}", event.name());
        Ok(id)
    }

    /// Remove a subscription. Returns whether it was found.
    pub fn unsubscribe(&self, event: Event, id: u32) -> bool {
        let Some(mut reg) = self.lock_registry(REGISTRY_WAIT_MS) else {
            error!("Broker: registry busy, unsubscribe {id} abandoned");
            return false;
        };
        let list = &mut reg.lists[event.index()];
        let before = list.len();
        list.retain(|s| s.id != id);
        list.len() != before
    }

    /// Enqueue an event for the dispatcher. Bounded: a full mailbox is
    /// retried for at most [`PUBLISH_WAIT_MS`], then the event is
    /// dropped with a warning.
    pub fn publish(&self, event: Event) {
        let mut ev = event;
        let deadline = Instant::now() + Duration::from_millis(PUBLISH_WAIT_MS);
        loop {
            match self.tx.try_send(ev) {
                Ok(()) => {
                    debug!("Broker: event {} queued", event.name());
                    return;
                }
                Err(TrySendError::Full(back)) => {
                    if Instant::now() >= deadline {
                        warn!("Broker: mailbox full, dropping event {}", event.name());
                        return;
                    }
                    ev = back;
                    std::thread::sleep(Duration::from_millis(RETRY_STEP_MS));
                }
                Err(TrySendError::Disconnected(_)) => {
                    error!("Broker: mailbox gone, dropping event {}", event.name());
                    return;
                }
            }
        }
    }

    /// Wait up to one second for the next event and dispatch it to
    /// every callback registered for its variant, in subscription
    /// order. Returns `false` on timeout so the consumer loop can
    /// heartbeat. Callbacks are serialized by the registry lock; no
    /// two ever run concurrently.
    pub fn process_next(&self) -> bool {
        let event = {
            let rx = match self.rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    error!("Broker: dispatcher lock poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            match rx.recv_timeout(Duration::from_millis(PROCESS_WAIT_MS)) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Broker: all producers gone");
                    return false;
                }
            }
        };

        let Some(mut reg) = self.lock_registry(REGISTRY_WAIT_MS) else {
            error!(
                "Broker: registry busy, event {} not dispatched",
                event.name()
            );
            return false;
        };
        for sub in reg.lists[event.index()].iter_mut() {
            (sub.callback)(event);
        }
        true
    }

    /// Bounded registry acquisition. A poisoned lock (a callback
    /// panicked) is recovered rather than propagated: the dispatcher
    /// must keep running on a device with no operator.
    fn lock_registry(&self, budget_ms: u64) -> Option<MutexGuard<'_, Registry>> {
        let deadline = Instant::now() + Duration::from_millis(budget_ms);
        loop {
            match self.registry.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => {
                    error!("Broker: registry lock poisoned, recovering");
                    return Some(poisoned.into_inner());
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(RETRY_STEP_MS));
                }
            }
        }
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn subscription_ids_start_at_one_and_increase() {
        let broker = EventBroker::new();
        let a = broker.subscribe(Event::Reset, |_| {}).unwrap();
        let b = broker.subscribe(Event::InputPressed, |_| {}).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn publish_then_process_invokes_callback() {
        let broker = EventBroker::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        broker
            .subscribe(Event::SleepUntilInput, move |_| {
                *h.lock().unwrap() += 1;
            })
            .unwrap();

        broker.publish(Event::SleepUntilInput);
        assert!(broker.process_next());
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn callbacks_run_in_subscription_order() {
        let broker = EventBroker::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        broker
            .subscribe(Event::Reset, move |_| o.lock().unwrap().push("a"))
            .unwrap();
        let o = order.clone();
        broker
            .subscribe(Event::Reset, move |_| o.lock().unwrap().push("b"))
            .unwrap();

        broker.publish(Event::Reset);
        assert!(broker.process_next());
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn events_only_reach_their_own_variant() {
        let broker = EventBroker::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let h = hits.clone();
        broker
            .subscribe(Event::Reset, move |_| h.lock().unwrap().push("reset"))
            .unwrap();
        let h = hits.clone();
        broker
            .subscribe(Event::StopInput, move |_| h.lock().unwrap().push("stop"))
            .unwrap();

        broker.publish(Event::StopInput);
        assert!(broker.process_next());
        assert_eq!(*hits.lock().unwrap(), vec!["stop"]);
    }

    #[test]
    fn unsubscribe_removes_callback() {
        let broker = EventBroker::new();
        let hits = Arc::new(Mutex::new(0));

        let h = hits.clone();
        let id = broker
            .subscribe(Event::Reset, move |_| *h.lock().unwrap() += 1)
            .unwrap();

        assert!(broker.unsubscribe(Event::Reset, id));
        assert!(!broker.unsubscribe(Event::Reset, id));

        broker.publish(Event::Reset);
        assert!(broker.process_next());
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn process_next_times_out_without_events() {
        let broker = EventBroker::new();
        assert!(!broker.process_next());
    }

    #[test]
    fn overflow_drops_events_beyond_mailbox_depth() {
        let broker = EventBroker::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        broker
            .subscribe(Event::SleepUntilNextPeriod, move |_| {
                *h.lock().unwrap() += 1;
            })
            .unwrap();

        // One more than the mailbox holds; the last publish drops.
        for _ in 0..=MAILBOX_DEPTH {
            broker.publish(Event::SleepUntilNextPeriod);
        }
        for _ in 0..MAILBOX_DEPTH {
            assert!(broker.process_next());
        }
        assert!(!broker.process_next());
        assert_eq!(*hits.lock().unwrap(), MAILBOX_DEPTH);
    }

    #[test]
    fn publish_from_inside_a_callback_does_not_deadlock() {
        let broker = Arc::new(EventBroker::new());
        let hits = Arc::new(Mutex::new(0));

        let b = broker.clone();
        broker
            .subscribe(Event::InputPressed, move |_| {
                b.publish(Event::StopInput);
            })
            .unwrap();
        let h = hits.clone();
        broker
            .subscribe(Event::StopInput, move |_| *h.lock().unwrap() += 1)
            .unwrap();

        broker.publish(Event::InputPressed);
        assert!(broker.process_next());
        assert!(broker.process_next());
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
