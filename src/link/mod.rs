//! Handshake protocol client over the MQTT transport.
//!
//! The transport delivers connection, data and error events on its own
//! task. This module turns that callback stream into the blocking
//! request/acknowledge steps the linear capture workflow needs:
//!
//! - publish a health report, then wait for either a `config-ok`
//!   sentinel or a full configuration document on the config topic;
//! - publish an image header, then wait for the header's timestamp to
//!   come back on the ack topic before streaming the payload.
//!
//! Each wait is a fresh one-shot rendezvous. The callback side holds a
//! single `Option` slot per rendezvous, so its critical section stays
//! O(1): compare, signal, done. The only other state crossing the
//! task boundary is the connected flag and the session error counter.

pub mod mqtt;

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::app::ports::{keys, StoragePort};
use crate::app::CancelToken;
use crate::config::CaptureSchedule;

/// Transport-level errors surface as a session counter, not as flow
/// control; past this many the session is considered broken and the
/// device-wide restart policy takes over.
const SESSION_ERROR_CEILING: u32 = 20;

/// Rendezvous waits poll in slices this long so a cancellation is
/// observed promptly.
const WAIT_SLICE_MS: u64 = 100;

/// Ack tokens are UTC second timestamps: `2025-03-28T11:08:28Z`.
pub const TOKEN_CAPACITY: usize = 24;

/// Sentinel payload on the config topic meaning "your configuration
/// is current". A JSON string, compared verbatim. A legitimately
/// serialized configuration cannot collide with it in practice, but
/// the discriminator is string-based by server contract.
const CONFIG_OK: &str = "config-ok";

// ---------------------------------------------------------------------------
// Errors and transport contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// Send rejected at the transport layer (queue full, no session).
    PublishFailed,
    SubscribeFailed,
    /// No transport attached yet.
    NotConnected,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublishFailed => write!(f, "publish failed"),
            Self::SubscribeFailed => write!(f, "subscribe failed"),
            Self::NotConnected => write!(f, "transport not connected"),
        }
    }
}

/// Events delivered from the transport's own task context.
pub enum TransportEvent<'a> {
    Connected,
    Disconnected,
    Data { topic: &'a str, payload: &'a [u8] },
    Error,
}

/// Wire transport under the handshake client. Publish is
/// fire-and-forget: a success means the transport accepted the send,
/// not that anyone received it — delivery confirmation only exists in
/// the ack protocol above.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError>;

    fn subscribe(&self, topic: &str) -> Result<(), LinkError>;

    fn reconnect(&self) -> Result<(), LinkError>;
}

// ---------------------------------------------------------------------------
// Broker profile
// ---------------------------------------------------------------------------

/// Topic names used by the handshake protocol.
#[derive(Debug, Clone)]
pub struct TopicSet {
    pub config: String,
    pub health_report: String,
    pub image_ack: String,
    pub image: String,
    pub log: String,
}

/// Immutable connection profile, constructed once from storage at
/// startup and shared by reference thereafter.
#[derive(Debug, Clone)]
pub struct BrokerProfile {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub topics: TopicSet,
}

impl BrokerProfile {
    pub fn from_storage(
        storage: &dyn StoragePort,
    ) -> Result<Self, crate::app::ports::StorageError> {
        Ok(Self {
            uri: storage.read_str(keys::MQTT_ADDRESS)?,
            username: storage.read_str(keys::MQTT_USER)?,
            password: storage.read_str(keys::MQTT_PASSWORD)?,
            topics: TopicSet {
                config: storage.read_str(keys::CONFIG_TOPIC)?,
                health_report: storage.read_str(keys::HEALTH_TOPIC)?,
                image_ack: storage.read_str(keys::IMAGE_ACK_TOPIC)?,
                image: storage.read_str(keys::IMAGE_TOPIC)?,
                log: storage.read_str(keys::LOG_TOPIC)?,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Rendezvous primitives
// ---------------------------------------------------------------------------

/// One pending header acknowledgement: the token the workflow expects
/// and the signal half of its one-shot rendezvous. Consumed on match
/// *and* on mismatch — a late matching token must not satisfy a wait
/// cycle that a mismatch already spoiled.
struct PendingAck {
    expected: heapless::String<TOKEN_CAPACITY>,
    signal: SyncSender<()>,
}

/// Block on `rx` in cancellation-aware slices until signaled, the
/// deadline passes, or the token is cancelled.
fn sliced_wait(rx: &Receiver<()>, timeout_ms: u64, cancel: &CancelToken) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let slice = (deadline - now).min(Duration::from_millis(WAIT_SLICE_MS));
        match rx.recv_timeout(slice) {
            Ok(()) => return true,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake client
// ---------------------------------------------------------------------------

/// The shared protocol client. All mutability is interior; the
/// transport callback and the workflow task hold the same `Arc`.
pub struct HandshakeClient {
    topics: TopicSet,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    schedule: Arc<Mutex<CaptureSchedule>>,
    storage: Arc<Mutex<Box<dyn StoragePort>>>,
    pending_ack: Mutex<Option<PendingAck>>,
    config_waiter: Mutex<Option<SyncSender<()>>>,
    new_config: AtomicBool,
    connected: AtomicBool,
    error_count: AtomicU32,
    /// Invoked (from the transport callback context) when the session
    /// error ceiling is exceeded or a persist fails mid-promotion.
    escalation: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl HandshakeClient {
    pub fn new(
        topics: TopicSet,
        schedule: Arc<Mutex<CaptureSchedule>>,
        storage: Arc<Mutex<Box<dyn StoragePort>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topics,
            transport: Mutex::new(None),
            schedule,
            storage,
            pending_ack: Mutex::new(None),
            config_waiter: Mutex::new(None),
            new_config: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
            escalation: Mutex::new(None),
        })
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    /// Wire the transport in once it exists; the client then considers
    /// the session live and will auto-reconnect on disconnects.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock().unwrap_or_else(|p| p.into_inner()) = Some(transport);
        self.connected.store(true, Ordering::Release);
    }

    pub fn set_escalation_hook(&self, hook: impl Fn() + Send + 'static) {
        *self.escalation.lock().unwrap_or_else(|p| p.into_inner()) = Some(Box::new(hook));
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, LinkError> {
        self.transport
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(LinkError::NotConnected)
    }

    /// Fire-and-forget publish; errors are transport-level send
    /// failures, not delivery reports.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        self.transport()?.publish(topic, payload)
    }

    /// Whether the last concluded negotiation promoted a new document
    /// (as opposed to a `config-ok` confirmation).
    pub fn new_config_received(&self) -> bool {
        self.new_config.load(Ordering::Acquire)
    }

    pub fn session_error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    // -- Rendezvous waits (workflow task side) ---------------------------

    /// Arm the configuration rendezvous and block until the server
    /// answers the health report (sentinel or full document), the
    /// timeout passes, or the cycle is cancelled.
    pub fn wait_for_config(&self, timeout_ms: u64, cancel: &CancelToken) -> bool {
        let (tx, rx) = sync_channel(1);
        *self
            .config_waiter
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(tx);

        let signaled = sliced_wait(&rx, timeout_ms, cancel);
        if !signaled {
            // Disarm so a late answer cannot signal a stale slot.
            self.config_waiter
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
        }
        signaled
    }

    /// Arm the header-ack rendezvous for `token` and block until the
    /// identical token arrives, the timeout passes, or the cycle is
    /// cancelled. Tokens are single-use: a mismatched ack spoils this
    /// wait and a later match will not revive it.
    pub fn wait_for_header_ack(&self, token: &str, timeout_ms: u64, cancel: &CancelToken) -> bool {
        let mut expected = heapless::String::new();
        if expected.push_str(token).is_err() {
            error!("Link: ack token longer than {TOKEN_CAPACITY} bytes");
            return false;
        }

        let (tx, rx) = sync_channel(1);
        *self
            .pending_ack
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(PendingAck {
            expected,
            signal: tx,
        });

        let signaled = sliced_wait(&rx, timeout_ms, cancel);
        if !signaled {
            self.pending_ack
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
        }
        signaled
    }

    // -- Transport callback side ----------------------------------------

    /// Single entry point for the transport's event callback. Runs on
    /// the transport task, never on the workflow task.
    pub fn on_transport_event(&self, event: TransportEvent<'_>) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Data { topic, payload } => {
                if topic == self.topics.image_ack {
                    self.on_ack_payload(payload);
                } else if topic == self.topics.config {
                    self.on_config_payload(payload);
                } else {
                    debug!("Link: ignoring message on {topic}");
                }
            }
            TransportEvent::Error => self.on_transport_error(),
        }
    }

    fn on_connected(&self) {
        info!("Link: connected, subscribing to protocol topics");
        match self.transport() {
            Ok(t) => {
                if t.subscribe(&self.topics.image_ack).is_err() {
                    error!("Link: subscribe to {} failed", self.topics.image_ack);
                }
                if t.subscribe(&self.topics.config).is_err() {
                    error!("Link: subscribe to {} failed", self.topics.config);
                }
            }
            Err(_) => error!("Link: connected event before transport attach"),
        }
        self.connected.store(true, Ordering::Release);
    }

    fn on_disconnected(&self) {
        if self.connected.load(Ordering::Acquire) {
            warn!("Link: disconnected, attempting reconnect");
            if let Ok(t) = self.transport() {
                if t.reconnect().is_err() {
                    error!("Link: reconnect attempt failed");
                }
            }
        }
    }

    fn on_transport_error(&self) {
        let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        error!("Link: transport error ({count} this session)");
        if count > SESSION_ERROR_CEILING {
            error!("Link: too many transport errors, escalating");
            self.fire_escalation();
        }
    }

    fn on_ack_payload(&self, payload: &[u8]) {
        let Ok(received) = core::str::from_utf8(payload) else {
            error!("Link: ack payload is not UTF-8");
            return;
        };
        if received.len() > TOKEN_CAPACITY {
            error!("Link: received ack token is too long");
            return;
        }

        let mut slot = self.pending_ack.lock().unwrap_or_else(|p| p.into_inner());
        match slot.take() {
            Some(pending) if pending.expected.as_str() == received => {
                info!("Link: matching acknowledgement token: {received}");
                // Waiter may already have timed out; nothing to do then.
                let _ = pending.signal.try_send(());
            }
            Some(pending) => {
                error!("Link: non-matching acknowledgement token");
                error!("Link: received: {received}");
                error!("Link: expected: {}", pending.expected);
                // Dropped: this wait cycle is spoiled.
            }
            None => debug!("Link: ack token {received} with no wait pending"),
        }
    }

    fn on_config_payload(&self, payload: &[u8]) {
        let doc: Value = match serde_json::from_slice(payload) {
            Ok(doc) => doc,
            Err(e) => {
                error!("Link: error parsing config payload: {e}");
                return;
            }
        };

        if doc.as_str() == Some(CONFIG_OK) {
            info!("Link: received config-ok");
            self.new_config.store(false, Ordering::Release);
            self.signal_config_waiter();
            return;
        }

        if let Err(e) = CaptureSchedule::validate(&doc) {
            // Invalid candidates never signal: the waiter's timeout is
            // the negotiation failure path.
            error!("Link: invalid config received: {e}");
            return;
        }

        // Persist first, then promote, then signal: a reboot between
        // the steps must never leave a promoted-but-unpersisted config.
        {
            let mut storage = self.storage.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = storage.write(keys::DYNAMIC_CONFIG, payload) {
                error!("Link: failed to persist new config: {e}");
                self.fire_escalation();
                return;
            }
        }
        {
            let mut schedule = self.schedule.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = schedule.load(&doc) {
                // validate() passed, so this is unreachable in
                // practice; refuse to promote regardless.
                error!("Link: validated config failed to load: {e}");
                return;
            }
        }
        info!("Link: new config loaded");
        self.new_config.store(true, Ordering::Release);
        self.signal_config_waiter();
    }

    fn signal_config_waiter(&self) {
        let mut slot = self
            .config_waiter
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match slot.take() {
            Some(signal) => {
                let _ = signal.try_send(());
            }
            None => debug!("Link: config answer with no wait pending"),
        }
    }

    fn fire_escalation(&self) {
        let hook = self.escalation.lock().unwrap_or_else(|p| p.into_inner());
        match hook.as_ref() {
            Some(hook) => hook(),
            None => error!("Link: no escalation hook installed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
