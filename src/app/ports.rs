//! Port traits — the boundary between the duty-cycle core and the
//! hardware-facing adapters.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ CaptureApp / ProvisioningApp
//! ```
//!
//! Each port has an ESP-IDF adapter and a simulation backend so the
//! full workflow is exercisable on the host. Ports are deliberately
//! narrow: the core consumes the camera, network, sensors, storage and
//! indicator through exactly the calls listed here and nothing else.

use core::fmt;

use crate::config::TimeOfDay;
use crate::drivers::indicator::Pattern;

// ───────────────────────────────────────────────────────────────
// Persistent storage keys
// ───────────────────────────────────────────────────────────────

/// Key vocabulary of the single NVS namespace. Written during
/// provisioning, read at every boot.
pub mod keys {
    /// Boot mode: `"cam"` runs the capture duty cycle, anything else
    /// falls back to QR provisioning.
    pub const MODE: &str = "mode";

    pub const SSID: &str = "ssid";
    pub const PASSWORD: &str = "password";
    pub const SERVER_URL: &str = "server_url";

    pub const MQTT_ADDRESS: &str = "mqttAddress";
    pub const MQTT_USER: &str = "mqttUser";
    pub const MQTT_PASSWORD: &str = "mqttPassword";

    pub const CONFIG_TOPIC: &str = "configTopic";
    pub const HEALTH_TOPIC: &str = "healthRepTopic";
    pub const IMAGE_ACK_TOPIC: &str = "imageAckTopic";
    pub const IMAGE_TOPIC: &str = "imageTopic";
    pub const LOG_TOPIC: &str = "logTopic";

    /// The last adopted schedule document, stored verbatim as JSON.
    pub const DYNAMIC_CONFIG: &str = "dynamic_config";

    /// Consecutive-failure counter surviving reboots.
    pub const ERROR_COUNT: &str = "errorCount";
}

// ───────────────────────────────────────────────────────────────
// Storage port
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Generic I/O error from the storage backend.
    IoError,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}

/// Persistent key-value storage (NVS on the device).
///
/// Writes MUST be atomic — no partial values on power loss. ESP-IDF
/// NVS guarantees this natively; the in-memory backend trivially.
pub trait StoragePort: Send {
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. `Ok(())` even if the key did not exist.
    fn delete(&mut self, key: &str) -> Result<(), StorageError>;

    fn exists(&self, key: &str) -> bool;

    /// Dedicated accessor for the persisted failure counter.
    /// A missing counter reads as zero.
    fn read_failure_count(&self) -> u32;

    fn write_failure_count(&mut self, count: u32) -> Result<(), StorageError>;

    /// Erase every key — configuration and credentials. Factory reset
    /// only; irreversible from software.
    fn erase_all(&mut self) -> Result<(), StorageError>;

    /// Read a key as UTF-8 text.
    fn read_str(&self, key: &str) -> Result<String, StorageError> {
        let bytes = self.read(key)?;
        String::from_utf8(bytes).map_err(|_| StorageError::IoError)
    }
}

// ───────────────────────────────────────────────────────────────
// Network port
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    /// Station association did not complete within the bound.
    ConnectFailed,
    /// SNTP synchronisation did not complete within the bound.
    TimeSyncFailed,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed => write!(f, "WiFi connect failed"),
            Self::TimeSyncFailed => write!(f, "time sync failed"),
        }
    }
}

/// Network association. `connect` blocks until associated or failed;
/// `sync_time` blocks until the wall clock is trustworthy.
pub trait NetworkPort: Send {
    fn connect(&mut self) -> Result<(), NetworkError>;

    fn sync_time(&mut self) -> Result<(), NetworkError>;
}

// ───────────────────────────────────────────────────────────────
// Imaging port
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagingError {
    InitFailed,
    CaptureFailed,
    /// `frame()` called without a captured frame.
    NoFrame,
}

impl fmt::Display for ImagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitFailed => write!(f, "camera init failed"),
            Self::CaptureFailed => write!(f, "capture failed"),
            Self::NoFrame => write!(f, "no frame available"),
        }
    }
}

/// Borrowed view of the most recently captured frame.
pub struct Frame<'a> {
    pub bytes: &'a [u8],
    /// Pixel format label as transmitted in the image header.
    pub mode: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Camera subsystem. The driver may queue one frame behind the most
/// recent acquisition request, so callers flush one stale capture
/// before the capture they intend to transmit.
pub trait ImagingPort: Send {
    fn start(&mut self) -> Result<(), ImagingError>;

    fn capture(&mut self) -> Result<(), ImagingError>;

    fn frame(&self) -> Result<Frame<'_>, ImagingError>;

    /// Return the frame buffer to the driver, enabling the next capture.
    fn release_frame(&mut self);
}

// ───────────────────────────────────────────────────────────────
// Sensor port
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    InitFailed,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitFailed => write!(f, "sensor init failed"),
        }
    }
}

/// Health-telemetry sensor aggregation. `read_all` inserts one entry
/// per sensor into the health document; a failed sensor contributes
/// its zero/sentinel value rather than omitting the key, so the
/// document shape is stable for downstream consumers.
pub trait SensorPort: Send {
    fn init(&mut self) -> Result<(), SensorError>;

    fn read_all(&mut self, doc: &mut serde_json::Map<String, serde_json::Value>);
}

// ───────────────────────────────────────────────────────────────
// Indicator port
// ───────────────────────────────────────────────────────────────

/// Fire-and-forget status LED. No acknowledgement, no error path.
pub trait IndicatorPort: Send + Sync {
    fn set_pattern(&self, pattern: Pattern);
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic uptime plus wall-clock queries.
pub trait ClockPort: Send + Sync {
    /// Microseconds since boot (monotonic).
    fn uptime_us(&self) -> u64;

    fn uptime_ms(&self) -> u64 {
        self.uptime_us() / 1000
    }

    /// Wall-clock time of day, `None` before the clock is synced.
    fn time_of_day(&self) -> Option<TimeOfDay>;

    /// UTC timestamp `YYYY-MM-DDTHH:MM:SSZ` — the ack token format.
    fn utc_timestamp(&self) -> String;
}

// ───────────────────────────────────────────────────────────────
// Provisioning ports
// ───────────────────────────────────────────────────────────────

/// QR symbol decoder. Returns the decoded payload text, if the frame
/// contained a readable code.
pub trait QrPort: Send {
    fn decode(&mut self, frame: &[u8], width: u32, height: u32) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerError {
    RequestFailed,
    /// HTTP 400: this device is not registered with the server.
    NotRegistered,
    MalformedResponse,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestFailed => write!(f, "config request failed"),
            Self::NotRegistered => write!(f, "device not registered with server"),
            Self::MalformedResponse => write!(f, "malformed server response"),
        }
    }
}

/// Provisioning server: one HTTPS GET returning the device's static
/// configuration document.
pub trait ProvisioningServerPort: Send {
    fn fetch_config(&mut self, url: &str) -> Result<serde_json::Value, ServerError>;
}
