//! Mock port implementations shared by the integration tests.
//!
//! Each mock records what the workflow did to it, so tests assert on
//! observable behaviour instead of internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use starlingcam::app::ports::{
    ClockPort, IndicatorPort, QrPort, StorageError, StoragePort,
};
use starlingcam::config::TimeOfDay;
use starlingcam::drivers::indicator::Pattern;

// ── Clock ─────────────────────────────────────────────────────

/// Clock with a settable wall time and uptime, so tests control the
/// schedule resolution and the rendezvous budgets.
pub struct MockClock {
    pub uptime_ms: AtomicU64,
    time_of_day: Mutex<Option<TimeOfDay>>,
    pub timestamp: String,
}

impl MockClock {
    pub fn new(time_of_day: &str) -> Arc<Self> {
        Arc::new(Self {
            uptime_ms: AtomicU64::new(0),
            time_of_day: Mutex::new(Some(TimeOfDay::parse(time_of_day).unwrap())),
            timestamp: String::from("2025-03-28T11:08:28Z"),
        })
    }

    pub fn unsynced() -> Arc<Self> {
        Arc::new(Self {
            uptime_ms: AtomicU64::new(0),
            time_of_day: Mutex::new(None),
            timestamp: String::from("1970-01-01T00:00:00Z"),
        })
    }

    pub fn set_uptime_ms(&self, ms: u64) {
        self.uptime_ms.store(ms, Ordering::Relaxed);
    }
}

impl ClockPort for MockClock {
    fn uptime_us(&self) -> u64 {
        self.uptime_ms.load(Ordering::Relaxed) * 1000
    }

    fn time_of_day(&self) -> Option<TimeOfDay> {
        *self.time_of_day.lock().unwrap()
    }

    fn utc_timestamp(&self) -> String {
        self.timestamp.clone()
    }
}

// ── Indicator ─────────────────────────────────────────────────

pub struct MockIndicator {
    pub patterns: Mutex<Vec<Pattern>>,
}

impl MockIndicator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            patterns: Mutex::new(Vec::new()),
        })
    }

    pub fn saw(&self, pattern: Pattern) -> bool {
        self.patterns.lock().unwrap().contains(&pattern)
    }
}

impl IndicatorPort for MockIndicator {
    fn set_pattern(&self, pattern: Pattern) {
        self.patterns.lock().unwrap().push(pattern);
    }
}

// ── Storage ───────────────────────────────────────────────────

pub struct MemStorage {
    map: HashMap<String, Vec<u8>>,
    failures: u32,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            failures: 0,
        }
    }

    /// Fresh shared storage handle as the workflows consume it.
    pub fn shared() -> Arc<Mutex<Box<dyn StoragePort>>> {
        Arc::new(Mutex::new(Box::new(Self::new())))
    }
}

impl StoragePort for MemStorage {
    fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.map.get(key).cloned().ok_or(StorageError::NotFound)
    }

    fn write(&mut self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.map.insert(key.to_string(), data.to_vec());
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

// ── QR decoder ────────────────────────────────────────────────

/// Yields `None` for a configured number of frames, then a payload.
pub struct ScriptedQr {
    misses_left: u32,
    payload: Option<String>,
    pub decode_calls: u32,
}

impl ScriptedQr {
    pub fn new(misses: u32, payload: &str) -> Self {
        Self {
            misses_left: misses,
            payload: Some(payload.to_string()),
            decode_calls: 0,
        }
    }

    /// Never decodes anything.
    pub fn blind() -> Self {
        Self {
            misses_left: u32::MAX,
            payload: None,
            decode_calls: 0,
        }
    }
}

impl QrPort for ScriptedQr {
    fn decode(&mut self, _frame: &[u8], _width: u32, _height: u32) -> Option<String> {
        self.decode_calls += 1;
        if self.misses_left > 0 {
            self.misses_left -= 1;
            return None;
        }
        self.payload.clone()
    }
}
