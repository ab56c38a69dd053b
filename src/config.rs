//! Operating schedule: time-of-day model, operating windows, and the
//! dynamic configuration document that drives the duty cycle.
//!
//! A configuration partitions the day into an ordered list of windows,
//! each carrying a capture period in seconds or `-1` ("sleep through
//! this window"). The list is scanned in order and the first window
//! containing "now" wins, so the configuration author is responsible
//! for keeping overlaps unambiguous.
//!
//! Documents arrive as JSON, either over the configuration topic or
//! from persistent storage:
//!
//! ```json
//! {
//!   "configurationId": "c0a8012e-...",
//!   "windows": [
//!     { "period": -1, "start": "00:00:00", "end": "07:00:00" },
//!     { "period": 30, "start": "07:00:00", "end": "12:00:00" }
//!   ]
//! }
//! ```
//!
//! Validation gates every adoption path; an invalid document never
//! replaces the configuration that is already live.

use core::fmt;

use log::{error, info, warn};
use serde_json::Value;

use crate::app::ports::{keys, StoragePort};

/// Capacity of the configuration id buffer. Ids of this length or
/// longer are rejected by [`CaptureSchedule::validate`].
pub const UUID_CAPACITY: usize = 40;

/// Period used when no window matches the current time of day.
pub const DEFAULT_PERIOD_SECS: i64 = 40;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleError {
    /// `configurationId` missing, empty, or not a string.
    MissingId,
    /// `configurationId` is too long for the id buffer.
    IdTooLong,
    /// `windows` missing, not an array, or empty.
    MissingWindows,
    /// A window `period` is missing, not an integer, or below -1.
    InvalidPeriod,
    /// A window `start`/`end` is missing or not a valid `HH:MM:SS`.
    InvalidTime,
    /// The document is not syntactically valid JSON.
    Malformed,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingId => write!(f, "configuration id missing or empty"),
            Self::IdTooLong => write!(f, "configuration id too long"),
            Self::MissingWindows => write!(f, "window array missing or empty"),
            Self::InvalidPeriod => write!(f, "window period missing or below -1"),
            Self::InvalidTime => write!(f, "window time not a valid HH:MM:SS"),
            Self::Malformed => write!(f, "configuration document is not valid JSON"),
        }
    }
}

// ---------------------------------------------------------------------------
// Time of day
// ---------------------------------------------------------------------------

/// A wall-clock time of day with second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
    second: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8, second: u8) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 || second > 59 {
            return Err(ScheduleError::InvalidTime);
        }
        Ok(Self {
            hour,
            minute,
            second,
        })
    }

    /// Strict `HH:MM:SS` parser: exactly eight characters, two-digit
    /// fields, `:` separators, hour 0-23, minute/second 0-59.
    pub fn parse(s: &str) -> Result<Self, ScheduleError> {
        let b = s.as_bytes();
        if b.len() != 8 || b[2] != b':' || b[5] != b':' {
            return Err(ScheduleError::InvalidTime);
        }
        let field = |hi: usize, lo: usize| -> Result<u8, ScheduleError> {
            if !b[hi].is_ascii_digit() || !b[lo].is_ascii_digit() {
                return Err(ScheduleError::InvalidTime);
            }
            Ok((b[hi] - b'0') * 10 + (b[lo] - b'0'))
        };
        Self::new(field(0, 1)?, field(3, 4)?, field(6, 7)?)
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn second(&self) -> u8 {
        self.second
    }

    /// Seconds since midnight.
    pub fn to_seconds(self) -> u32 {
        u32::from(self.hour) * 3600 + u32::from(self.minute) * 60 + u32::from(self.second)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }
}

// ---------------------------------------------------------------------------
// Operating windows
// ---------------------------------------------------------------------------

/// One entry of the daily schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingWindow {
    /// Capture period in seconds; `-1` means "sleep through this window".
    pub period: i64,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl OperatingWindow {
    /// Fallback window guaranteeing the device stays reachable when a
    /// schedule gap or misconfiguration leaves nothing active.
    pub fn fallback() -> Self {
        Self {
            period: DEFAULT_PERIOD_SECS,
            start: TimeOfDay {
                hour: 0,
                minute: 0,
                second: 0,
            },
            end: TimeOfDay {
                hour: 23,
                minute: 59,
                second: 59,
            },
        }
    }

    pub fn contains(&self, now: TimeOfDay) -> bool {
        self.start <= now && now <= self.end
    }

    /// Whether this window directs the device to sleep until its end.
    pub fn is_sleep(&self) -> bool {
        self.period == -1
    }
}

/// Result of resolving the active window for the current time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// An active (or fallback) window applies; run the duty cycle.
    Active,
    /// The matching window is a sleep window; the caller must sleep
    /// until the window's end instead of running the duty cycle.
    Sleeping,
}

// ---------------------------------------------------------------------------
// Capture schedule
// ---------------------------------------------------------------------------

/// The live configuration: identity plus the ordered window list and
/// the index of the window resolved at the last wake.
pub struct CaptureSchedule {
    uuid: heapless::String<UUID_CAPACITY>,
    windows: Vec<OperatingWindow>,
    active: Option<usize>,
}

impl CaptureSchedule {
    pub fn new() -> Self {
        Self {
            uuid: heapless::String::new(),
            windows: Vec::new(),
            active: None,
        }
    }

    /// Check a candidate document without touching any state.
    ///
    /// Required shape: a non-empty `configurationId` string shorter
    /// than the id buffer, and a non-empty `windows` array whose
    /// entries each carry an integer `period >= -1` and strictly
    /// formatted `start`/`end` times.
    pub fn validate(doc: &Value) -> Result<(), ScheduleError> {
        let id = doc
            .get("configurationId")
            .and_then(Value::as_str)
            .ok_or(ScheduleError::MissingId)?;
        if id.is_empty() {
            return Err(ScheduleError::MissingId);
        }
        if id.len() >= UUID_CAPACITY {
            return Err(ScheduleError::IdTooLong);
        }

        let windows = doc
            .get("windows")
            .and_then(Value::as_array)
            .ok_or(ScheduleError::MissingWindows)?;
        if windows.is_empty() {
            return Err(ScheduleError::MissingWindows);
        }

        for w in windows {
            let period = w
                .get("period")
                .and_then(Value::as_i64)
                .ok_or(ScheduleError::InvalidPeriod)?;
            if period < -1 {
                return Err(ScheduleError::InvalidPeriod);
            }
            for key in ["start", "end"] {
                let t = w
                    .get(key)
                    .and_then(Value::as_str)
                    .ok_or(ScheduleError::InvalidTime)?;
                TimeOfDay::parse(t)?;
            }
        }
        Ok(())
    }

    /// Validate and adopt a document, replacing the previous identity
    /// and window list atomically. The active-window mark is cleared;
    /// it is recomputed on the next [`set_active_window`] call.
    ///
    /// [`set_active_window`]: Self::set_active_window
    pub fn load(&mut self, doc: &Value) -> Result<(), ScheduleError> {
        Self::validate(doc)?;

        // Infallible after validate; checked access keeps the parse
        // honest if the two ever drift.
        let id = doc
            .get("configurationId")
            .and_then(Value::as_str)
            .ok_or(ScheduleError::MissingId)?;
        let array = doc
            .get("windows")
            .and_then(Value::as_array)
            .ok_or(ScheduleError::MissingWindows)?;

        let mut windows = Vec::with_capacity(array.len());
        for w in array {
            windows.push(OperatingWindow {
                period: w
                    .get("period")
                    .and_then(Value::as_i64)
                    .ok_or(ScheduleError::InvalidPeriod)?,
                start: TimeOfDay::parse(
                    w.get("start")
                        .and_then(Value::as_str)
                        .ok_or(ScheduleError::InvalidTime)?,
                )?,
                end: TimeOfDay::parse(
                    w.get("end")
                        .and_then(Value::as_str)
                        .ok_or(ScheduleError::InvalidTime)?,
                )?,
            });
        }

        self.uuid.clear();
        self.uuid
            .push_str(id)
            .map_err(|()| ScheduleError::IdTooLong)?;
        self.windows = windows;
        self.active = None;
        info!(
            "Schedule: adopted configuration '{}' ({} windows)",
            self.uuid,
            self.windows.len()
        );
        Ok(())
    }

    /// Load the persisted configuration, falling back to the single
    /// default window when nothing usable is stored. The device must
    /// never end up unreachable because of a bad flash image.
    pub fn load_from_storage(&mut self, storage: &dyn StoragePort) {
        let raw = match storage.read(keys::DYNAMIC_CONFIG) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Schedule: no persisted configuration ({e}), using fallback window");
                self.install_fallback();
                return;
            }
        };

        let doc: Value = match serde_json::from_slice(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                error!("Schedule: persisted configuration is not valid JSON: {e}");
                self.install_fallback();
                return;
            }
        };

        if let Err(e) = self.load(&doc) {
            error!("Schedule: persisted configuration rejected: {e}");
            self.install_fallback();
        }
    }

    fn install_fallback(&mut self) {
        self.uuid.clear();
        self.windows = vec![OperatingWindow::fallback()];
        self.active = None;
    }

    /// Resolve the active window for `now`: the first window
    /// containing it wins. A sleep window (`period == -1`) yields
    /// [`ScheduleOutcome::Sleeping`] and the caller must not run the
    /// duty cycle this wake.
    pub fn set_active_window(&mut self, now: TimeOfDay) -> ScheduleOutcome {
        self.active = None;
        for (i, w) in self.windows.iter().enumerate() {
            if w.contains(now) {
                self.active = Some(i);
                info!(
                    "Schedule: active window {} - {}, period {}",
                    w.start, w.end, w.period
                );
                if w.is_sleep() {
                    warn!("Schedule: sleep window, device wakes at {}", w.end);
                    return ScheduleOutcome::Sleeping;
                }
                return ScheduleOutcome::Active;
            }
        }
        error!("Schedule: no window matches {now}, fallback window applies");
        ScheduleOutcome::Active
    }

    /// The window resolved by the last [`set_active_window`] call, or
    /// the fallback window when none matched.
    ///
    /// [`set_active_window`]: Self::set_active_window
    pub fn active_window(&self) -> OperatingWindow {
        match self.active.and_then(|i| self.windows.get(i)) {
            Some(w) => *w,
            None => OperatingWindow::fallback(),
        }
    }

    /// Capture period of the active window (fallback: 40 s).
    pub fn period(&self) -> i64 {
        self.active_window().period
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

impl Default for CaptureSchedule {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
