//! Unified error type for the firmware.
//!
//! Every subsystem failure funnels into [`Error`], keeping the
//! terminal decision (retry next wake vs. escalate) in one place —
//! only the workflow and the sleep/error policy decide severity, the
//! components just report.

use core::fmt;

use crate::app::ports::{ImagingError, NetworkError, SensorError, ServerError, StorageError};
use crate::config::ScheduleError;
use crate::link::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Network(NetworkError),
    Link(LinkError),
    Imaging(ImagingError),
    Sensor(SensorError),
    Storage(StorageError),
    Schedule(ScheduleError),
    Server(ServerError),
    /// Subsystem bring-up failure not covered by a typed variant.
    Init(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(e) => write!(f, "network: {e}"),
            Self::Link(e) => write!(f, "link: {e}"),
            Self::Imaging(e) => write!(f, "imaging: {e}"),
            Self::Sensor(e) => write!(f, "sensor: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Schedule(e) => write!(f, "schedule: {e}"),
            Self::Server(e) => write!(f, "server: {e}"),
            Self::Init(msg) => write!(f, "init: {msg}"),
        }
    }
}

impl From<NetworkError> for Error {
    fn from(e: NetworkError) -> Self {
        Self::Network(e)
    }
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

impl From<ImagingError> for Error {
    fn from(e: ImagingError) -> Self {
        Self::Imaging(e)
    }
}

impl From<SensorError> for Error {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ScheduleError> for Error {
    fn from(e: ScheduleError) -> Self {
        Self::Schedule(e)
    }
}

impl From<ServerError> for Error {
    fn from(e: ServerError) -> Self {
        Self::Server(e)
    }
}

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
