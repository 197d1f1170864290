use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

use crate::prayer::{OccurrenceKey, PrayerName};

#[derive(Debug, Error)]
pub enum TimeTableError {
    #[error("invalid clock time `{0}`, expected HH:MM or --:--")]
    InvalidTime(String),
    #[error("unknown prayer `{0}`")]
    UnknownPrayer(String),
    #[error("{date}: {later} at {later_time} is not after {earlier} at {earlier_time}")]
    OutOfOrder {
        date: NaiveDate,
        earlier: PrayerName,
        earlier_time: String,
        later: PrayerName,
        later_time: String,
    },
    #[error("unable to read time table `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed time table `{path}`")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
}

/// Failures reported by the platform notification primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("notification permission not granted")]
    PermissionDenied,
    #[error("notification capability failed: {0}")]
    Transient(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to access store `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store `{path}`")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unable to encode `{key}`")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything the scheduling core can surface. None of these end the process;
/// callers skip the current cycle and retry on the next timer tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("notification permission denied, notifications disabled")]
    PermissionDenied,
    #[error("transient capability failure: {0}")]
    TransientCapability(String),
    #[error("next prayer did not advance past {key}")]
    StaleData { key: OccurrenceKey },
    #[error("{prayer} has no known time on {date}")]
    UnknownTime { prayer: PrayerName, date: NaiveDate },
}

impl From<CapabilityError> for ScheduleError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::PermissionDenied => ScheduleError::PermissionDenied,
            CapabilityError::Transient(reason) => ScheduleError::TransientCapability(reason),
        }
    }
}
