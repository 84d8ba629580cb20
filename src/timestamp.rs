//! Cluster timestamp: the document store's monotonic `(seconds, ordinal)`
//! pair stamped on every committed operation, also used as the change-stream
//! resume token's timestamp component.

use std::fmt;

use bson::Timestamp;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Newtype over `bson::Timestamp` so that increment/wall-clock conversion
/// read as named operations instead of scattered field arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterTime {
    seconds: u32,
    ordinal: u32,
}

impl ClusterTime {
    pub fn new(seconds: u32, ordinal: u32) -> Self {
        ClusterTime { seconds, ordinal }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// `T⁺ = (seconds, ordinal + 1)` — used when resuming from a persisted
    /// checkpoint so the stream does not re-emit the last-applied event.
    pub fn increment(&self) -> ClusterTime {
        ClusterTime {
            seconds: self.seconds,
            ordinal: self.ordinal + 1,
        }
    }

    /// `seconds` interpreted as a Unix epoch, for logging only. Never panics:
    /// an out-of-range value falls back to a raw numeric rendering rather
    /// than crashing a log line.
    pub fn to_wall_clock(&self) -> String {
        match Utc.timestamp_opt(self.seconds as i64, 0).single() {
            Some(dt) => dt.to_rfc3339(),
            None => format!("<unrepresentable epoch {}>", self.seconds),
        }
    }
}

impl From<Timestamp> for ClusterTime {
    fn from(ts: Timestamp) -> Self {
        ClusterTime {
            seconds: ts.time,
            ordinal: ts.increment,
        }
    }
}

impl From<ClusterTime> for Timestamp {
    fn from(ct: ClusterTime) -> Self {
        Timestamp {
            time: ct.seconds,
            increment: ct.ordinal,
        }
    }
}

impl fmt::Display for ClusterTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.seconds, self.ordinal)
    }
}
