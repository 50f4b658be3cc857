//! Object path layout for the archive.
//!
//! ```text
//! raw/{subject}/{kind}/dt={YYYY-MM-DD}/location={key}/{HH-MM-SS}[-{suffix}].json
//! ```
//!
//! Every partition column can be read back from the path alone, so listings
//! are enough to prune before any object body is fetched.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use fitted_core::StoreError;
use object_store::path::Path;

pub const ROOT: &str = "raw";
pub const DATE_COLUMN: &str = "dt";
pub const DIMENSION_COLUMN: &str = "location";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H-%M-%S";

/// Current-conditions objects and N-day forecast objects live side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionKind {
    Current,
    Forecast(u8),
}

impl PartitionKind {
    pub fn for_horizon(forecast_days: Option<u8>) -> Self {
        match forecast_days {
            Some(days) => PartitionKind::Forecast(days),
            None => PartitionKind::Current,
        }
    }

    pub fn forecast_days(self) -> Option<u8> {
        match self {
            PartitionKind::Current => None,
            PartitionKind::Forecast(days) => Some(days),
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKind::Current => f.write_str("current"),
            PartitionKind::Forecast(days) => write!(f, "forecast-{days}d"),
        }
    }
}

impl FromStr for PartitionKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "current" {
            return Ok(PartitionKind::Current);
        }
        s.strip_prefix("forecast-")
            .and_then(|rest| rest.strip_suffix('d'))
            .and_then(|days| days.parse::<u8>().ok())
            .filter(|days| *days > 0)
            .map(PartitionKind::Forecast)
            .ok_or_else(|| StoreError::InvalidPath(format!("unknown partition type {s:?}")))
    }
}

/// Location of one archived object, parsed or about to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPath {
    pub subject: String,
    pub kind: PartitionKind,
    pub dt: NaiveDate,
    pub location: String,
    pub time: NaiveTime,
    /// Disambiguates writers that land on the same second
    pub suffix: Option<String>,
}

impl PartitionPath {
    pub fn new(subject: &str, kind: PartitionKind, location: &str, at: DateTime<Utc>) -> Self {
        let time = NaiveTime::from_hms_opt(at.hour(), at.minute(), at.second()).unwrap_or(at.time());
        Self {
            subject: subject.to_string(),
            kind,
            dt: at.date_naive(),
            location: location.to_string(),
            time,
            suffix: None,
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// Write timestamp, to the second.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.dt.and_time(self.time).and_utc()
    }

    pub fn file_name(&self) -> String {
        let time = self.time.format(TIME_FORMAT);
        match &self.suffix {
            Some(suffix) => format!("{time}-{suffix}.json"),
            None => format!("{time}.json"),
        }
    }

    pub fn to_path(&self) -> Path {
        location_prefix(&self.subject, self.kind, self.dt, &self.location).child(self.file_name())
    }

    /// Parse an object path produced by [`PartitionPath::to_path`].
    pub fn parse(path: &Path) -> Result<Self, StoreError> {
        let invalid = |why: &str| StoreError::InvalidPath(format!("{path}: {why}"));
        let parts: Vec<String> = path.parts().map(|p| p.as_ref().to_string()).collect();
        let [root, subject, kind, dt, location, file] = parts.as_slice() else {
            return Err(invalid("expected 6 segments"));
        };
        if root != ROOT {
            return Err(invalid("not under raw/"));
        }

        let kind: PartitionKind = kind.parse()?;
        let dt = parse_date_segment(dt).ok_or_else(|| invalid("bad dt= segment"))?;
        let location = location
            .strip_prefix("location=")
            .filter(|l| !l.is_empty())
            .ok_or_else(|| invalid("bad location= segment"))?;

        let stem = file
            .strip_suffix(".json")
            .ok_or_else(|| invalid("not a .json object"))?;
        let (time, rest) = match (stem.get(..8), stem.get(8..)) {
            (Some(time), Some(rest)) => (time, rest),
            _ => return Err(invalid("bad file name")),
        };
        let suffix = match rest.strip_prefix('-') {
            None if rest.is_empty() => None,
            Some(suffix) if !suffix.is_empty() => Some(suffix.to_string()),
            _ => return Err(invalid("bad file name")),
        };
        let time = NaiveTime::parse_from_str(time, TIME_FORMAT)
            .map_err(|_| invalid("bad time in file name"))?;

        Ok(Self {
            subject: subject.clone(),
            kind,
            dt,
            location: location.to_string(),
            time,
            suffix,
        })
    }
}

/// Parse a `dt=YYYY-MM-DD` path segment.
pub fn parse_date_segment(segment: &str) -> Option<NaiveDate> {
    segment
        .strip_prefix("dt=")
        .and_then(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok())
}

pub fn subject_prefix(subject: &str) -> Path {
    Path::from(ROOT).child(subject)
}

pub fn kind_prefix(subject: &str, kind: PartitionKind) -> Path {
    subject_prefix(subject).child(kind.to_string())
}

pub fn date_prefix(subject: &str, kind: PartitionKind, dt: NaiveDate) -> Path {
    kind_prefix(subject, kind).child(format!("dt={}", dt.format(DATE_FORMAT)))
}

pub fn location_prefix(subject: &str, kind: PartitionKind, dt: NaiveDate, location: &str) -> Path {
    date_prefix(subject, kind, dt).child(format!("location={location}"))
}
