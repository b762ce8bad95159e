//! Wall-clock version tags with string round-trip.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error raised when a timestamp string cannot be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid timestamp '{0}'")]
pub struct TimestampError(pub String);

/// A wall-clock instant used as a snapshot version. Precision is
/// milliseconds so that the RFC 3339 rendering round-trips exactly;
/// equality and ordering are total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Current wall-clock time, truncated to millisecond precision.
    pub fn now() -> Self {
        Self::from_millis(Utc::now().timestamp_millis())
    }

    /// The Unix epoch.
    pub fn zero() -> Self {
        Self::from_millis(0)
    }

    /// Build from milliseconds since the Unix epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis_opt(millis).single().unwrap_or_default())
    }

    /// Milliseconds since the Unix epoch.
    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The next representable instant. Used to keep successive versions
    /// strictly increasing when the clock has not advanced.
    pub fn succ(&self) -> Self {
        Self::from_millis(self.millis() + 1)
    }

    /// The underlying UTC datetime.
    pub fn datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed =
            DateTime::parse_from_rfc3339(s).map_err(|_| TimestampError(s.to_string()))?;
        Ok(Self::from_millis(parsed.timestamp_millis()))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip_is_exact() {
        let t = Timestamp::now();
        let back: Timestamp = t.to_string().parse().unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn ordering_is_total() {
        let a = Timestamp::from_millis(1_000);
        let b = Timestamp::from_millis(2_000);
        assert!(a < b);
        assert_eq!(a.max(b), b);
    }

    #[test]
    fn succ_is_strictly_greater() {
        let t = Timestamp::from_millis(41);
        assert!(t.succ() > t);
        assert_eq!(t.succ().millis(), 42);
    }

    #[test]
    fn zero_is_the_epoch() {
        assert_eq!(Timestamp::zero().millis(), 0);
        assert_eq!(Timestamp::zero().to_string(), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not-a-time".parse::<Timestamp>().is_err());
    }
}
