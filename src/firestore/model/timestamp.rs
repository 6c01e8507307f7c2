use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: i32 = 1_000_000_000;

/// Point in time with nanosecond precision, normalised so that
/// `0 <= nanos < 1e9`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let carry = nanos.div_euclid(NANOS_PER_SECOND);
        Self {
            seconds: seconds + carry as i64,
            nanos: nanos.rem_euclid(NANOS_PER_SECOND),
        }
    }

    pub fn now() -> Self {
        let now = Utc::now();
        Self::new(now.timestamp(), now.timestamp_subsec_nanos() as i32)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(
            millis.div_euclid(1_000),
            (millis.rem_euclid(1_000) * 1_000_000) as i32,
        )
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + (self.nanos / 1_000_000) as i64
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + (self.nanos / 1_000) as i64
    }

    /// The next representable instant.
    pub fn successor(&self) -> Self {
        Self::new(self.seconds, self.nanos + 1)
    }

    pub fn to_rfc3339(&self) -> String {
        Utc.timestamp_opt(self.seconds, self.nanos as u32)
            .single()
            .map(|datetime| datetime.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .unwrap_or_else(|| "1970-01-01T00:00:00.000000000Z".to_string())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.seconds, self.nanos).cmp(&(other.seconds, other.nanos))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp(seconds={}, nanos={})", self.seconds, self.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!(timestamp, Timestamp { seconds: 2, nanos: 500_000_000 });
        let negative = Timestamp::new(0, -1);
        assert_eq!(negative, Timestamp { seconds: -1, nanos: 999_999_999 });
    }

    #[test]
    fn converts_millis_and_successor() {
        let timestamp = Timestamp::from_millis(1_500);
        assert_eq!(timestamp.to_millis(), 1_500);
        let edge = Timestamp::new(3, 999_999_999).successor();
        assert_eq!(edge, Timestamp::new(4, 0));
        assert!(Timestamp::new(1, 0) < Timestamp::new(1, 1));
    }

    #[test]
    fn renders_rfc3339() {
        assert_eq!(
            Timestamp::new(0, 5).to_rfc3339(),
            "1970-01-01T00:00:00.000000005Z"
        );
    }
}
