//! Datetime recognition for temporal-unit inference.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp resolution, ordered coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Millisecond,
    Microsecond,
    Nanosecond,
}

impl TimeUnit {
    pub fn suffix(&self) -> &'static str {
        match self {
            TimeUnit::Second => "s",
            TimeUnit::Millisecond => "ms",
            TimeUnit::Microsecond => "us",
            TimeUnit::Nanosecond => "ns",
        }
    }

    /// Ticks of this unit per second
    fn per_second(&self) -> i64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Millisecond => 1_000,
            TimeUnit::Microsecond => 1_000_000,
            TimeUnit::Nanosecond => 1_000_000_000,
        }
    }
}

impl From<TimeUnit> for arrow_schema::TimeUnit {
    fn from(unit: TimeUnit) -> Self {
        match unit {
            TimeUnit::Second => arrow_schema::TimeUnit::Second,
            TimeUnit::Millisecond => arrow_schema::TimeUnit::Millisecond,
            TimeUnit::Microsecond => arrow_schema::TimeUnit::Microsecond,
            TimeUnit::Nanosecond => arrow_schema::TimeUnit::Nanosecond,
        }
    }
}

/// Epoch magnitude windows. An integer outside all of them is not a timestamp.
pub fn epoch_unit(value: i64) -> Option<TimeUnit> {
    match value {
        1_000_000_000..=9_999_999_999 => Some(TimeUnit::Second),
        1_000_000_000_000..=9_999_999_999_999 => Some(TimeUnit::Millisecond),
        1_000_000_000_000_000..=9_999_999_999_999_999 => Some(TimeUnit::Microsecond),
        1_000_000_000_000_000_000..=i64::MAX => Some(TimeUnit::Nanosecond),
        _ => None,
    }
}

/// Parse an RFC 3339 / ISO-8601 style datetime and report the unit its
/// sub-second precision calls for. Values with zone offsets are normalised to UTC.
pub fn parse_datetime(s: &str) -> Option<(DateTime<Utc>, TimeUnit)> {
    // cheap rejection before trying every format
    if s.len() < 10 || !s.as_bytes()[0].is_ascii_digit() || s.as_bytes()[4] != b'-' {
        return None;
    }

    let parsed = DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        })?;

    Some((parsed, precision_of(parsed.timestamp_subsec_nanos())))
}

fn precision_of(subsec_nanos: u32) -> TimeUnit {
    if subsec_nanos == 0 {
        TimeUnit::Second
    } else if subsec_nanos % 1_000_000 == 0 {
        TimeUnit::Millisecond
    } else if subsec_nanos % 1_000 == 0 {
        TimeUnit::Microsecond
    } else {
        TimeUnit::Nanosecond
    }
}

/// Ticks since the epoch in `unit`, `None` if it doesn't fit an i64.
pub fn ticks(dt: &DateTime<Utc>, unit: TimeUnit) -> Option<i64> {
    match unit {
        TimeUnit::Second => Some(dt.timestamp()),
        TimeUnit::Millisecond => Some(dt.timestamp_millis()),
        TimeUnit::Microsecond => Some(dt.timestamp_micros()),
        TimeUnit::Nanosecond => dt.timestamp_nanos_opt(),
    }
}

/// Rescale an epoch value between units, `None` on overflow.
pub fn rescale(value: i64, from: TimeUnit, to: TimeUnit) -> Option<i64> {
    let (from, to) = (from.per_second(), to.per_second());
    if to >= from {
        value.checked_mul(to / from)
    } else {
        Some(value.div_euclid(from / to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_follows_fraction_digits() {
        let unit = |s: &str| parse_datetime(s).map(|(_, u)| u);
        assert_eq!(unit("2023-05-01T12:34:56Z"), Some(TimeUnit::Second));
        assert_eq!(unit("2023-05-01T12:34:56.120Z"), Some(TimeUnit::Millisecond));
        assert_eq!(unit("2023-05-01T12:34:56.123456+02:00"), Some(TimeUnit::Microsecond));
        assert_eq!(unit("2023-05-01T12:34:56.123456789-07:00"), Some(TimeUnit::Nanosecond));
        assert_eq!(unit("2023-05-01 12:34:56"), Some(TimeUnit::Second));
        assert_eq!(unit("2023-05-01"), Some(TimeUnit::Second));
        assert_eq!(unit("hello world, friends"), None);
        assert_eq!(unit("2023"), None);
    }

    #[test]
    fn test_offsets_normalise_to_utc() {
        let (dt, _) = parse_datetime("1970-01-01T02:00:00+02:00").unwrap();
        assert_eq!(dt.timestamp(), 0);
    }

    #[test]
    fn test_epoch_windows() {
        assert_eq!(epoch_unit(42), None);
        assert_eq!(epoch_unit(1_700_000_000), Some(TimeUnit::Second));
        assert_eq!(epoch_unit(1_700_000_000_000), Some(TimeUnit::Millisecond));
        assert_eq!(epoch_unit(1_700_000_000_000_000), Some(TimeUnit::Microsecond));
        assert_eq!(epoch_unit(1_700_000_000_000_000_000), Some(TimeUnit::Nanosecond));
        assert_eq!(epoch_unit(-1_700_000_000), None);
    }

    #[test]
    fn test_rescale() {
        assert_eq!(rescale(2, TimeUnit::Second, TimeUnit::Millisecond), Some(2_000));
        assert_eq!(rescale(2_500, TimeUnit::Millisecond, TimeUnit::Second), Some(2));
        assert_eq!(rescale(i64::MAX, TimeUnit::Second, TimeUnit::Nanosecond), None);
    }
}
