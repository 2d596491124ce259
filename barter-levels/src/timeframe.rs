//! Timeframes and period boundary alignment.
//!
//! Periods are right-closed: a period labelled `end` covers `(end - length, end]`. Fixed-length
//! timeframes align to the Unix epoch, weeks align to Monday 00:00 UTC and months, quarters and
//! years align to calendar boundaries.

use crate::error::LevelError;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_WEEK: i64 = 7 * SECS_PER_DAY;

/// The Unix epoch fell on a Thursday, Monday 00:00 UTC is 3 days earlier.
const WEEK_ALIGN_OFFSET_SECS: i64 = 3 * SECS_PER_DAY;

/// Timeframe a level ladder is maintained for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1M")]
    Month1,
    #[serde(rename = "3M")]
    Quarter1,
    #[serde(rename = "1y")]
    Year1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 9] = [
        Timeframe::Min5,
        Timeframe::Min15,
        Timeframe::Hour1,
        Timeframe::Hour4,
        Timeframe::Day1,
        Timeframe::Week1,
        Timeframe::Month1,
        Timeframe::Quarter1,
        Timeframe::Year1,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::Min5 => "5m",
            Timeframe::Min15 => "15m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
            Timeframe::Week1 => "1w",
            Timeframe::Month1 => "1M",
            Timeframe::Quarter1 => "3M",
            Timeframe::Year1 => "1y",
        }
    }

    /// Length in seconds for timeframes with a fixed length, `None` for calendar timeframes.
    pub fn fixed_secs(&self) -> Option<i64> {
        match self {
            Timeframe::Min5 => Some(5 * SECS_PER_MINUTE),
            Timeframe::Min15 => Some(15 * SECS_PER_MINUTE),
            Timeframe::Hour1 => Some(60 * SECS_PER_MINUTE),
            Timeframe::Hour4 => Some(240 * SECS_PER_MINUTE),
            Timeframe::Day1 => Some(SECS_PER_DAY),
            Timeframe::Week1 => Some(SECS_PER_WEEK),
            Timeframe::Month1 | Timeframe::Quarter1 | Timeframe::Year1 => None,
        }
    }

    fn calendar_months(&self) -> u32 {
        match self {
            Timeframe::Quarter1 => 3,
            Timeframe::Year1 => 12,
            _ => 1,
        }
    }

    /// End of the period containing `time`. A `time` exactly on a boundary belongs to the
    /// period ending at that boundary.
    pub fn period_end(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timeframe::Week1 => ceil_to_secs(time, SECS_PER_WEEK, WEEK_ALIGN_OFFSET_SECS),
            _ => match self.fixed_secs() {
                Some(length) => ceil_to_secs(time, length, 0),
                None => ceil_to_months(time, self.calendar_months()),
            },
        }
    }
}

/// End of the minute containing `time`, the stamp used for minute bars.
pub fn minute_end(time: DateTime<Utc>) -> DateTime<Utc> {
    ceil_to_secs(time, SECS_PER_MINUTE, 0)
}

fn ceil_to_secs(time: DateTime<Utc>, length: i64, offset: i64) -> DateTime<Utc> {
    let secs = time.timestamp() + offset;
    let on_boundary = secs.rem_euclid(length) == 0 && time.timestamp_subsec_nanos() == 0;
    let end = if on_boundary {
        secs
    } else {
        (secs.div_euclid(length) + 1) * length
    };

    DateTime::from_timestamp(end - offset, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn ceil_to_months(time: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let month0 = time.month0() - time.month0() % months;
    let start = month_start(time.year(), month0);

    if start == Some(time) {
        return time;
    }

    let next = month0 + months;
    month_start(time.year() + (next / 12) as i32, next % 12).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn month_start(year: i32, month0: u32) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month0 + 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for Timeframe {
    type Err = LevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|timeframe| timeframe.label() == s.trim())
            .ok_or_else(|| LevelError::UnsupportedTimeframe(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_period_end() {
        struct TestCase {
            timeframe: Timeframe,
            input: &'static str,
            expected: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: mid-period rounds up to the next 5m boundary
                timeframe: Timeframe::Min5,
                input: "2024-03-04T10:02:30Z",
                expected: "2024-03-04T10:05:00Z",
            },
            TestCase {
                // TC1: exactly on a boundary stays in the period ending there
                timeframe: Timeframe::Min5,
                input: "2024-03-04T10:05:00Z",
                expected: "2024-03-04T10:05:00Z",
            },
            TestCase {
                // TC2: hourly
                timeframe: Timeframe::Hour1,
                input: "2024-03-04T10:00:01Z",
                expected: "2024-03-04T11:00:00Z",
            },
            TestCase {
                // TC3: 4h aligned to epoch
                timeframe: Timeframe::Hour4,
                input: "2024-03-04T13:15:00Z",
                expected: "2024-03-04T16:00:00Z",
            },
            TestCase {
                // TC4: daily closes at the following midnight
                timeframe: Timeframe::Day1,
                input: "2024-03-04T20:00:00Z",
                expected: "2024-03-05T00:00:00Z",
            },
            TestCase {
                // TC5: weekly ends on Monday 00:00 (2024-03-06 is a Wednesday)
                timeframe: Timeframe::Week1,
                input: "2024-03-06T12:00:00Z",
                expected: "2024-03-11T00:00:00Z",
            },
            TestCase {
                // TC6: monthly
                timeframe: Timeframe::Month1,
                input: "2024-03-15T12:00:00Z",
                expected: "2024-04-01T00:00:00Z",
            },
            TestCase {
                // TC7: quarterly rolls into the next year
                timeframe: Timeframe::Quarter1,
                input: "2024-11-15T12:00:00Z",
                expected: "2025-01-01T00:00:00Z",
            },
            TestCase {
                // TC8: yearly on boundary
                timeframe: Timeframe::Year1,
                input: "2025-01-01T00:00:00Z",
                expected: "2025-01-01T00:00:00Z",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.timeframe.period_end(time(test.input));
            assert_eq!(actual, time(test.expected), "TC{} failed", index);
        }
    }

    #[test]
    fn test_minute_end() {
        assert_eq!(
            minute_end(time("2024-03-04T10:04:30Z")),
            time("2024-03-04T10:05:00Z")
        );
        assert_eq!(
            minute_end(time("2024-03-04T10:05:00Z")),
            time("2024-03-04T10:05:00Z")
        );
    }

    #[test]
    fn test_timeframe_parse() {
        for timeframe in Timeframe::ALL {
            assert_eq!(timeframe.label().parse::<Timeframe>().unwrap(), timeframe);
        }
        assert_eq!(
            "2h".parse::<Timeframe>(),
            Err(LevelError::UnsupportedTimeframe("2h".to_string()))
        );
    }

    #[test]
    fn test_timeframe_serde_uses_label() {
        let json = serde_json::to_string(&Timeframe::Day1).unwrap();
        assert_eq!(json, "\"1d\"");
        let parsed: Timeframe = serde_json::from_str("\"15m\"").unwrap();
        assert_eq!(parsed, Timeframe::Min15);
    }
}
