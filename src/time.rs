//! Calendar-day arithmetic in the caller's timezone, plus an injectable clock.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

use crate::error::ConfigError;

static OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:UTC|GMT)?([+-])(\d{2})(?::?(\d{2}))?$").expect("valid offset regex")
});

/// The caller's timezone: an IANA zone such as `America/New_York`, or a
/// fixed UTC offset. Decides which calendar day a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timezone {
    Named(Tz),
    Fixed(FixedOffset),
}

/// Longest DST gap searched for the first valid instant of a local day.
const MAX_GAP_STEPS: i64 = 16;

impl Timezone {
    pub fn utc() -> Self {
        Timezone::Named(Tz::UTC)
    }

    pub fn from_offset(offset: FixedOffset) -> Self {
        Timezone::Fixed(offset)
    }

    /// Parse a timezone, falling back to UTC when the string is unrecognized.
    pub fn parse_or_utc(raw: Option<&str>) -> Self {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Self::utc(),
            Some(s) => s.parse().unwrap_or_else(|e| {
                tracing::warn!(timezone = s, error = %e, "Unrecognized timezone, using UTC");
                Self::utc()
            }),
        }
    }

    /// The offset from UTC in effect at `instant`.
    pub fn offset_at(&self, instant: DateTime<Utc>) -> FixedOffset {
        match self {
            Timezone::Named(tz) => tz.offset_from_utc_datetime(&instant.naive_utc()).fix(),
            Timezone::Fixed(offset) => *offset,
        }
    }

    /// The local calendar day an instant falls on.
    pub fn local_day(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            Timezone::Named(tz) => instant.with_timezone(tz).date_naive(),
            Timezone::Fixed(offset) => instant.with_timezone(offset).date_naive(),
        }
    }

    /// The UTC instant at which local `day` begins. When midnight falls in a
    /// DST gap the day starts at the first local time that exists.
    pub fn day_start_utc(&self, day: NaiveDate) -> DateTime<Utc> {
        let midnight = day.and_time(NaiveTime::MIN);
        match self {
            Timezone::Fixed(offset) => {
                let shift = TimeDelta::seconds(offset.local_minus_utc().into());
                Utc.from_utc_datetime(&(midnight - shift))
            }
            Timezone::Named(tz) => (0..=MAX_GAP_STEPS)
                .find_map(|step| {
                    tz.from_local_datetime(&(midnight + TimeDelta::minutes(15 * step)))
                        .earliest()
                })
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&midnight)),
        }
    }

    /// Today's calendar day according to `clock`.
    pub fn today(&self, clock: &dyn Clock) -> NaiveDate {
        self.local_day(clock.now())
    }
}

impl Default for Timezone {
    fn default() -> Self {
        Self::utc()
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timezone::Named(tz) => f.write_str(tz.name()),
            Timezone::Fixed(offset) => write!(f, "{offset}"),
        }
    }
}

impl FromStr for Timezone {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if matches!(trimmed.to_ascii_uppercase().as_str(), "UTC" | "Z" | "GMT" | "ETC/UTC") {
            return Ok(Self::utc());
        }
        if let Ok(tz) = trimmed.parse::<Tz>() {
            return Ok(Timezone::Named(tz));
        }

        let invalid = || ConfigError::InvalidValue {
            key: "timezone".to_string(),
            message: format!("'{trimmed}' is not an IANA zone or a fixed offset like +02:00"),
        };

        let caps = OFFSET_RE.captures(trimmed).ok_or_else(invalid)?;
        let hours: i32 = caps[2].parse().map_err(|_| invalid())?;
        let minutes: i32 = caps
            .get(3)
            .map(|m| m.as_str().parse())
            .transpose()
            .map_err(|_| invalid())?
            .unwrap_or(0);
        if hours > 14 || minutes > 59 {
            return Err(invalid());
        }
        let seconds = (hours * 3600 + minutes * 60) * if &caps[1] == "-" { -1 } else { 1 };
        FixedOffset::east_opt(seconds).map(Timezone::Fixed).ok_or_else(invalid)
    }
}

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant, for tests and replays.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn parses_named_utc_variants() {
        assert_eq!("UTC".parse::<Timezone>().unwrap(), Timezone::utc());
        assert_eq!("z".parse::<Timezone>().unwrap(), Timezone::utc());
    }

    #[test]
    fn parses_offsets() {
        let now = Utc::now();
        let tz: Timezone = "+05:30".parse().unwrap();
        assert_eq!(tz.offset_at(now).local_minus_utc(), 5 * 3600 + 30 * 60);
        let tz: Timezone = "-0800".parse().unwrap();
        assert_eq!(tz.offset_at(now).local_minus_utc(), -8 * 3600);
        let tz: Timezone = "UTC+03".parse().unwrap();
        assert_eq!(tz.offset_at(now).local_minus_utc(), 3 * 3600);
    }

    #[test]
    fn rejects_garbage() {
        assert!("Mars/Olympus".parse::<Timezone>().is_err());
        assert!("+25:00".parse::<Timezone>().is_err());
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(Timezone::parse_or_utc(Some("Europe/Nowhere")), Timezone::utc());
        assert_eq!(Timezone::parse_or_utc(None), Timezone::utc());
    }

    #[test]
    fn local_day_crosses_midnight() {
        let tz: Timezone = "-05:00".parse().unwrap();
        let instant = "2024-06-02T03:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(tz.local_day(instant), day("2024-06-01"));
    }

    #[test]
    fn today_uses_clock() {
        let clock = FixedClock("2024-06-01T23:30:00Z".parse().unwrap());
        let tz: Timezone = "+01:00".parse().unwrap();
        assert_eq!(tz.today(&clock), day("2024-06-02"));
        assert_eq!(Timezone::utc().today(&clock), day("2024-06-01"));
    }

    #[test]
    fn parses_iana_zones() {
        let tz: Timezone = "America/New_York".parse().unwrap();
        assert_eq!(tz, Timezone::Named(chrono_tz::America::New_York));
        assert_eq!(tz.to_string(), "America/New_York");
        assert_eq!(Timezone::parse_or_utc(Some("Europe/Berlin")).to_string(), "Europe/Berlin");
    }

    #[test]
    fn evening_in_new_york_is_still_today() {
        // 21:00 on Jan 5 in New York.
        let clock = FixedClock("2024-01-06T02:00:00Z".parse().unwrap());
        let tz: Timezone = "America/New_York".parse().unwrap();
        assert_eq!(tz.today(&clock), day("2024-01-05"));
    }

    #[test]
    fn dst_transition_days_have_local_boundaries() {
        let tz: Timezone = "America/New_York".parse().unwrap();
        let spring = day("2024-03-10");
        let start = tz.day_start_utc(spring);
        let end = tz.day_start_utc(day("2024-03-11"));
        assert_eq!(start, "2024-03-10T05:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(end, "2024-03-11T04:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!((end - start).num_hours(), 23);

        let fall = tz.day_start_utc(day("2024-11-03"));
        let after = tz.day_start_utc(day("2024-11-04"));
        assert_eq!((after - fall).num_hours(), 25);
    }

    #[test]
    fn midnight_gap_starts_day_at_first_valid_time() {
        // Santiago skipped 00:00-01:00 local on 2023-09-03.
        let tz: Timezone = "America/Santiago".parse().unwrap();
        let start = tz.day_start_utc(day("2023-09-03"));
        assert_eq!(start, "2023-09-03T04:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(tz.local_day(start), day("2023-09-03"));
    }
}
