//! Local wall-clock ↔ UTC conversion for per-user timezones.
//!
//! Pure functions over `chrono` + `chrono-tz`. Timezone names are validated
//! at the point a user supplies one (`parse_timezone`), never deferred to
//! scheduling time.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Result, VigilError};

/// Parse an IANA timezone name (e.g. `Europe/Moscow`).
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| VigilError::InvalidTimezone(name.to_owned()))
}

/// Project a UTC instant into `tz` and return the local calendar date.
pub fn local_date_for(tz: Tz, at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&tz).date_naive()
}

/// Build the UTC instant for a local wall-clock time on `date` in `tz`.
///
/// DST handling: an ambiguous local time (fall-back) resolves to the earlier
/// instant; a nonexistent local time (spring-forward gap) resolves to the
/// same wall-clock time one hour later, which always lands past the gap.
pub fn combine_local_to_utc(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
        }
    }
}

/// Instant arithmetic: add (or with a negative value, subtract) minutes.
pub fn add_minutes(at: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    at + Duration::minutes(minutes)
}

/// Instant arithmetic: add (or with a negative value, subtract) hours.
pub fn add_hours(at: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    at + Duration::hours(hours)
}
