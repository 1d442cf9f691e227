//! Date windows used to search calendars

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::event::local_to_utc;

/// A half-open `[start, end)` window.
///
/// Bounds are always stored in UTC, whatever zone they have been expressed in, so that naive and zone-qualified windows compare consistently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidInput(format!("empty time window [{}, {})", start, end)));
        }
        Ok(Self { start, end })
    }

    /// Build a window from zone-qualified bounds
    pub fn from_zoned<T: TimeZone>(start: DateTime<T>, end: DateTime<T>) -> Result<Self> {
        Self::new(start.with_timezone(&Utc), end.with_timezone(&Utc))
    }

    /// Build a window from naive bounds, that are interpreted in the `reference` zone
    pub fn from_naive(start: NaiveDateTime, end: NaiveDateTime, reference: &Tz) -> Result<Self> {
        let start_utc = local_to_utc(reference, start)
            .ok_or_else(|| Error::InvalidInput(format!("{} does not exist in {}", start, reference)))?;
        let end_utc = local_to_utc(reference, end)
            .ok_or_else(|| Error::InvalidInput(format!("{} does not exist in {}", end, reference)))?;
        Self::new(start_utc, end_utc)
    }

    /// The window that starts `before` ago and ends `after` from `now`
    pub fn around(now: DateTime<Utc>, before: Duration, after: Duration) -> Self {
        let start = now - before;
        let end = std::cmp::max(now + after, start + Duration::seconds(1));
        Self { start, end }
    }

    pub fn start(&self) -> &DateTime<Utc> { &self.start }
    pub fn end(&self) -> &DateTime<Utc>   { &self.end }

    /// The start bound, formatted for a CalDAV `<time-range>`
    pub fn caldav_start(&self) -> String {
        format_caldav(&self.start)
    }

    /// The end bound, formatted for a CalDAV `<time-range>`
    pub fn caldav_end(&self) -> String {
        format_caldav(&self.end)
    }

    pub fn contains(&self, instant: &DateTime<Utc>) -> bool {
        self.start <= *instant && *instant < self.end
    }

    /// Whether `[start, end)` overlaps this window
    pub fn overlaps(&self, start: &DateTime<Utc>, end: &DateTime<Utc>) -> bool {
        *start < self.end && *end > self.start
    }

    /// Whether a span known by its first and last occurrences (both inclusive) overlaps this window
    pub fn overlaps_span(&self, first_occurrence: &DateTime<Utc>, last_occurrence: &DateTime<Utc>) -> bool {
        *first_occurrence <= self.end && *last_occurrence >= self.start
    }
}

impl Display for TimeWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

fn format_caldav(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}
