//! Calendar events (iCal `VEVENT` items)

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::item::ChangeToken;

/// Title given to events that have none
pub const UNTITLED: &str = "Untitled";

/// Extension property that links an event to an external client record
pub const X_CLIENT_ID: &str = "X-CLIENT-ID";
/// Extension property that links an event to an external affair record
pub const X_AFFAIR_ID: &str = "X-AFFAIR-ID";



/// A point in time as found in a `DTSTART`, `DTEND`, `RECURRENCE-ID` or `EXDATE` property.
///
/// Every value is normalized to a UTC instant. Date-only values are promoted to midnight UTC and tagged as all-day.
/// The time zone name (`TZID`) is kept so that the value can be written back the way it was read.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTime {
    instant: DateTime<Utc>,
    all_day: bool,
    tzid: Option<String>,
}

impl EventTime {
    /// A date-time expressed in UTC
    pub fn utc(instant: DateTime<Utc>) -> Self {
        Self { instant, all_day: false, tzid: None }
    }

    /// A date-only value
    pub fn all_day(date: NaiveDate) -> Self {
        Self { instant: Utc.from_utc_datetime(&date.and_time(NaiveTime::default())), all_day: true, tzid: None }
    }

    /// A local date-time qualified by an IANA time zone name.
    ///
    /// Local times that are ambiguous (DST fall-back) resolve to the earliest instant, local times that do not exist (DST gap) are shifted one hour later.
    /// Unknown zone names are kept verbatim, but the local time is then interpreted as UTC.
    pub fn zoned(local: NaiveDateTime, tzid: &str) -> Result<Self> {
        let instant = match tzid.parse::<Tz>() {
            Ok(tz) => local_to_utc(&tz, local)
                .ok_or_else(|| Error::protocol(format!("{} does not exist in {}", local, tzid), tzid))?,
            Err(_) => {
                log::warn!("Unknown time zone {:?}, interpreting {} as UTC", tzid, local);
                Utc.from_utc_datetime(&local)
            },
        };
        Ok(Self { instant, all_day: false, tzid: Some(tzid.to_string()) })
    }

    pub fn instant(&self) -> DateTime<Utc> { self.instant }
    pub fn is_all_day(&self) -> bool       { self.all_day }
    pub fn tzid(&self) -> Option<&str>     { self.tzid.as_deref() }

    /// The calendar date of this value, in its own time zone
    pub fn date(&self) -> NaiveDate {
        self.local().date()
    }

    /// The wall-clock value of this time, in its own time zone (UTC if it has none)
    pub fn local(&self) -> NaiveDateTime {
        match self.tzid.as_deref().and_then(|name| name.parse::<Tz>().ok()) {
            Some(tz) => self.instant.with_timezone(&tz).naive_local(),
            None => self.instant.naive_utc(),
        }
    }

    /// The wall-clock value of this time, seen from `zone`
    pub fn local_in(&self, zone: &Tz) -> NaiveDateTime {
        if self.all_day {
            // A date has no instant: it is the same day everywhere
            return self.instant.naive_utc();
        }
        self.instant.with_timezone(zone).naive_local()
    }

    /// This time moved by `by`, keeping its kind. Zoned values move on the wall clock
    pub fn shifted(&self, by: Duration) -> EventTime {
        let instant = self.instant + by;
        if self.all_day {
            return EventTime::all_day(instant.date_naive());
        }
        match self.tzid.as_deref() {
            Some(tzid) => {
                let local = self.local() + by;
                EventTime::zoned(local, tzid).unwrap_or_else(|_| EventTime::utc(instant))
            },
            None => EventTime::utc(instant),
        }
    }
}

impl Display for EventTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.all_day, &self.tzid) {
            (true, _) => write!(f, "{}", self.date()),
            (false, Some(tz)) => write!(f, "{} [{}]", self.local(), tz),
            (false, None) => write!(f, "{}", self.instant.to_rfc3339()),
        }
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|text| text.is_empty() == false)
}

pub(crate) fn local_to_utc(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local).earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}



/// The `STATUS` of an event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Tentative,
    Confirmed,
    Cancelled,
    /// Not an RFC5545 value for events, but this is how tasks mirrored as events are marked done
    Completed,
    Other(String),
}

impl EventStatus {
    /// Parse a `STATUS` value. This never fails: unknown values are kept verbatim, an empty value is the default status
    pub fn from_ical(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "" => Self::default(),
            "TENTATIVE" => Self::Tentative,
            "CONFIRMED" => Self::Confirmed,
            "CANCELLED" => Self::Cancelled,
            "COMPLETED" => Self::Completed,
            _ => Self::Other(value.trim().to_string()),
        }
    }

    pub fn as_ical(&self) -> &str {
        match self {
            Self::Tentative => "TENTATIVE",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Other(s) => s,
        }
    }
}

impl Default for EventStatus {
    fn default() -> Self {
        Self::Confirmed
    }
}



/// A calendar event
///
/// `uid` + `recurrence_anchor` uniquely identify a resource. The series master has no anchor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Persistent, globally unique identifier of the series
    uid: String,
    title: String,
    /// Never empty: an empty text is the same as no text at all
    description: Option<String>,
    location: Option<String>,
    start: EventTime,
    end: EventTime,
    status: EventStatus,
    /// The occurrence this sub-record overrides. `None` for the series master and for non-recurring events
    recurrence_anchor: Option<EventTime>,
    /// The `RRULE`, kept verbatim
    rrule: Option<String>,
    exception_dates: Vec<EventTime>,
    /// Incremented on every edit
    sequence: u32,
    last_modified: Option<DateTime<Utc>>,
    /// The `etag` of the resource this event has been read from, if any
    change_token: Option<ChangeToken>,
    /// `X-` properties, kept verbatim
    extensions: BTreeMap<String, String>,
}

impl Event {
    /// Create a brand new Event that is not on a server yet.
    /// This will pick a new (random) uid.
    pub fn new(title: String, start: EventTime, end: EventTime) -> Self {
        let uid = Uuid::new_v4().to_hyphenated().to_string();
        Self::with_uid(uid, title, start, end)
    }

    /// Create an Event with a known uid
    pub fn with_uid(uid: String, title: String, start: EventTime, end: EventTime) -> Self {
        Self {
            uid,
            title,
            description: None,
            location: None,
            start,
            end,
            status: EventStatus::default(),
            recurrence_anchor: None,
            rrule: None,
            exception_dates: Vec::new(),
            sequence: 0,
            last_modified: None,
            change_token: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn uid(&self) -> &str                 { &self.uid }
    pub fn title(&self) -> &str               { &self.title }
    pub fn description(&self) -> Option<&str> { self.description.as_deref() }
    pub fn location(&self) -> Option<&str>    { self.location.as_deref() }
    pub fn start(&self) -> &EventTime         { &self.start }
    pub fn end(&self) -> &EventTime           { &self.end }
    pub fn status(&self) -> &EventStatus      { &self.status }
    pub fn completed(&self) -> bool           { self.status == EventStatus::Completed }
    pub fn recurrence_anchor(&self) -> Option<&EventTime> { self.recurrence_anchor.as_ref() }
    pub fn rrule(&self) -> Option<&str>       { self.rrule.as_deref() }
    pub fn exception_dates(&self) -> &[EventTime] { &self.exception_dates }
    pub fn sequence(&self) -> u32             { self.sequence }
    pub fn last_modified(&self) -> Option<&DateTime<Utc>> { self.last_modified.as_ref() }
    pub fn change_token(&self) -> Option<&ChangeToken> { self.change_token.as_ref() }
    pub fn extensions(&self) -> &BTreeMap<String, String> { &self.extensions }

    /// Whether this is the series master (or a standalone event), rather than an override of one occurrence
    pub fn is_master(&self) -> bool {
        self.recurrence_anchor.is_none()
    }

    pub fn is_recurring(&self) -> bool {
        self.rrule.is_some() || self.recurrence_anchor.is_some()
    }

    /// The linked external client id, if any
    pub fn client_id(&self) -> Option<&str> {
        self.extensions.get(X_CLIENT_ID).map(|s| s.as_str())
    }

    /// The linked external affair id, if any
    pub fn affair_id(&self) -> Option<&str> {
        self.extensions.get(X_AFFAIR_ID).map(|s| s.as_str())
    }

    pub fn set_title(&mut self, title: String)                    { self.title = title; }
    pub fn set_description(&mut self, description: Option<String>) { self.description = non_empty(description); }
    pub fn set_location(&mut self, location: Option<String>)      { self.location = non_empty(location); }
    pub fn set_start(&mut self, start: EventTime)                 { self.start = start; }
    pub fn set_end(&mut self, end: EventTime)                     { self.end = end; }
    /// An empty [`EventStatus::Other`] is the default status
    pub fn set_status(&mut self, status: EventStatus) {
        self.status = match status {
            EventStatus::Other(value) if value.trim().is_empty() => EventStatus::default(),
            status => status,
        };
    }
    pub fn set_recurrence_anchor(&mut self, anchor: Option<EventTime>) { self.recurrence_anchor = anchor; }
    pub fn set_rrule(&mut self, rrule: Option<String>)            { self.rrule = rrule; }
    pub fn set_sequence(&mut self, sequence: u32)                 { self.sequence = sequence; }
    pub fn set_last_modified(&mut self, at: Option<DateTime<Utc>>) { self.last_modified = at; }
    pub fn set_change_token(&mut self, token: Option<ChangeToken>) { self.change_token = token; }

    /// Mark this event as done (or not).
    ///
    /// Un-completing an event resets its status to `CONFIRMED`
    pub fn set_completed(&mut self, completed: bool) {
        self.status = if completed {
            EventStatus::Completed
        } else {
            match &self.status {
                EventStatus::Completed => EventStatus::Confirmed,
                other => other.clone(),
            }
        };
    }

    pub fn add_exception_date(&mut self, date: EventTime) {
        if self.exception_dates.contains(&date) == false {
            self.exception_dates.push(date);
        }
    }

    pub fn set_exception_dates(&mut self, dates: Vec<EventTime>) {
        self.exception_dates = dates;
    }

    /// Set an `X-` property. Names are upper-cased, and must start with `X-`
    pub fn set_extension(&mut self, name: &str, value: String) -> Result<()> {
        let name = name.to_ascii_uppercase();
        if name.starts_with("X-") == false {
            return Err(Error::InvalidInput(format!("{} is not an extension property name", name)));
        }
        self.extensions.insert(name, value);
        Ok(())
    }

    pub fn remove_extension(&mut self, name: &str) -> Option<String> {
        self.extensions.remove(&name.to_ascii_uppercase())
    }

    pub fn bump_sequence(&mut self) {
        self.sequence += 1;
    }

    /// Whether both events look the same to a user.
    ///
    /// Stamps and change tokens are ignored
    pub fn has_same_observable_content_as(&self, other: &Event) -> bool {
           self.uid == other.uid
        && self.title == other.title
        && self.description == other.description
        && self.location == other.location
        && self.start == other.start
        && self.end == other.end
        && self.status == other.status
        && self.recurrence_anchor == other.recurrence_anchor
        && self.rrule == other.rrule
        && self.exception_dates == other.exception_dates
        && self.sequence == other.sequence
        && self.extensions == other.extensions
    }

    /// Whether `[start, end)` of this event overlaps `[window_start, window_end)`.
    ///
    /// Zero-length events are considered to last one second
    pub fn overlaps(&self, window_start: &DateTime<Utc>, window_end: &DateTime<Utc>) -> bool {
        let start = self.start.instant();
        let end = std::cmp::max(self.end.instant(), start + Duration::seconds(1));
        start < *window_end && end > *window_start
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoned_times_are_normalized() {
        let local = NaiveDate::from_ymd_opt(2026, 1, 23).unwrap().and_hms_opt(10, 0, 0).unwrap();
        let t = EventTime::zoned(local, "Europe/Paris").unwrap();
        assert_eq!(t.instant(), Utc.with_ymd_and_hms(2026, 1, 23, 9, 0, 0).unwrap());
        assert_eq!(t.local(), local);
        assert_eq!(t.tzid(), Some("Europe/Paris"));
        assert_eq!(t.is_all_day(), false);
    }

    #[test]
    fn dst_gap_is_shifted() {
        // 2026-03-29 02:30 does not exist in Paris
        let local = NaiveDate::from_ymd_opt(2026, 3, 29).unwrap().and_hms_opt(2, 30, 0).unwrap();
        let t = EventTime::zoned(local, "Europe/Paris").unwrap();
        assert_eq!(t.instant(), Utc.with_ymd_and_hms(2026, 3, 29, 1, 30, 0).unwrap());
    }

    #[test]
    fn all_day_values_are_midnight_utc() {
        let t = EventTime::all_day(NaiveDate::from_ymd_opt(2026, 1, 23).unwrap());
        assert_eq!(t.instant(), Utc.with_ymd_and_hms(2026, 1, 23, 0, 0, 0).unwrap());
        assert!(t.is_all_day());
        assert_eq!(t.to_string(), "2026-01-23");
    }

    #[test]
    fn completion_drives_status() {
        let start = EventTime::utc(Utc::now());
        let mut ev = Event::new("Call the plumber".to_string(), start.clone(), start);
        assert_eq!(ev.status(), &EventStatus::Confirmed);
        ev.set_completed(true);
        assert!(ev.completed());
        assert_eq!(ev.status().as_ical(), "COMPLETED");
        ev.set_completed(false);
        assert_eq!(ev.status(), &EventStatus::Confirmed);
    }

    #[test]
    fn extensions() {
        let start = EventTime::utc(Utc::now());
        let mut ev = Event::new("Visit".to_string(), start.clone(), start);
        ev.set_extension("x-client-id", "42".to_string()).unwrap();
        assert_eq!(ev.client_id(), Some("42"));
        assert!(ev.set_extension("SUMMARY", "nope".to_string()).is_err());
        assert_eq!(ev.affair_id(), None);
    }

    #[test]
    fn overlap() {
        let day = |d| Utc.with_ymd_and_hms(2026, 1, d, 0, 0, 0).unwrap();
        let ev = Event::new("Trip".to_string(), EventTime::utc(day(10)), EventTime::utc(day(12)));
        assert!(ev.overlaps(&day(11), &day(20)));
        assert!(ev.overlaps(&day(1), &day(11)));
        assert!(ev.overlaps(&day(12), &day(20)) == false);
        assert!(ev.overlaps(&day(1), &day(10)) == false);
    }
}
