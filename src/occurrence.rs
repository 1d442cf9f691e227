//! Removal of a single occurrence of a recurring event
//!
//! A resource holds a series master (with an `RRULE`) and zero or more overrides, one per materialized occurrence (with a `RECURRENCE-ID`).
//! Removing an occurrence drops the sub-record that represents it. When the series master could generate that occurrence again,
//! its instant is also appended to the master `EXDATE` set. When no sub-record remains, the whole resource must be deleted.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::event::{Event, EventTime};
use crate::recurrence::shaped_like;

/// The occurrence a user wants to remove, as they expressed it
#[derive(Clone, Debug, PartialEq)]
pub enum RequestedOccurrence {
    /// A date without time
    Date(NaiveDate),
    /// A date-time without zone, expressed in the reference zone
    Naive(NaiveDateTime),
    /// A date-time with an explicit offset
    Zoned(DateTime<FixedOffset>),
}

impl RequestedOccurrence {
    /// Parse `2026-01-23`, `20260123`, `2026-01-23T10:00[:00]`, `20260123T100000[Z]` or an RFC 3339 date-time
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
            return Ok(Self::Zoned(dt));
        }
        if let Some(utc) = input.strip_suffix('Z') {
            if let Ok(naive) = NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S") {
                return Ok(Self::Zoned(Utc.from_utc_datetime(&naive).into()));
            }
        }
        for format in &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y%m%dT%H%M%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
                return Ok(Self::Naive(naive));
            }
        }
        for format in &["%Y-%m-%d", "%Y%m%d"] {
            if let Ok(date) = NaiveDate::parse_from_str(input, format) {
                return Ok(Self::Date(date));
            }
        }
        Err(Error::InvalidInput(format!("{:?} is neither a date nor a date-time", input)))
    }

    /// The wall-clock value of this request in `zone`
    fn local_in(&self, zone: &Tz) -> NaiveDateTime {
        match self {
            Self::Date(date) => date.and_time(NaiveTime::default()),
            Self::Naive(naive) => *naive,
            Self::Zoned(dt) => dt.with_timezone(zone).naive_local(),
        }
    }

    /// Roughly when the requested occurrence happens. This is only good enough to look for it
    pub fn approximate_instant(&self, zone: &Tz) -> DateTime<Utc> {
        match self {
            Self::Zoned(dt) => dt.with_timezone(&Utc),
            _ => {
                let local = self.local_in(zone);
                crate::event::local_to_utc(zone, local).unwrap_or_else(|| Utc.from_utc_datetime(&local))
            },
        }
    }
}

impl Display for RequestedOccurrence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Date(date) => write!(f, "{}", date),
            Self::Naive(naive) => write!(f, "{}", naive),
            Self::Zoned(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}

/// What to do with the resource once the occurrence is removed
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// Write these sub-records back
    Rewrite(Vec<Event>),
    /// Nothing is left: delete the whole resource
    DeleteResource,
}

/// Whether `candidate` (an occurrence anchor, or a start when there is no anchor) designates `requested`.
///
/// Both sides are seen as wall-clock times in `zone`, at minute granularity.
/// When either side is at midnight (an all-day occurrence, or a date-only request), dates are compared instead.
pub fn matches(candidate: &EventTime, requested: &RequestedOccurrence, zone: &Tz) -> bool {
    let candidate = truncate_to_minute(candidate.local_in(zone));
    let requested = truncate_to_minute(requested.local_in(zone));
    if candidate == requested {
        return true;
    }
    if is_midnight(&candidate) || is_midnight(&requested) {
        return candidate.date() == requested.date();
    }
    false
}

fn truncate_to_minute(dt: NaiveDateTime) -> NaiveDateTime {
    dt.with_second(0).and_then(|dt| dt.with_nanosecond(0)).unwrap_or(dt)
}

fn is_midnight(dt: &NaiveDateTime) -> bool {
    dt.hour() == 0 && dt.minute() == 0
}

/// The instant a sub-record stands for
fn occurrence_key(event: &Event) -> &EventTime {
    event.recurrence_anchor().unwrap_or_else(|| event.start())
}

/// Remove `requested` from the sub-records of one resource.
///
/// `expanded` lists the occurrences the server generated for this series around the requested instant (from an expanded search).
/// It is only used when no sub-record matches, to find out whether the requested occurrence is generated by the master `RRULE`.
pub fn remove_occurrence(mut events: Vec<Event>, requested: &RequestedOccurrence, zone: &Tz, expanded: &[EventTime]) -> Result<Resolution> {
    let matching: Vec<usize> = events.iter()
        .enumerate()
        .filter(|(_, ev)| matches(occurrence_key(ev), requested, zone))
        .map(|(i, _)| i)
        .collect();

    if matching.len() > 1 {
        return Err(Error::AmbiguousOccurrence { requested: requested.to_string(), count: matching.len() });
    }

    if let Some(&index) = matching.first() {
        let target = &events[index];
        if target.is_master() && target.rrule().is_some() {
            // The first occurrence of a series: the master itself must stay
            log::debug!("Excluding the first occurrence of {} ({})", target.uid(), target.start());
            let first = target.start().clone();
            exclude(&mut events[index], first);
            return Ok(Resolution::Rewrite(events));
        }

        let removed = events.remove(index);
        log::debug!("Dropping the sub-record of {} at {}", removed.uid(), occurrence_key(&removed));
        if events.is_empty() {
            return Ok(Resolution::DeleteResource);
        }
        if let (Some(anchor), Some(master)) = (removed.recurrence_anchor(), recurring_master(&mut events)) {
            let exdate = shaped_like(master.start(), anchor);
            exclude(master, exdate);
        }
        return Ok(Resolution::Rewrite(events));
    }

    // No sub-record stands for this occurrence: it may still be generated by the rule
    let generated: Vec<&EventTime> = expanded.iter()
        .filter(|occurrence| matches(occurrence, requested, zone))
        .collect();
    let master = match recurring_master(&mut events) {
        None => return Err(Error::OccurrenceNotFound(requested.to_string())),
        Some(master) => master,
    };
    let occurrence = match generated.as_slice() {
        [] => return Err(Error::OccurrenceNotFound(requested.to_string())),
        [occurrence] => *occurrence,
        many => return Err(Error::AmbiguousOccurrence { requested: requested.to_string(), count: many.len() }),
    };

    let exdate = shaped_like(master.start(), occurrence);
    log::debug!("Excluding {} from the series {}", exdate, master.uid());
    exclude(master, exdate);
    Ok(Resolution::Rewrite(events))
}

fn recurring_master(events: &mut [Event]) -> Option<&mut Event> {
    events.iter_mut().find(|ev| ev.is_master() && ev.rrule().is_some())
}

fn exclude(master: &mut Event, exdate: EventTime) {
    master.add_exception_date(exdate);
    master.bump_sequence();
}
