//! Expansion of recurring series into their occurrences
//!
//! Rules are handed to the `rrule` crate, together with the series start and its `EXDATE`s.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use itertools::Itertools;
use rrule::RRuleSet;

use crate::error::{Error, Result};
use crate::event::{Event, EventTime};
use crate::window::TimeWindow;

/// Recurring series are never expanded beyond this many occurrences
pub const MAX_OCCURRENCES: u16 = 1000;

/// The starts of the occurrences of `master` that begin between `after` and `before` (both included).
///
/// Excluded occurrences (`EXDATE`) are not returned. Events without a rule have no occurrence.
pub fn occurrence_starts(master: &Event, after: &DateTime<Utc>, before: &DateTime<Utc>) -> Result<Vec<EventTime>> {
    let rule = match master.rrule() {
        None => return Ok(Vec::new()),
        Some(rule) => rule,
    };
    let text = rule_set_text(master.start(), rule, master.exception_dates());
    let rule_set: RRuleSet = text.parse()
        .map_err(|err| Error::protocol(format!("Unable to expand the series {}: {}", master.uid(), err), text.clone()))?;

    let tz: rrule::Tz = Utc.into();
    let result = rule_set
        .after((*after - Duration::seconds(1)).with_timezone(&tz))
        .before((*before + Duration::seconds(1)).with_timezone(&tz))
        .all(MAX_OCCURRENCES);
    if result.limited {
        log::warn!("{} has more than {} occurrences, the others are ignored", master.uid(), MAX_OCCURRENCES);
    }

    Ok(result.dates.iter()
        .map(|dt| shaped_like(master.start(), &EventTime::utc(dt.with_timezone(&Utc))))
        .collect())
}

/// The occurrences of `master` that overlap `window`, each one anchored on its own start
pub fn expand(master: &Event, window: &TimeWindow) -> Result<Vec<Event>> {
    let length = master.end().instant() - master.start().instant();
    let starts = occurrence_starts(master, &(*window.start() - length), window.end())?;

    Ok(starts.into_iter()
        .map(|start| {
            let mut occurrence = master.clone();
            occurrence.set_rrule(None);
            occurrence.set_exception_dates(Vec::new());
            occurrence.set_end(start.shifted(length));
            occurrence.set_recurrence_anchor(Some(start.clone()));
            occurrence.set_start(start);
            occurrence
        })
        .filter(|occurrence| occurrence.overlaps(window.start(), window.end()))
        .collect())
}

/// Express `time` the way the series start is expressed (`EXDATE` and `RECURRENCE-ID` values must have the same type as `DTSTART`)
pub fn shaped_like(series_start: &EventTime, time: &EventTime) -> EventTime {
    if series_start.is_all_day() {
        return EventTime::all_day(time.local().date());
    }
    match series_start.tzid() {
        Some(tzid) => {
            let local = match tzid.parse::<Tz>() {
                Ok(tz) => time.instant().with_timezone(&tz).naive_local(),
                Err(_) => time.instant().naive_utc(),
            };
            EventTime::zoned(local, tzid).unwrap_or_else(|_| EventTime::utc(time.instant()))
        },
        None => EventTime::utc(time.instant()),
    }
}

fn rule_set_text(start: &EventTime, rule: &str, exdates: &[EventTime]) -> String {
    let mut lines = vec![
        format!("DTSTART{}", ical_value(start)),
        format!("RRULE:{}", with_until_like(rule, series_zone(start))),
    ];
    for exdate in exdates {
        lines.push(format!("EXDATE{}", ical_value(&shaped_like(start, exdate))));
    }
    lines.join("\n")
}

/// The zone `DTSTART` is written in, `None` when it is written in UTC
fn series_zone(start: &EventTime) -> Option<Tz> {
    match start.is_all_day() {
        true => None,
        false => start.tzid().and_then(|tzid| tzid.parse::<Tz>().ok()),
    }
}

/// The parameters and value of a time property. All-day values become midnight UTC
fn ical_value(time: &EventTime) -> String {
    if time.is_all_day() {
        return format!(":{}T000000Z", time.date().format("%Y%m%d"));
    }
    match (series_zone(time), time.tzid()) {
        (Some(_), Some(tzid)) => format!(";TZID={}:{}", tzid, time.local().format("%Y%m%dT%H%M%S")),
        _ => format!(":{}", time.instant().format("%Y%m%dT%H%M%SZ")),
    }
}

/// `UNTIL` must be expressed like `DTSTART`: in UTC, or as a local time of the series zone.
/// Dates last until the end of their day, values without a zone are read as UTC.
fn with_until_like(rule: &str, zone: Option<Tz>) -> String {
    rule.trim()
        .split(';')
        .map(|part| match part.split_once('=') {
            Some((name, value)) if name.eq_ignore_ascii_case("UNTIL") => format!("UNTIL={}", until_value(value, zone)),
            _ => part.to_string(),
        })
        .join(";")
}

fn until_value(value: &str, zone: Option<Tz>) -> String {
    let naive = match value.contains('T') {
        true => NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y%m%dT%H%M%S").ok(),
        false => NaiveDate::parse_from_str(value, "%Y%m%d").ok().and_then(|date| date.and_hms_opt(23, 59, 59)),
    };
    let until = match naive {
        None => return value.to_string(),
        Some(naive) => Utc.from_utc_datetime(&naive),
    };
    match zone {
        Some(zone) => until.with_timezone(&zone).format("%Y%m%dT%H%M%S").to_string(),
        None => until.format("%Y%m%dT%H%M%SZ").to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn utc(month: u32, day: u32, hour: u32) -> EventTime {
        EventTime::utc(Utc.with_ymd_and_hms(2026, month, day, hour, 0, 0).unwrap())
    }

    fn series(rule: &str, start: EventTime, end: EventTime) -> Event {
        let mut master = Event::with_uid("series".to_string(), "Series".to_string(), start, end);
        master.set_rrule(Some(rule.to_string()));
        master
    }

    fn year() -> (DateTime<Utc>, DateTime<Utc>) {
        (Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(), Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn weekly_with_exdates() {
        let mut master = series("FREQ=WEEKLY;COUNT=5", utc(1, 2, 9), utc(1, 2, 10));
        let (from, to) = year();
        assert_eq!(occurrence_starts(&master, &from, &to).unwrap().len(), 5);

        master.add_exception_date(utc(1, 16, 9));
        let starts = occurrence_starts(&master, &from, &to).unwrap();
        assert_eq!(starts, vec![utc(1, 2, 9), utc(1, 9, 9), utc(1, 23, 9), utc(1, 30, 9)]);
    }

    #[test]
    fn monthly_and_until() {
        let master = series("FREQ=MONTHLY;UNTIL=20260405", utc(1, 5, 9), utc(1, 5, 10));
        let (from, to) = year();
        let starts = occurrence_starts(&master, &from, &to).unwrap();
        assert_eq!(starts, vec![utc(1, 5, 9), utc(2, 5, 9), utc(3, 5, 9), utc(4, 5, 9)]);
    }

    #[test]
    fn zoned_series_keep_their_wall_clock_time() {
        // Daylight saving time starts on March 29th in Paris
        let local = NaiveDate::from_ymd_opt(2026, 3, 23).unwrap().and_hms_opt(9, 0, 0).unwrap();
        let start = EventTime::zoned(local, "Europe/Paris").unwrap();
        let end = EventTime::zoned(local + Duration::hours(1), "Europe/Paris").unwrap();
        let master = series("FREQ=WEEKLY;COUNT=2", start, end);

        let (from, to) = year();
        let starts = occurrence_starts(&master, &from, &to).unwrap();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].tzid(), Some("Europe/Paris"));
        assert_eq!(starts[1].local(), local + Duration::days(7));
        assert_eq!(starts[1].instant(), Utc.with_ymd_and_hms(2026, 3, 30, 7, 0, 0).unwrap());

        // UNTIL is always UTC for zoned series: the occurrence of April 6th (07:00 UTC) is the last one
        let master = series("FREQ=WEEKLY;UNTIL=20260406T070000Z", master.start().clone(), master.end().clone());
        assert_eq!(occurrence_starts(&master, &from, &to).unwrap().len(), 3);
    }

    #[test]
    fn all_day_occurrences() {
        let day = |d| EventTime::all_day(NaiveDate::from_ymd_opt(2026, 1, d).unwrap());
        let mut master = series("FREQ=DAILY;COUNT=4", day(5), day(6));
        master.add_exception_date(day(6));

        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2026, 1, 6, 12, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 9, 0, 0, 0).unwrap(),
        ).unwrap();
        let occurrences = expand(&master, &window).unwrap();
        let anchors: Vec<&EventTime> = occurrences.iter().filter_map(|occ| occ.recurrence_anchor()).collect();
        assert_eq!(anchors, vec![&day(7), &day(8)]);
        assert!(occurrences.iter().all(|occ| occ.rrule().is_none() && occ.end().is_all_day()));
        assert_eq!(occurrences[0].end(), &day(8));
    }

    #[test]
    fn invalid_rules_are_protocol_errors() {
        let master = series("FREQ=SOMETIMES", utc(1, 2, 9), utc(1, 2, 10));
        let (from, to) = year();
        assert!(matches!(occurrence_starts(&master, &from, &to), Err(Error::Protocol { .. })));
    }
}
