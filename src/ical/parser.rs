//! A module to parse ICal files

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use ical::parser::ical::component::IcalEvent;
use ical::property::Property;

use crate::error::{Error, Result};
use crate::event::{Event, EventStatus, EventTime, UNTITLED};


/// Parse an iCal file into its primary [`Event`].
///
/// The primary sub-record is the series master (the one without a `RECURRENCE-ID`), or the first one if every sub-record is an override.
pub fn parse(content: &str) -> Result<Event> {
    let mut events = parse_all(content)?;
    let index = events.iter().position(|ev| ev.is_master()).unwrap_or(0);
    Ok(events.swap_remove(index))
}

/// Parse every `VEVENT` of an iCal file (a series master and its overrides, usually)
pub fn parse_all(content: &str) -> Result<Vec<Event>> {
    let reader = ical::IcalParser::new(content.as_bytes());

    let mut events = Vec::new();
    for calendar in reader {
        let calendar = calendar
            .map_err(|err| Error::protocol(format!("Unable to parse iCal data: {}", err), content))?;
        if calendar.todos.is_empty() == false || calendar.journals.is_empty() == false {
            log::debug!("Ignoring {} VTODO and {} VJOURNAL items", calendar.todos.len(), calendar.journals.len());
        }
        for ical_event in &calendar.events {
            events.push(
                parse_event(ical_event).map_err(|err| match err {
                    Error::Protocol { message, .. } => Error::protocol(message, content),
                    other => other,
                })?
            );
        }
    }

    if events.is_empty() {
        return Err(Error::protocol("No VEVENT in iCal data", content));
    }
    Ok(events)
}

fn parse_event(ical_event: &IcalEvent) -> Result<Event> {
    let mut uid = None;
    let mut title = None;
    let mut description = None;
    let mut location = None;
    let mut start = None;
    let mut end = None;
    let mut duration = None;
    let mut status = None;
    let mut anchor = None;
    let mut rrule = None;
    let mut exdates = Vec::new();
    let mut sequence = 0;
    let mut last_modified = None;
    let mut extensions = Vec::new();

    for prop in &ical_event.properties {
        let value = match &prop.value {
            None => continue,
            Some(v) => v.as_str(),
        };
        match prop.name.to_ascii_uppercase().as_str() {
            "UID" => uid = Some(value.trim().to_string()),
            "SUMMARY" => title = Some(unescape(value)),
            "DESCRIPTION" => description = Some(unescape(value)),
            "LOCATION" => location = Some(unescape(value)),
            "DTSTART" => start = Some(parse_time(prop, value)?),
            "DTEND" => end = Some(parse_time(prop, value)?),
            "DURATION" => duration = parse_duration(value),
            "STATUS" => status = Some(EventStatus::from_ical(value)),
            "RECURRENCE-ID" => anchor = Some(parse_time(prop, value)?),
            "RRULE" => rrule = Some(value.trim().to_string()),
            "EXDATE" => {
                for single in value.split(',').filter(|v| v.trim().is_empty() == false) {
                    exdates.push(parse_time(prop, single)?);
                }
            },
            "SEQUENCE" => sequence = value.trim().parse().unwrap_or(0),
            "LAST-MODIFIED" => last_modified = parse_utc_stamp(value),
            name if name.starts_with("X-") => extensions.push((name.to_string(), unescape(value))),
            _ => (),
        }
    }

    let uid = uid.ok_or_else(|| Error::protocol("Missing UID", ""))?;
    let start = start.ok_or_else(|| Error::protocol(format!("Missing DTSTART for {}", uid), ""))?;
    let end = match (end, duration) {
        (Some(end), _) => end,
        (None, Some(duration)) => start.shifted(duration),
        (None, None) if start.is_all_day() => start.shifted(Duration::days(1)),
        (None, None) => start.clone(),
    };
    let title = title.filter(|t| t.trim().is_empty() == false).unwrap_or_else(|| UNTITLED.to_string());

    let mut event = Event::with_uid(uid, title, start, end);
    event.set_description(description);
    event.set_location(location);
    event.set_status(status.unwrap_or_default());
    event.set_recurrence_anchor(anchor);
    event.set_rrule(rrule);
    event.set_exception_dates(exdates);
    event.set_sequence(sequence);
    event.set_last_modified(last_modified);
    for (name, value) in extensions {
        event.set_extension(&name, value)?;
    }
    Ok(event)
}

fn param<'a>(prop: &'a Property, name: &str) -> Option<&'a str> {
    prop.params.as_ref()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(|v| v.as_str())
}

/// Parse a `DATE` or `DATE-TIME` value, honouring its `VALUE` and `TZID` parameters
fn parse_time(prop: &Property, value: &str) -> Result<EventTime> {
    let value = value.trim();
    let is_date = param(prop, "VALUE").map(|v| v.eq_ignore_ascii_case("DATE")).unwrap_or(false)
        || (value.len() == 8 && value.contains('T') == false);

    if is_date {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d")
            .map_err(|err| Error::protocol(format!("Invalid date {:?} in {}: {}", value, prop.name, err), ""))?;
        return Ok(EventTime::all_day(date));
    }

    if let Some(utc) = value.strip_suffix('Z') {
        let naive = parse_naive(utc, &prop.name)?;
        return Ok(EventTime::utc(Utc.from_utc_datetime(&naive)));
    }

    let naive = parse_naive(value, &prop.name)?;
    match param(prop, "TZID") {
        Some(tzid) => EventTime::zoned(naive, tzid.trim_matches('"')),
        // Floating times are read as UTC
        None => Ok(EventTime::utc(Utc.from_utc_datetime(&naive))),
    }
}

fn parse_naive(value: &str, prop_name: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .map_err(|err| Error::protocol(format!("Invalid date-time {:?} in {}: {}", value, prop_name, err), ""))
}

fn parse_utc_stamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let naive = NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y%m%dT%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Parse an RFC5545 `DURATION` (`P1D`, `PT1H30M`, `P2W`, `-PT15M`...)
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, unsigned) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let duration = iso8601::duration(unsigned).ok()?;
    let std_duration: std::time::Duration = duration.into();
    let duration = Duration::from_std(std_duration).ok()?;
    Some(if negative { -duration } else { duration })
}

/// Revert RFC5545 TEXT escaping
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
