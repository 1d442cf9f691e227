//! A module to build ICal files

use chrono::{DateTime, Utc};
use ics::components::{Parameter, Property};
use ics::properties::{Description, DtEnd, DtStart, ExDate, LastModified, Location, RRule, RecurrenceID, Sequence, Summary};
use ics::{escape_text, ICalendar};

use crate::error::{Error, Result};
use crate::event::{Event, EventTime};
use crate::ical::default_prod_id;


/// Create an iCal item from a single [`Event`]
pub fn build_from(event: &Event) -> Result<String> {
    build_series(std::slice::from_ref(event))
}

/// Create an iCal item that holds several sub-records of the same series (a master and its overrides, usually)
pub fn build_series(events: &[Event]) -> Result<String> {
    let uid = match events.first() {
        None => return Err(Error::InvalidInput("cannot build an empty iCal item".to_string())),
        Some(ev) => ev.uid(),
    };
    if let Some(stranger) = events.iter().find(|ev| ev.uid() != uid) {
        return Err(Error::InvalidInput(format!("{} and {} cannot share an iCal item", uid, stranger.uid())));
    }

    let s_now = format_date_time(&Utc::now());
    let mut calendar = ICalendar::new("2.0", default_prod_id());
    for event in events {
        calendar.add_event(build_event(event, &s_now));
    }

    Ok(calendar.to_string())
}

fn build_event<'a>(event: &'a Event, s_now: &str) -> ics::Event<'a> {
    let mut vevent = ics::Event::new(event.uid(), s_now.to_string());

    if let Some(anchor) = event.recurrence_anchor() {
        vevent.push(with_time_params(RecurrenceID::new(format_event_time(anchor)), anchor));
    }
    vevent.push(with_time_params(DtStart::new(format_event_time(event.start())), event.start()));
    vevent.push(with_time_params(DtEnd::new(format_event_time(event.end())), event.end()));
    vevent.push(Summary::new(escape_text(event.title())));
    // Empty values are written as absent properties
    if let Some(description) = event.description().filter(|text| text.is_empty() == false) {
        vevent.push(Description::new(escape_text(description)));
    }
    if let Some(location) = event.location().filter(|text| text.is_empty() == false) {
        vevent.push(Location::new(escape_text(location)));
    }
    if event.status().as_ical().trim().is_empty() == false {
        vevent.push(Property::new("STATUS", event.status().as_ical()));
    }
    vevent.push(Sequence::new(event.sequence().to_string()));
    if let Some(rrule) = event.rrule() {
        vevent.push(RRule::new(rrule));
    }
    for exdate in event.exception_dates() {
        vevent.push(with_time_params(ExDate::new(format_event_time(exdate)), exdate));
    }
    if let Some(last_modified) = event.last_modified() {
        vevent.push(LastModified::new(format_date_time(last_modified)));
    }
    for (name, value) in event.extensions() {
        vevent.push(Property::new(name.as_str(), escape_text(value)));
    }

    vevent
}

/// Add the `VALUE=DATE` or `TZID=...` parameter a time property needs
fn with_time_params<'a, P>(property: P, time: &'a EventTime) -> Property<'a>
where
    P: Into<Property<'a>>,
{
    let mut property = property.into();
    if time.is_all_day() {
        property.add(Parameter::new("VALUE", "DATE"));
    } else if let Some(tzid) = time.tzid() {
        property.add(Parameter::new("TZID", tzid));
    }
    property
}

fn format_event_time(time: &EventTime) -> String {
    if time.is_all_day() {
        time.date().format("%Y%m%d").to_string()
    } else if time.tzid().is_some() {
        time.local().format("%Y%m%dT%H%M%S").to_string()
    } else {
        format_date_time(&time.instant())
    }
}

fn format_date_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}
