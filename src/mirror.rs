//! A fast, read-only path to the data of the remote store
//!
//! Some calendar servers keep their data in tables that can be read directly, without going through the CalDAV protocol.
//! A mirror serves reads from such a copy. It is never written to: every mutation goes through a [`CalDavSource`](crate::traits::CalDavSource),
//! otherwise the server change counters would not move and clients would miss the change.

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::calendar::{CalendarId, Collection, SupportedComponents, parse_color_or_default};
use crate::error::{Error, Result};
use crate::item::ChangeToken;
use crate::resource::{RawResource, ResourceRef};
use crate::window::TimeWindow;

/// A read-only copy of the remote store
#[async_trait]
pub trait Mirror: Send + Sync {
    /// The collections of the mirrored principal
    async fn collections(&self) -> Result<Vec<Collection>>;

    /// The event resources of a collection that have an occurrence in `window`
    async fn search(&self, collection: &CalendarId, window: &TimeWindow) -> Result<Vec<RawResource>>;

    /// The resource of `uid`, if the mirror already knows it
    async fn find_uid(&self, collection: &CalendarId, uid: &str) -> Result<Option<RawResource>>;
}



/// A calendar row of the mirrored tables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MirrorCalendar {
    pub id: i64,
    /// Last segment of the collection URL
    pub uri: String,
    pub displayname: Option<String>,
    pub calendarcolor: Option<String>,
    pub synctoken: Option<i64>,
    /// Comma-separated component names (`VEVENT,VTODO`)
    pub components: Option<String>,
}

/// A calendar object row of the mirrored tables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MirrorObject {
    pub calendarid: i64,
    /// File name of the resource
    pub uri: String,
    pub uid: String,
    pub etag: Option<String>,
    pub componenttype: Option<String>,
    /// Unix timestamps. A missing value is unbounded
    pub firstoccurence: Option<i64>,
    pub lastoccurence: Option<i64>,
    pub calendardata: String,
}

/// A full dump of the mirrored tables
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MirrorSnapshot {
    pub calendars: Vec<MirrorCalendar>,
    pub objects: Vec<MirrorObject>,
}



/// A [`Mirror`] that serves a snapshot of the server tables
pub struct SnapshotMirror {
    /// Collection URLs are built from this and the calendar `uri`
    calendar_home: Url,
    snapshot: RwLock<MirrorSnapshot>,
}

impl SnapshotMirror {
    pub fn new(calendar_home: Url, snapshot: MirrorSnapshot) -> Self {
        Self { calendar_home, snapshot: RwLock::new(snapshot) }
    }

    /// Load a snapshot that has been dumped as JSON
    pub fn from_file(calendar_home: Url, path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let snapshot = serde_json::from_reader(file)?;
        Ok(Self::new(calendar_home, snapshot))
    }

    /// Replace the snapshot with a fresher one
    pub fn refresh(&self, snapshot: MirrorSnapshot) -> Result<()> {
        let mut current = self.snapshot.write()
            .map_err(|_| Error::Storage("mirror lock is poisoned".to_string()))?;
        *current = snapshot;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MirrorSnapshot>> {
        self.snapshot.read()
            .map_err(|_| Error::Storage("mirror lock is poisoned".to_string()))
    }

    fn collection_url(&self, calendar: &MirrorCalendar) -> Result<Url> {
        let uri = calendar.uri.trim_matches('/');
        Ok(self.calendar_home.join(&format!("{}/", uri))?)
    }

    fn calendar_id_of(&self, snapshot: &MirrorSnapshot, collection: &CalendarId) -> Option<i64> {
        snapshot.calendars.iter()
            .find(|cal| self.collection_url(cal).map(|url| crate::utils::same_resource(&url, collection)).unwrap_or(false))
            .map(|cal| cal.id)
    }

    fn to_raw(collection: &CalendarId, object: &MirrorObject) -> Result<RawResource> {
        let href = crate::resource::href_in(collection, &object.uri)?;
        let token = object.etag.as_ref().map(|etag| ChangeToken::from(format!("\"{}\"", etag.trim_matches('"'))));
        Ok(RawResource::new(ResourceRef::new(href, token), object.calendardata.clone()))
    }
}

fn is_event(object: &MirrorObject) -> bool {
    object.componenttype.as_deref().map(|c| c.eq_ignore_ascii_case("VEVENT")).unwrap_or(true)
}

fn timestamp(ts: Option<i64>, unbounded: DateTime<Utc>) -> DateTime<Utc> {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single()).unwrap_or(unbounded)
}

#[async_trait]
impl Mirror for SnapshotMirror {
    async fn collections(&self) -> Result<Vec<Collection>> {
        let snapshot = self.read()?;
        let mut collections = Vec::new();
        for calendar in &snapshot.calendars {
            let components = calendar.components.as_deref().unwrap_or("VEVENT");
            let mut supported = SupportedComponents::empty();
            for component in components.split(',').map(|c| c.trim()) {
                match component {
                    "VEVENT" => supported.insert(SupportedComponents::EVENT),
                    "VTODO" => supported.insert(SupportedComponents::TODO),
                    _ => (),
                }
            }
            if supported.contains(SupportedComponents::EVENT) == false {
                continue;
            }

            let id = self.collection_url(calendar)?;
            let name = calendar.displayname.clone()
                .filter(|name| name.trim().is_empty() == false)
                .unwrap_or_else(|| calendar.uri.clone());
            let color = parse_color_or_default(calendar.calendarcolor.as_deref());
            let ctag = calendar.synctoken.map(|token| ChangeToken::from(token.to_string()));
            collections.push(Collection::new(id, name, color, ctag, supported));
        }
        Ok(collections)
    }

    async fn search(&self, collection: &CalendarId, window: &TimeWindow) -> Result<Vec<RawResource>> {
        let snapshot = self.read()?;
        let calendar_id = match self.calendar_id_of(&snapshot, collection) {
            None => return Err(Error::NotFound(collection.to_string())),
            Some(id) => id,
        };

        snapshot.objects.iter()
            .filter(|object| object.calendarid == calendar_id && is_event(object))
            .filter(|object| window.overlaps_span(
                &timestamp(object.firstoccurence, DateTime::<Utc>::MIN_UTC),
                &timestamp(object.lastoccurence, DateTime::<Utc>::MAX_UTC),
            ))
            .map(|object| Self::to_raw(collection, object))
            .collect()
    }

    async fn find_uid(&self, collection: &CalendarId, uid: &str) -> Result<Option<RawResource>> {
        let snapshot = self.read()?;
        let calendar_id = match self.calendar_id_of(&snapshot, collection) {
            None => return Ok(None),
            Some(id) => id,
        };
        snapshot.objects.iter()
            .find(|object| object.calendarid == calendar_id && object.uid == uid)
            .map(|object| Self::to_raw(collection, object))
            .transpose()
    }
}
