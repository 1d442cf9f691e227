//! An in-memory remote store, that behaves like a CalDAV server seen through a [`Client`](crate::client::Client)
//!
//! It is used by integration tests and demos. Tests can tweak it to fail with a [`MockBehaviour`], to reject credentials,
//! or to apply writes asynchronously the way some servers do.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use url::Url;

use crate::calendar::{CalendarId, Collection, SupportedComponents, default_color};
use crate::error::{Error, Result};
use crate::event::{Event, EventTime};
use crate::item::ChangeToken;
use crate::mock_behaviour::MockBehaviour;
use crate::recurrence;
use crate::resource::{href_for_uid, RawResource, ResourceRef};
use crate::traits::CalDavSource;
use crate::window::TimeWindow;

struct StoredResource {
    collection: CalendarId,
    token: ChangeToken,
    body: String,
    /// How many more reads will not see this resource yet
    hidden_reads: u32,
}

#[derive(Default)]
struct MockState {
    collections: Vec<Collection>,
    /// Keyed by href
    resources: BTreeMap<String, StoredResource>,
    reject_credentials: bool,
    visibility_delay: u32,
    lost_put_responses: u32,
    fetch_count: usize,
    put_count: usize,
    delete_count: usize,
    /// The precondition of every put, in order
    put_log: Vec<(Url, Option<ChangeToken>)>,
    /// Hrefs that listings report twice, the first time with an outdated token
    listed_twice: Vec<String>,
}

impl MockState {
    fn bump_ctag(&mut self, collection: &CalendarId) {
        if let Some(col) = self.collections.iter_mut().find(|col| col.id() == collection) {
            col.set_ctag(Some(ChangeToken::random()));
        }
    }

    fn check_collection(&self, collection: &CalendarId) -> Result<()> {
        match self.collections.iter().any(|col| col.id() == collection) {
            true => Ok(()),
            false => Err(Error::NotFound(collection.to_string())),
        }
    }

    fn visible_in<'a>(&'a self, collection: &'a CalendarId) -> impl Iterator<Item = (&'a String, &'a StoredResource)> + 'a {
        self.resources.iter()
            .filter(move |(_, res)| &res.collection == collection && res.hidden_reads == 0)
    }
}

/// A remote store that lives in memory
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
    behaviour: Option<Arc<Mutex<MockBehaviour>>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose operations fail the way `behaviour` says
    pub fn with_behaviour(behaviour: Arc<Mutex<MockBehaviour>>) -> Self {
        Self { state: Mutex::default(), behaviour: Some(behaviour) }
    }

    fn state(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state.lock().map_err(|_| Error::Storage("mock state is poisoned".to_string()))
    }

    fn check(&self, op: fn(&mut MockBehaviour) -> Result<()>) -> Result<()> {
        if let Some(behaviour) = &self.behaviour {
            let mut behaviour = behaviour.lock().map_err(|_| Error::Storage("mock behaviour is poisoned".to_string()))?;
            op(&mut behaviour)?;
        }
        if self.state()?.reject_credentials {
            return Err(Error::Auth { url: "mock://remote".to_string() });
        }
        Ok(())
    }


    /// Add a calendar, as another client would do. Returns its id
    pub fn add_collection(&self, id: &str, display_name: &str) -> Result<CalendarId> {
        self.add_collection_with(id, display_name, SupportedComponents::EVENT)
    }

    pub fn add_collection_with(&self, id: &str, display_name: &str, supported: SupportedComponents) -> Result<CalendarId> {
        let id: CalendarId = Url::parse(id)?;
        let collection = Collection::new(id.clone(), display_name.to_string(), default_color(), Some(ChangeToken::random()), supported);
        self.state()?.collections.push(collection);
        Ok(id)
    }

    /// Store an event, as another client would do
    pub fn insert_event(&self, collection: &CalendarId, event: &Event) -> Result<ResourceRef> {
        let body = crate::ical::build_from(event)?;
        self.insert_raw(collection, event.uid(), body, ChangeToken::random())
    }

    /// Store a body with a given change token, as another client would do
    pub fn insert_raw(&self, collection: &CalendarId, uid: &str, body: String, token: ChangeToken) -> Result<ResourceRef> {
        let href = href_for_uid(collection, uid)?;
        let mut state = self.state()?;
        state.check_collection(collection)?;
        state.resources.insert(href.to_string(), StoredResource {
            collection: collection.clone(),
            token: token.clone(),
            body,
            hidden_reads: 0,
        });
        state.bump_ctag(collection);
        Ok(ResourceRef::new(href, Some(token)))
    }

    /// Remove a resource, as another client would do
    pub fn remove(&self, href: &Url) -> Result<()> {
        let mut state = self.state()?;
        if let Some(res) = state.resources.remove(href.as_str()) {
            state.bump_ctag(&res.collection);
        }
        Ok(())
    }

    /// The current body and token of a resource
    pub fn resource(&self, href: &Url) -> Result<Option<RawResource>> {
        let state = self.state()?;
        Ok(state.resources.get(href.as_str())
            .map(|res| RawResource::new(ResourceRef::new(href.clone(), Some(res.token.clone())), res.body.clone())))
    }

    /// How many resources `collection` holds, including the ones that are not visible yet
    pub fn resource_count(&self, collection: &CalendarId) -> Result<usize> {
        Ok(self.state()?.resources.values().filter(|res| &res.collection == collection).count())
    }

    /// Every later call fails as if the credentials were wrong
    pub fn reject_credentials(&self, reject: bool) -> Result<()> {
        self.state()?.reject_credentials = reject;
        Ok(())
    }

    /// Resources written from now on will stay invisible to the next `reads` reads (fetches or listings)
    pub fn delay_visibility(&self, reads: u32) -> Result<()> {
        self.state()?.visibility_delay = reads;
        Ok(())
    }

    /// The next `count` puts are applied, but their response is lost on the way back
    pub fn lose_put_responses(&self, count: u32) -> Result<()> {
        self.state()?.lost_put_responses = count;
        Ok(())
    }

    /// Listings will report `href` twice, as a server with a corrupted index would
    pub fn list_twice(&self, href: &Url) -> Result<()> {
        self.state()?.listed_twice.push(href.to_string());
        Ok(())
    }

    pub fn fetch_count(&self) -> usize  { self.state().map(|s| s.fetch_count).unwrap_or(0) }
    pub fn put_count(&self) -> usize    { self.state().map(|s| s.put_count).unwrap_or(0) }
    pub fn delete_count(&self) -> usize { self.state().map(|s| s.delete_count).unwrap_or(0) }

    /// The href and the precondition of every put so far
    pub fn put_log(&self) -> Vec<(Url, Option<ChangeToken>)> {
        self.state().map(|s| s.put_log.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CalDavSource for MockRemote {
    async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.check(MockBehaviour::can_list_collections)?;
        Ok(self.state()?.collections.clone())
    }

    async fn list_resources(&self, collection: &CalendarId) -> Result<Vec<ResourceRef>> {
        self.check(MockBehaviour::can_list_resources)?;
        let mut state = self.state()?;
        state.check_collection(collection)?;
        let listed_twice = state.listed_twice.clone();
        let mut listed = Vec::new();
        for (href, res) in state.resources.iter_mut().filter(|(_, res)| &res.collection == collection) {
            if res.hidden_reads > 0 {
                res.hidden_reads -= 1;
                continue;
            }
            let url = Url::parse(href)?;
            if listed_twice.contains(href) {
                listed.push(ResourceRef::new(url.clone(), Some(ChangeToken::from("outdated"))));
            }
            listed.push(ResourceRef::new(url, Some(res.token.clone())));
        }
        Ok(listed)
    }

    async fn search(&self, collection: &CalendarId, window: &TimeWindow, expand: bool) -> Result<Vec<RawResource>> {
        self.check(MockBehaviour::can_search)?;
        let state = self.state()?;
        state.check_collection(collection)?;

        let mut hits = Vec::new();
        for (href, res) in state.visible_in(collection) {
            let events = match crate::ical::parse_all(&res.body) {
                Err(err) => {
                    log::warn!("Mock: skipping {} that does not parse: {}", href, err);
                    continue;
                },
                Ok(events) => events,
            };
            let occurrences = match occurrences_in(&events, window) {
                Err(err) => {
                    log::warn!("Mock: skipping {} that cannot be expanded: {}", href, err);
                    continue;
                },
                Ok(occurrences) => occurrences,
            };
            if occurrences.is_empty() {
                continue;
            }
            let body = match expand {
                false => res.body.clone(),
                true => crate::ical::build_series(&occurrences)?,
            };
            hits.push(RawResource::new(ResourceRef::new(Url::parse(href)?, Some(res.token.clone())), body));
        }
        Ok(hits)
    }

    async fn fetch(&self, resource: &ResourceRef) -> Result<RawResource> {
        self.check(MockBehaviour::can_fetch)?;
        let mut state = self.state()?;
        state.fetch_count += 1;
        let res = state.resources.get_mut(resource.href().as_str())
            .ok_or_else(|| Error::NotFound(resource.href().to_string()))?;
        if res.hidden_reads > 0 {
            res.hidden_reads -= 1;
            return Err(Error::NotFound(resource.href().to_string()));
        }
        Ok(RawResource::new(ResourceRef::new(resource.href().clone(), Some(res.token.clone())), res.body.clone()))
    }

    async fn put(&self, href: &Url, body: String, previous: Option<&ChangeToken>) -> Result<ResourceRef> {
        self.check(MockBehaviour::can_put)?;
        let href = href.clone();
        let mut state = self.state()?;
        let collection = state.collections.iter()
            .find(|col| href.as_str().starts_with(col.id().as_str()))
            .map(|col| col.id().clone())
            .ok_or_else(|| Error::NotFound(href.to_string()))?;
        state.put_count += 1;
        state.put_log.push((href.clone(), previous.cloned()));

        let current = state.resources.get(href.as_str()).map(|res| res.token.clone());
        match (previous, &current) {
            (Some(expected), Some(current)) if expected != current => {
                return Err(Error::Conflict { href: href.to_string(), expected: Some(expected.clone()) });
            },
            (Some(expected), None) => {
                return Err(Error::Conflict { href: href.to_string(), expected: Some(expected.clone()) });
            },
            (None, Some(_)) => log::info!("Mock: {} already exists, replacing it", href),
            _ => (),
        }

        let token = ChangeToken::random();
        let hidden_reads = state.visibility_delay;
        state.resources.insert(href.to_string(), StoredResource {
            collection: collection.clone(),
            token: token.clone(),
            body,
            hidden_reads,
        });
        state.bump_ctag(&collection);

        if state.lost_put_responses > 0 {
            state.lost_put_responses -= 1;
            return Err(Error::transport(format!("Mock: the response to the PUT of {} got lost", href)));
        }
        Ok(ResourceRef::new(href, Some(token)))
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        self.check(MockBehaviour::can_delete)?;
        let mut state = self.state()?;
        state.delete_count += 1;
        let current = match state.resources.get(resource.href().as_str()) {
            None => return Ok(()),
            Some(res) => res.token.clone(),
        };
        if let Some(expected) = resource.change_token() {
            if expected != &current {
                return Err(Error::Conflict { href: resource.href().to_string(), expected: Some(expected.clone()) });
            }
        }
        if let Some(res) = state.resources.remove(resource.href().as_str()) {
            state.bump_ctag(&res.collection);
        }
        Ok(())
    }
}



/// The sub-records of a resource that show up in `window`, with recurring masters expanded into their occurrences
fn occurrences_in(events: &[Event], window: &TimeWindow) -> Result<Vec<Event>> {
    let overridden: Vec<&EventTime> = events.iter().filter_map(|ev| ev.recurrence_anchor()).collect();
    let mut found = Vec::new();
    for event in events {
        if event.is_master() && event.rrule().is_some() {
            found.extend(recurrence::expand(event, window)?.into_iter()
                .filter(|occurrence| overridden.iter().all(|other| other.instant() != occurrence.start().instant())));
        } else if event.overlaps(window.start(), window.end()) {
            found.push(event.clone());
        }
    }
    Ok(found)
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn weekly() -> Event {
        let start = EventTime::utc(Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap());
        let end = EventTime::utc(Utc.with_ymd_and_hms(2026, 1, 2, 10, 0, 0).unwrap());
        let mut event = Event::with_uid("weekly".to_string(), "Standup".to_string(), start, end);
        event.set_rrule(Some("FREQ=WEEKLY;COUNT=10".to_string()));
        event
    }

    fn january() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        ).unwrap()
    }

    #[test]
    fn expansion() {
        let mut master = weekly();
        let occurrences = occurrences_in(std::slice::from_ref(&master), &january()).unwrap();
        // Jan 2, 9, 16, 23, 30
        assert_eq!(occurrences.len(), 5);
        assert!(occurrences.iter().all(|occ| occ.recurrence_anchor().is_some() && occ.rrule().is_none()));

        master.add_exception_date(EventTime::utc(Utc.with_ymd_and_hms(2026, 1, 16, 9, 0, 0).unwrap()));
        assert_eq!(occurrences_in(std::slice::from_ref(&master), &january()).unwrap().len(), 4);

        // An overridden occurrence is replaced by its override
        let mut moved = weekly();
        moved.set_rrule(None);
        moved.set_recurrence_anchor(Some(EventTime::utc(Utc.with_ymd_and_hms(2026, 1, 23, 9, 0, 0).unwrap())));
        moved.set_start(EventTime::utc(Utc.with_ymd_and_hms(2026, 1, 23, 14, 0, 0).unwrap()));
        moved.set_end(EventTime::utc(Utc.with_ymd_and_hms(2026, 1, 23, 15, 0, 0).unwrap()));
        let occurrences = occurrences_in(&[master, moved], &january()).unwrap();
        assert_eq!(occurrences.len(), 4);
        assert!(occurrences.iter().any(|occ| occ.start().instant() == Utc.with_ymd_and_hms(2026, 1, 23, 14, 0, 0).unwrap()));

        let mut monthly = weekly();
        monthly.set_rrule(Some("FREQ=MONTHLY;BYMONTHDAY=2,20".to_string()));
        assert_eq!(occurrences_in(&[monthly], &january()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn writes() {
        let remote = MockRemote::new();
        let work = remote.add_collection("https://mock.example.com/alice/work/", "Work").unwrap();
        let ctag = remote.list_collections().await.unwrap()[0].ctag().cloned();

        let body = crate::ical::build_from(&weekly()).unwrap();
        let href = href_for_uid(&work, "weekly").unwrap();
        let created = remote.put(&href, body.clone(), None).await.unwrap();
        assert_ne!(remote.list_collections().await.unwrap()[0].ctag().cloned(), ctag);

        // A stale token is refused
        let stale = ChangeToken::from("stale");
        assert!(matches!(remote.put(&href, body.clone(), Some(&stale)).await, Err(Error::Conflict{..})));
        let updated = remote.put(&href, body, created.change_token()).await.unwrap();
        assert_ne!(updated.change_token(), created.change_token());

        remote.delete(&updated).await.unwrap();
        remote.delete(&updated).await.unwrap();
        assert_eq!(remote.resource_count(&work).unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_visibility() {
        let remote = MockRemote::new();
        let work = remote.add_collection("https://mock.example.com/alice/work/", "Work").unwrap();
        remote.delay_visibility(2).unwrap();
        let body = crate::ical::build_from(&weekly()).unwrap();
        let created = remote.put(&href_for_uid(&work, "weekly").unwrap(), body, None).await.unwrap();

        assert!(remote.list_resources(&work).await.unwrap().is_empty());
        assert!(matches!(remote.fetch(&created).await, Err(Error::NotFound(_))));
        assert!(remote.fetch(&created).await.is_ok());
        assert_eq!(remote.list_resources(&work).await.unwrap().len(), 1);
    }
}
