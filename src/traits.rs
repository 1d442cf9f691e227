//! Traits used by the sync engine to reach both ends of a sync: the remote store and the local store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::calendar::{CalendarId, Collection};
use crate::calendar::preference::CollectionPreference;
use crate::error::Result;
use crate::event::Event;
use crate::item::{ChangeToken, LocalRow, RowId, SyncOrigin, SyncRecord, UpsertKind};
use crate::resource::{RawResource, ResourceRef};
use crate::window::TimeWindow;

/// A remote calendar store (usually a CalDAV server)
///
/// Implementors do not retry anything: retrying transient failures is the caller's business.
#[async_trait]
pub trait CalDavSource: Send + Sync {
    /// Returns the calendars that the authenticated principal can reach
    async fn list_collections(&self) -> Result<Vec<Collection>>;

    /// Returns the current change token of every resource of a collection, without their bodies
    async fn list_resources(&self, collection: &CalendarId) -> Result<Vec<ResourceRef>>;

    /// Returns the resources that overlap `window`.
    ///
    /// With `expand`, the server materializes every occurrence of recurring series inside the window
    async fn search(&self, collection: &CalendarId, window: &TimeWindow, expand: bool) -> Result<Vec<RawResource>>;

    /// Retrieves a resource body and its current change token
    async fn fetch(&self, resource: &ResourceRef) -> Result<RawResource>;

    /// Creates (`previous` is `None`) or replaces (`previous` is the last known token) the resource at `href`.
    ///
    /// New resources are put at [`href_for_uid`](crate::resource::href_for_uid), which only depends on their uid.
    /// Creating again a resource that already exists replaces it, so that retrying a create that has not been acknowledged never makes a duplicate.
    async fn put(&self, href: &Url, body: String, previous: Option<&ChangeToken>) -> Result<ResourceRef>;

    /// Removes a resource. Deleting a resource that does not exist is not an error
    async fn delete(&self, resource: &ResourceRef) -> Result<()>;
}

/// The local store the remote store is mirrored to.
///
/// Every call is expected to be atomic.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert or replace the row of `event.uid()` in `collection`, coming from a pull. The row is clean afterwards
    async fn upsert_event(&mut self, collection: &CalendarId, event: Event) -> Result<(RowId, UpsertKind)>;

    /// Record that `row` has been pushed (or pulled) as `resource`.
    ///
    /// `revision` is the row revision that has been sent. If the row has been edited since then, the token is recorded but the row stays dirty.
    /// A resource that has been pushed before any listing showed it is recorded as [`awaiting_listing`](SyncRecord::awaiting_listing).
    async fn mark_synced(&mut self, row: RowId, resource: &ResourceRef, at: DateTime<Utc>, revision: u64, origin: SyncOrigin) -> Result<()>;

    /// Record that a listing of the server has shown the resources of these rows
    async fn mark_listed(&mut self, rows: &[RowId]) -> Result<()>;

    /// Rows that have been created, edited or deleted since their last push
    async fn list_dirty_rows(&self, collection: &CalendarId) -> Result<Vec<LocalRow>>;

    async fn row(&self, row: RowId) -> Result<Option<LocalRow>>;

    /// The row of `uid` in `collection`, if any
    async fn row_by_uid(&self, collection: &CalendarId, uid: &str) -> Result<Option<LocalRow>>;

    /// Every sync record of a collection
    async fn sync_records(&self, collection: &CalendarId) -> Result<Vec<SyncRecord>>;

    async fn sync_record(&self, row: RowId) -> Result<Option<SyncRecord>>;

    /// Remove a row and its sync record
    async fn remove_row(&mut self, row: RowId) -> Result<()>;

    /// Get the preference of a collection, creating it if this is the first time we see it
    async fn collection_preference(&mut self, collection: &Collection, hidden_prefixes: &[String]) -> Result<CollectionPreference>;

    async fn set_collection_preference(&mut self, preference: CollectionPreference) -> Result<()>;

    /// The collection change token seen at the last complete listing
    async fn collection_ctag(&self, collection: &CalendarId) -> Result<Option<ChangeToken>>;

    async fn set_collection_ctag(&mut self, collection: &CalendarId, ctag: Option<ChangeToken>) -> Result<()>;
}

pub trait SyncSlave {
    /// Returns the last time this source successfully synced from a master source (e.g. from a server)
    /// (or None in case it has never been synchronized)
    fn get_last_sync(&self) -> Option<DateTime<Utc>>;
    /// Update the last sync timestamp to now, or to a custom time in case `timepoint` is `Some`
    fn update_last_sync(&mut self, timepoint: Option<DateTime<Utc>>);
}
