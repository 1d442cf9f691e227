//! This modules merges the local store and the remote store into a single virtual one
//!
//! It is also responsible for syncing them together

use std::sync::Arc;

use chrono::{Duration, Utc};
use itertools::Itertools;
use tokio::sync::{Mutex, MutexGuard};
use url::Url;

use crate::calendar::{CalendarId, Collection};
use crate::calendar::preference::{CollectionPreference, CollectionView};
use crate::config::SyncSettings;
use crate::detector::{diff_listing, ChangeSet};
use crate::error::{Error, Result};
use crate::event::{Event, EventTime};
use crate::item::{RowId, SyncOrigin, SyncRecord, SyncStatus, UpsertKind};
use crate::mirror::Mirror;
use crate::occurrence::{RequestedOccurrence, Resolution};
use crate::resource::{href_for_uid, RawResource, ResourceRef};
use crate::traits::{CalDavSource, LocalStore, SyncSlave};
use crate::window::TimeWindow;

pub mod sync_progress;
use sync_progress::{FeedbackSender, SyncEvent, SyncPhase, SyncProgress, SyncReport};
pub mod retry;
use retry::RetryPolicy;
pub mod push;
use push::{push_row, PushOutcome};
pub mod read_path;
use read_path::ReadPath;
pub mod background;
use background::Propagator;

/// How many resources are downloaded between two progress feedbacks
#[cfg(not(test))]
const DOWNLOAD_BATCH_SIZE: usize = 30;
/// How many resources are downloaded between two progress feedbacks
#[cfg(test)]
const DOWNLOAD_BATCH_SIZE: usize = 3;


/// The result of [`Provider::create_event`]
#[derive(Clone, Debug, PartialEq)]
pub enum CreateOutcome {
    /// The event has been read back, and is stored locally
    Confirmed { row: RowId, resource: ResourceRef },
    /// The server accepted the event, but did not show it yet. The next sync will pick it up
    Accepted { uid: String, href: Url },
}

/// The result of [`Provider::remove_occurrence`]
#[derive(Clone, Debug, PartialEq)]
pub enum OccurrenceRemoval {
    /// The rest of the series has been written back
    Rewritten(ResourceRef),
    /// No occurrence was left, the whole resource has been deleted
    ResourceDeleted,
}

/// What the Diffing phase decided for one collection
struct CollectionPlan {
    collection: Collection,
    changes: ChangeSet<SyncRecord, ResourceRef>,
    /// Whether `changes` comes from a complete listing (rather than from an unchanged collection token)
    listed: bool,
}



/// A data source that combines a local store and a remote store, and is able to sync both.
///
/// In case of conflicts (the same event has been modified on both ends since the last sync), `remote` always wins.
pub struct Provider<L, R>
where
    L: LocalStore + SyncSlave,
    R: CalDavSource,
{
    /// The remote source (usually a server)
    remote: Arc<R>,
    /// The local store
    local: Arc<Mutex<L>>,
    /// A fast read path, if there is one
    mirror: Option<Arc<dyn Mirror>>,

    settings: SyncSettings,
    retry: RetryPolicy,
}

impl<L, R> Provider<L, R>
where
    L: LocalStore + SyncSlave,
    R: CalDavSource,
{
    /// Create a provider.
    ///
    /// `remote` is usually a [`Client`](crate::client::Client), `local` is usually a [`Cache`](crate::cache::Cache).
    pub fn new(remote: R, local: L, settings: SyncSettings) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self {
            remote: Arc::new(remote),
            local: Arc::new(Mutex::new(local)),
            mirror: None,
            settings,
            retry,
        }
    }

    /// Serve reads from `mirror`. Writes still go to the remote store
    pub fn with_mirror(mut self, mirror: Arc<dyn Mirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Returns the local store. It is locked until the guard is dropped
    pub async fn local(&self) -> MutexGuard<'_, L> { self.local.lock().await }
    /// A shared handle on the local store, for tasks that outlive this borrow (see [`Provider::propagator`])
    pub fn local_handle(&self) -> Arc<Mutex<L>>    { self.local.clone() }
    /// Returns the remote store.
    ///
    /// Apart from tests, there are very few (if any) reasons to access `remote` directly.
    pub fn remote(&self) -> &R                     { &self.remote }
    /// The settings this provider has been built with
    pub fn settings(&self) -> &SyncSettings        { &self.settings }

    fn read_path(&self) -> ReadPath<'_, R> {
        ReadPath::new(self.mirror.as_deref(), self.remote.as_ref())
    }


    /// Performs a synchronisation between `local` and `remote`, and provide feeedback to the user about the progress.
    ///
    /// Dirty local rows are pushed, and changed remote resources are pulled. Only resources whose change token moved are downloaded.
    ///
    /// Errors that only affect a collection or a resource are collected in the returned report, and the sync goes on.
    /// Only fatal errors (e.g. rejected credentials) are returned as `Err`.
    /// In case errors happened, the sync might have been partially executed. Simply run this function again, it will pick up where it failed.
    pub async fn sync_with_feedback(&self, feedback_sender: FeedbackSender) -> Result<SyncReport> {
        let progress = SyncProgress::new_with_feedback_channel(feedback_sender);
        self.run_sync(progress).await
    }

    /// Performs a synchronisation between `local` and `remote`, without giving any feedback.
    ///
    /// See [`Self::sync_with_feedback`]
    pub async fn sync(&self) -> Result<SyncReport> {
        self.run_sync(SyncProgress::new()).await
    }

    async fn run_sync(&self, mut progress: SyncProgress) -> Result<SyncReport> {
        progress.info("Starting a sync.");
        progress.feedback(SyncEvent::Started);
        progress.enter(SyncPhase::Start);

        if let Err(err) = self.run_sync_inner(&mut progress).await {
            log::error!("Sync terminated because of an error: {}", err);
            progress.feedback(SyncEvent::Finished{ success: false });
            return Err(err);
        }

        let success = progress.is_success();
        progress.enter(if success { SyncPhase::Completed } else { SyncPhase::CompletedWithErrors });
        progress.feedback(SyncEvent::Finished{ success });
        let report = progress.into_report();
        log::info!("Sync finished. {}", report);
        Ok(report)
    }

    /// Only returns fatal errors
    async fn run_sync_inner(&self, progress: &mut SyncProgress) -> Result<()> {
        progress.enter(SyncPhase::Listing);
        let collections = match self.retry.run("list collections", || self.remote.list_collections()).await {
            Ok(collections) => collections,
            Err(err) => {
                absorb(progress, None, None, err)?;
                return Ok(());
            },
        };
        let enabled = self.enabled_collections(collections, progress).await?;

        progress.enter(SyncPhase::Diffing);
        let mut plans = Vec::new();
        for collection in enabled {
            let id = collection.id().clone();
            match self.diff_collection(collection, progress).await {
                Ok(plan) => plans.push(plan),
                Err(err) => {
                    progress.warn(&format!("Skipping {} for this sync", id));
                    absorb(progress, Some(&id), None, err)?;
                },
            }
        }

        progress.enter(SyncPhase::Pulling);
        for plan in &plans {
            self.pull_collection(plan, progress).await?;
        }

        progress.enter(SyncPhase::Pushing);
        for plan in &plans {
            self.push_collection(plan.collection.id(), progress).await?;
        }

        progress.enter(SyncPhase::Finalizing);
        self.local.lock().await.update_last_sync(None);
        Ok(())
    }

    /// The collections the sync should care about
    async fn enabled_collections(&self, collections: Vec<Collection>, progress: &mut SyncProgress) -> Result<Vec<Collection>> {
        let mut local = self.local.lock().await;
        let mut enabled = Vec::new();
        for collection in collections {
            let preference = match local.collection_preference(&collection, &self.settings.hidden_prefixes).await {
                Ok(preference) => preference,
                Err(err) => {
                    absorb(progress, Some(collection.id()), None, err)?;
                    continue;
                },
            };
            if self.settings.include_all || preference.is_enabled {
                enabled.push(collection);
            } else {
                progress.debug(&format!("Skipping disabled calendar {}", collection.display_name()));
            }
        }
        Ok(enabled)
    }

    async fn diff_collection(&self, collection: Collection, progress: &mut SyncProgress) -> Result<CollectionPlan> {
        let id = collection.id().clone();
        let (records, known_ctag) = {
            let local = self.local.lock().await;
            (local.sync_records(&id).await?, local.collection_ctag(&id).await?)
        };

        if collection.ctag().is_some() && collection.ctag() == known_ctag.as_ref() {
            progress.debug(&format!("{} has not changed since the last sync", collection.display_name()));
            let unchanged = records.into_iter()
                .map(|record| {
                    let resource = ResourceRef::new(record.remote_href.clone(), record.remote_change_token.clone());
                    (record, resource)
                })
                .collect();
            let changes = ChangeSet { unchanged, changed: Vec::new(), new: Vec::new(), missing: Vec::new(), duplicates: Vec::new() };
            return Ok(CollectionPlan { collection, changes, listed: false });
        }

        let listing = self.retry.run("list resources", || self.remote.list_resources(&id)).await?;
        let changes = diff_listing(records, listing);
        progress.debug(&format!("{}: {} unchanged, {} changed, {} new, {} gone",
            collection.display_name(), changes.unchanged.len(), changes.changed.len(), changes.new.len(), changes.missing.len()));
        Ok(CollectionPlan { collection, changes, listed: true })
    }

    async fn pull_collection(&self, plan: &CollectionPlan, progress: &mut SyncProgress) -> Result<()> {
        let id = plan.collection.id();
        let name = plan.collection.display_name().to_string();
        progress.report_mut().unchanged += plan.changes.unchanged.len();
        progress.report_mut().duplicates.extend(plan.changes.duplicates.iter().cloned());
        let mut complete = true;

        let to_fetch = plan.changes.changed.iter()
            .map(|(_, resource)| resource)
            .chain(plan.changes.new.iter())
            .collect_vec();
        let mut downloaded = 0;
        for batch in to_fetch.chunks(DOWNLOAD_BATCH_SIZE) {
            for resource in batch {
                downloaded += 1;
                if let Err(err) = self.pull_resource(id, resource, progress).await {
                    complete = false;
                    absorb(progress, Some(id), Some(resource.href().as_str()), err)?;
                }
            }
            progress.feedback(SyncEvent::InProgress{
                calendar: name.clone(),
                details: format!("{}/{} remote changes", downloaded, plan.changes.to_fetch()),
            });
        }

        if plan.listed {
            let now_listed = plan.changes.unchanged.iter()
                .filter(|(record, _)| record.awaiting_listing)
                .map(|(record, _)| record.row)
                .collect_vec();
            if now_listed.is_empty() == false {
                progress.debug(&format!("{} of our own writes now show up in {}", now_listed.len(), name));
                if let Err(err) = self.local.lock().await.mark_listed(&now_listed).await {
                    absorb(progress, Some(id), None, err)?;
                }
            }
        }

        if plan.listed && self.settings.apply_remote_deletions {
            for record in &plan.changes.missing {
                if record.awaiting_listing {
                    // The server has not caught up with our own write yet
                    progress.debug(&format!("{} is not listed by the server yet, keeping it", record.uid));
                    complete = false;
                    continue;
                }
                if let Err(err) = self.apply_remote_deletion(record, progress).await {
                    complete = false;
                    absorb(progress, Some(id), Some(record.uid.as_str()), err)?;
                }
            }
        }

        // A failed download must be retried, even if the collection does not change anymore
        if plan.listed && complete {
            let result = self.local.lock().await.set_collection_ctag(id, plan.collection.ctag().cloned()).await;
            if let Err(err) = result {
                absorb(progress, Some(id), None, err)?;
            }
        }
        Ok(())
    }

    async fn pull_resource(&self, collection: &CalendarId, resource: &ResourceRef, progress: &mut SyncProgress) -> Result<()> {
        progress.trace(&format!("Downloading {}", resource.href()));
        progress.report_mut().fetches += 1;
        let raw = self.retry.run("fetch", || self.remote.fetch(resource)).await?;
        let mut event = crate::ical::parse(&raw.body)?;
        event.set_change_token(raw.change_token().cloned());
        let uid = event.uid().to_string();

        let mut local = self.local.lock().await;
        if let Some(existing) = local.row_by_uid(collection, &uid).await? {
            if existing.is_dirty() {
                progress.warn(&format!("{} has changed both locally and on the server, keeping the server version", uid));
                progress.report_mut().conflicts.push(uid.clone());
            }
        }

        let (row, kind) = local.upsert_event(collection, event).await?;
        let revision = local.row(row).await?.map(|r| r.revision).unwrap_or_default();
        local.mark_synced(row, &raw.reference, Utc::now(), revision, SyncOrigin::Pulled).await?;
        match kind {
            UpsertKind::Created => progress.report_mut().created += 1,
            UpsertKind::Updated => progress.report_mut().updated += 1,
        }
        Ok(())
    }

    async fn apply_remote_deletion(&self, record: &SyncRecord, progress: &mut SyncProgress) -> Result<()> {
        let mut local = self.local.lock().await;
        if let Some(row) = local.row(record.row).await? {
            if row.is_dirty() && row.sync_status != SyncStatus::LocallyDeleted {
                progress.warn(&format!("{} has been deleted on the server but edited locally, deleting it anyway", record.uid));
                progress.report_mut().conflicts.push(record.uid.clone());
            }
        }
        progress.debug(&format!("{} has been deleted on the server", record.uid));
        local.remove_row(record.row).await?;
        progress.report_mut().deleted += 1;
        Ok(())
    }

    async fn push_collection(&self, collection: &CalendarId, progress: &mut SyncProgress) -> Result<()> {
        let dirty = match self.local.lock().await.list_dirty_rows(collection).await {
            Ok(dirty) => dirty,
            Err(err) => return absorb(progress, Some(collection), None, err),
        };
        for row in dirty {
            match push_row(self.local.as_ref(), self.remote.as_ref(), &self.retry, row.id).await {
                Ok(PushOutcome::Uploaded(_)) => progress.report_mut().pushed += 1,
                Ok(PushOutcome::Deleted) => progress.report_mut().remote_deleted += 1,
                Ok(PushOutcome::Skipped) => (),
                Err(err) => absorb(progress, Some(collection), Some(row.uid()), err)?,
            }
        }
        Ok(())
    }


    /// Push a single row right now, and wait for the outcome
    pub async fn push_now(&self, row: RowId) -> Result<PushOutcome> {
        push_row(self.local.as_ref(), self.remote.as_ref(), &self.retry, row).await
    }

    /// The collections of the remote store, with the way the user wants to see them
    pub async fn list_collections(&self) -> Result<Vec<CollectionView>> {
        let collections = self.read_path().collections().await?;
        let mut local = self.local.lock().await;
        let mut views = Vec::with_capacity(collections.len());
        for collection in collections {
            let preference = local.collection_preference(&collection, &self.settings.hidden_prefixes).await?;
            views.push(CollectionView { collection, preference });
        }
        Ok(views)
    }

    /// Change how the user wants to see a collection. The sync engine never does this by itself
    pub async fn set_collection_preference(&self, preference: CollectionPreference) -> Result<()> {
        self.local.lock().await.set_collection_preference(preference).await
    }

    /// The events of the enabled collections that overlap `window`.
    ///
    /// Resources that cannot be read are skipped (and logged). Recurring series are not expanded.
    pub async fn events_in(&self, window: &TimeWindow) -> Result<Vec<(CalendarId, Event)>> {
        let read = self.read_path();
        let mut events = Vec::new();
        for view in self.list_collections().await? {
            if self.settings.include_all == false && view.is_enabled() == false {
                continue;
            }
            let hits = match read.search(view.id(), window).await {
                Ok(hits) => hits,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::warn!("Unable to search {}: {}", view.name(), err);
                    continue;
                },
            };
            for raw in hits {
                match crate::ical::parse_all(&raw.body) {
                    Ok(decoded) => {
                        for mut event in decoded {
                            event.set_change_token(raw.change_token().cloned());
                            events.push((view.id().clone(), event));
                        }
                    },
                    Err(err) => log::warn!("Skipping {}: {}", raw.href(), err),
                }
            }
        }
        Ok(events)
    }

    /// Create an event on the server, then try to read it back.
    ///
    /// Some servers apply writes asynchronously: the event is looked up a few times, and if it never shows up,
    /// [`CreateOutcome::Accepted`] is returned instead of waiting any longer.
    pub async fn create_event(&self, collection: &CalendarId, event: Event) -> Result<CreateOutcome> {
        let href = href_for_uid(collection, event.uid())?;
        let body = crate::ical::build_from(&event)?;
        let written = self.retry.run("create", || self.remote.put(&href, body.clone(), None)).await?;
        log::info!("Created {} at {}", event.uid(), written.href());

        let read = self.read_path();
        for attempt in 0..self.settings.confirm_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.confirm_delay()).await;
            }
            match read.find(collection, event.uid(), written.href()).await {
                Ok(Some(raw)) => {
                    let row = self.store_synced(collection, event, &raw.reference).await?;
                    return Ok(CreateOutcome::Confirmed { row, resource: raw.reference });
                },
                Ok(None) => log::debug!("{} is not visible yet (attempt {})", event.uid(), attempt + 1),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => log::warn!("Unable to read {} back: {}", event.uid(), err),
            }
        }

        log::info!("{} has been accepted but is not visible yet", event.uid());
        Ok(CreateOutcome::Accepted { uid: event.uid().to_string(), href: written.href().clone() })
    }

    /// Remove a single occurrence of the series `uid`, leaving the rest of the series alone.
    ///
    /// `requested` is matched against the sub-records of the resource (see [`crate::occurrence::matches`]),
    /// and against the occurrences the server generates from the series rule. No match, or several matches, are errors.
    pub async fn remove_occurrence(&self, collection: &CalendarId, uid: &str, requested: &RequestedOccurrence) -> Result<OccurrenceRemoval> {
        let zone = self.settings.reference_zone();
        let href = self.locate(collection, uid).await?;
        let reference = ResourceRef::new(href, None);
        let raw = self.retry.run("fetch", || self.remote.fetch(&reference)).await?;
        let events = crate::ical::parse_all(&raw.body)?;

        let expanded = match events.iter().any(|ev| ev.is_master() && ev.rrule().is_some()) {
            true => self.expanded_occurrences(collection, &events, requested, &zone).await,
            false => Vec::new(),
        };

        match crate::occurrence::remove_occurrence(events, requested, &zone, &expanded)? {
            Resolution::Rewrite(events) => {
                let body = crate::ical::build_series(&events)?;
                let reference = self.retry.run("put", || self.remote.put(raw.href(), body.clone(), raw.change_token())).await?;
                log::info!("Removed the occurrence {} of {}", requested, uid);

                let master = events.iter().find(|ev| ev.is_master()).or_else(|| events.first()).cloned();
                if let Some(master) = master {
                    self.store_synced(collection, master, &reference).await?;
                }
                Ok(OccurrenceRemoval::Rewritten(reference))
            },
            Resolution::DeleteResource => {
                self.retry.run("delete", || self.remote.delete(&raw.reference)).await?;
                log::info!("Removed the last occurrence of {}, the resource is gone", uid);

                let mut local = self.local.lock().await;
                if let Some(row) = local.row_by_uid(collection, uid).await? {
                    local.remove_row(row.id).await?;
                }
                Ok(OccurrenceRemoval::ResourceDeleted)
            },
        }
    }

    /// Where the resource of `uid` lives
    async fn locate(&self, collection: &CalendarId, uid: &str) -> Result<Url> {
        {
            let local = self.local.lock().await;
            if let Some(row) = local.row_by_uid(collection, uid).await? {
                if let Some(record) = local.sync_record(row.id).await? {
                    return Ok(record.remote_href);
                }
            }
        }
        if let Some(mirror) = &self.mirror {
            if let Some(raw) = mirror.find_uid(collection, uid).await? {
                return Ok(raw.href().clone());
            }
        }
        href_for_uid(collection, uid)
    }

    /// The occurrences the server generates for `uid` around the requested one
    async fn expanded_occurrences(&self, collection: &CalendarId, events: &[Event], requested: &RequestedOccurrence, zone: &chrono_tz::Tz) -> Vec<EventTime> {
        let window = TimeWindow::around(requested.approximate_instant(zone), Duration::days(1), Duration::days(1));
        let master = match events.iter().find(|ev| ev.is_master() && ev.rrule().is_some()) {
            None => return Vec::new(),
            Some(master) => master,
        };
        match self.retry.run("expanded search", || self.remote.search(collection, &window, true)).await {
            Ok(hits) => hits.iter()
                .flat_map(|hit: &RawResource| crate::ical::parse_all(&hit.body).unwrap_or_default())
                .filter(|ev| ev.uid() == master.uid())
                .map(|ev| ev.recurrence_anchor().cloned().unwrap_or_else(|| ev.start().clone()))
                .collect(),
            Err(err) => {
                log::warn!("The server did not expand {} around {} ({}), expanding it locally", master.uid(), requested, err);
                crate::recurrence::occurrence_starts(master, window.start(), window.end())
                    .unwrap_or_else(|err| {
                        log::warn!("{}", err);
                        Vec::new()
                    })
            },
        }
    }

    /// Store `event` as a clean row, synced with `resource`
    async fn store_synced(&self, collection: &CalendarId, mut event: Event, resource: &ResourceRef) -> Result<RowId> {
        event.set_change_token(resource.change_token().cloned());
        let mut local = self.local.lock().await;
        let (row, _) = local.upsert_event(collection, event).await?;
        let revision = local.row(row).await?.map(|r| r.revision).unwrap_or_default();
        local.mark_synced(row, resource, Utc::now(), revision, SyncOrigin::Pushed).await?;
        Ok(row)
    }
}

impl<L, R> Provider<L, R>
where
    L: LocalStore + SyncSlave + 'static,
    R: CalDavSource + 'static,
{
    /// Start pushing edited rows in the background, as configured
    pub fn propagator(&self) -> Propagator {
        Propagator::start(
            self.local.clone(),
            self.remote.clone(),
            self.retry.clone(),
            self.settings.queue_capacity,
            self.settings.queue_concurrency,
        )
    }
}

/// Keep a non-fatal error for the report, or give up on the whole pass
fn absorb(progress: &mut SyncProgress, collection: Option<&CalendarId>, resource: Option<&str>, err: Error) -> Result<()> {
    if err.is_fatal() {
        return Err(err);
    }
    progress.error(collection, resource, err);
    Ok(())
}
