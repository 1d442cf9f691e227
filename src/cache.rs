//! This module provides a local cache for CalDAV data
//!
//! This is the reference [`LocalStore`]: one JSON file per user, rewritten after every change.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::calendar::{CalendarId, Collection};
use crate::calendar::preference::CollectionPreference;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::item::{ChangeToken, LocalRow, RowId, SyncOrigin, SyncRecord, SyncStatus, UpsertKind};
use crate::resource::ResourceRef;
use crate::traits::{LocalStore, SyncSlave};


/// A local store that keeps its rows in a local file
#[derive(Debug, PartialEq)]
pub struct Cache {
    /// `None` for caches that only live in memory
    backing_folder: Option<PathBuf>,
    user: String,
    data: CachedData,
}

#[derive(Default, Debug, PartialEq, Serialize, Deserialize)]
struct CachedData {
    next_row: u64,
    rows: BTreeMap<u64, LocalRow>,
    /// Keyed by row
    records: BTreeMap<u64, SyncRecord>,
    /// In observation order
    preferences: Vec<CollectionPreference>,
    ctags: HashMap<String, ChangeToken>,
    last_sync: Option<DateTime<Utc>>,
}

impl Cache {
    /// Get the path to the cache file of `user` in `folder`
    pub fn cache_file(folder: &Path, user: &str) -> PathBuf {
        folder.join(format!("{}.json", sanitize_filename::sanitize(user)))
    }

    /// Initialize a cache from the content of a valid backing file if it exists.
    /// Returns an error otherwise
    pub fn from_folder(folder: &Path, user: &str) -> Result<Self> {
        let path = Self::cache_file(folder, user);
        let data = match std::fs::File::open(&path) {
            Err(err) => {
                return Err(Error::Storage(format!("Unable to open file {:?}: {}", path, err)));
            },
            Ok(file) => serde_json::from_reader(file)?,
        };

        Ok(Self{
            backing_folder: Some(PathBuf::from(folder)),
            user: user.to_string(),
            data,
        })
    }

    /// Initialize a cache with the default contents
    pub fn new(folder: &Path, user: &str) -> Self {
        Self{
            backing_folder: Some(PathBuf::from(folder)),
            user: user.to_string(),
            data: CachedData::default(),
        }
    }

    /// Open the cache of `user`, or start an empty one if there is none yet
    pub fn open(folder: &Path, user: &str) -> Result<Self> {
        if Self::cache_file(folder, user).exists() {
            Self::from_folder(folder, user)
        } else {
            log::info!("No cache for {} yet in {:?}, starting an empty one", user, folder);
            Ok(Self::new(folder, user))
        }
    }

    /// A cache that is never written to disk
    pub fn in_memory(user: &str) -> Self {
        Self { backing_folder: None, user: user.to_string(), data: CachedData::default() }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Store the current Cache to its backing folder
    pub fn save_to_folder(&self) -> Result<()> {
        let folder = match &self.backing_folder {
            None => return Ok(()),
            Some(folder) => folder,
        };
        std::fs::create_dir_all(folder)?;

        // Write aside then rename, so that a crash never leaves a truncated file
        let path = Self::cache_file(folder, &self.user);
        let tmp_path = path.with_extension("json.tmp");
        let file = std::fs::File::create(&tmp_path)?;
        serde_json::to_writer(file, &self.data)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn row_mut(&mut self, row: RowId) -> Result<&mut LocalRow> {
        self.data.rows.get_mut(&row.0)
            .ok_or_else(|| Error::Storage(format!("{} does not exist", row)))
    }

    /// Returns the row of `uid` in `collection`, if any
    pub fn find_row(&self, collection: &CalendarId, uid: &str) -> Option<&LocalRow> {
        self.data.rows.values()
            .find(|row| &row.collection == collection && row.uid() == uid)
    }

    /// Every row of a collection, including the ones that are marked for deletion
    pub fn rows(&self, collection: &CalendarId) -> Vec<&LocalRow> {
        self.data.rows.values()
            .filter(|row| &row.collection == collection)
            .collect()
    }

    /// The events of a collection, as the user sees them
    pub fn events(&self, collection: &CalendarId) -> Vec<&Event> {
        self.rows(collection).into_iter()
            .filter(|row| row.sync_status != SyncStatus::LocallyDeleted)
            .map(|row| &row.event)
            .collect()
    }


    /// Add a locally created event. It will be pushed at the next sync
    pub fn create_local_event(&mut self, collection: &CalendarId, event: Event) -> Result<RowId> {
        if self.find_row(collection, event.uid()).is_some() {
            return Err(Error::InvalidInput(format!("{} already exists in {}", event.uid(), collection)));
        }
        let id = self.insert_row(collection, event, SyncStatus::NotSynced);
        self.save_to_folder()?;
        Ok(id)
    }

    /// Replace the event of a row with a locally edited version.
    ///
    /// The sequence number is incremented, and the row is marked as modified
    pub fn update_local_event(&mut self, row: RowId, mut event: Event) -> Result<()> {
        let local = self.row_mut(row)?;
        if local.uid() != event.uid() {
            return Err(Error::InvalidInput(format!("{} cannot change its uid to {}", row, event.uid())));
        }
        local.sync_status = match local.sync_status {
            SyncStatus::NotSynced => SyncStatus::NotSynced,
            SyncStatus::Synced | SyncStatus::LocallyModified => SyncStatus::LocallyModified,
            SyncStatus::LocallyDeleted => {
                return Err(Error::InvalidInput(format!("{} has been deleted", row)));
            },
        };
        event.set_sequence(local.event.sequence() + 1);
        event.set_change_token(local.event.change_token().cloned());
        event.set_last_modified(Some(Utc::now()));
        local.event = event;
        local.revision += 1;
        self.save_to_folder()
    }

    /// Delete a row. Rows that have never been pushed disappear at once, the others are deleted from the server at the next sync
    pub fn mark_for_deletion(&mut self, row: RowId) -> Result<()> {
        let status = self.row_mut(row)?.sync_status;
        let pushed = self.data.records.contains_key(&row.0);
        match status {
            SyncStatus::NotSynced if pushed == false => {
                log::debug!("{} has never been synced, removing it right away", row);
                self.data.rows.remove(&row.0);
                self.data.records.remove(&row.0);
            },
            _ => {
                let local = self.row_mut(row)?;
                local.sync_status = SyncStatus::LocallyDeleted;
                local.revision += 1;
            },
        }
        self.save_to_folder()
    }

    fn insert_row(&mut self, collection: &CalendarId, event: Event, sync_status: SyncStatus) -> RowId {
        self.data.next_row += 1;
        let id = RowId(self.data.next_row);
        self.data.rows.insert(id.0, LocalRow {
            id,
            collection: collection.clone(),
            event,
            sync_status,
            revision: 1,
        });
        id
    }

    /// Compares two Caches to check they have the same current content
    ///
    /// This is not a complete equality test: row ids, stamps and tokens may differ
    pub fn has_same_observable_content_as(&self, other: &Self) -> bool {
        let mut left: Vec<(&CalendarId, &Event)> = self.data.rows.values().map(|r| (&r.collection, &r.event)).collect();
        let mut right: Vec<(&CalendarId, &Event)> = other.data.rows.values().map(|r| (&r.collection, &r.event)).collect();
        if left.len() != right.len() {
            log::debug!("Count of rows mismatch: {} and {}", left.len(), right.len());
            return false;
        }
        left.sort_by(|a, b| (a.0.as_str(), a.1.uid()).cmp(&(b.0.as_str(), b.1.uid())));
        right.sort_by(|a, b| (a.0.as_str(), a.1.uid()).cmp(&(b.0.as_str(), b.1.uid())));

        left.iter().zip(right.iter())
            .all(|((cal_l, ev_l), (cal_r, ev_r))| cal_l == cal_r && ev_l.has_same_observable_content_as(ev_r))
    }
}

#[async_trait]
impl LocalStore for Cache {
    async fn upsert_event(&mut self, collection: &CalendarId, event: Event) -> Result<(RowId, UpsertKind)> {
        let existing = self.find_row(collection, event.uid()).map(|row| row.id);
        let result = match existing {
            Some(id) => {
                let row = self.row_mut(id)?;
                row.event = event;
                row.sync_status = SyncStatus::Synced;
                row.revision += 1;
                (id, UpsertKind::Updated)
            },
            None => (self.insert_row(collection, event, SyncStatus::Synced), UpsertKind::Created),
        };
        self.save_to_folder()?;
        Ok(result)
    }

    async fn mark_synced(&mut self, row: RowId, resource: &ResourceRef, at: DateTime<Utc>, revision: u64, origin: SyncOrigin) -> Result<()> {
        let awaiting_listing = match origin {
            SyncOrigin::Pulled => false,
            SyncOrigin::Pushed => self.data.records.get(&row.0).map(|previous| previous.awaiting_listing).unwrap_or(true),
        };
        let local = self.row_mut(row)?;
        local.event.set_change_token(resource.change_token().cloned());
        if local.revision == revision {
            local.sync_status = SyncStatus::Synced;
        } else {
            log::debug!("{} has been edited while it was pushed, it stays dirty", row);
        }
        let record = SyncRecord {
            row,
            uid: local.uid().to_string(),
            remote_href: resource.href().clone(),
            remote_change_token: resource.change_token().cloned(),
            last_synced_at: at,
            awaiting_listing,
        };
        self.data.records.insert(row.0, record);
        self.save_to_folder()
    }

    async fn mark_listed(&mut self, rows: &[RowId]) -> Result<()> {
        for row in rows {
            if let Some(record) = self.data.records.get_mut(&row.0) {
                record.awaiting_listing = false;
            }
        }
        self.save_to_folder()
    }

    async fn list_dirty_rows(&self, collection: &CalendarId) -> Result<Vec<LocalRow>> {
        Ok(self.data.rows.values()
            .filter(|row| &row.collection == collection && row.is_dirty())
            .cloned()
            .collect())
    }

    async fn row(&self, row: RowId) -> Result<Option<LocalRow>> {
        Ok(self.data.rows.get(&row.0).cloned())
    }

    async fn row_by_uid(&self, collection: &CalendarId, uid: &str) -> Result<Option<LocalRow>> {
        Ok(self.find_row(collection, uid).cloned())
    }

    async fn sync_records(&self, collection: &CalendarId) -> Result<Vec<SyncRecord>> {
        Ok(self.data.records.values()
            .filter(|record| self.data.rows.get(&record.row.0).map(|row| &row.collection == collection).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn sync_record(&self, row: RowId) -> Result<Option<SyncRecord>> {
        Ok(self.data.records.get(&row.0).cloned())
    }

    async fn remove_row(&mut self, row: RowId) -> Result<()> {
        self.data.rows.remove(&row.0);
        self.data.records.remove(&row.0);
        self.save_to_folder()
    }

    async fn collection_preference(&mut self, collection: &Collection, hidden_prefixes: &[String]) -> Result<CollectionPreference> {
        if let Some(pref) = self.data.preferences.iter().find(|p| &p.collection_id == collection.id()) {
            return Ok(pref.clone());
        }
        let pref = CollectionPreference::default_for(collection.id(), collection.display_name(), self.data.preferences.len(), hidden_prefixes);
        log::debug!("First time we see {}, enabled: {}", collection.id(), pref.is_enabled);
        self.data.preferences.push(pref.clone());
        self.save_to_folder()?;
        Ok(pref)
    }

    async fn set_collection_preference(&mut self, preference: CollectionPreference) -> Result<()> {
        match self.data.preferences.iter_mut().find(|p| p.collection_id == preference.collection_id) {
            Some(existing) => *existing = preference,
            None => self.data.preferences.push(preference),
        }
        self.save_to_folder()
    }

    async fn collection_ctag(&self, collection: &CalendarId) -> Result<Option<ChangeToken>> {
        Ok(self.data.ctags.get(collection.as_str()).cloned())
    }

    async fn set_collection_ctag(&mut self, collection: &CalendarId, ctag: Option<ChangeToken>) -> Result<()> {
        match ctag {
            Some(ctag) => self.data.ctags.insert(collection.to_string(), ctag),
            None => self.data.ctags.remove(collection.as_str()),
        };
        self.save_to_folder()
    }
}

impl SyncSlave for Cache {
    fn get_last_sync(&self) -> Option<DateTime<Utc>> {
        self.data.last_sync
    }

    fn update_last_sync(&mut self, timepoint: Option<DateTime<Utc>>) {
        self.data.last_sync = Some(timepoint.unwrap_or_else(|| Utc::now()));
        if let Err(err) = self.save_to_folder() {
            log::warn!("Unable to save the last sync time: {}", err);
        }
    }
}
