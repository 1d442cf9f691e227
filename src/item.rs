//! Local rows, their sync status and the records that tie them to remote resources

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use url::Url;
use chrono::{DateTime, Utc};

use crate::calendar::CalendarId;
use crate::event::Event;



/// A ChangeToken is basically a CalDAV `etag` (or a collection `ctag`). Whenever it changes, this means the data has changed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken {
    tag: String
}

impl From<String> for ChangeToken {
    fn from(tag: String) -> ChangeToken {
        Self { tag }
    }
}

impl From<&str> for ChangeToken {
    fn from(tag: &str) -> ChangeToken {
        Self { tag: tag.to_string() }
    }
}

impl ChangeToken {
    /// Get the inner token (usually a WebDAV `etag`)
    pub fn as_str(&self) -> &str {
        &self.tag
    }

    /// Generate a random ChangeToken
    pub fn random() -> Self {
        let random = uuid::Uuid::new_v4().to_hyphenated().to_string();
        Self { tag: random }
    }
}

impl Display for ChangeToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag)
    }
}



/// Identifier of a row in the local store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl Display for RowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "row#{}", self.0)
    }
}



/// Describes whether this row has been synced already, or modified since the last time it was synced
///
/// The change token this row was last synced with lives in its [`SyncRecord`].
/// As soon as the row is edited locally, that token must be considered stale: it is only kept as the precondition of the next push.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// This row has been locally created, and never synced yet
    NotSynced,
    /// This row mirrors the remote resource, and has not been locally modified since then.
    Synced,
    /// This row has been synced, and has been locally modified since then.
    LocallyModified,
    /// This row has been synced, and has been locally deleted since then.
    LocallyDeleted,
}

impl SyncStatus {
    /// Whether this row must be pushed to the server
    pub fn is_dirty(&self) -> bool {
        *self != SyncStatus::Synced
    }
}



/// A local task row, mirrored to a remote Event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalRow {
    pub id: RowId,
    /// The collection this row belongs to
    pub collection: CalendarId,
    pub event: Event,
    pub sync_status: SyncStatus,
    /// Incremented on every local edit. A push only marks the row clean if no other edit happened meanwhile.
    pub revision: u64,
}

impl LocalRow {
    pub fn uid(&self) -> &str {
        self.event.uid()
    }

    pub fn is_dirty(&self) -> bool {
        self.sync_status.is_dirty()
    }
}



/// What the local store remembers about the remote counterpart of a row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub row: RowId,
    /// The remote `uid`
    pub uid: String,
    /// Where the resource lives on the server
    pub remote_href: Url,
    /// Last known change token. This is authoritative only right after a successful pull or push.
    pub remote_change_token: Option<ChangeToken>,
    pub last_synced_at: DateTime<Utc>,
    /// Set when we created the resource ourselves, until a listing of the server shows it.
    /// Such a record is never taken for a remote deletion.
    #[serde(default)]
    pub awaiting_listing: bool,
}

/// Which way the data went when a row was last synced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOrigin {
    /// Downloaded from the server
    Pulled,
    /// Uploaded to the server
    Pushed,
}



/// Whether an upsert created a row or updated an existing one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertKind {
    Created,
    Updated,
}
