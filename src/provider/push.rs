//! Uploading a single dirty row
//!
//! This is shared by the sync passes and the background propagation.

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::item::{RowId, SyncOrigin, SyncStatus};
use crate::provider::retry::RetryPolicy;
use crate::resource::{href_for_uid, ResourceRef};
use crate::traits::{CalDavSource, LocalStore};

/// What happened to a pushed row
#[derive(Clone, Debug, PartialEq)]
pub enum PushOutcome {
    /// The row has been created or replaced on the server
    Uploaded(ResourceRef),
    /// The row deletion has been applied to the server, and the row is gone
    Deleted,
    /// Nothing had to be pushed (the row is clean, or does not exist anymore)
    Skipped,
}

/// Push `row` to `remote`, and record the outcome in `local`.
///
/// The local store is only locked while it is read or written, never during network calls.
/// A row that is edited while its push is in flight stays dirty, so that the edit is pushed next time.
pub async fn push_row<L, R>(local: &Mutex<L>, remote: &R, retry: &RetryPolicy, row: RowId) -> Result<PushOutcome>
where
    L: LocalStore,
    R: CalDavSource + ?Sized,
{
    let (current, record) = {
        let local = local.lock().await;
        let current = match local.row(row).await? {
            None => {
                log::debug!("{} does not exist anymore, nothing to push", row);
                return Ok(PushOutcome::Skipped);
            },
            Some(current) => current,
        };
        (current, local.sync_record(row).await?)
    };
    if current.is_dirty() == false {
        return Ok(PushOutcome::Skipped);
    }

    if current.sync_status == SyncStatus::LocallyDeleted {
        if let Some(record) = &record {
            let resource = ResourceRef::new(record.remote_href.clone(), record.remote_change_token.clone());
            log::debug!("Deleting {} from the server", resource.href());
            retry.run("delete", || remote.delete(&resource)).await?;
        }
        local.lock().await.remove_row(row).await?;
        return Ok(PushOutcome::Deleted);
    }

    let body = crate::ical::build_from(&current.event)?;
    let (href, previous) = match &record {
        Some(record) => (record.remote_href.clone(), record.remote_change_token.clone()),
        None => (href_for_uid(&current.collection, current.uid())?, None),
    };
    log::debug!("Pushing {} to {} (precondition {:?})", row, href, previous);
    let reference = retry.run("put", || remote.put(&href, body.clone(), previous.as_ref())).await?;

    local.lock().await.mark_synced(row, &reference, Utc::now(), current.revision, SyncOrigin::Pushed).await?;
    Ok(PushOutcome::Uploaded(reference))
}
