//! Fire-and-forget propagation of local edits
//!
//! Edited rows are queued, and pushed by a bounded pool of tasks. The caller never waits for the server, and never hears about failures:
//! they are logged, and the row stays dirty until a later push or sync pass succeeds.
//!
//! Rows are not deduplicated. Two jobs for the same row may run concurrently, in which case the last write to reach the server wins.
//! Jobs that are still queued or running when the propagator (or the runtime) is dropped may be lost. Call [`Propagator::shutdown`] to wait for them.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::item::RowId;
use crate::provider::push::{push_row, PushOutcome};
use crate::provider::retry::RetryPolicy;
use crate::traits::{CalDavSource, LocalStore};

/// A bounded queue of rows to push
pub struct Propagator {
    sender: Option<mpsc::Sender<RowId>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Propagator {
    /// Start the dispatcher. At most `capacity` rows wait in the queue, and at most `concurrency` pushes run at once
    pub fn start<L, R>(local: Arc<Mutex<L>>, remote: Arc<R>, retry: RetryPolicy, capacity: usize, concurrency: usize) -> Self
    where
        L: LocalStore + 'static,
        R: CalDavSource + 'static,
    {
        let (sender, mut receiver) = mpsc::channel::<RowId>(capacity.max(1));
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let dispatcher = tokio::spawn(async move {
            let mut running: Vec<JoinHandle<()>> = Vec::new();
            while let Some(row) = receiver.recv().await {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let local = local.clone();
                let remote = remote.clone();
                let retry = retry.clone();
                running.push(tokio::spawn(async move {
                    match push_row(&local, remote.as_ref(), &retry, row).await {
                        Ok(PushOutcome::Skipped) => log::trace!("Background push of {}: nothing to do", row),
                        Ok(outcome) => log::debug!("Background push of {}: {:?}", row, outcome),
                        Err(err) => log::warn!("Background push of {} failed, it will be retried at the next sync: {}", row, err),
                    }
                    drop(permit);
                }));
                running.retain(|job| job.is_finished() == false);
            }

            for job in running {
                if let Err(err) = job.await {
                    log::error!("A background push panicked: {}", err);
                }
            }
        });

        Self { sender: Some(sender), dispatcher: Some(dispatcher) }
    }

    /// Queue a row to push. This never waits: a full queue is an error, and the row stays dirty
    pub fn enqueue(&self, row: RowId) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(Error::QueueClosed)?;
        sender.try_send(row).map_err(|err| match err {
            TrySendError::Full(row) => {
                log::warn!("Background queue is full, {} will be pushed at the next sync", row);
                Error::QueueFull
            },
            TrySendError::Closed(_) => Error::QueueClosed,
        })
    }

    /// Stop accepting rows, and wait until every queued and running push is over
    pub async fn shutdown(mut self) {
        self.sender.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(err) = dispatcher.await {
                log::error!("The background dispatcher panicked: {}", err);
            }
        }
    }
}
