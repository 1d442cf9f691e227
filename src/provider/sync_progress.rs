//! Utilities to track the progression of a sync

use std::fmt::{Display, Error as FmtError, Formatter};

use crate::calendar::CalendarId;
use crate::error::Error;

/// The steps of a sync pass, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Start,
    Listing,
    Diffing,
    Pulling,
    Pushing,
    Finalizing,
    Completed,
    CompletedWithErrors,
}

impl SyncPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncPhase::Completed | SyncPhase::CompletedWithErrors)
    }
}

impl Default for SyncPhase {
    fn default() -> Self {
        Self::Start
    }
}

/// An event that happens during a sync
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// Sync has not started
    NotStarted,
    /// Sync has just started but no calendar is handled yet
    Started,
    /// The sync entered a new phase
    Phase(SyncPhase),
    /// Sync is in progress.
    InProgress{ calendar: String, details: String},
    /// Sync is finished
    Finished{ success: bool },
}

impl Display for SyncEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            SyncEvent::NotStarted => write!(f, "Not started"),
            SyncEvent::Started => write!(f, "Sync has started..."),
            SyncEvent::Phase(phase) => write!(f, "{:?}...", phase),
            SyncEvent::InProgress{calendar, details} => write!(f, "[{}] {}...", calendar, details),
            SyncEvent::Finished{success} => match success {
                true => write!(f, "Sync successfully finished"),
                false => write!(f, "Sync finished with errors"),
            }
        }
    }
}

impl Default for SyncEvent {
    fn default() -> Self {
        Self::NotStarted
    }
}



/// See [`feedback_channel`]
pub type FeedbackSender = tokio::sync::watch::Sender<SyncEvent>;
/// See [`feedback_channel`]
pub type FeedbackReceiver = tokio::sync::watch::Receiver<SyncEvent>;

/// Create a feeback channel, that can be used to retrieve the current progress of a sync operation
pub fn feedback_channel() -> (FeedbackSender, FeedbackReceiver) {
    tokio::sync::watch::channel(SyncEvent::default())
}



/// Something that went wrong with a single collection or a single resource. The rest of the pass went on
#[derive(Debug)]
pub struct SyncError {
    pub collection: Option<CalendarId>,
    /// The uid or href of the resource, when the error is not about the whole collection
    pub resource: Option<String>,
    pub error: Error,
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match (&self.collection, &self.resource) {
            (Some(col), Some(res)) => write!(f, "[{}] {}: {}", col, res, self.error),
            (Some(col), None) => write!(f, "[{}] {}", col, self.error),
            (None, Some(res)) => write!(f, "{}: {}", res, self.error),
            (None, None) => write!(f, "{}", self.error),
        }
    }
}

/// What a sync pass did
#[derive(Debug, Default)]
pub struct SyncReport {
    /// The phase the pass ended in
    pub phase: SyncPhase,
    /// Local rows created from new remote resources
    pub created: usize,
    /// Local rows updated from changed remote resources
    pub updated: usize,
    /// Remote resources that did not need to be fetched
    pub unchanged: usize,
    /// Local rows removed because their resource disappeared from the server
    pub deleted: usize,
    /// Local rows uploaded to the server
    pub pushed: usize,
    /// Local deletions applied to the server
    pub remote_deleted: usize,
    /// How many resource bodies have been downloaded
    pub fetches: usize,
    pub errors: Vec<SyncError>,
    /// Uids that changed on both sides. The remote version has been kept
    pub conflicts: Vec<String>,
    /// Resources the server listed more than once
    pub duplicates: Vec<String>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Display for SyncReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{:?}: {} created, {} updated, {} unchanged, {} deleted locally, {} pushed, {} deleted remotely, {} fetches, {} errors, {} conflicts",
            self.phase, self.created, self.updated, self.unchanged, self.deleted, self.pushed, self.remote_deleted,
            self.fetches, self.errors.len(), self.conflicts.len())
    }
}



/// A structure that tracks the progression and the errors that happen during a sync
pub struct SyncProgress {
    report: SyncReport,
    feedback_channel: Option<FeedbackSender>
}
impl SyncProgress {
    pub fn new() -> Self {
        Self { report: SyncReport::default(), feedback_channel: None }
    }
    pub fn new_with_feedback_channel(channel: FeedbackSender) -> Self {
        Self { report: SyncReport::default(), feedback_channel: Some(channel) }
    }

    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }

    pub fn report(&self) -> &SyncReport {
        &self.report
    }
    pub fn report_mut(&mut self) -> &mut SyncReport {
        &mut self.report
    }
    pub fn into_report(self) -> SyncReport {
        self.report
    }

    /// Move to another phase
    pub fn enter(&mut self, phase: SyncPhase) {
        log::debug!("Sync phase: {:?}", phase);
        self.report.phase = phase;
        self.feedback(SyncEvent::Phase(phase));
    }

    /// Log an error, and keep it for the report
    pub fn error(&mut self, collection: Option<&CalendarId>, resource: Option<&str>, error: Error) {
        let error = SyncError {
            collection: collection.cloned(),
            resource: resource.map(|r| r.to_string()),
            error,
        };
        log::error!("{}", error);
        if let Error::Protocol{ payload, .. } = &error.error {
            log::debug!("Offending payload: {}", payload);
        }
        self.report.errors.push(error);
    }
    /// Log a warning
    pub fn warn(&mut self, text: &str) {
        log::warn!("{}", text);
    }
    /// Log an info
    pub fn info(&mut self, text: &str) {
        log::info!("{}", text);
    }
    /// Log a debug message
    pub fn debug(&mut self, text: &str) {
        log::debug!("{}", text);
    }
    /// Log a trace message
    pub fn trace(&mut self, text: &str) {
        log::trace!("{}", text);
    }
    /// Send an event as a feedback to the listener (if any).
    pub fn feedback(&mut self, event: SyncEvent) {
        if let Some(sender) = self.feedback_channel.as_ref() {
            // Nobody listening is fine
            let _ = sender.send(event);
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}
