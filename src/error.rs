//! Error types for the sync engine
//!
//! Every fallible operation of this crate returns a [`Result`], whose error side tells the caller
//! how to react: give up on the whole pass ([`Error::Auth`]), retry later ([`Error::Transport`]),
//! skip a single resource ([`Error::Protocol`]), or refresh before writing again ([`Error::Conflict`]).

use thiserror::Error;

use crate::item::ChangeToken;

/// Errors that can happen while talking to a calendar server or keeping the local store in sync
#[derive(Error, Debug)]
pub enum Error {
    /// The server rejected our credentials. This is fatal for a sync pass.
    #[error("authentication rejected by {url}")]
    Auth { url: String },

    /// The network or the server failed in a way that may go away if we try again
    #[error("transport failure: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The server answered something we are unable to understand
    #[error("malformed server payload: {message}")]
    Protocol { message: String, payload: String },

    /// The resource does not exist (anymore)
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A conditional write failed because the resource changed on the server since we last saw it
    #[error("{href} has changed on the server (expected change token {expected:?}), refresh it before retrying")]
    Conflict {
        href: String,
        expected: Option<ChangeToken>,
    },

    /// Credentials or server address are missing
    #[error("calendar account is not configured: {0}")]
    NotConfigured(String),

    #[error("no occurrence matches {0}")]
    OccurrenceNotFound(String),

    #[error("{count} occurrences match {requested}, refusing to guess")]
    AmbiguousOccurrence { requested: String, count: usize },

    /// A caller-supplied value is not acceptable
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The local store refused an operation
    #[error("local storage error: {0}")]
    Storage(String),

    /// The background queue cannot accept any more work right now
    #[error("background propagation queue is full")]
    QueueFull,

    /// The background queue has been shut down
    #[error("background propagation queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a [`Error::Protocol`], keeping the offending payload for diagnosis
    pub fn protocol<M: Into<String>, P: Into<String>>(message: M, payload: P) -> Self {
        Self::Protocol { message: message.into(), payload: payload.into() }
    }

    /// Build a [`Error::Transport`] that does not wrap any lower-level error
    pub fn transport<M: Into<String>>(message: M) -> Self {
        Self::Transport { message: message.into(), source: None }
    }

    /// Whether retrying the very same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// Whether this error must abort a whole sync pass
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth { .. } | Error::NotConfigured(_))
    }

    /// Map an unsuccessful HTTP status to the matching error kind
    pub fn from_status(status: reqwest::StatusCode, href: &str, body: String) -> Self {
        use reqwest::StatusCode;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth { url: href.to_string() },
            StatusCode::NOT_FOUND | StatusCode::GONE => Error::NotFound(href.to_string()),
            StatusCode::PRECONDITION_FAILED => Error::Conflict { href: href.to_string(), expected: None },
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Error::transport(format!("{} answered {}", href, status))
            },
            s if s.is_server_error() => Error::transport(format!("{} answered {}", href, status)),
            s => Error::protocol(format!("unexpected HTTP status {} for {}", s, href), body),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let message = match err.url() {
            Some(url) => format!("request to {} failed: {}", url, err),
            None => format!("request failed: {}", err),
        };
        Error::Transport { message, source: Some(err) }
    }
}
