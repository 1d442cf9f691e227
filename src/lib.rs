//! This crate keeps a local event store consistent with a CalDAV calendar server.
//!
//! It provides a CalDAV client in the [`client`] module, that can be used as a stand-alone module.
//!
//! Because the connection to the server may be slow, the events are mirrored to a local store. A reference one, that lives in a JSON file, is provided in the [`cache`] module.
//!
//! These two sides (actual client and local store) are used together in a [`Provider`](provider::Provider). \
//! A `Provider` syncs them cheaply, by only downloading resources whose change token moved, and pushes local edits, either during a sync or in the background. \
//! It also serves reads from a fast [`mirror`] when one is available, and removes single occurrences of recurring events.

pub mod traits;
pub mod error;
pub use error::{Error, Result};

pub mod calendar;
pub mod item;
pub mod event;
pub use event::{Event, EventTime};
pub mod window;
pub use window::TimeWindow;
pub mod resource;
pub mod detector;
pub mod occurrence;
pub mod recurrence;
pub mod provider;
pub use provider::Provider;

pub mod session;
pub mod client;
pub use client::Client;
pub mod cache;
pub use cache::Cache;
pub mod mirror;
pub mod ical;

pub mod mock;
pub mod mock_behaviour;

pub mod config;
pub mod utils;

/// A provider that syncs a local [`Cache`] with a CalDAV server
pub type CalDavProvider = Provider<Cache, Client>;
