//! Support for library configuration options

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use url::Url;
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// Part of the ProdID string that describes the organization (example of a ProdID string: `-//ABC Corporation//My Product//EN`).
/// Feel free to override it when initing this library.
pub static ORG_NAME: Lazy<Arc<Mutex<String>>> = Lazy::new(|| Arc::new(Mutex::new("Agenda".to_string())));

/// Part of the ProdID string that describes the product name (example of a ProdID string: `-//ABC Corporation//My Product//EN`).
/// Feel free to override it when initing this library.
pub static PRODUCT_NAME: Lazy<Arc<Mutex<String>>> = Lazy::new(|| Arc::new(Mutex::new("AgendaSync".to_string())));

pub const ENV_URL: &str = "AGENDA_SYNC_URL";
pub const ENV_USERNAME: &str = "AGENDA_SYNC_USERNAME";
pub const ENV_PASSWORD: &str = "AGENDA_SYNC_PASSWORD";
pub const ENV_CACHE: &str = "AGENDA_SYNC_CACHE";



/// Everything this crate can be configured with
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub sync: SyncSettings,
    /// Where local caches are stored
    pub cache_folder: Option<PathBuf>,
}

impl Settings {
    /// Read settings from a JSON file. Missing fields get their default values
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|err| Error::NotConfigured(format!("unable to open {:?}: {}", path, err)))?;
        let settings = serde_json::from_reader(file)?;
        Ok(settings)
    }

    /// Override values with the `AGENDA_SYNC_*` environment variables that are set
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides<F: Fn(&str) -> Option<String>>(mut self, lookup: F) -> Result<Self> {
        if let Some(url) = lookup(ENV_URL) {
            self.server.url = Some(Url::parse(&url)?);
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.server.username = Some(username);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.server.password = Some(password);
        }
        if let Some(folder) = lookup(ENV_CACHE) {
            self.cache_folder = Some(PathBuf::from(folder));
        }
        Ok(self)
    }

    pub fn cache_folder(&self) -> PathBuf {
        self.cache_folder.clone().unwrap_or_else(|| PathBuf::from("agenda_cache"))
    }
}



/// How to reach the remote calendar store
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub url: Option<Url>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Timeout of every single network call
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { url: None, username: None, password: None, request_timeout_secs: 15 }
    }
}

impl std::fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSettings")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The base URL and credentials, or [`Error::NotConfigured`] if any is missing
    pub fn credentials(&self) -> Result<(Url, String, String)> {
        let url = self.url.clone()
            .ok_or_else(|| Error::NotConfigured("no server URL".to_string()))?;
        let username = self.username.clone().filter(|u| u.is_empty() == false)
            .ok_or_else(|| Error::NotConfigured("no username".to_string()))?;
        let password = self.password.clone().filter(|p| p.is_empty() == false)
            .ok_or_else(|| Error::NotConfigured("no password".to_string()))?;
        Ok((url, username, password))
    }
}



/// Tunables of the sync engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Sync collections even if their preference disables them
    pub include_all: bool,
    /// Collections whose name starts with one of these are disabled by default
    pub hidden_prefixes: Vec<String>,
    /// How many times a transport failure is retried
    pub transport_retries: u32,
    /// Delay before the first retry. It doubles at each attempt
    pub retry_base_delay_ms: u64,
    /// How many times a freshly created event is looked up before giving up on confirming it
    pub confirm_attempts: u32,
    pub confirm_delay_ms: u64,
    /// IANA name of the zone naive times are expressed in
    pub reference_zone: String,
    /// Whether resources that disappeared from the server are removed locally
    pub apply_remote_deletions: bool,
    /// Background propagation
    pub queue_capacity: usize,
    pub queue_concurrency: usize,
    /// Default read window, in days around now
    pub window_days_before: i64,
    pub window_days_after: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            include_all: false,
            hidden_prefixes: vec!["_".to_string(), ".".to_string()],
            transport_retries: 3,
            retry_base_delay_ms: 200,
            confirm_attempts: 3,
            confirm_delay_ms: 300,
            reference_zone: "UTC".to_string(),
            apply_remote_deletions: true,
            queue_capacity: 64,
            queue_concurrency: 4,
            window_days_before: 7,
            window_days_after: 30,
        }
    }
}

impl SyncSettings {
    pub fn retry_base_delay(&self) -> Duration { Duration::from_millis(self.retry_base_delay_ms) }
    pub fn confirm_delay(&self) -> Duration    { Duration::from_millis(self.confirm_delay_ms) }

    /// The reference zone. Unknown names fall back to UTC
    pub fn reference_zone(&self) -> Tz {
        match self.reference_zone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                log::warn!("Unknown reference zone {:?}, using UTC", self.reference_zone);
                Tz::UTC
            }
        }
    }

    /// The default window to read events in
    pub fn default_window(&self, now: chrono::DateTime<chrono::Utc>) -> crate::window::TimeWindow {
        crate::window::TimeWindow::around(
            now,
            chrono::Duration::days(self.window_days_before),
            chrono::Duration::days(self.window_days_after),
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.server.request_timeout(), Duration::from_secs(15));
        assert_eq!(settings.sync.transport_retries, 3);
        assert_eq!(settings.sync.confirm_attempts, 3);
        assert_eq!(settings.sync.confirm_delay(), Duration::from_millis(300));
        assert_eq!(settings.sync.reference_zone(), Tz::UTC);
        assert_eq!(settings.sync.hidden_prefixes, vec!["_", "."]);
        assert!(settings.sync.apply_remote_deletions);
    }

    #[test]
    fn partial_file() {
        let settings: Settings = serde_json::from_str(r#"{
            "server": { "url": "https://cal.example.com/dav/", "username": "alice" },
            "sync": { "reference_zone": "Europe/Paris", "include_all": true }
        }"#).unwrap();
        assert_eq!(settings.sync.reference_zone(), chrono_tz::Europe::Paris);
        assert!(settings.sync.include_all);
        assert_eq!(settings.sync.queue_capacity, 64);

        // No password: not configured, but not a crash either
        match settings.server.credentials() {
            Err(Error::NotConfigured(_)) => (),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn overrides() {
        let mut env = HashMap::new();
        env.insert(ENV_URL, "https://cal.example.com/dav/");
        env.insert(ENV_USERNAME, "alice");
        env.insert(ENV_PASSWORD, "s3cret");

        let settings = Settings::default()
            .with_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        let (url, username, password) = settings.server.credentials().unwrap();
        assert_eq!(url.as_str(), "https://cal.example.com/dav/");
        assert_eq!(username, "alice");
        assert_eq!(password, "s3cret");
        assert!(format!("{:?}", settings.server).contains("s3cret") == false);
    }
}
