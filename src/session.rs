//! Short-lived connection state to a calendar server

use std::time::Duration;

use reqwest::{Method, RequestBuilder};
use url::Url;

use crate::config::ServerSettings;
use crate::error::{Error, Result};

/// An identity and its secret
#[derive(Clone, PartialEq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new<U: ToString, P: ToString>(username: U, password: P) -> Self {
        Self { username: username.to_string(), password: password.to_string() }
    }

    pub fn username(&self) -> &str { &self.username }
    pub fn password(&self) -> &str { &self.password }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}



/// The credentials and HTTP transport used for one sync pass (or one request).
///
/// Sessions are cheap to build. Do not share them between users.
#[derive(Clone, Debug)]
pub struct Session {
    base_url: Url,
    credentials: Credentials,
    http: reqwest::Client,
}

impl Session {
    pub fn new(base_url: Url, credentials: Credentials, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { base_url, credentials, http })
    }

    /// Build a session from the settings, or fail with [`Error::NotConfigured`]
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        let (url, username, password) = settings.credentials()?;
        Self::new(url, Credentials::new(username, password), settings.request_timeout())
    }

    pub fn base_url(&self) -> &Url               { &self.base_url }
    pub fn credentials(&self) -> &Credentials    { &self.credentials }

    /// Build a URL on the same server as the base URL, but with another path
    pub fn combine(&self, path: &str) -> Url {
        let mut built = self.base_url.clone();
        built.set_path(path);
        built.set_query(None);
        built
    }

    /// Resolve an `href` found in a server response. It may be absolute, or only a path
    pub fn resolve(&self, href: &str) -> Result<Url> {
        crate::utils::resolve_href(&self.base_url, href)
    }

    /// Start an authenticated request
    pub fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        self.http
            .request(method, url.as_str())
            .basic_auth(self.credentials.username.clone(), Some(self.credentials.password.clone()))
    }

    /// Start an authenticated request with a WebDAV method (`PROPFIND`, `REPORT`...)
    pub fn dav_request(&self, method: &str, url: &Url) -> Result<RequestBuilder> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| Error::InvalidInput(format!("invalid HTTP method {}", method)))?;
        Ok(self.request(method, url))
    }
}
