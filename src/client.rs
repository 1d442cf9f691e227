//! This module provides a client to connect to a CalDAV server

use std::convert::TryFrom;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Response, StatusCode};
use minidom::Element;
use url::Url;

use crate::calendar::{CalendarId, Collection, SupportedComponents, parse_color_or_default, slug_of};
use crate::config::ServerSettings;
use crate::error::{Error, Result};
use crate::item::ChangeToken;
use crate::resource::{RawResource, ResourceRef};
use crate::session::Session;
use crate::traits::CalDavSource;
use crate::utils::{find_elem, find_elems, resolve_href, same_resource};
use crate::window::TimeWindow;


static DAVCLIENT_BODY: &str = r#"
    <d:propfind xmlns:d="DAV:">
       <d:prop>
           <d:current-user-principal />
       </d:prop>
    </d:propfind>
"#;

static HOMESET_BODY: &str = r#"
    <d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" >
      <d:self/>
      <d:prop>
        <c:calendar-home-set />
      </d:prop>
    </d:propfind>
"#;

static CAL_BODY: &str = r#"
    <d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/" xmlns:a="http://apple.com/ns/ical/" >
       <d:prop>
         <d:displayname />
         <d:resourcetype />
         <c:supported-calendar-component-set />
         <a:calendar-color />
         <cs:getctag />
       </d:prop>
    </d:propfind>
"#;

static EVENTS_BODY: &str = r#"
    <c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
        <d:prop>
            <d:getetag />
        </d:prop>
        <c:filter>
            <c:comp-filter name="VCALENDAR">
                <c:comp-filter name="VEVENT" />
            </c:comp-filter>
        </c:filter>
    </c:calendar-query>
"#;

fn search_body(window: &TimeWindow, expand: bool) -> String {
    let expand = if expand {
        format!(r#"<c:expand start="{}" end="{}"/>"#, window.caldav_start(), window.caldav_end())
    } else {
        String::new()
    };

    format!(r#"
    <c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
        <d:prop>
            <d:getetag />
            <c:calendar-data>{}</c:calendar-data>
        </d:prop>
        <c:filter>
            <c:comp-filter name="VCALENDAR">
                <c:comp-filter name="VEVENT">
                    <c:time-range start="{}" end="{}"/>
                </c:comp-filter>
            </c:comp-filter>
        </c:filter>
    </c:calendar-query>
"#, expand, window.caldav_start(), window.caldav_end())
}



/// A CalDAV source that fetches its data from a CalDAV server
pub struct Client {
    session: Session,

    principal: Mutex<Option<Url>>,
    calendar_home_set: Mutex<Option<Url>>,
}

impl Client {
    /// Create a client. This does not start a connection
    pub fn new(session: Session) -> Self {
        Self {
            session,
            principal: Mutex::new(None),
            calendar_home_set: Mutex::new(None),
        }
    }

    /// Create a client from the settings, or fail with [`Error::NotConfigured`]
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        Ok(Self::new(Session::from_settings(settings)?))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn sub_request(&self, url: &Url, method: &str, body: String, depth: u32) -> Result<String> {
        let response = self.session.dav_request(method, url)?
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body)
            .send()
            .await?;
        let response = check_status(response, url).await?;
        Ok(response.text().await?)
    }

    async fn sub_request_and_extract_href(&self, url: &Url, body: &str, items: &[&str]) -> Result<Url> {
        let text = self.sub_request(url, "PROPFIND", body.to_string(), 0).await?;
        let root = parse_xml(&text)?;

        let mut current_element = &root;
        for item in items {
            current_element = find_elem(current_element, item)
                .ok_or_else(|| Error::protocol(format!("Missing <{}> in the response of {}", item, url), text.clone()))?;
        }
        resolve_href(self.session.base_url(), &current_element.text())
    }

    /// Return the Principal URL, or fetch it from server if not known yet
    async fn get_principal(&self) -> Result<Url> {
        if let Some(p) = self.principal.lock().ok().and_then(|p| p.clone()) {
            return Ok(p);
        }

        let principal_url = self.sub_request_and_extract_href(self.session.base_url(), DAVCLIENT_BODY, &["current-user-principal", "href"]).await?;
        log::debug!("Principal URL is {}", principal_url);
        if let Ok(mut p) = self.principal.lock() {
            *p = Some(principal_url.clone());
        }
        Ok(principal_url)
    }

    /// Return the Homeset URL, or fetch it from server if not known yet
    async fn get_cal_home_set(&self) -> Result<Url> {
        if let Some(h) = self.calendar_home_set.lock().ok().and_then(|h| h.clone()) {
            return Ok(h);
        }
        let principal_url = self.get_principal().await?;

        let chs_url = self.sub_request_and_extract_href(&principal_url, HOMESET_BODY, &["calendar-home-set", "href"]).await?;
        log::debug!("Calendar home set URL is {:?}", chs_url.path());
        if let Ok(mut h) = self.calendar_home_set.lock() {
            *h = Some(chs_url.clone());
        }
        Ok(chs_url)
    }

    async fn put_once(&self, href: &Url, body: &str, previous: Option<&ChangeToken>) -> Result<Response> {
        let mut request = self.session.request(reqwest::Method::PUT, href)
            .header(CONTENT_TYPE, "text/calendar; charset=utf-8")
            .header(CONTENT_LENGTH, body.len());
        request = match previous {
            None => request.header("If-None-Match", "*"),
            Some(token) => request.header("If-Match", token.as_str()),
        };
        Ok(request.body(body.to_string()).send().await?)
    }

    /// Turn a successful PUT response into a reference. Some servers do not send the new ETag: ask for it then
    async fn reference_after_put(&self, href: Url, response: Response) -> Result<ResourceRef> {
        match etag_of(&response) {
            Some(token) => Ok(ResourceRef::new(href, Some(token))),
            None => {
                log::debug!("No ETag in the response to the PUT of {}, fetching it", href);
                let fetched = self.fetch(&ResourceRef::new(href, None)).await?;
                Ok(fetched.reference)
            },
        }
    }
}

#[async_trait]
impl CalDavSource for Client {
    async fn list_collections(&self) -> Result<Vec<Collection>> {
        let cal_home_set = self.get_cal_home_set().await?;
        let text = self.sub_request(&cal_home_set, "PROPFIND", CAL_BODY.into(), 1).await?;
        parse_collections(&text, self.session.base_url())
    }

    async fn list_resources(&self, collection: &CalendarId) -> Result<Vec<ResourceRef>> {
        let text = self.sub_request(collection, "REPORT", EVENTS_BODY.into(), 1).await?;
        parse_resource_listing(&text, self.session.base_url(), collection)
    }

    async fn search(&self, collection: &CalendarId, window: &TimeWindow, expand: bool) -> Result<Vec<RawResource>> {
        log::debug!("Searching {} in {}", window, collection);
        let text = self.sub_request(collection, "REPORT", search_body(window, expand), 1).await?;
        parse_search(&text, self.session.base_url())
    }

    async fn fetch(&self, resource: &ResourceRef) -> Result<RawResource> {
        let response = self.session.request(reqwest::Method::GET, resource.href())
            .send()
            .await?;
        let response = check_status(response, resource.href()).await?;

        let token = etag_of(&response).or_else(|| resource.change_token().cloned());
        let body = response.text().await?;
        Ok(RawResource::new(ResourceRef::new(resource.href().clone(), token), body))
    }

    async fn put(&self, href: &Url, body: String, previous: Option<&ChangeToken>) -> Result<ResourceRef> {
        let href = href.clone();
        let response = self.put_once(&href, &body, previous).await?;

        match (response.status(), previous) {
            (status, _) if status.is_success() => self.reference_after_put(href, response).await,
            (StatusCode::PRECONDITION_FAILED, None) => {
                // Either a previous attempt did succeed but we never got the answer, or the uid is already taken.
                // The location only depends on the uid, so this is the same resource: replace it.
                log::info!("{} already exists, replacing it", href);
                let existing = self.fetch(&ResourceRef::new(href.clone(), None)).await?;
                let existing_token = existing.change_token().cloned();
                let retry = self.put_once(&href, &body, existing_token.as_ref()).await?;
                if retry.status() == StatusCode::PRECONDITION_FAILED {
                    return Err(Error::Conflict { href: href.to_string(), expected: existing_token });
                }
                let retry = check_status(retry, &href).await?;
                self.reference_after_put(href, retry).await
            },
            (StatusCode::PRECONDITION_FAILED, Some(token)) => {
                Err(Error::Conflict { href: href.to_string(), expected: Some(token.clone()) })
            },
            _ => Err(check_status(response, &href).await.err()
                    .unwrap_or_else(|| Error::transport(format!("Unexpected response to the PUT of {}", href)))),
        }
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        let mut request = self.session.request(reqwest::Method::DELETE, resource.href());
        if let Some(token) = resource.change_token() {
            request = request.header("If-Match", token.as_str());
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                log::debug!("{} was already deleted", resource.href());
                Ok(())
            },
            StatusCode::PRECONDITION_FAILED => Err(Error::Conflict {
                href: resource.href().to_string(),
                expected: resource.change_token().cloned(),
            }),
            _ => check_status(response, resource.href()).await.map(|_| ()),
        }
    }
}


async fn check_status(response: Response, url: &Url) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::from_status(status, url.as_str(), body))
}

fn etag_of(response: &Response) -> Option<ChangeToken> {
    response.headers().get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(|value| ChangeToken::from(value.trim()))
}

fn parse_xml(text: &str) -> Result<Element> {
    text.parse::<Element>()
        .map_err(|err| Error::protocol(format!("Invalid XML: {}", err), text))
}

/// Whether a `<response>` reports a non-2xx status for the resource itself
fn response_is_error(response: &Element) -> bool {
    response.children()
        .filter(|child| child.name() == "status")
        .any(|status| status.text().split_whitespace().nth(1).map(|code| code.starts_with('2')) == Some(false))
}

/// Parse the multistatus answer to a PROPFIND on the calendar home set
pub fn parse_collections(text: &str, base: &Url) -> Result<Vec<Collection>> {
    let root = parse_xml(text)?;
    let reps = find_elems(&root, "response");
    let mut calendars = Vec::new();
    for rep in reps {
        let calendar_href = match find_elem(rep, "href") {
            None => {
                log::warn!("A collection has no URL! Ignoring it.");
                continue;
            },
            Some(h) => h.text(),
        };
        let this_calendar_url = match resolve_href(base, &calendar_href) {
            Err(err) => {
                log::warn!("Collection {:?} has an invalid URL ({}). Ignoring it.", calendar_href, err);
                continue;
            },
            Ok(url) => url,
        };

        // We filter out non-calendar items
        let resource_types = match find_elem(rep, "resourcetype") {
            None => continue,
            Some(rt) => rt,
        };
        if resource_types.children().any(|rt| rt.name() == "calendar") == false {
            continue;
        }

        // We filter out the root calendar collection, that has an empty supported-calendar-component-set
        let el_supported_comps = match find_elem(rep, "supported-calendar-component-set") {
            None => continue,
            Some(comps) => comps,
        };
        if el_supported_comps.children().count() == 0 {
            continue;
        }
        let supported_components = match SupportedComponents::try_from(el_supported_comps.clone()) {
            Err(err) => {
                log::warn!("Calendar {} has invalid supported components ({})! Ignoring it.", this_calendar_url, err);
                continue;
            },
            Ok(sc) => sc,
        };
        if supported_components.contains(SupportedComponents::EVENT) == false {
            log::debug!("Calendar {} does not hold events. Ignoring it.", this_calendar_url);
            continue;
        }

        let display_name = find_elem(rep, "displayname")
            .map(|e| e.text())
            .filter(|name| name.trim().is_empty() == false)
            .unwrap_or_else(|| slug_of(&this_calendar_url).to_string());
        let color = parse_color_or_default(find_elem(rep, "calendar-color").map(|e| e.text()).as_deref());
        let ctag = find_elem(rep, "getctag")
            .map(|e| e.text())
            .filter(|t| t.trim().is_empty() == false)
            .map(ChangeToken::from);

        log::info!("Found calendar {}", display_name);
        calendars.push(Collection::new(this_calendar_url, display_name, color, ctag, supported_components));
    }

    Ok(calendars)
}

/// Parse the multistatus answer to a calendar-query that only asked for etags
pub fn parse_resource_listing(text: &str, base: &Url, collection: &CalendarId) -> Result<Vec<ResourceRef>> {
    let root = parse_xml(text)?;
    let mut items = Vec::new();
    for response in find_elems(&root, "response") {
        let href = match find_elem(response, "href").map(|elem| resolve_href(base, &elem.text())) {
            Some(Ok(url)) => url,
            _ => {
                log::warn!("Unable to extract HREF");
                continue;
            },
        };
        if same_resource(&href, collection) || response_is_error(response) {
            continue;
        }

        let token = match find_elem(response, "getetag").map(|etag| etag.text()) {
            Some(etag) if etag.trim().is_empty() == false => ChangeToken::from(etag.trim()),
            _ => {
                log::warn!("Unable to extract ETAG for item {}, ignoring it", href);
                continue;
            },
        };
        items.push(ResourceRef::new(href, Some(token)));
    }
    Ok(items)
}

/// Parse the multistatus answer to a calendar-query that asked for etags and bodies
pub fn parse_search(text: &str, base: &Url) -> Result<Vec<RawResource>> {
    let root = parse_xml(text)?;
    let mut hits = Vec::new();
    for response in find_elems(&root, "response") {
        if response_is_error(response) {
            continue;
        }
        let href = match find_elem(response, "href").map(|elem| resolve_href(base, &elem.text())) {
            Some(Ok(url)) => url,
            _ => {
                log::warn!("Unable to extract HREF");
                continue;
            },
        };
        let body = match find_elem(response, "calendar-data") {
            None => {
                log::warn!("No calendar data for {}, ignoring it", href);
                continue;
            },
            Some(data) => data.text(),
        };
        let token = find_elem(response, "getetag")
            .map(|etag| etag.text())
            .filter(|etag| etag.trim().is_empty() == false)
            .map(|etag| ChangeToken::from(etag.trim()));
        hits.push(RawResource::new(ResourceRef::new(href, token), body));
    }
    Ok(hits)
}
