//! Calendar collections, as discovered on a server

pub mod preference;

use std::convert::TryFrom;

use serde::{Deserialize, Serialize};
use bitflags::bitflags;
use csscolorparser::Color;

use crate::error::Error;
use crate::item::ChangeToken;

/// The color a collection gets when the server does not provide a valid one
pub const DEFAULT_COLOR: &str = "#005f82";

/// The ID of a collection, i.e. its URL
pub type CalendarId = url::Url;

bitflags! {
    #[derive(Serialize, Deserialize)]
    pub struct SupportedComponents: u8 {
        /// An event, such as a calendar meeting
        const EVENT = 1;
        /// A to-do item, such as a reminder
        const TODO = 2;
    }
}

impl TryFrom<minidom::Element> for SupportedComponents {
    type Error = Error;

    /// Create an instance from an XML <supported-calendar-component-set> element
    fn try_from(element: minidom::Element) -> Result<Self, Self::Error> {
        if element.name() != "supported-calendar-component-set" {
            return Err(Error::protocol("Element must be a <supported-calendar-component-set>", format!("{:?}", element)));
        }

        let mut flags = Self::empty();
        for child in element.children() {
            match child.attr("name") {
                None => continue,
                Some("VEVENT") => flags.insert(Self::EVENT),
                Some("VTODO") => flags.insert(Self::TODO),
                Some(other) => {
                    log::debug!("Unimplemented supported component type: {:?}. Ignoring it", other);
                    continue
                },
            };
        }

        Ok(flags)
    }
}



/// A calendar collection on the remote store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    id: CalendarId,
    display_name: String,
    color: Color,
    /// The collection change token (`getctag`), when the server exposes one
    ctag: Option<ChangeToken>,
    supported_components: SupportedComponents,
}

impl Collection {
    pub fn new(id: CalendarId, display_name: String, color: Color, ctag: Option<ChangeToken>, supported_components: SupportedComponents) -> Self {
        Self { id, display_name, color, ctag, supported_components }
    }

    pub fn id(&self) -> &CalendarId             { &self.id }
    pub fn display_name(&self) -> &str          { &self.display_name }
    pub fn color(&self) -> &Color               { &self.color }
    pub fn ctag(&self) -> Option<&ChangeToken>  { self.ctag.as_ref() }
    pub fn supported_components(&self) -> SupportedComponents { self.supported_components }

    pub fn set_ctag(&mut self, ctag: Option<ChangeToken>) {
        self.ctag = ctag;
    }

    /// The last non-empty segment of the collection URL
    pub fn slug(&self) -> &str {
        slug_of(&self.id)
    }
}

/// The last non-empty path segment of a URL
pub fn slug_of(url: &url::Url) -> &str {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| s.is_empty() == false).last())
        .unwrap_or("")
}

/// Parse a color as sent by a server (`#RRGGBB` or `#RRGGBBAA`), falling back to [`DEFAULT_COLOR`]
pub fn parse_color_or_default(raw: Option<&str>) -> Color {
    if let Some(raw) = raw {
        match csscolorparser::parse(raw.trim()) {
            Ok(color) => return color,
            Err(err) => log::debug!("Invalid collection color {:?} ({}), using the default one", raw, err),
        }
    }
    default_color()
}

pub fn default_color() -> Color {
    csscolorparser::parse(DEFAULT_COLOR)
        .unwrap_or_else(|_| Color::from_rgba(0.0, 95.0 / 255.0, 130.0 / 255.0, 1.0))
}
