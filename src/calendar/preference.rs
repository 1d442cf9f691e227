//! Local-only display preferences of collections

use serde::{Deserialize, Serialize};
use csscolorparser::Color;

use crate::calendar::{CalendarId, Collection, slug_of, default_color};

/// Colors given to collections, in observation order
pub const PALETTE: [&str; 8] = [
    "#005f82", "#FF6B6B", "#4ECDC4", "#45B7D1",
    "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE",
];

/// What the user chose to see of a collection.
///
/// This is independent of whatever the server says about the collection visibility.
/// The sync engine creates these lazily, and never deletes them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionPreference {
    pub collection_id: CalendarId,
    pub is_enabled: bool,
    pub display_color: Color,
}

impl CollectionPreference {
    /// The default preference of the `index`-th collection ever observed
    pub fn default_for(collection_id: &CalendarId, display_name: &str, index: usize, hidden_prefixes: &[String]) -> Self {
        let hidden = is_hidden_by_convention(display_name, collection_id, hidden_prefixes);
        if hidden {
            log::debug!("Collection {} is hidden by default", collection_id);
        }
        Self {
            collection_id: collection_id.clone(),
            is_enabled: hidden == false,
            display_color: palette_color(index),
        }
    }
}

/// Whether a collection should be hidden unless the user explicitly enables it
pub fn is_hidden_by_convention(display_name: &str, collection_id: &CalendarId, hidden_prefixes: &[String]) -> bool {
    let slug = slug_of(collection_id);
    hidden_prefixes.iter()
        .filter(|prefix| prefix.is_empty() == false)
        .any(|prefix| display_name.starts_with(prefix.as_str()) || slug.starts_with(prefix.as_str()))
}

pub fn palette_color(index: usize) -> Color {
    let hex = PALETTE[index % PALETTE.len()];
    csscolorparser::parse(hex).unwrap_or_else(|_| default_color())
}



/// A collection, as the user wants to see it
#[derive(Clone, Debug, PartialEq)]
pub struct CollectionView {
    pub collection: Collection,
    pub preference: CollectionPreference,
}

impl CollectionView {
    pub fn id(&self) -> &CalendarId     { self.collection.id() }
    pub fn name(&self) -> &str          { self.collection.display_name() }
    pub fn is_enabled(&self) -> bool    { self.preference.is_enabled }

    /// The color to display: the user's choice wins over the server's
    pub fn color(&self) -> &Color {
        &self.preference.display_color
    }

    /// The color the server advertises
    pub fn server_color(&self) -> &Color {
        self.collection.color()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["_".to_string(), ".".to_string()]
    }

    #[test]
    fn hidden_collections() {
        let regular: CalendarId = "https://cal.example.com/calendars/alice/work/".parse().unwrap();
        let inbox: CalendarId = "https://cal.example.com/calendars/alice/_inbox/".parse().unwrap();

        assert!(is_hidden_by_convention("Work", &regular, &prefixes()) == false);
        assert!(is_hidden_by_convention("Inbox", &inbox, &prefixes()));
        assert!(is_hidden_by_convention(".trash", &regular, &prefixes()));
        assert!(is_hidden_by_convention(".trash", &regular, &[]) == false);
    }

    #[test]
    fn default_preferences() {
        let id: CalendarId = "https://cal.example.com/calendars/alice/work/".parse().unwrap();
        let first = CollectionPreference::default_for(&id, "Work", 0, &prefixes());
        assert!(first.is_enabled);
        assert_eq!(first.display_color.to_hex_string(), "#005f82");

        let second = CollectionPreference::default_for(&id, "_Work", 1, &prefixes());
        assert!(second.is_enabled == false);
        assert_eq!(second.display_color.to_hex_string(), "#ff6b6b");

        // The palette wraps around
        assert_eq!(palette_color(PALETTE.len() + 2).to_hex_string(), "#4ecdc4");
    }
}
