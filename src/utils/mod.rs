//! Some utility functions

use minidom::Element;
use url::Url;

use crate::calendar::preference::CollectionView;
use crate::event::Event;
use crate::error::Result;

/// Walks an XML tree and returns every element that has the given name
pub fn find_elems<S: AsRef<str>>(root: &Element, searched_name: S) -> Vec<&Element> {
    let searched_name = searched_name.as_ref();
    let mut elems: Vec<&Element> = Vec::new();

    for el in root.children() {
        if el.name() == searched_name {
            elems.push(el);
        } else {
            let ret = find_elems(el, searched_name);
            elems.extend(ret);
        }
    }
    elems
}

/// Walks an XML tree until it finds an elements with the given name
pub fn find_elem<S: AsRef<str>>(root: &Element, searched_name: S) -> Option<&Element> {
    let searched_name = searched_name.as_ref();
    if root.name() == searched_name {
        return Some(root);
    }

    for el in root.children() {
        if el.name() == searched_name {
            return Some(el);
        } else {
            let ret = find_elem(el, searched_name);
            if ret.is_some() {
                return ret;
            }
        }
    }
    None
}

/// Resolve an `href` found in a server response against the URL of the server.
///
/// Servers usually send absolute paths, sometimes full URLs
pub fn resolve_href(base: &Url, href: &str) -> Result<Url> {
    let href = href.trim();
    if href.starts_with('/') {
        let mut url = base.clone();
        url.set_query(None);
        url.set_fragment(None);
        // `set_path` would percent-encode the already encoded path
        return Ok(url.join(href)?);
    }
    Ok(base.join(href)?)
}

/// Whether two URLs point to the same resource, ignoring a trailing slash
pub fn same_resource(left: &Url, right: &Url) -> bool {
    left.as_str().trim_end_matches('/') == right.as_str().trim_end_matches('/')
}


/// A debug utility that pretty-prints collections
pub fn print_collection_list(collections: &[CollectionView]) {
    for view in collections {
        let enabled = if view.is_enabled() { " " } else { "x" };
        println!("{} {} {}\t{}", enabled, view.color().to_hex_string(), view.name(), view.id());
    }
}

/// Print a one-line summary of `event` to stdout, marking completed and recurring events
pub fn print_event(event: &Event) {
    let completion = if event.completed() { "✓" } else { " " };
    let recurring = if event.is_recurring() { "↻" } else { " " };
    println!("    {}{} {} -> {}\t{}\t{}", completion, recurring, event.start(), event.end(), event.title(), event.uid());
}
