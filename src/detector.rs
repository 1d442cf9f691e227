//! Decides which remote resources must be fetched again, from their change tokens only

use std::collections::{HashMap, HashSet};

use url::Url;

use crate::item::{ChangeToken, SyncRecord};
use crate::resource::ResourceRef;

/// How a listing compares to what we knew about a collection
#[derive(Debug, Default, PartialEq)]
pub struct ChangeSet<K, V> {
    /// Known, and the token did not change
    pub unchanged: Vec<(K, V)>,
    /// Known, but the token changed. These must be fetched and updated
    pub changed: Vec<(K, V)>,
    /// Not known yet. These must be fetched and inserted
    pub new: Vec<V>,
    /// Known, but absent from the listing
    pub missing: Vec<K>,
    /// Keys that appeared more than once in the listing
    pub duplicates: Vec<String>,
}

impl<K, V> ChangeSet<K, V> {
    /// How many resources must be fetched
    pub fn to_fetch(&self) -> usize {
        self.changed.len() + self.new.len()
    }
}

/// Partition `current` against `previous`.
///
/// `previous` holds what we stored at the last sync, `current` is a fresh listing.
/// Both are matched on `key`, and only tokens are compared: no body is ever looked at.
/// When a key appears several times in `current`, the last entry wins, and the key is reported in `duplicates`.
pub fn diff<K, V, I, F, G, H>(previous: Vec<K>, current: I, key_of_previous: F, key_of_current: G, token_of_previous: H) -> ChangeSet<K, V>
where
    I: IntoIterator<Item = V>,
    V: HasChangeToken,
    F: Fn(&K) -> String,
    G: Fn(&V) -> String,
    H: Fn(&K) -> Option<ChangeToken>,
{
    let mut latest: HashMap<String, V> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut duplicates = Vec::new();
    for item in current {
        let key = key_of_current(&item);
        if latest.insert(key.clone(), item).is_some() {
            log::warn!("{} is listed more than once by the server, keeping the last entry", key);
            if duplicates.contains(&key) == false {
                duplicates.push(key);
            }
        } else {
            order.push(key);
        }
    }

    let mut set = ChangeSet {
        unchanged: Vec::new(),
        changed: Vec::new(),
        new: Vec::new(),
        missing: Vec::new(),
        duplicates,
    };

    let mut seen = HashSet::new();
    for known in previous {
        let key = key_of_previous(&known);
        match latest.remove(&key) {
            None => {
                if seen.contains(&key) == false {
                    set.missing.push(known);
                }
            },
            Some(item) => {
                seen.insert(key);
                if item.change_token().is_some() && item.change_token() == token_of_previous(&known).as_ref() {
                    set.unchanged.push((known, item));
                } else {
                    set.changed.push((known, item));
                }
            },
        }
    }

    // Keep the listing order for new items
    for key in order {
        if let Some(item) = latest.remove(&key) {
            set.new.push(item);
        }
    }
    set
}

/// Things that carry a change token
pub trait HasChangeToken {
    fn change_token(&self) -> Option<&ChangeToken>;
}

impl HasChangeToken for ResourceRef {
    fn change_token(&self) -> Option<&ChangeToken> {
        ResourceRef::change_token(self)
    }
}

/// Match sync records to a resource listing, on their hrefs
pub fn diff_listing(records: Vec<SyncRecord>, listing: Vec<ResourceRef>) -> ChangeSet<SyncRecord, ResourceRef> {
    diff(
        records,
        listing,
        |record| href_key(&record.remote_href),
        |resource| href_key(resource.href()),
        |record| record.remote_change_token.clone(),
    )
}

fn href_key(url: &Url) -> String {
    url.as_str().trim_end_matches('/').to_string()
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::item::RowId;

    fn href(name: &str) -> Url {
        format!("https://cal.example.com/work/{}.ics", name).parse().unwrap()
    }

    fn record(row: u64, name: &str, token: &str) -> SyncRecord {
        SyncRecord {
            row: RowId(row),
            uid: name.to_string(),
            remote_href: href(name),
            remote_change_token: Some(ChangeToken::from(token)),
            last_synced_at: Utc::now(),
            awaiting_listing: false,
        }
    }

    fn listed(name: &str, token: &str) -> ResourceRef {
        ResourceRef::new(href(name), Some(ChangeToken::from(token)))
    }

    #[test]
    fn partition() {
        let records = vec![record(1, "a", "a1"), record(2, "b", "b1"), record(3, "c", "c1")];
        let listing = vec![listed("a", "a1"), listed("b", "b2"), listed("d", "d1")];

        let set = diff_listing(records, listing);
        assert_eq!(set.unchanged.len(), 1);
        assert_eq!(set.unchanged[0].0.uid, "a");
        assert_eq!(set.changed.len(), 1);
        assert_eq!(set.changed[0].1.change_token(), Some(&ChangeToken::from("b2")));
        assert_eq!(set.new, vec![listed("d", "d1")]);
        assert_eq!(set.missing.len(), 1);
        assert_eq!(set.missing[0].uid, "c");
        assert_eq!(set.to_fetch(), 2);
        assert!(set.duplicates.is_empty());
    }

    #[test]
    fn duplicates_keep_the_last_entry() {
        let records = vec![record(1, "a", "a1")];
        let listing = vec![listed("a", "a0"), listed("a", "a1"), listed("e", "e1"), listed("e", "e2")];

        let set = diff_listing(records, listing);
        assert_eq!(set.unchanged.len(), 1);
        assert!(set.changed.is_empty());
        assert_eq!(set.new, vec![listed("e", "e2")]);
        assert_eq!(set.duplicates.len(), 2);
    }

    #[test]
    fn missing_tokens_are_changes() {
        let mut known = record(1, "a", "a1");
        known.remote_change_token = None;
        let set = diff_listing(vec![known], vec![ResourceRef::new(href("a"), None)]);
        assert_eq!(set.changed.len(), 1);
    }
}
