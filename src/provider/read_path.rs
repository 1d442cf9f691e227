//! Reads are served by the mirror when one is attached, and by the remote store otherwise.
//!
//! Nothing here ever writes: mutations always go through a [`CalDavSource`].

use url::Url;

use crate::calendar::{CalendarId, Collection};
use crate::error::{Error, Result};
use crate::mirror::Mirror;
use crate::resource::{RawResource, ResourceRef};
use crate::traits::CalDavSource;
use crate::window::TimeWindow;

pub struct ReadPath<'a, R: ?Sized> {
    mirror: Option<&'a dyn Mirror>,
    remote: &'a R,
}

impl<'a, R> ReadPath<'a, R>
where
    R: CalDavSource + ?Sized,
{
    pub fn new(mirror: Option<&'a dyn Mirror>, remote: &'a R) -> Self {
        Self { mirror, remote }
    }

    pub fn uses_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    pub async fn collections(&self) -> Result<Vec<Collection>> {
        match self.mirror {
            Some(mirror) => mirror.collections().await,
            None => self.remote.list_collections().await,
        }
    }

    /// The resources of `collection` that overlap `window`, with their bodies
    pub async fn search(&self, collection: &CalendarId, window: &TimeWindow) -> Result<Vec<RawResource>> {
        match self.mirror {
            Some(mirror) => mirror.search(collection, window).await,
            None => self.remote.search(collection, window, false).await,
        }
    }

    /// Look up a resource that has just been written at `href`. `None` means it is not visible yet
    pub async fn find(&self, collection: &CalendarId, uid: &str, href: &Url) -> Result<Option<RawResource>> {
        match self.mirror {
            Some(mirror) => mirror.find_uid(collection, uid).await,
            None => match self.remote.fetch(&ResourceRef::new(href.clone(), None)).await {
                Ok(raw) => Ok(Some(raw)),
                Err(Error::NotFound(_)) => Ok(None),
                Err(err) => Err(err),
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{MirrorSnapshot, SnapshotMirror};
    use crate::mock::MockRemote;

    #[tokio::test]
    async fn mirror_first() {
        let remote = MockRemote::new();
        remote.add_collection("https://mock.example.com/alice/work/", "Work").unwrap();

        let direct = ReadPath::new(None, &remote);
        assert_eq!(direct.collections().await.unwrap().len(), 1);
        assert!(direct.uses_mirror() == false);

        let mirror = SnapshotMirror::new("https://mock.example.com/alice/".parse().unwrap(), MirrorSnapshot::default());
        let fast = ReadPath::new(Some(&mirror), &remote);
        assert!(fast.collections().await.unwrap().is_empty());

        let work: CalendarId = "https://mock.example.com/alice/work/".parse().unwrap();
        let missing = crate::resource::href_for_uid(&work, "nope").unwrap();
        assert!(direct.find(&work, "nope", &missing).await.unwrap().is_none());
        assert!(fast.find(&work, "nope", &missing).await.unwrap().is_none());
    }
}
