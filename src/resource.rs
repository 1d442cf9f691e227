use url::Url;

use crate::item::ChangeToken;

/// Where a calendar resource lives, and which version of it we know about
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    href: Url,
    change_token: Option<ChangeToken>,
}

impl ResourceRef {
    pub fn new(href: Url, change_token: Option<ChangeToken>) -> Self {
        Self { href, change_token }
    }

    pub fn href(&self) -> &Url { &self.href }
    pub fn change_token(&self) -> Option<&ChangeToken> { self.change_token.as_ref() }

    /// The identifier of the resource inside its collection, i.e. the file name without its `.ics` extension
    pub fn remote_id(&self) -> String {
        let name = crate::calendar::slug_of(&self.href);
        name.strip_suffix(".ics").unwrap_or(name).to_string()
    }
}

/// A resource body, as sent by the server
#[derive(Clone, Debug, PartialEq)]
pub struct RawResource {
    pub reference: ResourceRef,
    pub body: String,
}

impl RawResource {
    pub fn new(reference: ResourceRef, body: String) -> Self {
        Self { reference, body }
    }

    pub fn href(&self) -> &Url { self.reference.href() }
    pub fn change_token(&self) -> Option<&ChangeToken> { self.reference.change_token() }
}

/// The location a resource with this uid gets in `collection`
pub fn href_for_uid(collection: &Url, uid: &str) -> crate::error::Result<Url> {
    let file = format!("{}.ics", sanitize_filename::sanitize(uid));
    href_in(collection, &file)
}

/// The location of the file `name` in `collection`
pub fn href_in(collection: &Url, name: &str) -> crate::error::Result<Url> {
    let mut base = collection.clone();
    if base.path().ends_with('/') == false {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(name)?)
}
