//! This module handles conversion between iCal files and internal representations
//!
//! It is a wrapper around different Rust third-party libraries, since I haven't find any complete library that is able to parse _and_ generate iCal files

mod parser;
pub use parser::{parse, parse_all};
mod builder;
pub use builder::{build_from, build_series};

use crate::config::{ORG_NAME, PRODUCT_NAME};

pub fn default_prod_id() -> String {
    let org_name = ORG_NAME.lock().map(|s| s.clone()).unwrap_or_default();
    let product_name = PRODUCT_NAME.lock().map(|s| s.clone()).unwrap_or_default();
    format!("-//{}//{}//EN", org_name, product_name)
}
