//! Persistence for the curator: refresh jobs, collections and photos.

mod models;
mod schema;
mod store;

pub use models::{CollectionRecord, RefreshJobRecord, SelectedPhoto};
pub use schema::PHOTO_DB_SCHEMA;
pub use store::{open_connection, PhotoStore};

use regex::Regex;
use std::sync::OnceLock;

static IDENTIFIER_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Entity identifiers are restricted to `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_identifier(identifier: &str) -> bool {
    IDENTIFIER_PATTERN
        .get_or_init(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
        .is_match(identifier)
}
