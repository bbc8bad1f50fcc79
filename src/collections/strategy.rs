use super::{azp, dummy, fs};
use crate::photo_store::CollectionRecord;
use anyhow::Result;
use rusqlite::Connection;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Per-field validation messages, keyed by settings field name.
pub type SettingsErrors = BTreeMap<String, String>;

/// Counters reported by one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Where a selected photo can be fetched from, plus the side-channel metadata
/// forwarded to the display agent.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoInfo {
    /// A fetchable URL; `file://` for local files and downloaded temp files.
    pub url: String,
    /// Path of the photo within its collection.
    pub path: String,
    /// Display name of the owning collection.
    pub collection_name: String,
}

/// The closed set of scan strategies. Registration is this table; a strategy
/// exists exactly when it has a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    FileSystem,
    AmazonPhotos,
    Dummy,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::FileSystem,
        StrategyKind::AmazonPhotos,
        StrategyKind::Dummy,
    ];

    pub fn from_class_name(class_name: &str) -> Option<Self> {
        match class_name {
            "FileSystemCollection" => Some(StrategyKind::FileSystem),
            "AmazonPhotosCollection" => Some(StrategyKind::AmazonPhotos),
            "DummyCollection" => Some(StrategyKind::Dummy),
            _ => None,
        }
    }

    pub fn class_name(self) -> &'static str {
        match self {
            StrategyKind::FileSystem => "FileSystemCollection",
            StrategyKind::AmazonPhotos => "AmazonPhotosCollection",
            StrategyKind::Dummy => "DummyCollection",
        }
    }

    pub fn settings_schema(self) -> JsonValue {
        match self {
            StrategyKind::FileSystem => fs::settings_schema(),
            StrategyKind::AmazonPhotos => azp::settings_schema(),
            StrategyKind::Dummy => dummy::settings_schema(),
        }
    }

    pub fn settings_default(self) -> JsonValue {
        match self {
            StrategyKind::FileSystem => fs::settings_default(),
            StrategyKind::AmazonPhotos => azp::settings_default(),
            StrategyKind::Dummy => dummy::settings_default(),
        }
    }

    pub fn validate_settings(self, settings: &JsonValue) -> Result<(), SettingsErrors> {
        match self {
            StrategyKind::FileSystem => fs::validate_settings(settings).map(|_| ()),
            StrategyKind::AmazonPhotos => azp::validate_settings(settings).map(|_| ()),
            StrategyKind::Dummy => dummy::validate_settings(settings),
        }
    }

    /// Representation of the settings safe to return to clients. Secret
    /// values are masked.
    pub fn masked_settings(self, settings: &JsonValue) -> JsonValue {
        match self {
            StrategyKind::AmazonPhotos => azp::masked_settings(settings),
            _ => settings.clone(),
        }
    }

    /// Merge patched settings over stored ones, restoring masked secrets so a
    /// round-tripped representation never destroys credentials.
    pub fn merge_patch_settings(self, stored: &JsonValue, patch: JsonValue) -> JsonValue {
        match self {
            StrategyKind::AmazonPhotos => azp::merge_patch_settings(stored, patch),
            _ => patch,
        }
    }

    /// Run one scan. `cancel` must be polled between units of work; a true
    /// return means "end the scan cleanly now".
    pub fn update(
        self,
        conn: &mut Connection,
        record: &CollectionRecord,
        cancel: &dyn Fn() -> bool,
    ) -> Result<ScanStats> {
        match self {
            StrategyKind::FileSystem => fs::update(conn, record, cancel),
            StrategyKind::AmazonPhotos => azp::update(conn, record, cancel),
            StrategyKind::Dummy => dummy::update(conn, record, cancel),
        }
    }

    /// Resolve a concrete URL and metadata for a stored photo.
    pub fn photo_info(
        self,
        conn: &Connection,
        record: &CollectionRecord,
        photo_id: i64,
    ) -> Result<Option<PhotoInfo>> {
        match self {
            StrategyKind::FileSystem => fs::photo_info(conn, record, photo_id),
            StrategyKind::AmazonPhotos => azp::photo_info(conn, record, photo_id),
            StrategyKind::Dummy => dummy::photo_info(conn, record, photo_id),
        }
    }
}

/// Generate one scan token: 64 random bits, hex-encoded.
pub(crate) fn new_scan_token() -> String {
    use rand::Rng;
    format!("{:016x}", rand::rng().random::<u64>())
}

/// Percent-encode a filesystem path into a `file://` URL.
pub(crate) fn path_to_file_url(path: &std::path::Path) -> String {
    let mut url = String::from("file://");
    for component in path.to_string_lossy().split('/') {
        if component.is_empty() {
            continue;
        }
        url.push('/');
        url.push_str(&urlencoding::encode(component));
    }
    url
}
