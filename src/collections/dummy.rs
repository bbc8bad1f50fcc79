//! A strategy that scans nothing. Useful in tests and as the trivial member
//! of the registry.

use super::strategy::{PhotoInfo, ScanStats, SettingsErrors};
use crate::photo_store::CollectionRecord;
use anyhow::Result;
use rusqlite::Connection;
use serde_json::{json, Value as JsonValue};

pub fn settings_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {},
        "required": [],
    })
}

pub fn settings_default() -> JsonValue {
    json!({})
}

pub fn validate_settings(settings: &JsonValue) -> Result<(), SettingsErrors> {
    let mut errors = SettingsErrors::new();
    match settings.as_object() {
        Some(object) => {
            for key in object.keys() {
                errors.insert(key.clone(), "Unknown field.".to_string());
            }
        }
        None => {
            errors.insert("settings".to_string(), "Not a valid mapping type.".to_string());
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn update(
    _conn: &mut Connection,
    _record: &CollectionRecord,
    _cancel: &dyn Fn() -> bool,
) -> Result<ScanStats> {
    Ok(ScanStats::default())
}

pub fn photo_info(
    _conn: &Connection,
    _record: &CollectionRecord,
    _photo_id: i64,
) -> Result<Option<PhotoInfo>> {
    Ok(None)
}
