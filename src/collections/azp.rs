//! Cloud photo scan strategy.
//!
//! The remote backend is an opaque HTTP API with two calls: a paginated
//! "list photos" endpoint and a per-node "download" endpoint. Nodes carry a
//! modification date used to decide insert vs. update; the same scan-token
//! sweep as the filesystem strategy reconciles deletions.

use super::strategy::{new_scan_token, path_to_file_url, PhotoInfo, ScanStats, SettingsErrors};
use crate::photo_store::CollectionRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

const LIST_BATCH_SIZE: usize = 10_000;
// Safeguard against a backend that keeps paginating forever.
const MAX_LIST_OFFSET: usize = 10_000_000;
const TEMP_FILE_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Deserialize)]
pub struct AzpSettings {
    pub api_url: String,
    pub user_agent: String,
    pub cookies: BTreeMap<String, String>,
}

pub fn settings_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "api_url": { "type": "string", "title": "API URL" },
            "user_agent": { "type": "string", "title": "User agent" },
            "cookies": { "type": "object", "title": "Cookies" },
        },
        "required": ["api_url", "user_agent", "cookies"],
    })
}

pub fn settings_default() -> JsonValue {
    json!({
        "api_url": "",
        "user_agent": "",
        "cookies": {},
    })
}

pub fn validate_settings(settings: &JsonValue) -> Result<AzpSettings, SettingsErrors> {
    let mut errors = SettingsErrors::new();
    let object = match settings.as_object() {
        Some(object) => object,
        None => {
            errors.insert("settings".to_string(), "Not a valid mapping type.".to_string());
            return Err(errors);
        }
    };

    for key in object.keys() {
        if !matches!(key.as_str(), "api_url" | "user_agent" | "cookies") {
            errors.insert(key.clone(), "Unknown field.".to_string());
        }
    }
    for field in ["api_url", "user_agent"] {
        match object.get(field) {
            None => {
                errors.insert(
                    field.to_string(),
                    "Missing data for required field.".to_string(),
                );
            }
            Some(JsonValue::String(_)) => {}
            Some(_) => {
                errors.insert(field.to_string(), "Not a valid string.".to_string());
            }
        }
    }
    match object.get("cookies") {
        None => {
            errors.insert(
                "cookies".to_string(),
                "Missing data for required field.".to_string(),
            );
        }
        Some(JsonValue::Object(cookies)) => {
            if cookies.values().any(|value| !value.is_string()) {
                errors.insert("cookies".to_string(), "Not a valid string.".to_string());
            }
        }
        Some(_) => {
            errors.insert("cookies".to_string(), "Not a valid mapping type.".to_string());
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    serde_json::from_value(settings.clone()).map_err(|e| {
        let mut errors = SettingsErrors::new();
        errors.insert("settings".to_string(), e.to_string());
        errors
    })
}

/// Cookie values never leave the server in the clear.
pub fn masked_settings(settings: &JsonValue) -> JsonValue {
    let mut masked = settings.clone();
    if let Some(cookies) = masked.get_mut("cookies").and_then(|c| c.as_object_mut()) {
        for value in cookies.values_mut() {
            *value = JsonValue::String("***".to_string());
        }
    }
    masked
}

/// Replace masked cookie values in a patch with the stored secrets, so a
/// client round-tripping the masked representation keeps its credentials.
pub fn merge_patch_settings(stored: &JsonValue, mut patch: JsonValue) -> JsonValue {
    let mask_pattern = Regex::new(r"^\*+$").unwrap();
    let stored_cookies = stored
        .get("cookies")
        .and_then(|c| c.as_object())
        .cloned()
        .unwrap_or_else(JsonMap::new);

    if let Some(cookies) = patch.get_mut("cookies").and_then(|c| c.as_object_mut()) {
        for (name, value) in cookies.iter_mut() {
            let is_masked = value
                .as_str()
                .map(|s| mask_pattern.is_match(s))
                .unwrap_or(false);
            if is_masked {
                if let Some(stored_value) = stored_cookies.get(name) {
                    *value = stored_value.clone();
                }
            }
        }
    }
    patch
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzpNode {
    id: String,
    name: String,
    modified_date: DateTime<Utc>,
    #[serde(default)]
    content_date: Option<DateTime<Utc>>,
    #[serde(default)]
    image: Option<AzpImageInfo>,
    #[serde(default)]
    settings: AzpNodeSettings,
}

#[derive(Debug, Clone, Deserialize)]
struct AzpImageInfo {
    width: i64,
    height: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AzpNodeSettings {
    #[serde(default)]
    favorite: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct AzpNodeDetails {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "parentMap")]
    parent_map: Option<AzpParentMap>,
}

#[derive(Debug, Clone, Deserialize)]
struct AzpParentMap {
    #[serde(default, rename = "FOLDER")]
    folder: Vec<String>,
}

struct AzpClient {
    http: reqwest::blocking::Client,
    api_url: String,
    cookie_header: String,
}

impl AzpClient {
    fn new(settings: &AzpSettings) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()?;
        let cookie_header = settings
            .cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        Ok(Self {
            http,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            cookie_header,
        })
    }

    fn list_photos(&self, offset: usize, limit: usize) -> Result<Vec<AzpNode>> {
        let nodes = self
            .http
            .get(format!("{}/photos", self.api_url))
            .query(&[("offset", offset.to_string()), ("limit", limit.to_string())])
            .header(reqwest::header::COOKIE, &self.cookie_header)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(nodes)
    }

    fn get_node(&self, node_id: &str) -> Result<AzpNodeDetails> {
        let node = self
            .http
            .get(format!("{}/nodes/{}", self.api_url, node_id))
            .header(reqwest::header::COOKIE, &self.cookie_header)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(node)
    }

    fn download_node(&self, node_id: &str, name: &str, out_directory: &Path) -> Result<PathBuf> {
        let response = self
            .http
            .get(format!("{}/nodes/{}/content", self.api_url, node_id))
            .header(reqwest::header::COOKIE, &self.cookie_header)
            .send()?
            .error_for_status()?;
        let destination = out_directory.join(format!("{}_{}", node_id, name));
        let bytes = response.bytes()?;
        std::fs::write(&destination, &bytes)?;
        Ok(destination)
    }
}

pub fn update(
    conn: &mut Connection,
    record: &CollectionRecord,
    cancel: &dyn Fn() -> bool,
) -> Result<ScanStats> {
    let settings =
        validate_settings(&record.settings).map_err(|e| anyhow::anyhow!("invalid settings: {:?}", e))?;
    let collection_id = record.id.context("collection has no id")?;
    let client = AzpClient::new(&settings)?;

    let mut stats = ScanStats::default();
    let scan_token = new_scan_token();

    let mut offset = 0usize;
    'listing: while !cancel() {
        if offset >= MAX_LIST_OFFSET {
            warn!("Stopping listing at offset {}", offset);
            break;
        }

        let nodes = client.list_photos(offset, LIST_BATCH_SIZE)?;
        offset += nodes.len();
        if nodes.is_empty() {
            break;
        }

        for node in nodes {
            if cancel() {
                break 'listing;
            }
            write_node(conn, collection_id, &node, &scan_token, &mut stats)?;
        }
    }

    if !cancel() {
        let tx = conn.transaction()?;
        stats.deleted = tx.query_row(
            "SELECT COUNT(photo_id) FROM azp_collections_data
             WHERE collection_id = ?1 AND scan_token != ?2",
            params![collection_id, scan_token],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM photos WHERE id IN (
                 SELECT photo_id FROM azp_collections_data
                 WHERE collection_id = ?1 AND scan_token != ?2
             )",
            params![collection_id, scan_token],
        )?;
        tx.commit()?;
    } else {
        info!("Update was cancelled");
    }

    info!(
        "Collection {} refreshed. Added: {}. Updated: {}. Deleted: {}.",
        record.identifier, stats.added, stats.updated, stats.deleted
    );
    Ok(stats)
}

fn write_node(
    conn: &mut Connection,
    collection_id: i64,
    node: &AzpNode,
    scan_token: &str,
    stats: &mut ScanStats,
) -> Result<()> {
    let existing: Option<(i64, Option<String>)> = conn
        .query_row(
            "SELECT photo_id, modified_date FROM azp_collections_data
             WHERE collection_id = ?1 AND node_id = ?2",
            params![collection_id, node.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let mut photo_id: Option<i64> = None;
    if let Some((existing_id, previous_modified)) = existing {
        photo_id = Some(existing_id);
        let unchanged = previous_modified
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|previous| node.modified_date <= previous.with_timezone(&Utc))
            .unwrap_or(false);
        if unchanged {
            conn.execute(
                "UPDATE azp_collections_data SET scan_token = ?1 WHERE photo_id = ?2",
                params![scan_token, existing_id],
            )?;
            return Ok(());
        }
    }

    if photo_id.is_none() {
        stats.added += 1;
    } else {
        stats.updated += 1;
    }

    let favorite = node.settings.favorite.unwrap_or(false);
    let capture_date = node.content_date.map(|dt| dt.to_rfc3339());
    let (width, height) = node
        .image
        .as_ref()
        .map(|image| (Some(image.width), Some(image.height)))
        .unwrap_or((None, None));

    let tx = conn.transaction()?;
    let photo_id: i64 = tx.query_row(
        "INSERT INTO photos (id, collection_id, width, height, favorite, capture_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET width = ?3, height = ?4, favorite = ?5, capture_date = ?6
         RETURNING id",
        params![
            photo_id,
            collection_id,
            width,
            height,
            favorite as i64,
            capture_date,
        ],
        |row| row.get(0),
    )?;
    tx.execute(
        "INSERT INTO azp_collections_data (photo_id, collection_id, node_id, name, modified_date, scan_token)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(photo_id) DO UPDATE SET node_id = ?3, name = ?4, modified_date = ?5, scan_token = ?6",
        params![
            photo_id,
            collection_id,
            node.id,
            node.name,
            node.modified_date.to_rfc3339(),
            scan_token,
        ],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn photo_info(
    conn: &Connection,
    record: &CollectionRecord,
    photo_id: i64,
) -> Result<Option<PhotoInfo>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT node_id, name FROM azp_collections_data WHERE photo_id = ?1",
            params![photo_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (node_id, name) = match row {
        Some(row) => row,
        None => {
            error!(
                "No photo in collection {} with id {}",
                record.identifier, photo_id
            );
            return Ok(None);
        }
    };

    let settings =
        validate_settings(&record.settings).map_err(|e| anyhow::anyhow!("invalid settings: {:?}", e))?;
    let client = AzpClient::new(&settings)?;

    let out_directory = std::env::temp_dir().join("cadre_azp");
    std::fs::create_dir_all(&out_directory)?;
    cleanup_out_directory(&out_directory);

    let downloaded = client.download_node(&node_id, &name, &out_directory)?;
    let remote_path = node_path(&client, &node_id).unwrap_or_else(|| name.clone());

    Ok(Some(PhotoInfo {
        url: path_to_file_url(&downloaded),
        path: remote_path,
        collection_name: record.display_name.clone(),
    }))
}

/// Reconstruct the remote folder path by walking parent links. A cycle or a
/// missing parent just truncates the path.
fn node_path(client: &AzpClient, node_id: &str) -> Option<String> {
    let mut segments: Vec<String> = Vec::new();
    let mut visited: std::collections::HashSet<String> = Default::default();
    let mut next_node_id = node_id.to_string();

    loop {
        if !visited.insert(next_node_id.clone()) {
            break;
        }
        let node = match client.get_node(&next_node_id) {
            Ok(node) => node,
            Err(e) => {
                error!("Failed to get node path: {}", e);
                return None;
            }
        };
        let Some(segment) = node.name else { break };
        segments.push(segment);
        match node.parent_map.and_then(|map| map.folder.into_iter().next()) {
            Some(parent) => next_node_id = parent,
            None => break,
        }
    }

    segments.reverse();
    Some(segments.join("/"))
}

/// Downloaded photos are only needed until the agent fetched them; unlink
/// anything older than an hour.
fn cleanup_out_directory(path: &Path) {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let now = std::time::SystemTime::now();
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else { continue };
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .accessed()
            .or_else(|_| metadata.modified())
            .ok()
            .and_then(|time| now.duration_since(time).ok());
        if age.map(|age| age >= TEMP_FILE_MAX_AGE).unwrap_or(false) {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                error!("Can't cleanup old downloads: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_settings_messages() {
        let errors = validate_settings(&json!({})).unwrap_err();
        assert_eq!(
            errors.get("api_url").unwrap(),
            "Missing data for required field."
        );
        assert_eq!(
            errors.get("cookies").unwrap(),
            "Missing data for required field."
        );

        let errors = validate_settings(&json!({
            "api_url": "http://example.test",
            "user_agent": "agent",
            "cookies": {"session": 5},
        }))
        .unwrap_err();
        assert_eq!(errors.get("cookies").unwrap(), "Not a valid string.");
    }

    #[test]
    fn test_masked_settings_hides_cookie_values() {
        let settings = json!({
            "api_url": "http://example.test",
            "user_agent": "agent",
            "cookies": {"session": "secret", "token": "also secret"},
        });
        let masked = masked_settings(&settings);
        assert_eq!(masked["cookies"]["session"], "***");
        assert_eq!(masked["cookies"]["token"], "***");
        assert_eq!(masked["api_url"], "http://example.test");
    }

    #[test]
    fn test_merge_patch_restores_masked_cookies() {
        let stored = json!({
            "api_url": "http://example.test",
            "user_agent": "agent",
            "cookies": {"session": "secret"},
        });
        let patch = json!({
            "api_url": "http://example.test",
            "user_agent": "new agent",
            "cookies": {"session": "***", "fresh": "value"},
        });
        let merged = merge_patch_settings(&stored, patch);
        assert_eq!(merged["cookies"]["session"], "secret");
        assert_eq!(merged["cookies"]["fresh"], "value");
        assert_eq!(merged["user_agent"], "new agent");
    }

    #[test]
    fn test_node_deserialization() {
        let node: AzpNode = serde_json::from_value(json!({
            "id": "node-1",
            "name": "beach.jpg",
            "modifiedDate": "2024-05-01T10:00:00Z",
            "contentDate": "2023-08-15T12:00:00Z",
            "image": {"width": 4000, "height": 3000},
            "settings": {"favorite": true},
        }))
        .unwrap();
        assert_eq!(node.id, "node-1");
        assert_eq!(node.image.unwrap().width, 4000);
        assert_eq!(node.settings.favorite, Some(true));

        // Minimal nodes parse too.
        let node: AzpNode = serde_json::from_value(json!({
            "id": "node-2",
            "name": "x.jpg",
            "modifiedDate": "2024-05-01T10:00:00Z",
        }))
        .unwrap();
        assert!(node.image.is_none());
        assert!(node.content_date.is_none());
    }
}
