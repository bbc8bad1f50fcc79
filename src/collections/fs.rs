//! Filesystem scan strategy: walk a directory tree, probe image files, and
//! mirror them into the photo catalog.

use super::strategy::{new_scan_token, path_to_file_url, PhotoInfo, ScanStats, SettingsErrors};
use crate::photo_store::CollectionRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use walkdir::WalkDir;

#[derive(Debug, Clone, Deserialize)]
pub struct FsSettings {
    pub root_path: String,
}

pub fn settings_schema() -> JsonValue {
    json!({
        "type": "object",
        "properties": {
            "root_path": { "type": "string", "title": "Path" },
        },
        "required": ["root_path"],
    })
}

pub fn settings_default() -> JsonValue {
    json!({ "root_path": "~/photos" })
}

pub fn validate_settings(settings: &JsonValue) -> Result<FsSettings, SettingsErrors> {
    let mut errors = SettingsErrors::new();
    let object = match settings.as_object() {
        Some(object) => object,
        None => {
            errors.insert("settings".to_string(), "Not a valid mapping type.".to_string());
            return Err(errors);
        }
    };

    for key in object.keys() {
        if key != "root_path" {
            errors.insert(key.clone(), "Unknown field.".to_string());
        }
    }
    match object.get("root_path") {
        None => {
            errors.insert(
                "root_path".to_string(),
                "Missing data for required field.".to_string(),
            );
        }
        Some(JsonValue::String(_)) => {}
        Some(_) => {
            errors.insert("root_path".to_string(), "Not a valid string.".to_string());
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(FsSettings {
        root_path: object["root_path"].as_str().unwrap().to_string(),
    })
}

/// Expand `~` and resolve symlinks. A root that fails to canonicalize is kept
/// as expanded so the scan can report a meaningful walk error.
fn resolve_root(root_path: &str) -> PathBuf {
    let expanded = if root_path == "~" {
        std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(root_path))
    } else if let Some(rest) = root_path.strip_prefix("~/") {
        match std::env::var("HOME") {
            Ok(home) => Path::new(&home).join(rest),
            Err(_) => PathBuf::from(root_path),
        }
    } else {
        PathBuf::from(root_path)
    };
    expanded.canonicalize().unwrap_or(expanded)
}

#[derive(Debug)]
struct ImageProbe {
    format: String,
    width: u32,
    height: u32,
    capture_date: Option<String>,
}

/// Probe a file as an image. A failed probe means "not an image", not an
/// error: the scan just skips the file.
fn probe_image(path: &Path) -> Option<ImageProbe> {
    let reader = image::ImageReader::open(path)
        .ok()?
        .with_guessed_format()
        .ok()?;
    let format = reader.format()?;
    let (width, height) = match reader.into_dimensions() {
        Ok(dimensions) => dimensions,
        Err(e) => {
            debug!("File {:?} is probably not an image: {}", path, e);
            return None;
        }
    };

    Some(ImageProbe {
        format: format
            .extensions_str()
            .first()
            .copied()
            .unwrap_or("image")
            .to_string(),
        width,
        height,
        capture_date: read_capture_date(path),
    })
}

fn read_capture_date(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;

    let datetime = read_ascii_tag(&exif, exif::Tag::DateTimeOriginal)?;
    let naive = parse_exif_datetime(&datetime)?;

    // The capture date is timezone-aware only when the original-time offset
    // tag is present; otherwise it is taken as UTC.
    match read_ascii_tag(&exif, exif::Tag::OffsetTimeOriginal).and_then(|s| parse_utc_offset(&s)) {
        Some(offset) => offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.to_rfc3339()),
        None => Some(Utc.from_utc_datetime(&naive).to_rfc3339()),
    }
}

fn read_ascii_tag(exif: &exif::Exif, tag: exif::Tag) -> Option<String> {
    let field = exif.get_field(tag, exif::In::PRIMARY)?;
    match &field.value {
        exif::Value::Ascii(vecs) => vecs
            .first()
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

/// EXIF datetime format: "YYYY:MM:DD HH:MM:SS"
fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    if s.len() < 19 {
        return None;
    }
    let date = s[..10].replace(':', "-");
    let normalized = format!("{} {}", date, &s[11..19]);
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S").ok()
}

/// EXIF offset format: "+HH:MM" or "-HH:MM"
fn parse_utc_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    if s.len() != 6 {
        return None;
    }
    let sign = match &s[..1] {
        "+" => 1,
        "-" => -1,
        _ => return None,
    };
    let hours: i32 = s[1..3].parse().ok()?;
    let minutes: i32 = s[4..6].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub fn update(
    conn: &mut Connection,
    record: &CollectionRecord,
    cancel: &dyn Fn() -> bool,
) -> Result<ScanStats> {
    let settings =
        validate_settings(&record.settings).map_err(|e| anyhow::anyhow!("invalid settings: {:?}", e))?;
    let root = resolve_root(&settings.root_path);
    let collection_id = record.id.context("collection has no id")?;

    let mut stats = ScanStats::default();
    info!("Scanning {:?}", root);
    let scan_token = new_scan_token();

    for entry in WalkDir::new(&root) {
        if cancel() {
            info!("Scan was cancelled");
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                error!("Walk error under {:?}: {}", root, e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let local_path = match entry.path().strip_prefix(&root) {
            Ok(path) => path.to_string_lossy().to_string(),
            Err(_) => continue,
        };
        let modified_date: DateTime<Utc> =
            match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(time) => time.into(),
                None => {
                    error!("Can't stat {:?}", entry.path());
                    continue;
                }
            };

        let existing: Option<(i64, Option<String>)> = conn
            .query_row(
                "SELECT photo_id, modified_date FROM fs_collections_data
                 WHERE collection_id = ?1 AND path = ?2",
                params![collection_id, local_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let mut photo_id: Option<i64> = None;
        if let Some((existing_id, previous_modified)) = existing {
            photo_id = Some(existing_id);
            let unchanged = previous_modified
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|previous| modified_date <= previous.with_timezone(&Utc))
                .unwrap_or(false);
            if unchanged {
                conn.execute(
                    "UPDATE fs_collections_data SET scan_token = ?1 WHERE photo_id = ?2",
                    params![scan_token, existing_id],
                )?;
                continue;
            }
        }

        let probe = match probe_image(entry.path()) {
            Some(probe) => probe,
            None => continue,
        };

        if photo_id.is_none() {
            stats.added += 1;
        } else {
            stats.updated += 1;
        }

        let tx = conn.transaction()?;
        let photo_id: i64 = tx.query_row(
            "INSERT INTO photos (id, collection_id, format, width, height, capture_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET format = ?3, width = ?4, height = ?5, capture_date = ?6
             RETURNING id",
            params![
                photo_id,
                collection_id,
                probe.format,
                probe.width,
                probe.height,
                probe.capture_date,
            ],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO fs_collections_data (photo_id, collection_id, path, modified_date, scan_token)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(photo_id) DO UPDATE SET modified_date = ?4, scan_token = ?5",
            params![
                photo_id,
                collection_id,
                local_path,
                modified_date.to_rfc3339(),
                scan_token,
            ],
        )?;
        tx.commit()?;
    }

    if !cancel() {
        let tx = conn.transaction()?;
        stats.deleted = tx.query_row(
            "SELECT COUNT(photo_id) FROM fs_collections_data
             WHERE collection_id = ?1 AND scan_token != ?2",
            params![collection_id, scan_token],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM photos WHERE id IN (
                 SELECT photo_id FROM fs_collections_data
                 WHERE collection_id = ?1 AND scan_token != ?2
             )",
            params![collection_id, scan_token],
        )?;
        tx.commit()?;
    }

    info!(
        "Collection {} refreshed. Added: {}. Updated: {}. Deleted: {}.",
        record.identifier, stats.added, stats.updated, stats.deleted
    );
    Ok(stats)
}

pub fn photo_info(
    conn: &Connection,
    record: &CollectionRecord,
    photo_id: i64,
) -> Result<Option<PhotoInfo>> {
    let local_path: Option<String> = conn
        .query_row(
            "SELECT path FROM fs_collections_data WHERE photo_id = ?1",
            params![photo_id],
            |row| row.get(0),
        )
        .optional()?;

    let local_path = match local_path {
        Some(path) => path,
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
    let absolute = resolve_root(&settings.root_path).join(&local_path);
    if !absolute.exists() {
        return Ok(None);
    }

    Ok(Some(PhotoInfo {
        url: path_to_file_url(&absolute),
        path: local_path,
        collection_name: record.display_name.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo_store::{open_connection, PHOTO_DB_SCHEMA};
    use tempfile::TempDir;

    fn make_collection(conn: &Connection, root: &Path) -> CollectionRecord {
        conn.execute(
            "INSERT INTO collections (identifier, display_name, schedule, enabled, class_name, settings_json)
             VALUES ('local', 'Local photos', '', 1, 'FileSystemCollection', ?1)",
            params![json!({"root_path": root.to_string_lossy()}).to_string()],
        )
        .unwrap();
        CollectionRecord {
            id: Some(conn.last_insert_rowid()),
            identifier: "local".to_string(),
            display_name: "Local photos".to_string(),
            schedule: String::new(),
            enabled: true,
            class_name: "FileSystemCollection".to_string(),
            settings: json!({"root_path": root.to_string_lossy()}),
        }
    }

    fn write_test_image(path: &Path, width: u32, height: u32) {
        let img = image::DynamicImage::new_rgb8(width, height);
        img.save(path).unwrap();
    }

    fn setup() -> (Connection, TempDir, TempDir) {
        let db_dir = TempDir::new().unwrap();
        let photos_dir = TempDir::new().unwrap();
        let conn = open_connection(db_dir.path().join("photo.db")).unwrap();
        PHOTO_DB_SCHEMA.ensure(&conn).unwrap();
        (conn, db_dir, photos_dir)
    }

    fn photo_rows(conn: &Connection) -> Vec<(i64, String)> {
        let mut stmt = conn
            .prepare(
                "SELECT photos.id, fs_collections_data.path FROM photos
                 JOIN fs_collections_data ON fs_collections_data.photo_id = photos.id
                 ORDER BY fs_collections_data.path",
            )
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_validate_settings_messages() {
        let errors = validate_settings(&json!({})).unwrap_err();
        assert_eq!(
            errors.get("root_path").unwrap(),
            "Missing data for required field."
        );

        let errors = validate_settings(&json!({"root_path": 3})).unwrap_err();
        assert_eq!(errors.get("root_path").unwrap(), "Not a valid string.");

        let errors = validate_settings(&json!({"root_path": "~", "extra": 1})).unwrap_err();
        assert_eq!(errors.get("extra").unwrap(), "Unknown field.");
    }

    #[test]
    fn test_parse_exif_datetime() {
        let naive = parse_exif_datetime("2024:03:15 12:30:45").unwrap();
        assert_eq!(naive.to_string(), "2024-03-15 12:30:45");
        assert!(parse_exif_datetime("not a date").is_none());
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(
            parse_utc_offset("+02:00"),
            FixedOffset::east_opt(2 * 3600)
        );
        assert_eq!(
            parse_utc_offset("-05:30"),
            FixedOffset::east_opt(-(5 * 3600 + 30 * 60))
        );
        assert!(parse_utc_offset("02:00").is_none());
    }

    #[test]
    fn test_scan_adds_images_and_skips_non_images() {
        let (mut conn, _db_dir, photos_dir) = setup();
        let record = make_collection(&conn, photos_dir.path());

        write_test_image(&photos_dir.path().join("a.png"), 100, 50);
        write_test_image(&photos_dir.path().join("b.jpg"), 50, 100);
        std::fs::write(photos_dir.path().join("notes.txt"), "not an image").unwrap();

        let stats = update(&mut conn, &record, &|| false).unwrap();
        assert_eq!(stats.added, 2);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.deleted, 0);

        let rows = photo_rows(&conn);
        assert_eq!(rows.len(), 2);
        let (width, height): (i64, i64) = conn
            .query_row(
                "SELECT photos.width, photos.height FROM photos
                 JOIN fs_collections_data ON fs_collections_data.photo_id = photos.id
                 WHERE fs_collections_data.path = 'a.png'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!((width, height), (100, 50));
    }

    #[test]
    fn test_rescan_of_unchanged_tree_is_stable() {
        let (mut conn, _db_dir, photos_dir) = setup();
        let record = make_collection(&conn, photos_dir.path());
        write_test_image(&photos_dir.path().join("a.png"), 20, 20);

        update(&mut conn, &record, &|| false).unwrap();
        let before = photo_rows(&conn);

        let stats = update(&mut conn, &record, &|| false).unwrap();
        assert_eq!(stats, ScanStats::default());
        assert_eq!(photo_rows(&conn), before);
    }

    #[test]
    fn test_sweep_removes_deleted_files_and_keeps_survivors() {
        let (mut conn, _db_dir, photos_dir) = setup();
        let record = make_collection(&conn, photos_dir.path());
        for name in ["a.png", "b.png", "c.png"] {
            write_test_image(&photos_dir.path().join(name), 10, 10);
        }

        update(&mut conn, &record, &|| false).unwrap();
        let before = photo_rows(&conn);
        assert_eq!(before.len(), 3);

        std::fs::remove_file(photos_dir.path().join("b.png")).unwrap();
        let stats = update(&mut conn, &record, &|| false).unwrap();
        assert_eq!(stats.deleted, 1);

        // Surviving photos keep their row identity.
        let after = photo_rows(&conn);
        assert_eq!(after.len(), 2);
        for row in &after {
            assert!(before.contains(row));
        }
        assert!(!after.iter().any(|(_, path)| path == "b.png"));
    }

    #[test]
    fn test_cancelled_scan_skips_sweep() {
        let (mut conn, _db_dir, photos_dir) = setup();
        let record = make_collection(&conn, photos_dir.path());
        for name in ["a.png", "b.png"] {
            write_test_image(&photos_dir.path().join(name), 10, 10);
        }
        update(&mut conn, &record, &|| false).unwrap();

        // A scan cancelled from the start must not delete anything.
        std::fs::remove_file(photos_dir.path().join("b.png")).unwrap();
        update(&mut conn, &record, &|| true).unwrap();
        assert_eq!(photo_rows(&conn).len(), 2);
    }

    #[test]
    fn test_photo_info_returns_file_url() {
        let (mut conn, _db_dir, photos_dir) = setup();
        let record = make_collection(&conn, photos_dir.path());
        write_test_image(&photos_dir.path().join("a.png"), 10, 10);
        update(&mut conn, &record, &|| false).unwrap();

        let (photo_id, _) = photo_rows(&conn)[0].clone();
        let info = photo_info(&conn, &record, photo_id).unwrap().unwrap();
        assert!(info.url.starts_with("file:///"));
        assert!(info.url.ends_with("a.png"));
        assert_eq!(info.path, "a.png");
        assert_eq!(info.collection_name, "Local photos");

        // A photo whose backing file disappeared yields no info.
        std::fs::remove_file(photos_dir.path().join("a.png")).unwrap();
        assert!(photo_info(&conn, &record, photo_id).unwrap().is_none());
    }
}
