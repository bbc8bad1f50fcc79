use super::models::{CollectionRecord, RefreshJobRecord, SelectedPhoto};
use super::schema::PHOTO_DB_SCHEMA;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Open a connection with the pragmas every reader and writer relies on.
///
/// Collection workers open their own connections with this; the store itself
/// goes through it too so the busy timeout and cascade behavior are uniform.
pub fn open_connection<P: AsRef<Path>>(db_path: P) -> Result<Connection> {
    let conn = Connection::open(db_path.as_ref()).context("Failed to open photo database")?;
    conn.busy_timeout(Duration::from_secs(60))?;
    conn.execute("PRAGMA foreign_keys = ON;", [])?;
    Ok(conn)
}

pub struct PhotoStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl PhotoStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if !path.exists() {
            info!("Creating new photo database at {:?}", path);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = open_connection(path)?;
        PHOTO_DB_SCHEMA
            .ensure(&conn)
            .context("Photo database schema validation failed")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run a closure against the shared connection. Strategy-specific lookups
    /// (locator tables) go through this.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    // =========================================================================
    // Collections
    // =========================================================================

    fn row_to_collection(row: &rusqlite::Row) -> rusqlite::Result<CollectionRecord> {
        let settings_json: Option<String> = row.get("settings_json")?;
        let settings = settings_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(JsonValue::Object(Default::default()));

        Ok(CollectionRecord {
            id: Some(row.get("id")?),
            identifier: row.get("identifier")?,
            display_name: row.get("display_name")?,
            schedule: row.get("schedule")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            class_name: row.get("class_name")?,
            settings,
        })
    }

    pub fn list_collections(&self) -> Result<Vec<CollectionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, identifier, display_name, schedule, enabled, class_name, settings_json
             FROM collections ORDER BY identifier",
        )?;
        let records = stmt
            .query_map([], Self::row_to_collection)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get_collection(&self, identifier: &str) -> Result<Option<CollectionRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, identifier, display_name, schedule, enabled, class_name, settings_json
                 FROM collections WHERE identifier = ?1",
                params![identifier],
                Self::row_to_collection,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_collection_by_id(&self, id: i64) -> Result<Option<CollectionRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, identifier, display_name, schedule, enabled, class_name, settings_json
                 FROM collections WHERE id = ?1",
                params![id],
                Self::row_to_collection,
            )
            .optional()?;
        Ok(record)
    }

    /// Insert or, when `record.id` is set, replace a collection row.
    pub fn upsert_collection(&self, record: &CollectionRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id = conn.query_row(
            "INSERT INTO collections (id, identifier, display_name, schedule, enabled, class_name, settings_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET identifier = ?2, display_name = ?3, schedule = ?4,
                 enabled = ?5, class_name = ?6, settings_json = ?7
             RETURNING id",
            params![
                record.id,
                record.identifier,
                record.display_name,
                record.schedule,
                record.enabled as i64,
                record.class_name,
                serde_json::to_string(&record.settings)?,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Deleting a collection cascades to its photos and locator rows.
    pub fn delete_collection(&self, identifier: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM collections WHERE identifier = ?1",
            params![identifier],
        )?;
        Ok(deleted > 0)
    }

    // =========================================================================
    // Refresh jobs
    // =========================================================================

    fn row_to_refresh_job(row: &rusqlite::Row) -> rusqlite::Result<RefreshJobRecord> {
        let options_json: String = row.get("affiche_options_json")?;
        let affiche_options = serde_json::from_str(&options_json)
            .unwrap_or(JsonValue::Object(Default::default()));

        Ok(RefreshJobRecord {
            id: Some(row.get("id")?),
            identifier: row.get("identifier")?,
            display_name: row.get("display_name")?,
            hostname: row.get("hostname")?,
            schedule: row.get("schedule")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            filter: row.get("filter")?,
            order: row.get("order")?,
            affiche_options,
            post_command_id: row.get("post_command_id")?,
        })
    }

    pub fn list_refresh_jobs(&self) -> Result<Vec<RefreshJobRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, identifier, display_name, hostname, schedule, enabled, filter, \"order\",
                    affiche_options_json, post_command_id
             FROM refresh_jobs ORDER BY identifier",
        )?;
        let records = stmt
            .query_map([], Self::row_to_refresh_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn get_refresh_job(&self, identifier: &str) -> Result<Option<RefreshJobRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, identifier, display_name, hostname, schedule, enabled, filter, \"order\",
                        affiche_options_json, post_command_id
                 FROM refresh_jobs WHERE identifier = ?1",
                params![identifier],
                Self::row_to_refresh_job,
            )
            .optional()?;
        Ok(record)
    }

    pub fn upsert_refresh_job(&self, record: &RefreshJobRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id = conn.query_row(
            "INSERT INTO refresh_jobs (id, identifier, display_name, hostname, schedule, enabled,
                 filter, \"order\", affiche_options_json, post_command_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET identifier = ?2, display_name = ?3, hostname = ?4,
                 schedule = ?5, enabled = ?6, filter = ?7, \"order\" = ?8,
                 affiche_options_json = ?9, post_command_id = ?10
             RETURNING id",
            params![
                record.id,
                record.identifier,
                record.display_name,
                record.hostname,
                record.schedule,
                record.enabled as i64,
                record.filter,
                record.order,
                serde_json::to_string(&record.affiche_options)?,
                record.post_command_id,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn delete_refresh_job(&self, identifier: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM refresh_jobs WHERE identifier = ?1",
            params![identifier],
        )?;
        Ok(deleted > 0)
    }

    // =========================================================================
    // Photo selection
    // =========================================================================

    /// Atomically pick the next photo for the given compiled filter and order,
    /// stamping its display date and cycle count in the same statement.
    ///
    /// Selection is restricted to candidates whose `cycle_count` equals the
    /// current candidate minimum; the order expression breaks ties. The chosen
    /// photo's count is bumped to `max(min + 1, max)` so it trails the rest of
    /// the set until every other candidate has been shown.
    pub fn select_next_photo(
        &self,
        filter_sql: &str,
        order_sql: &str,
        extra_filter_sql: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<SelectedPhoto>> {
        let extra = extra_filter_sql.unwrap_or("1");
        let sql = format!(
            "WITH candidate_photos AS (
                 SELECT photos.id AS id, photos.cycle_count AS cycle_count,
                        photos.capture_date AS capture_date
                 FROM photos JOIN collections ON collections.id = photos.collection_id
                 WHERE collections.enabled AND ({filter_sql}) AND ({extra})
             ),
             bounds AS (
                 SELECT MIN(cycle_count) AS mn, MAX(cycle_count) AS mx FROM candidate_photos
             )
             UPDATE photos
             SET cycle_count = (SELECT MAX(mn + 1, mx) FROM bounds),
                 display_date = ?1
             WHERE id IN (
                 SELECT id FROM candidate_photos, bounds
                 WHERE cycle_count = bounds.mn
                 ORDER BY {order_sql} LIMIT 1
             )
             RETURNING id, collection_id, capture_date"
        );

        let conn = self.conn.lock().unwrap();
        let selected = conn
            .query_row(&sql, params![now.to_rfc3339()], |row| {
                Ok(SelectedPhoto {
                    photo_id: row.get(0)?,
                    collection_id: row.get(1)?,
                    capture_date: row.get(2)?,
                })
            })
            .optional()?;
        Ok(selected)
    }
}
