//! Photo collections: the strategy registry, per-collection scan workers,
//! and the manager owning their lifecycles.

mod azp;
mod dummy;
mod fs;
mod strategy;
mod worker;

pub use strategy::{PhotoInfo, ScanStats, SettingsErrors, StrategyKind};
pub use worker::{WorkerHandle, WorkerMessage};

use crate::photo_store::{validate_identifier, CollectionRecord, PhotoStore};
use crate::schedule::{Schedule, ScheduleError};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("invalid identifier")]
    InvalidIdentifier,

    #[error("already in use: \"{0}\"")]
    DuplicateIdentifier(String),

    #[error("no collection for the given identifier")]
    NotFound,

    #[error("unknown collection class: \"{0}\"")]
    UnknownClass(String),

    #[error("invalid settings")]
    Settings(SettingsErrors),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Fields a PATCH may change. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct CollectionPatch {
    pub identifier: Option<String>,
    pub display_name: Option<String>,
    pub schedule: Option<String>,
    pub enabled: Option<bool>,
    pub class_name: Option<String>,
    pub settings: Option<JsonValue>,
}

/// Owns every collection worker of one curator instance. The store remains
/// the source of truth for records; this map tracks the live workers.
pub struct CollectionManager {
    store: Arc<PhotoStore>,
    db_path: PathBuf,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl CollectionManager {
    pub fn new(store: Arc<PhotoStore>) -> Self {
        let db_path = store.db_path().to_path_buf();
        Self {
            store,
            db_path,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Reanimate every enabled collection found in the store. Collections
    /// with an unknown class stay dormant.
    pub fn start_all(&self) -> anyhow::Result<()> {
        for record in self.store.list_collections()? {
            if !record.enabled {
                continue;
            }
            match StrategyKind::from_class_name(&record.class_name) {
                Some(kind) => {
                    info!("Starting \"{}\"", record.identifier);
                    self.spawn_worker(record, kind);
                }
                None => {
                    error!(
                        "Invalid class name for \"{}\": {}",
                        record.identifier, record.class_name
                    );
                }
            }
        }
        info!("Started all collections");
        Ok(())
    }

    fn spawn_worker(&self, record: CollectionRecord, kind: StrategyKind) {
        let handle = worker::spawn(record.clone(), kind, self.db_path.clone());
        self.workers
            .lock()
            .unwrap()
            .insert(record.identifier, handle);
    }

    fn stop_worker(&self, identifier: &str) {
        let handle = self.workers.lock().unwrap().remove(identifier);
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    /// Validate the parts of a record every mutation shares.
    fn validate(
        identifier: &str,
        schedule: &str,
        class_name: &str,
        settings: &JsonValue,
    ) -> Result<StrategyKind, CollectionError> {
        if !validate_identifier(identifier) {
            return Err(CollectionError::InvalidIdentifier);
        }
        Schedule::parse(schedule)?;
        let kind = StrategyKind::from_class_name(class_name)
            .ok_or_else(|| CollectionError::UnknownClass(class_name.to_string()))?;
        kind.validate_settings(settings)
            .map_err(CollectionError::Settings)?;
        Ok(kind)
    }

    pub fn list(&self) -> anyhow::Result<Vec<CollectionRecord>> {
        self.store.list_collections()
    }

    pub fn get(&self, identifier: &str) -> anyhow::Result<Option<CollectionRecord>> {
        self.store.get_collection(identifier)
    }

    pub fn add(&self, mut record: CollectionRecord) -> Result<CollectionRecord, CollectionError> {
        let kind = Self::validate(
            &record.identifier,
            &record.schedule,
            &record.class_name,
            &record.settings,
        )?;
        if self.store.get_collection(&record.identifier)?.is_some() {
            return Err(CollectionError::DuplicateIdentifier(record.identifier));
        }

        record.id = None;
        let id = self.store.upsert_collection(&record)?;
        record.id = Some(id);
        info!("Added \"{}\"", record.identifier);

        if record.enabled {
            self.spawn_worker(record.clone(), kind);
        }
        Ok(record)
    }

    /// Apply a patch. The worker is destroyed and respawned on any change,
    /// including the empty patch.
    pub fn modify(
        &self,
        identifier: &str,
        patch: CollectionPatch,
    ) -> Result<CollectionRecord, CollectionError> {
        let stored = self
            .store
            .get_collection(identifier)?
            .ok_or(CollectionError::NotFound)?;

        let new_identifier = patch.identifier.unwrap_or_else(|| stored.identifier.clone());
        if new_identifier != stored.identifier
            && self.store.get_collection(&new_identifier)?.is_some()
        {
            return Err(CollectionError::DuplicateIdentifier(new_identifier));
        }

        let class_name = patch.class_name.unwrap_or_else(|| stored.class_name.clone());
        let merge_kind = StrategyKind::from_class_name(&class_name)
            .ok_or_else(|| CollectionError::UnknownClass(class_name.clone()))?;
        let settings = match patch.settings {
            Some(settings) => merge_kind.merge_patch_settings(&stored.settings, settings),
            None => stored.settings.clone(),
        };

        let record = CollectionRecord {
            id: stored.id,
            identifier: new_identifier,
            display_name: patch.display_name.unwrap_or_else(|| stored.display_name.clone()),
            schedule: patch.schedule.unwrap_or_else(|| stored.schedule.clone()),
            enabled: patch.enabled.unwrap_or(stored.enabled),
            class_name,
            settings,
        };
        let kind = Self::validate(
            &record.identifier,
            &record.schedule,
            &record.class_name,
            &record.settings,
        )?;

        self.stop_worker(&stored.identifier);
        self.store.upsert_collection(&record)?;
        info!("Modified \"{}\"", record.identifier);

        if record.enabled {
            self.spawn_worker(record.clone(), kind);
        }
        Ok(record)
    }

    pub fn remove(&self, identifier: &str) -> Result<(), CollectionError> {
        if self.store.get_collection(identifier)?.is_none() {
            return Err(CollectionError::NotFound);
        }
        self.stop_worker(identifier);
        self.store.delete_collection(identifier)?;
        info!("Removed \"{}\"", identifier);
        Ok(())
    }

    /// Schedule a one-shot scan at `now + delay` for an enabled collection.
    pub fn manual_scan(&self, identifier: &str, delay: Duration) -> Result<(), CollectionError> {
        let record = self
            .store
            .get_collection(identifier)?
            .ok_or(CollectionError::NotFound)?;
        if !record.enabled {
            return Err(CollectionError::NotFound);
        }

        let workers = self.workers.lock().unwrap();
        let handle = workers.get(identifier).ok_or(CollectionError::NotFound)?;
        if !handle.request_update(delay) {
            error!("Worker \"{}\" is not accepting updates", identifier);
        }
        Ok(())
    }

    /// Resolve the concrete URL and metadata of a selected photo through its
    /// owning collection's strategy.
    pub fn photo_info(
        &self,
        collection_id: i64,
        photo_id: i64,
    ) -> anyhow::Result<Option<PhotoInfo>> {
        let Some(record) = self.store.get_collection_by_id(collection_id)? else {
            return Ok(None);
        };
        let Some(kind) = StrategyKind::from_class_name(&record.class_name) else {
            error!(
                "Invalid class name for \"{}\": {}",
                record.identifier, record.class_name
            );
            return Ok(None);
        };
        self.store
            .with_connection(|conn| kind.photo_info(conn, &record, photo_id))
    }

    /// Stop every worker. Called from the SIGINT path.
    pub fn stop_all(&self) {
        let workers: Vec<(String, WorkerHandle)> =
            self.workers.lock().unwrap().drain().collect();
        for (identifier, handle) in workers {
            info!("Stopping \"{}\"", identifier);
            handle.stop();
        }
        info!("Stopped all collections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn make_manager() -> (CollectionManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PhotoStore::new(dir.path().join("photo.db")).unwrap());
        (CollectionManager::new(store), dir)
    }

    fn dummy_record(identifier: &str) -> CollectionRecord {
        CollectionRecord {
            id: None,
            identifier: identifier.to_string(),
            display_name: identifier.to_string(),
            schedule: String::new(),
            enabled: true,
            class_name: "DummyCollection".to_string(),
            settings: json!({}),
        }
    }

    #[test]
    fn test_add_get_remove() {
        let (manager, _dir) = make_manager();
        let added = manager.add(dummy_record("family")).unwrap();
        assert!(added.id.is_some());

        let fetched = manager.get("family").unwrap().unwrap();
        assert_eq!(fetched, added);

        manager.remove("family").unwrap();
        assert!(manager.get("family").unwrap().is_none());
        assert!(matches!(
            manager.remove("family"),
            Err(CollectionError::NotFound)
        ));
        manager.stop_all();
    }

    #[test]
    fn test_add_rejects_duplicates_and_bad_input() {
        let (manager, _dir) = make_manager();
        manager.add(dummy_record("family")).unwrap();

        assert!(matches!(
            manager.add(dummy_record("family")),
            Err(CollectionError::DuplicateIdentifier(_))
        ));

        let mut bad_identifier = dummy_record("2bad");
        bad_identifier.identifier = "2bad".to_string();
        assert!(matches!(
            manager.add(bad_identifier),
            Err(CollectionError::InvalidIdentifier)
        ));

        let mut bad_class = dummy_record("other");
        bad_class.class_name = "NoSuchCollection".to_string();
        assert!(matches!(
            manager.add(bad_class),
            Err(CollectionError::UnknownClass(_))
        ));

        let mut bad_schedule = dummy_record("other");
        bad_schedule.schedule = "whenever".to_string();
        assert!(matches!(
            manager.add(bad_schedule),
            Err(CollectionError::Schedule(_))
        ));

        let mut bad_settings = dummy_record("other");
        bad_settings.settings = json!({"unexpected": 1});
        assert!(matches!(
            manager.add(bad_settings),
            Err(CollectionError::Settings(_))
        ));
        manager.stop_all();
    }

    #[test]
    fn test_modify_merges_and_renames() {
        let (manager, _dir) = make_manager();
        let added = manager.add(dummy_record("family")).unwrap();

        // The empty patch is a semantic no-op.
        let unchanged = manager.modify("family", CollectionPatch::default()).unwrap();
        assert_eq!(unchanged, added);

        let renamed = manager
            .modify(
                "family",
                CollectionPatch {
                    identifier: Some("relatives".to_string()),
                    display_name: Some("The relatives".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.identifier, "relatives");
        assert_eq!(renamed.display_name, "The relatives");
        assert_eq!(renamed.id, added.id);
        assert!(manager.get("family").unwrap().is_none());

        // Renaming over an existing identifier is rejected.
        manager.add(dummy_record("other")).unwrap();
        assert!(matches!(
            manager.modify(
                "relatives",
                CollectionPatch {
                    identifier: Some("other".to_string()),
                    ..Default::default()
                }
            ),
            Err(CollectionError::DuplicateIdentifier(_))
        ));
        manager.stop_all();
    }

    #[test]
    fn test_manual_scan_requires_enabled_collection() {
        let (manager, _dir) = make_manager();
        let mut disabled = dummy_record("off");
        disabled.enabled = false;
        manager.add(disabled).unwrap();

        assert!(matches!(
            manager.manual_scan("off", Duration::from_secs(0)),
            Err(CollectionError::NotFound)
        ));
        assert!(matches!(
            manager.manual_scan("missing", Duration::from_secs(0)),
            Err(CollectionError::NotFound)
        ));

        manager.add(dummy_record("on")).unwrap();
        manager.manual_scan("on", Duration::from_secs(60)).unwrap();
        manager.stop_all();
    }

    #[test]
    fn test_disabled_collection_has_no_worker() {
        let (manager, _dir) = make_manager();
        let mut record = dummy_record("off");
        record.enabled = false;
        manager.add(record).unwrap();
        assert!(manager.workers.lock().unwrap().is_empty());

        // Enabling through a patch spawns the worker; disabling removes it.
        manager
            .modify(
                "off",
                CollectionPatch {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(manager.workers.lock().unwrap().contains_key("off"));

        manager
            .modify(
                "off",
                CollectionPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(manager.workers.lock().unwrap().is_empty());
        manager.stop_all();
    }
}
