use axum::extract::FromRef;

use crate::collections::CollectionManager;
use crate::config::AfficheConfig;
use crate::display::DisplayEngine;
use crate::photo_store::PhotoStore;
use crate::refresh::RefreshHandle;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub type GuardedPhotoStore = Arc<PhotoStore>;
pub type GuardedCollectionManager = Arc<CollectionManager>;
pub type GuardedPostCommands = Arc<BTreeMap<String, Vec<String>>>;
pub type GuardedDisplayEngine = Arc<DisplayEngine>;
pub type GuardedAfficheConfig = Arc<AfficheConfig>;

/// Handler state of the curator service.
#[derive(Clone)]
pub struct ExpoState {
    pub store: GuardedPhotoStore,
    pub collections: GuardedCollectionManager,
    pub refresh: RefreshHandle,
    pub post_commands: GuardedPostCommands,
    pub frontend_dir: Option<PathBuf>,
}

impl FromRef<ExpoState> for GuardedPhotoStore {
    fn from_ref(input: &ExpoState) -> Self {
        input.store.clone()
    }
}

impl FromRef<ExpoState> for GuardedCollectionManager {
    fn from_ref(input: &ExpoState) -> Self {
        input.collections.clone()
    }
}

impl FromRef<ExpoState> for RefreshHandle {
    fn from_ref(input: &ExpoState) -> Self {
        input.refresh.clone()
    }
}

impl FromRef<ExpoState> for GuardedPostCommands {
    fn from_ref(input: &ExpoState) -> Self {
        input.post_commands.clone()
    }
}

/// Handler state of the display agent service.
#[derive(Clone)]
pub struct AfficheState {
    pub engine: GuardedDisplayEngine,
    pub config: GuardedAfficheConfig,
    pub http: reqwest::Client,
    pub port: u16,
    pub frontend_dir: Option<PathBuf>,
}

impl FromRef<AfficheState> for GuardedDisplayEngine {
    fn from_ref(input: &AfficheState) -> Self {
        input.engine.clone()
    }
}

impl FromRef<AfficheState> for GuardedAfficheConfig {
    fn from_ref(input: &AfficheState) -> Self {
        input.config.clone()
    }
}
