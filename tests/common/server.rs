//! Test server lifecycle management
//!
//! Each test gets an isolated server with its own database and temp
//! directories, bound to a random port.

use cadre::collections::CollectionManager;
use cadre::config::AfficheConfig;
use cadre::display::{prepare_temp_dirs, DisplayEngine};
use cadre::photo_store::PhotoStore;
use cadre::refresh::create_refresh_scheduler;
use cadre::server::{
    make_affiche_router, make_expo_router, AfficheState, ExpoState, RequestsLoggingLevel,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A curator instance under test.
pub struct TestExpoServer {
    pub base_url: String,
    pub store: Arc<PhotoStore>,
    pub collections: Arc<CollectionManager>,

    _temp_dir: TempDir,
    shutdown_token: CancellationToken,
}

impl TestExpoServer {
    pub async fn spawn() -> Self {
        Self::spawn_with_post_commands(BTreeMap::new()).await
    }

    pub async fn spawn_with_post_commands(
        post_commands: BTreeMap<String, Vec<String>>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            PhotoStore::new(temp_dir.path().join("photo.db")).expect("Failed to open photo store"),
        );
        let collections = Arc::new(CollectionManager::new(Arc::clone(&store)));

        let shutdown_token = CancellationToken::new();
        let post_commands = Arc::new(post_commands);
        let (mut scheduler, refresh_handle) = create_refresh_scheduler(
            Arc::clone(&store),
            Arc::clone(&collections),
            Arc::clone(&post_commands),
            shutdown_token.clone(),
        );
        tokio::spawn(async move { scheduler.run().await });

        let state = ExpoState {
            store: Arc::clone(&store),
            collections: Arc::clone(&collections),
            refresh: refresh_handle,
            post_commands,
            frontend_dir: None,
        };
        let router = make_expo_router(state, RequestsLoggingLevel::None);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("Server failed");
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            store,
            collections,
            _temp_dir: temp_dir,
            shutdown_token,
        }
    }
}

impl Drop for TestExpoServer {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        self.collections.stop_all();
    }
}

/// A display agent instance under test, driven by a scripted fake of the
/// conversion binary.
pub struct TestAfficheServer {
    pub base_url: String,
    pub engine: Arc<DisplayEngine>,
    pub upload_dir: PathBuf,
    pub preview_dir: PathBuf,

    _temp_dir: TempDir,
}

impl TestAfficheServer {
    /// Spawn with a shell script standing in for the display writer. The
    /// script receives the standard argv:
    /// `<image> --options <json> --info <json> --preview <path>`.
    pub async fn spawn(writer_script: &str) -> Self {
        Self::spawn_with_expo_address(writer_script, None).await
    }

    pub async fn spawn_with_expo_address(
        writer_script: &str,
        expo_address: Option<String>,
    ) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let script_path = temp_dir.path().join("writer.sh");
        std::fs::write(&script_path, writer_script).expect("Failed to write script");
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (upload_dir, preview_dir) =
            prepare_temp_dirs(&temp_dir.path().join("temp")).expect("Failed to prepare temp dirs");
        let command = vec![
            "/bin/sh".to_string(),
            script_path.to_string_lossy().to_string(),
        ];
        let engine = Arc::new(DisplayEngine::new(
            command.clone(),
            upload_dir.clone(),
            preview_dir.clone(),
        ));

        let mut config =
            AfficheConfig::load(Some(&temp_dir.path().join("missing.json"))).unwrap();
        config.display_writer_command = command;
        config.expo_address = expo_address;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();

        let state = AfficheState {
            engine: Arc::clone(&engine),
            config: Arc::new(config),
            http: reqwest::Client::new(),
            port,
            frontend_dir: None,
        };
        let router = make_affiche_router(state, RequestsLoggingLevel::None);
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("Server failed");
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            engine,
            upload_dir,
            preview_dir,
            _temp_dir: temp_dir,
        }
    }
}
