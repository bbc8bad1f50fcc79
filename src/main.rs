use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cadre::collections::CollectionManager;
use cadre::config::ExpoConfig;
use cadre::photo_store::PhotoStore;
use cadre::refresh::create_refresh_scheduler;
use cadre::server::{run_expo_server, ExpoState, RequestsLoggingLevel};

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to the JSON configuration file. Overrides EXPO_CONFIG_PATH.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 5000)]
    pub port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Path to the frontend directory to be statically served.
    #[clap(long)]
    pub frontend_dir_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let config = ExpoConfig::load(cli_args.config.as_deref())?;
    info!("Configuration loaded:");
    info!("  db_path: {:?}", config.db_path);
    info!("  post_commands: {:?}", config.post_commands.keys());

    let store = Arc::new(PhotoStore::new(&config.db_path)?);
    let collections = Arc::new(CollectionManager::new(Arc::clone(&store)));
    {
        let collections = Arc::clone(&collections);
        tokio::task::spawn_blocking(move || collections.start_all()).await??;
    }

    let shutdown_token = CancellationToken::new();
    let post_commands = Arc::new(config.post_commands.clone());
    let (mut scheduler, refresh_handle) = create_refresh_scheduler(
        Arc::clone(&store),
        Arc::clone(&collections),
        Arc::clone(&post_commands),
        shutdown_token.clone(),
    );

    let state = ExpoState {
        store,
        collections: Arc::clone(&collections),
        refresh: refresh_handle,
        post_commands,
        frontend_dir: cli_args.frontend_dir_path.clone(),
    };

    info!("Ready to serve at port {}!", cli_args.port);
    let result = tokio::select! {
        result = run_expo_server(state, cli_args.port, cli_args.logging_level.clone()) => {
            info!("HTTP server stopped: {:?}", result);
            shutdown_token.cancel();
            result
        },
        _ = scheduler.run() => {
            info!("Scheduler stopped");
            Ok(())
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown_token.cancel();
            Ok(())
        }
    };

    // Workers are joined off the runtime because stopping them blocks.
    tokio::task::spawn_blocking(move || collections.stop_all()).await?;

    result
}
