use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cadre::config::AfficheConfig;
use cadre::display::{prepare_temp_dirs, DisplayEngine};
use cadre::server::{run_affiche_server, AfficheState, RequestsLoggingLevel};

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to the JSON configuration file. Overrides AFFICHE_CONFIG_PATH.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 5001)]
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

    let config = AfficheConfig::load(cli_args.config.as_deref())?;
    if config.display_writer_command.is_empty() {
        bail!("DISPLAY_WRITER_COMMAND must be configured");
    }
    info!("Configuration loaded:");
    info!("  temp_path: {:?}", config.temp_path);
    info!("  display_writer: {:?}", config.display_writer_command);

    let (upload_dir, preview_dir) = prepare_temp_dirs(&config.temp_path)?;
    let engine = Arc::new(DisplayEngine::new(
        config.display_writer_command.clone(),
        upload_dir,
        preview_dir,
    ));

    let state = AfficheState {
        engine,
        config: Arc::new(config),
        http: reqwest::Client::new(),
        port: cli_args.port,
        frontend_dir: cli_args.frontend_dir_path.clone(),
    };

    info!("Ready to serve at port {}!", cli_args.port);
    tokio::select! {
        result = run_affiche_server(state, cli_args.port, cli_args.logging_level.clone()) => {
            info!("HTTP server stopped: {:?}", result);
            result
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    }
}
