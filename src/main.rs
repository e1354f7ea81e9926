//! AirPlay mirroring to FPP matrix overlay daemon

use std::path::PathBuf;
use std::process::ExitCode;

use airplay_matrix::overlay::api::DEFAULT_API_URL;
use airplay_matrix::overlay::buffer::SHM_DIR;
use airplay_matrix::overlay::HttpControlApi;
use airplay_matrix::supervisor::{AirPlayCommands, RuntimePaths, Supervisor};
use airplay_matrix::{Config, StopFlag};
use clap::Parser;
use color_eyre::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "airplay-matrixd", version, about = "Show AirPlay mirroring on an FPP matrix overlay")]
struct Args {
    /// Plugin JSON settings
    #[arg(long)]
    config: PathBuf,

    /// FPP media directory; runtime files go under <media-dir>/tmp
    #[arg(long)]
    media_dir: PathBuf,

    /// Plugin install directory (accepted for the plugin manager, unused)
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Directory holding FPP's overlay shared-memory objects
    #[arg(long, default_value = SHM_DIR)]
    shm_dir: PathBuf,

    /// Base URL of the FPP control API
    #[arg(long, default_value = DEFAULT_API_URL)]
    api_url: String,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,airplay_matrix=info,airplay_matrixd=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config);

    if !config.enabled {
        info!("Plugin disabled in config; exiting");
        return Ok(ExitCode::SUCCESS);
    }

    let stop = StopFlag::new();
    listen_for_shutdown(stop.clone())?;

    let api = HttpControlApi::new(&args.api_url)?;
    let paths = RuntimePaths::new(&args.media_dir).with_shm_dir(&args.shm_dir);
    let commands = AirPlayCommands::from_config(&config);

    let mut supervisor = Supervisor::new(config, api, commands, paths, stop);
    let code = match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_interrupted() => ExitCode::SUCCESS,
        // already logged by the supervisor
        Err(_) => ExitCode::FAILURE,
    };

    info!("AirPlay matrix bridge stopped");
    Ok(code)
}

/// Raise `stop` on SIGINT or SIGTERM
fn listen_for_shutdown(stop: StopFlag) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            info!("Received {}, shutting down", name);
            stop.set();
        }
    });

    Ok(())
}
