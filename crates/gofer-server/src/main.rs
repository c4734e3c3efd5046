use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use gofer_server::external_events;
use gofer_server::logging;
use gofer_server::routes;
use gofer_server::state::AppState;

use gofer::conf::Settings;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Gofer orchestration server
    Serve {
        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => serve(config.as_deref()).await,
    }
}

async fn serve(config_path: Option<&std::path::Path>) -> Result<()> {
    let settings = Settings::new(config_path)?;
    logging::setup(&settings.api.log_level, settings.development.pretty_logging);

    let state = AppState::new(settings).await?;

    if state.settings.external_events.enable {
        let external_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = external_events::serve(external_state).await {
                tracing::error!(error = %e, "external events listener exited");
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state.clone()).layer(cors);

    let listener = tokio::net::TcpListener::bind(&state.settings.server.bind_address).await?;
    info!(address = %listener.local_addr()?, "gofer server listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received; stopping extensions and runs");

            shutdown_state.extensions.stop_all().await;
            shutdown_state.shutdown.cancel();
        })
        .await?;

    info!("server shutdown complete");
    Ok(())
}
