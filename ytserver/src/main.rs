use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ytserver::cleanup;
use ytserver::config::Settings;
use ytserver::download::Downloader;
use ytserver::routes::{self, AppState};
use ytserver::ytdlp::YtDlp;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();

    std::fs::create_dir_all(&settings.cookies_dir)
        .with_context(|| format!("creating cookies directory {}", settings.cookies_dir.display()))?;
    std::fs::create_dir_all(&settings.temp_dir)
        .with_context(|| format!("creating download directory {}", settings.temp_dir.display()))?;

    info!("Cookies directory: {}", settings.cookies_dir.display());
    info!("Download directory: {}", settings.temp_dir.display());
    if settings.reload {
        warn!("RELOAD is set but auto-reload is not supported; ignoring");
    }

    cleanup::spawn_sweeper(
        settings.temp_dir.clone(),
        Duration::from_secs(settings.stale_job_max_age),
    );

    let addr = settings.bind_addr();
    let state = AppState::new(settings, Downloader::new(Arc::new(YtDlp)));
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("ytserver listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {e}");
    }
}
