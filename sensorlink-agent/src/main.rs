//! SensorLink Agent - publishes shell-command sensors to Home Assistant over MQTT
//!
//! Usage: `sensorlink [CONFIG]`. Without an argument the config path comes
//! from `SENSORLINK_CONFIG`, then the OS config directory.

use anyhow::{Context, Result};
use sensorlink_agent::{scheduler, AppConfig, RumqttTransport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sensorlink_agent=info,sensorlink=info")),
        )
        .init();

    let path = AppConfig::resolve_path(std::env::args().nth(1))?;
    info!("SensorLink {} starting with {}", sensorlink_agent::SOFTWARE_VERSION, path.display());

    let config = AppConfig::load(&path).await?;
    let (model, settings) = config
        .into_runtime()
        .context("Invalid configuration")?;

    let handle = scheduler::start(model, settings, RumqttTransport::new())
        .context("Invalid configuration")?;

    tokio::spawn(shutdown_on_signal(handle.cancellation_token()));

    handle.wait().await.context("Agent execution failed")?;
    info!("SensorLink stopped");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    info!("Shutdown requested");
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
