mod config;
mod device;
mod notify;
mod policy;
mod scheduler;
mod state;
mod task;
mod weather;
mod web;

use anyhow::{Context, Result};
use chrono::Local;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use config::{FileConfig, HostConfig};
use device::HttpDeviceClient;
use notify::MailNotifier;
use scheduler::{LocalClock, RecurrenceScheduler};
use state::SystemState;
use task::WateringTask;
use weather::KnmiClient;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let host = HostConfig::from_env()?;
    info!(
        settings = %host.settings_path.display(),
        watering_at = %host.watering_at,
        web_port = host.web_port,
        "hub starting"
    );

    // ── Collaborators ───────────────────────────────────────────────
    let settings = FileConfig::new(&host.settings_path);
    let weather = KnmiClient::new(host.knmi_url.clone(), host.knmi_station, host.http_timeout)
        .context("failed to build weather client")?;
    let device =
        HttpDeviceClient::new(host.http_timeout).context("failed to build device client")?;
    let notifier = MailNotifier::new(
        settings.clone(),
        host.smtp_host.clone(),
        host.smtp_port,
        host.http_timeout,
    );
    let task = Arc::new(WateringTask::new(settings, weather, device, notifier));

    // ── Shared state (ephemeral, for the status endpoint) ───────────
    let shared = Arc::new(RwLock::new(SystemState::new()));

    // ── Recurrences ─────────────────────────────────────────────────
    let scheduler = RecurrenceScheduler::new();

    let daily_task = Arc::clone(&task);
    scheduler.spawn_daily(
        "watering",
        host.watering_at,
        LocalClock,
        Arc::clone(&shared),
        move || {
            let task = Arc::clone(&daily_task);
            async move {
                let outcome = task.run().await;
                info!(
                    watered = outcome.watered,
                    minutes = outcome.minutes,
                    failed = outcome.error.is_some(),
                    "scheduled watering finished"
                );
            }
        },
    );

    let heartbeat_state = Arc::clone(&shared);
    scheduler.spawn_every("heartbeat", host.heartbeat, move || {
        let shared = Arc::clone(&heartbeat_state);
        async move {
            debug!(at = %Local::now().to_rfc2822(), "heartbeat");
            shared.write().await.record_heartbeat();
        }
    });

    // ── Web server (until Ctrl-C) ───────────────────────────────────
    let served = web::serve(AppState { shared, task }, host.web_port, shutdown_signal()).await;

    scheduler.shutdown().await;
    info!("hub stopped");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
