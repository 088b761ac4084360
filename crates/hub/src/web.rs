use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ConfigProvider;
use crate::device::DeviceClient;
use crate::notify::Notifier;
use crate::state::SharedState;
use crate::task::{TaskOutcome, WateringTask};
use crate::weather::WeatherProvider;

/// Something that can run the watering task on demand.
pub trait Trigger: Send + Sync + 'static {
    fn trigger(&self) -> impl Future<Output = TaskOutcome> + Send;
}

impl<C, W, D, N> Trigger for WateringTask<C, W, D, N>
where
    C: ConfigProvider,
    W: WeatherProvider,
    D: DeviceClient,
    N: Notifier,
{
    fn trigger(&self) -> impl Future<Output = TaskOutcome> + Send {
        self.run()
    }
}

pub struct AppState<T> {
    pub shared: SharedState,
    pub task: Arc<T>,
}

impl<T> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            task: Arc::clone(&self.task),
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<T: Trigger>(state: AppState<T>) -> Router {
    Router::new()
        .route("/run", get(run_now::<T>))
        .route("/api/status", get(api_status::<T>))
        .with_state(state)
}

/// Runs the watering task synchronously. Meant for testing the setup, not
/// for production scheduling.
async fn run_now<T: Trigger>(State(state): State<AppState<T>>) -> impl IntoResponse {
    info!("manual watering run requested");
    Json(state.task.trigger().await)
}

async fn api_status<T: Trigger>(State(state): State<AppState<T>>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<T: Trigger>(
    state: AppState<T>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!("web listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
