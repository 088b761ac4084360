use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Scheduler bookkeeping shown on the status endpoint. Watering outcomes are
/// not kept here; they go out with the notification and are dropped.
pub struct SystemState {
    pub started_at: Instant,
    pub next_watering: Option<NaiveDateTime>,
    pub last_heartbeat: Option<DateTime<Local>>,
    pub completed_runs: u64,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub next_watering: Option<NaiveDateTime>,
    pub last_heartbeat: Option<DateTime<Local>>,
    pub completed_runs: u64,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            next_watering: None,
            last_heartbeat: None,
            completed_runs: 0,
        }
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Some(Local::now());
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            next_watering: self.next_watering,
            last_heartbeat: self.last_heartbeat,
            completed_runs: self.completed_runs,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
