//! Remote irrigation controller. The device exposes a single endpoint,
//! `GET <base-url>?setTimer=<minutes>`, and answers with a flat JSON object
//! of integer telemetry values.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Settings, DEVICE_BASE_URL};

/// Used when the settings don't name the device.
pub const DEFAULT_DEVICE_URL: &str = "http://192.168.1.12";

/// Device telemetry reply. Logged, never used for decisions.
pub type DeviceResponse = BTreeMap<String, i64>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid watering duration: {0} minutes")]
    InvalidDuration(i64),
    #[error("device request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("device returned HTTP {0}")]
    Status(u16),
    #[error("malformed device reply: {0}")]
    MalformedReply(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Client port
// ---------------------------------------------------------------------------

/// Transport to the device: sends the timer request, returns the raw body.
pub trait DeviceClient: Send + Sync + 'static {
    fn set_timer(
        &self,
        base_url: &str,
        minutes: i64,
    ) -> impl Future<Output = Result<String, DispatchError>> + Send;
}

pub struct HttpDeviceClient {
    http: reqwest::Client,
}

impl HttpDeviceClient {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

pub fn timer_url(base_url: &str, minutes: i64) -> String {
    format!("{base_url}?setTimer={minutes}")
}

impl DeviceClient for HttpDeviceClient {
    async fn set_timer(&self, base_url: &str, minutes: i64) -> Result<String, DispatchError> {
        let url = timer_url(base_url, minutes);
        debug!(%url, "calling watering device");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DispatchError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Sends a watering duration to the device, once. Retrying is left to the
/// next scheduled run.
pub struct DeviceDispatcher<D> {
    client: D,
}

impl<D: DeviceClient> DeviceDispatcher<D> {
    pub fn new(client: D) -> Self {
        Self { client }
    }

    pub async fn dispatch(
        &self,
        settings: &Settings,
        minutes: i64,
    ) -> Result<DeviceResponse, DispatchError> {
        if minutes <= 0 {
            return Err(DispatchError::InvalidDuration(minutes));
        }

        let base_url = settings.get(DEVICE_BASE_URL).unwrap_or(DEFAULT_DEVICE_URL);
        let body = self.client.set_timer(base_url, minutes).await?;
        let response = parse_reply(&body)?;

        for (key, value) in &response {
            debug!(key = %key, value, "device telemetry");
        }
        info!(minutes, values = response.len(), "device accepted timer");
        Ok(response)
    }
}

/// Decode the device's flat JSON object. Non-integer values are malformed.
pub fn parse_reply(body: &str) -> Result<DeviceResponse, DispatchError> {
    Ok(serde_json::from_str(body)?)
}

// ===========================================================================
// Tests
// ===========================================================================
