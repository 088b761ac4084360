//! The watering run: settings → weather → duration → device → notification.
//!
//! Every failure along the way is folded into the [`TaskOutcome`] or logged.
//! Nothing escapes to the scheduler, so one bad day never stops the next.

use chrono::Local;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigProvider, EMAIL_DEBUG};
use crate::device::{DeviceClient, DeviceDispatcher};
use crate::notify::{Notification, Notifier};
use crate::policy::{DurationPolicy, WateringDecision};
use crate::weather::WeatherProvider;

pub const SUBJECT: &str = "Wateringsystem";

/// Result of one run. Sent out with the notification, then dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub watered: bool,
    pub minutes: i64,
    pub explanation: String,
    pub error: Option<String>,
}

impl TaskOutcome {
    fn deactivated() -> Self {
        Self {
            watered: false,
            minutes: 0,
            explanation: "Wateringsystem deactivated".to_string(),
            error: None,
        }
    }

    fn watered(decision: WateringDecision) -> Self {
        Self {
            watered: true,
            minutes: decision.minutes,
            explanation: format!(
                "Successfully watered the plants for {} minutes.\n{}",
                decision.minutes, decision.explanation
            ),
            error: None,
        }
    }

    fn skipped(decision: WateringDecision) -> Self {
        Self {
            watered: false,
            minutes: decision.minutes,
            explanation: format!(
                "Not watering the plants this time.\n{}",
                decision.explanation
            ),
            error: None,
        }
    }

    fn device_failed(decision: WateringDecision, cause: String) -> Self {
        Self {
            watered: false,
            minutes: decision.minutes,
            explanation: format!(
                "Calling the watering system failed; the plants were not watered.\n{}",
                decision.explanation
            ),
            error: Some(format!(
                "An exception was caught while trying to call the watering system. Message: {cause}"
            )),
        }
    }

    /// Mail body: the error first when there is one.
    pub fn message_body(&self) -> String {
        match &self.error {
            Some(e) => format!("{e}\n\n{}", self.explanation),
            None => self.explanation.clone(),
        }
    }
}

pub struct WateringTask<C, W, D, N> {
    config: C,
    weather: W,
    dispatcher: DeviceDispatcher<D>,
    notifier: N,
    policy: DurationPolicy,
}

impl<C, W, D, N> WateringTask<C, W, D, N>
where
    C: ConfigProvider,
    W: WeatherProvider,
    D: DeviceClient,
    N: Notifier,
{
    pub fn new(config: C, weather: W, device: D, notifier: N) -> Self {
        Self {
            config,
            weather,
            dispatcher: DeviceDispatcher::new(device),
            notifier,
            policy: DurationPolicy,
        }
    }

    pub async fn run(&self) -> TaskOutcome {
        let settings = self.config.load();
        if !settings.watering_enabled() {
            debug!(empty_settings = settings.is_empty(), "wateringsystem deactivated");
            return TaskOutcome::deactivated();
        }

        info!(
            at = %Local::now().to_rfc2822(),
            "running garden water task"
        );

        let reading = match self.weather.yesterday().await {
            Ok(reading) => {
                if reading.is_empty() {
                    warn!("weather data contained no usable values");
                }
                debug!(values = reading.len(), "weather data received");
                for (metric, value) in reading.iter() {
                    debug!(?metric, value, "weather");
                }
                Some(reading)
            }
            Err(e) => {
                warn!("weather data unavailable, using default minutes: {e}");
                None
            }
        };

        let decision = self.policy.decide(reading.as_ref());
        info!(minutes = decision.minutes, source = ?decision.source, "watering minutes decided");

        let outcome = if decision.should_water() {
            match self.dispatcher.dispatch(&settings, decision.minutes).await {
                Ok(_) => TaskOutcome::watered(decision),
                Err(e) => {
                    error!("failed to call watering device: {e}");
                    TaskOutcome::device_failed(decision, e.to_string())
                }
            }
        } else {
            info!(minutes = decision.minutes, "skipping watering");
            TaskOutcome::skipped(decision)
        };

        let notification = Notification::text(SUBJECT, outcome.message_body())
            .debug(settings.flag(EMAIL_DEBUG).unwrap_or(true));
        if let Err(e) = self.notifier.send(&notification).await {
            error!("failed to send outcome notification: {e}");
        }

        outcome
    }
}

// ===========================================================================
// Tests
// ===========================================================================

/// Scripted collaborators for exercising the task without network access.
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use crate::device::DispatchError;
    use crate::notify::NotifyError;
    use crate::weather::{WeatherError, WeatherMetric, WeatherReading};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct FakeWeather {
        pub transpiration: Option<i64>,
        pub fail: bool,
        pub calls: Arc<AtomicUsize>,
    }

    impl WeatherProvider for FakeWeather {
        async fn yesterday(&self) -> Result<WeatherReading, WeatherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(WeatherError::Status(500));
            }
            Ok(self
                .transpiration
                .map(|t| (WeatherMetric::Transpiration, t))
                .into_iter()
                .collect())
        }
    }

    #[derive(Clone, Default)]
    pub struct FakeDevice {
        pub fail: bool,
        pub calls: Arc<Mutex<Vec<(String, i64)>>>,
    }

    impl DeviceClient for FakeDevice {
        async fn set_timer(&self, base_url: &str, minutes: i64) -> Result<String, DispatchError> {
            self.calls
                .lock()
                .unwrap()
                .push((base_url.to_string(), minutes));
            if self.fail {
                Err(DispatchError::Status(502))
            } else {
                Ok(format!(r#"{{"timer":{minutes}}}"#))
            }
        }
    }

    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub fail: bool,
        pub sent: Arc<Mutex<Vec<Notification>>>,
    }

    impl Notifier for RecordingNotifier {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            if self.fail {
                Err(NotifyError::NoRecipients)
            } else {
                Ok(())
            }
        }
    }
}
