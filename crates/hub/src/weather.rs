//! Yesterday's weather signal from the KNMI daily-data service.
//!
//! The service answers with a comment block (`#` lines), a header row and a
//! single data row:
//!
//! ```text
//! # STN,YYYYMMDD,   DR,   RH,  RHX,  EV24
//! #
//!   240,20160608,    0,    0,    0,   41
//! ```
//!
//! The header row sits two lines above the data row. Only the columns listed
//! in [`WeatherMetric`] are kept.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{Days, Local, NaiveDate};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Default KNMI daily-data endpoint.
pub const KNMI_BASE_URL: &str = "http://projects.knmi.nl/klimatologie/daggegevens/getdata_dag.cgi";

/// Schiphol airport.
pub const DEFAULT_STATION: u32 = 240;

// ---------------------------------------------------------------------------
// Metric codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherMetric {
    /// Reference crop evaporation (Makkink), in 0.1 mm.
    Transpiration,
    /// Precipitation duration, in 0.1 hour.
    PrecipitationDuration,
    /// Daily precipitation amount, in 0.1 mm.
    PrecipitationMillimeters,
    /// Highest hourly precipitation amount, in 0.1 mm.
    PrecipitationMaxHourMillimeters,
}

/// Metric <-> KNMI column code. One row per metric, one metric per code.
const CODE_TABLE: [(WeatherMetric, &str); 4] = [
    (WeatherMetric::Transpiration, "EV24"),
    (WeatherMetric::PrecipitationDuration, "DR"),
    (WeatherMetric::PrecipitationMillimeters, "RH"),
    (WeatherMetric::PrecipitationMaxHourMillimeters, "RHX"),
];

impl WeatherMetric {
    pub fn code(self) -> &'static str {
        CODE_TABLE
            .iter()
            .find(|(metric, _)| *metric == self)
            .map(|(_, code)| *code)
            .unwrap_or_default()
    }

    /// Look up a metric by its wire code. Unknown codes yield `None`.
    pub fn from_code(code: &str) -> Option<Self> {
        CODE_TABLE
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(metric, _)| *metric)
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// One day of weather values. Missing metrics are normal: the feed often
/// leaves cells empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WeatherReading {
    values: BTreeMap<WeatherMetric, i64>,
}

impl WeatherReading {
    pub fn get(&self, metric: WeatherMetric) -> Option<i64> {
        self.values.get(&metric).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WeatherMetric, i64)> + '_ {
        self.values.iter().map(|(m, v)| (*m, *v))
    }
}

impl FromIterator<(WeatherMetric, i64)> for WeatherReading {
    fn from_iter<I: IntoIterator<Item = (WeatherMetric, i64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider port
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("weather request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("weather service returned HTTP {0}")]
    Status(u16),
}

/// Source of yesterday's weather reading.
pub trait WeatherProvider: Send + Sync + 'static {
    fn yesterday(&self) -> impl Future<Output = Result<WeatherReading, WeatherError>> + Send;
}

// ---------------------------------------------------------------------------
// KNMI client
// ---------------------------------------------------------------------------

pub struct KnmiClient {
    http: reqwest::Client,
    base_url: String,
    station: u32,
}

impl KnmiClient {
    pub fn new(base_url: impl Into<String>, station: u32, timeout: Duration) -> Result<Self, WeatherError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            station,
        })
    }

    /// URL for a single day of precipitation data.
    pub fn day_url(&self, day: NaiveDate) -> String {
        let date = day.format("%Y%m%d");
        format!(
            "{}?stns={}&vars=PRCP&start={date}&end={date}",
            self.base_url, self.station
        )
    }

    pub async fn fetch_day(&self, day: NaiveDate) -> Result<WeatherReading, WeatherError> {
        let url = self.day_url(day);
        debug!(%url, "fetching weather data");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(WeatherError::Status(response.status().as_u16()));
        }
        let body = response.text().await?;
        Ok(parse_daily_data(&body))
    }
}

impl WeatherProvider for KnmiClient {
    async fn yesterday(&self) -> Result<WeatherReading, WeatherError> {
        let today = Local::now().date_naive();
        let day = today.checked_sub_days(Days::new(1)).unwrap_or(today);
        self.fetch_day(day).await
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse the KNMI text format into a reading. Malformed input yields an
/// empty reading rather than an error.
pub fn parse_daily_data(raw: &str) -> WeatherReading {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let Some(data_idx) = lines.iter().position(|l| !l.starts_with('#')) else {
        warn!("weather data contains no data row");
        return WeatherReading::default();
    };
    if data_idx < 2 {
        warn!(data_idx, "weather data has no header row above the data row");
        return WeatherReading::default();
    }

    let names = split_row(lines[data_idx - 2]);
    let values = split_row(lines[data_idx]);
    if names.len() != values.len() {
        error!(
            header = names.len(),
            data = values.len(),
            "weather header and data column counts differ"
        );
        return WeatherReading::default();
    }

    names
        .iter()
        .zip(values.iter())
        .filter_map(|(name, value)| {
            let metric = WeatherMetric::from_code(name)?;
            match value.parse::<i32>() {
                Ok(v) => Some((metric, i64::from(v))),
                Err(_) => {
                    warn!(code = metric.code(), value = %value, "unable to parse weather value");
                    None
                }
            }
        })
        .collect()
}

fn split_row(line: &str) -> Vec<String> {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    compact.split(',').map(str::to_string).collect()
}

// ===========================================================================
// Tests
// ===========================================================================
