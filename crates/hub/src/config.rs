//! Configuration: watering settings from a TOML file (re-read every run) and
//! host settings from environment variables (read once at startup).

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

use crate::scheduler::DailyTime;
use crate::weather::{DEFAULT_STATION, KNMI_BASE_URL};

// ---------------------------------------------------------------------------
// Setting keys
// ---------------------------------------------------------------------------

pub const ENABLED: &str = "wateringsystem.enabled";
pub const DEVICE_BASE_URL: &str = "garden.arduino.base.url";
pub const EMAIL_USER: &str = "emailUser";
pub const EMAIL_PASSWORD: &str = "emailPassword";
pub const EMAIL_FROM: &str = "emailFrom";
pub const EMAIL_TO: &str = "emailTo";
pub const EMAIL_DEBUG: &str = "emailDebug";

// ---------------------------------------------------------------------------
// Watering settings
// ---------------------------------------------------------------------------

/// Flat string key/value settings for a single task run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `true` only when the value is literally "true" (any case).
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).map(|v| v.trim().eq_ignore_ascii_case("true"))
    }

    pub fn watering_enabled(&self) -> bool {
        self.flag(ENABLED).unwrap_or(false)
    }

    /// Parse TOML, flattening nested tables into dotted keys.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let table: toml::Table = contents.parse()?;
        let mut values = HashMap::new();
        flatten("", &table, &mut values)?;
        Ok(Self { values })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut HashMap<String, String>) -> Result<()> {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(inner) => flatten(&full, inner, out)?,
            toml::Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|item| scalar(&full, item))
                    .collect::<Result<Vec<_>>>()?
                    .join(",");
                out.insert(full, joined);
            }
            other => {
                let rendered = scalar(&full, other)?;
                out.insert(full, rendered);
            }
        }
    }
    Ok(())
}

fn scalar(key: &str, value: &toml::Value) -> Result<String> {
    Ok(match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        toml::Value::Array(_) | toml::Value::Table(_) => {
            bail!("setting '{key}' nests a list or table inside a list")
        }
    })
}

/// Supplies the watering settings at the start of each run.
pub trait ConfigProvider: Send + Sync + 'static {
    fn load(&self) -> Settings;
}

/// Settings file on disk. An unreadable or malformed file yields empty
/// settings, which reads as "watering disabled".
#[derive(Debug, Clone)]
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn try_load(&self) -> Result<Settings> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read settings: {}", self.path.display()))?;
        Settings::from_toml_str(&contents)
            .with_context(|| format!("failed to parse settings: {}", self.path.display()))
    }
}

impl ConfigProvider for FileConfig {
    fn load(&self) -> Settings {
        match self.try_load() {
            Ok(settings) => settings,
            Err(e) => {
                error!("{e:#}; continuing with empty settings");
                Settings::default()
            }
        }
    }
}

/// Fixed in-memory settings.
impl ConfigProvider for Settings {
    fn load(&self) -> Settings {
        self.clone()
    }
}

// ---------------------------------------------------------------------------
// Host configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub settings_path: PathBuf,
    pub web_port: u16,
    pub watering_at: DailyTime,
    pub heartbeat: Duration,
    pub http_timeout: Duration,
    pub knmi_url: String,
    pub knmi_station: u32,
    pub smtp_host: String,
    pub smtp_port: u16,
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let watering_at = match lookup("WATERING_AT") {
            Some(s) => s
                .parse::<DailyTime>()
                .with_context(|| format!("invalid WATERING_AT: {s:?}"))?,
            None => DailyTime::DEFAULT,
        };

        let cfg = Self {
            settings_path: lookup("CONFIG_PATH")
                .unwrap_or_else(|| "wateringsystem.toml".to_string())
                .into(),
            web_port: lookup("WEB_PORT")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(8080),
            watering_at,
            heartbeat: Duration::from_secs(parsed("HEARTBEAT_SECS").unwrap_or(3600)),
            http_timeout: Duration::from_secs(parsed("HTTP_TIMEOUT_SECS").unwrap_or(20)),
            knmi_url: lookup("KNMI_URL").unwrap_or_else(|| KNMI_BASE_URL.to_string()),
            knmi_station: lookup("KNMI_STATION")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_STATION),
            smtp_host: lookup("SMTP_HOST").unwrap_or_else(|| "smtp.gmail.com".to_string()),
            smtp_port: lookup("SMTP_PORT")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(587),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Returns an error describing every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.heartbeat.is_zero() {
            errors.push("HEARTBEAT_SECS must be positive".to_string());
        }
        if self.http_timeout.is_zero() {
            errors.push("HTTP_TIMEOUT_SECS must be positive".to_string());
        }
        if self.knmi_url.trim().is_empty() {
            errors.push("KNMI_URL is empty".to_string());
        }
        if self.smtp_host.trim().is_empty() {
            errors.push("SMTP_HOST is empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "host config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
