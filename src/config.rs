/// Service configuration.
///
/// Static settings live in a TOML file read once at startup. Secrets come
/// from the environment (a `.env` file is honored via `dotenv`) so the
/// TOML can be committed alongside deployments.
///
/// Station metadata is *not* here; it is reloadable and lives in
/// `stations::StationDirectory`.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::model::HISTORY_CAPACITY;

pub const DEFAULT_CONFIG_PATH: &str = "hydrolink.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing setting: {0}")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub topic: String,
    pub client_id: String,
    /// Broker username. The password is read from `MQTT_PASSWORD`.
    pub username: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            host: "localhost".to_string(),
            port: 1883,
            tls: false,
            topic: "v3/+/devices/+/up".to_string(),
            client_id: "hydrolink-ingest".to_string(),
            username: None,
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LegacyBusConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for LegacyBusConfig {
    fn default() -> Self {
        LegacyBusConfig {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "hydrolink-legacy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SheetsConfig {
    pub spreadsheet_id: Option<String>,
    /// Offset applied to the local-time timestamp column, in hours east of UTC.
    pub utc_offset_hours: i32,
    pub api_base: String,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        SheetsConfig {
            spreadsheet_id: None,
            utc_offset_hours: 7,
            api_base: "https://sheets.googleapis.com/v4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    /// Free-form selector, e.g. "postgres", "google_sheets", "postgres+sheets".
    #[serde(rename = "type")]
    pub kind: String,
    pub google_sheets: SheetsConfig,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        DataSourceConfig {
            kind: "postgres".to_string(),
            google_sheets: SheetsConfig::default(),
        }
    }
}

impl DataSourceConfig {
    pub fn relational_enabled(&self) -> bool {
        self.kind.to_lowercase().contains("postgres")
    }

    pub fn spreadsheet_enabled(&self) -> bool {
        let kind = self.kind.to_lowercase();
        kind.contains("google") || kind.contains("sheet")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub bind: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            bind: "0.0.0.0:4000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
    pub bootstrap_hours: i64,
    /// Per-backend limit on the startup history load.
    pub bootstrap_timeout_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            capacity: HISTORY_CAPACITY,
            bootstrap_hours: 48,
            bootstrap_timeout_secs: 30,
        }
    }
}

/// Which scalar a legacy sub-sensor republishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorChannel {
    Level,
    Pressure,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LegacySensor {
    pub id: String,
    pub channel: SensorChannel,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub file: Option<String>,
    pub timestamps: bool,
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub legacy_bus: LegacyBusConfig,
    pub data_source: DataSourceConfig,
    pub realtime: RealtimeConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
    /// Path of the reloadable station settings file.
    pub stations_file: String,
    /// Station id -> sub-sensors republished on the legacy bus.
    pub legacy_sensors: HashMap<String, Vec<LegacySensor>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            mqtt: MqttConfig::default(),
            legacy_bus: LegacyBusConfig::default(),
            data_source: DataSourceConfig::default(),
            realtime: RealtimeConfig::default(),
            history: HistoryConfig::default(),
            logging: LoggingConfig::default(),
            stations_file: "stations.toml".to_string(),
            legacy_sensors: HashMap::new(),
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(raw: &str, path: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Toml {
            path: path.to_string(),
            source,
        })
    }

    /// Loads the config file. A missing file yields defaults so a bare
    /// checkout can run against a local broker.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Ok(AppConfig::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_toml_str(&raw, &display)
    }
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Loads `.env` if present. Safe to call more than once.
pub fn load_env() {
    dotenv::dotenv().ok();
}

pub fn database_url() -> Result<String, ConfigError> {
    env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))
}

pub fn mqtt_password() -> Option<String> {
    env::var("MQTT_PASSWORD").ok()
}

pub fn sheets_token() -> Result<String, ConfigError> {
    env::var("GOOGLE_SHEETS_TOKEN").map_err(|_| ConfigError::Missing("GOOGLE_SHEETS_TOKEN"))
}
