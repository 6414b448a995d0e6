/// Station registry for the ingestion service.
///
/// Maps transport-level station ids to display metadata (name, display id,
/// static coordinates) and decides the sensor class. Unlike the service
/// config this file is reloadable: the directory re-reads it between
/// messages whenever its modification time changes, so an operator edit
/// takes effect on the next uplink without a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::Deserialize;

use crate::config::ConfigError;
use crate::logging::{self, Component};
use crate::model::SensorClass;

// ---------------------------------------------------------------------------
// Station metadata
// ---------------------------------------------------------------------------

/// How a station reports its level field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelUnit {
    /// Values above 10 are taken as centimeters.
    #[default]
    Auto,
    #[serde(alias = "meters")]
    M,
    #[serde(alias = "centimeters")]
    Cm,
}

/// Configured metadata for a single station.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StationConfig {
    /// Human-readable name shown on the dashboard.
    pub name: Option<String>,
    /// WGS84 latitude.
    pub lat: Option<f64>,
    /// WGS84 longitude.
    pub lng: Option<f64>,
    /// Short id used in legacy topics, e.g. "ST001".
    pub display_id: Option<String>,
    #[serde(default)]
    pub level_unit: LevelUnit,
}

impl StationConfig {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        }
    }
}

fn default_float_patterns() -> Vec<String> {
    vec!["hel-v3".to_string()]
}

fn default_float_ids() -> Vec<String> {
    vec!["ST001".to_string()]
}

/// The full contents of the station settings file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StationSettings {
    /// Substrings of station ids that identify float sensors regardless
    /// of their configured name.
    #[serde(default = "default_float_patterns")]
    pub float_id_patterns: Vec<String>,
    /// Station ids that are float sensors, matched exactly.
    #[serde(default = "default_float_ids")]
    pub float_ids: Vec<String>,
    #[serde(default)]
    pub stations: HashMap<String, StationConfig>,
}

impl Default for StationSettings {
    fn default() -> Self {
        let mut stations = HashMap::new();
        stations.insert(
            "test-hel-v3".to_string(),
            StationConfig {
                name: Some("Float Station".to_string()),
                lat: Some(14.422328),
                lng: Some(100.387755),
                display_id: Some("ST001".to_string()),
                level_unit: LevelUnit::Auto,
            },
        );
        stations.insert(
            "test-hel-v3-n2".to_string(),
            StationConfig {
                name: Some("Static Station 1".to_string()),
                lat: Some(14.420291),
                lng: Some(100.389034),
                display_id: None,
                level_unit: LevelUnit::Auto,
            },
        );
        stations.insert(
            "test-hel-wifilora32".to_string(),
            StationConfig {
                name: None,
                lat: None,
                lng: None,
                display_id: Some("ST002".to_string()),
                level_unit: LevelUnit::Auto,
            },
        );
        StationSettings {
            float_id_patterns: default_float_patterns(),
            float_ids: default_float_ids(),
            stations,
        }
    }
}

impl StationSettings {
    pub fn from_toml_str(raw: &str, path: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Toml {
            path: path.to_string(),
            source,
        })
    }

    /// Settings with no stations and no float patterns.
    pub fn empty() -> Self {
        StationSettings {
            float_id_patterns: Vec::new(),
            float_ids: Vec::new(),
            stations: HashMap::new(),
        }
    }

    /// Looks up a station by id. Returns `None` if not configured.
    pub fn find_station(&self, station_id: &str) -> Option<&StationConfig> {
        self.stations.get(station_id)
    }

    /// Configured name, falling back to the raw id.
    pub fn display_name(&self, station_id: &str) -> String {
        self.find_station(station_id)
            .and_then(|s| s.name.clone())
            .unwrap_or_else(|| station_id.to_string())
    }

    /// Configured short id, falling back to the raw id.
    pub fn display_id(&self, station_id: &str) -> String {
        self.find_station(station_id)
            .and_then(|s| s.display_id.clone())
            .unwrap_or_else(|| station_id.to_string())
    }

    pub fn level_unit(&self, station_id: &str) -> LevelUnit {
        self.find_station(station_id)
            .map(|s| s.level_unit)
            .unwrap_or_default()
    }

    /// Float if the display name mentions "float", the id contains a float
    /// pattern or the id is listed in `float_ids`; static otherwise.
    /// Evaluated per message.
    pub fn classify(&self, station_id: &str) -> SensorClass {
        let name_says_float = self.display_name(station_id).to_lowercase().contains("float");
        let id_says_float = self
            .float_id_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && station_id.contains(pattern.as_str()))
            || self.float_ids.iter().any(|id| id == station_id);
        if name_says_float || id_says_float {
            SensorClass::Float
        } else {
            SensorClass::Static
        }
    }
}

// ---------------------------------------------------------------------------
// Reloadable directory
// ---------------------------------------------------------------------------

struct Loaded {
    settings: Arc<StationSettings>,
    modified: Option<SystemTime>,
}

/// Owns the current `StationSettings` and swaps in a fresh copy when the
/// backing file changes.
pub struct StationDirectory {
    path: Option<PathBuf>,
    loaded: RwLock<Loaded>,
}

impl StationDirectory {
    /// A directory with fixed settings and no backing file.
    pub fn fixed(settings: StationSettings) -> Self {
        StationDirectory {
            path: None,
            loaded: RwLock::new(Loaded {
                settings: Arc::new(settings),
                modified: None,
            }),
        }
    }

    /// Reads `path` now. A missing file falls back to the built-in
    /// defaults and is picked up later if it appears.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let (settings, modified) = if path.exists() {
            read_settings(path)?
        } else {
            logging::warn(
                Component::System,
                None,
                &format!("{} not found, using built-in station defaults", path.display()),
            );
            (StationSettings::default(), None)
        };
        Ok(StationDirectory {
            path: Some(path.to_path_buf()),
            loaded: RwLock::new(Loaded {
                settings: Arc::new(settings),
                modified,
            }),
        })
    }

    /// The settings currently in effect.
    pub fn current(&self) -> Arc<StationSettings> {
        match self.loaded.read() {
            Ok(guard) => Arc::clone(&guard.settings),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().settings),
        }
    }

    /// Re-reads the file if its mtime moved. Parse errors keep the
    /// previous settings and are logged. Returns `true` if a reload happened.
    pub fn refresh_if_changed(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if modified.is_none() {
            return false;
        }
        {
            let guard = match self.loaded.read() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.modified == modified {
                return false;
            }
        }

        match read_settings(path) {
            Ok((settings, modified)) => {
                let mut guard = match self.loaded.write() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.settings = Arc::new(settings);
                guard.modified = modified;
                logging::info(
                    Component::System,
                    None,
                    &format!("Reloaded station settings from {}", path.display()),
                );
                true
            }
            Err(e) => {
                logging::warn(
                    Component::System,
                    None,
                    &format!("Keeping previous station settings: {}", e),
                );
                // Don't retry the same broken file on every message
                let mut guard = match self.loaded.write() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.modified = modified;
                false
            }
        }
    }
}

fn read_settings(path: &Path) -> Result<(StationSettings, Option<SystemTime>), ConfigError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    Ok((StationSettings::from_toml_str(&raw, &display)?, modified))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
