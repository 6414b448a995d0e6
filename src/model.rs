/// Core data types for the hydrolink ingestion service.
///
/// This module defines the shared domain model imported by all other modules:
/// the decoded reading, the history entry that is persisted and broadcast,
/// the enriched update pushed to real-time subscribers, and the error types
/// raised at each component boundary. It contains no I/O.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Physical and protocol constants
// ---------------------------------------------------------------------------

/// Meters of fresh-water head equivalent to one bar of gauge pressure.
pub const WATER_HEAD_METERS_PER_BAR: f64 = 10.197;

/// Level values above this are assumed to be centimeters.
pub const CENTIMETER_THRESHOLD: f64 = 10.0;

/// Station id assigned when an uplink carries no device identifier.
pub const UNKNOWN_STATION_ID: &str = "unknown";

/// RSSI reported when the uplink carries no reception metadata.
pub const RSSI_MISSING: i32 = -999;

/// Fallback coordinate used when no other location source is available.
pub const DEFAULT_LATITUDE: f64 = 13.7563;
pub const DEFAULT_LONGITUDE: f64 = 100.5018;

/// Number of recent entries kept per station.
pub const HISTORY_CAPACITY: usize = 20;

// ---------------------------------------------------------------------------
// Classification enums
// ---------------------------------------------------------------------------

/// Where a reading's coordinates came from, in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationSource {
    #[serde(rename = "GPS Sensor")]
    GpsSensor,
    #[serde(rename = "TTN Console")]
    NetworkEstimate,
    #[serde(rename = "Config File")]
    ConfigFile,
    Default,
}

impl LocationSource {
    /// Label stored in the `stations.location_source` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationSource::GpsSensor => "GPS Sensor",
            LocationSource::NetworkEstimate => "TTN Console",
            LocationSource::ConfigFile => "Config File",
            LocationSource::Default => "Default",
        }
    }
}

/// Float (buoy-style level sensor) vs Static (fixed pressure-based sensor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorClass {
    Float,
    Static,
}

impl SensorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorClass::Float => "Float",
            SensorClass::Static => "Static",
        }
    }

    /// Parses a stored label. Anything mentioning "float" is a float
    /// sensor; everything else, including blanks, is static.
    pub fn from_label(label: &str) -> SensorClass {
        if label.to_lowercase().contains("float") {
            SensorClass::Float
        } else {
            SensorClass::Static
        }
    }
}

/// Single-step direction of change in water level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    /// Compares a new level against the immediately preceding one.
    pub fn between(previous: f64, current: f64) -> Trend {
        if current > previous {
            Trend::Up
        } else if current < previous {
            Trend::Down
        } else {
            Trend::Stable
        }
    }
}

// ---------------------------------------------------------------------------
// Reading types
// ---------------------------------------------------------------------------

/// A decoded uplink, normalized to meters and annotated with its resolved
/// location and sensor class.
///
/// `water_level` is `None` only when the payload carried neither a level
/// field nor a positive pressure to derive one from.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub station_id: String,
    pub water_level: Option<f64>,
    pub pressure: Option<f64>,
    pub battery: f64,
    pub rssi: i32,
    pub snr: f64,
    pub data_rate: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location_source: LocationSource,
    pub sensor_class: SensorClass,
    pub observed_at: DateTime<Utc>,
}

/// The persisted and broadcast unit. One per accepted uplink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub station_id: String,
    pub water_level: f64,
    pub pressure: f64,
    pub battery: f64,
    pub rssi: i32,
    pub snr: f64,
    pub data_rate: String,
    #[serde(rename = "sensorType")]
    pub sensor_class: SensorClass,
    #[serde(rename = "timestamp")]
    pub observed_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Absent level or pressure is recorded as zero, matching what the
    /// storage backends have always held for such readings.
    pub fn from_reading(reading: &RawReading) -> Self {
        HistoryEntry {
            station_id: reading.station_id.clone(),
            water_level: reading.water_level.unwrap_or(0.0),
            pressure: reading.pressure.unwrap_or(0.0),
            battery: reading.battery,
            rssi: reading.rssi,
            snr: reading.snr,
            data_rate: reading.data_rate.clone(),
            sensor_class: reading.sensor_class,
            observed_at: reading.observed_at,
        }
    }
}

/// Station metadata written alongside each reading by the relational store.
#[derive(Debug, Clone, PartialEq)]
pub struct StationMeta {
    pub station_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub location_source: LocationSource,
}

/// The enriched reading pushed to real-time subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationUpdate {
    pub station_id: String,
    pub display_id: String,
    pub station_name: String,
    pub water_level: f64,
    pub pressure: f64,
    pub lat: f64,
    pub lng: f64,
    pub src: LocationSource,
    pub timestamp: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
    pub trend: Trend,
    pub data_rate: String,
    pub rssi: i32,
    pub snr: f64,
    pub battery: f64,
    pub sensor_type: SensorClass,
}

/// Full per-station history dump, ordered by station id.
pub type HistorySnapshot = BTreeMap<String, Vec<HistoryEntry>>;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// The uplink could not be parsed as structured data at all.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    NotJson(String),
    #[error("payload is JSON but not an object")]
    NotAnObject,
}

/// Errors raised by persistence backends and their adapters.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be reached or is not configured.
    #[error("{backend} unavailable: {reason}")]
    BackendUnavailable { backend: &'static str, reason: String },
    #[error("query failed: {0}")]
    Query(String),
    #[error("HTTP error: {0}")]
    Http(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<postgres::Error> for StorageError {
    fn from(err: postgres::Error) -> Self {
        if err.is_closed() {
            StorageError::BackendUnavailable {
                backend: "postgres",
                reason: err.to_string(),
            }
        } else {
            StorageError::Query(err.to_string())
        }
    }
}

/// Errors on the outbound buses.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_between_levels() {
        assert_eq!(Trend::between(1.0, 1.5), Trend::Up);
        assert_eq!(Trend::between(1.5, 1.0), Trend::Down);
        assert_eq!(Trend::between(1.2, 1.2), Trend::Stable);
    }

    #[test]
    fn test_sensor_class_from_label() {
        assert_eq!(SensorClass::from_label("Float"), SensorClass::Float);
        assert_eq!(SensorClass::from_label("float buoy"), SensorClass::Float);
        assert_eq!(SensorClass::from_label("Static"), SensorClass::Static);
        assert_eq!(SensorClass::from_label(""), SensorClass::Static);
    }

    #[test]
    fn test_history_entry_serializes_with_dashboard_field_names() {
        let entry = HistoryEntry {
            station_id: "d1".to_string(),
            water_level: 1.24,
            pressure: 0.0,
            battery: 3.7,
            rssi: -80,
            snr: 7.5,
            data_rate: "SF7BW125".to_string(),
            sensor_class: SensorClass::Float,
            observed_at: DateTime::parse_from_rfc3339("2026-10-16T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["waterLevel"], 1.24);
        assert_eq!(json["dataRate"], "SF7BW125");
        assert_eq!(json["sensorType"], "Float");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_location_source_labels_match_serialized_form() {
        for src in [
            LocationSource::GpsSensor,
            LocationSource::NetworkEstimate,
            LocationSource::ConfigFile,
            LocationSource::Default,
        ] {
            let json = serde_json::to_value(src).unwrap();
            assert_eq!(json, src.as_str());
        }
    }
}
