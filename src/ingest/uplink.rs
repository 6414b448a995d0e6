/// LoRaWAN uplink decoding.
///
/// Turns a raw network-server uplink document into a normalized
/// `RawReading`. Field firmware is heterogeneous and unversioned, so the
/// decoder is deliberately permissive: every field is optional, numeric
/// fields may arrive as numbers or numeric strings, and anything missing
/// degrades to a sentinel. Only a payload that is not a JSON object at all
/// is rejected.
///
/// Envelope shape (all nested objects optional):
///
/// ```json
/// {
///   "end_device_ids": { "device_id": "test-hel-v3" },
///   "uplink_message": {
///     "decoded_payload": { "waterLevel": 124, "pressure": 0.2, "battery": 3.9 },
///     "rx_metadata": [ { "rssi": -97, "snr": 8.5 } ],
///     "settings": { "data_rate": { "lora": { "spreading_factor": 7, "bandwidth": 125000 } } },
///     "locations": { "user": { "latitude": 14.42, "longitude": 100.38 } }
///   }
/// }
/// ```

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{
    CENTIMETER_THRESHOLD, DEFAULT_LATITUDE, DEFAULT_LONGITUDE, DecodeError, LocationSource,
    RSSI_MISSING, RawReading, UNKNOWN_STATION_ID, WATER_HEAD_METERS_PER_BAR,
};
use crate::stations::{LevelUnit, StationSettings};

// ---------------------------------------------------------------------------
// Field-name variants seen across firmware versions
// ---------------------------------------------------------------------------

pub const LEVEL_FIELDS: &[&str] = &["waterLevel", "waterlevel", "water_level", "Level"];
pub const PRESSURE_FIELDS: &[&str] = &["pressure", "Pressure"];
pub const BATTERY_FIELDS: &[&str] = &["battery", "bat", "Battery"];
const LATITUDE_FIELDS: &[&str] = &["latitude", "lat"];
const LONGITUDE_FIELDS: &[&str] = &["longitude", "lng", "lon"];

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decodes one uplink.
///
/// `received_at` is stamped as the observation time; the network server's
/// own timestamps are not trusted across gateways.
pub fn decode(
    payload: &[u8],
    stations: &StationSettings,
    received_at: DateTime<Utc>,
) -> Result<RawReading, DecodeError> {
    let doc: Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::NotJson(e.to_string()))?;
    if !doc.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    let station_id = doc
        .get("end_device_ids")
        .and_then(|ids| ids.get("device_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .unwrap_or(UNKNOWN_STATION_ID)
        .to_string();

    let uplink = doc.get("uplink_message").unwrap_or(&Value::Null);
    let decoded = uplink.get("decoded_payload").unwrap_or(&Value::Null);

    let pressure = probe_number(decoded, PRESSURE_FIELDS);
    let level = probe_number(decoded, LEVEL_FIELDS)
        .map(|raw| normalize_level(raw, stations.level_unit(&station_id)));
    let water_level = resolve_level(level, pressure);

    let battery = probe_number(decoded, BATTERY_FIELDS).unwrap_or(0.0);

    let (rssi, snr) = signal_metadata(uplink);
    let data_rate = data_rate_label(uplink);

    let (latitude, longitude, location_source) = resolve_location(decoded, uplink, stations, &station_id);
    let sensor_class = stations.classify(&station_id);

    Ok(RawReading {
        station_id,
        water_level,
        pressure,
        battery,
        rssi,
        snr,
        data_rate,
        latitude,
        longitude,
        location_source,
        sensor_class,
        observed_at: received_at,
    })
}

// ---------------------------------------------------------------------------
// Level normalization
// ---------------------------------------------------------------------------

/// Converts a raw level field to meters.
///
/// With `LevelUnit::Auto` a value above 10 is assumed to be centimeters.
/// The protocol carries no unit tag, so a station that genuinely reads
/// more than 10 m must declare `level_unit = "m"` in its settings.
pub fn normalize_level(raw: f64, unit: LevelUnit) -> f64 {
    match unit {
        LevelUnit::Auto if raw > CENTIMETER_THRESHOLD => raw / 100.0,
        LevelUnit::Auto | LevelUnit::M => raw,
        LevelUnit::Cm => raw / 100.0,
    }
}

/// Applies the pressure fallback.
///
/// Only when the level is absent or exactly zero and pressure is positive
/// is the level derived as hydrostatic head. Any non-zero level wins, even
/// an implausible one.
pub fn resolve_level(level: Option<f64>, pressure: Option<f64>) -> Option<f64> {
    match (level, pressure) {
        (Some(l), _) if l != 0.0 => Some(l),
        (_, Some(p)) if p > 0.0 => Some(p * WATER_HEAD_METERS_PER_BAR),
        _ => level,
    }
}

// ---------------------------------------------------------------------------
// Location resolution
// ---------------------------------------------------------------------------

/// Picks coordinates in priority order: payload GPS, network-server
/// estimate, station settings, fixed default.
fn resolve_location(
    decoded: &Value,
    uplink: &Value,
    stations: &StationSettings,
    station_id: &str,
) -> (f64, f64, LocationSource) {
    let gps = probe_number(decoded, LATITUDE_FIELDS).zip(probe_number(decoded, LONGITUDE_FIELDS));
    if let Some((lat, lng)) = gps.filter(|(lat, lng)| *lat != 0.0 && *lng != 0.0) {
        return (lat, lng, LocationSource::GpsSensor);
    }

    if let Some((lat, lng)) = network_location(uplink) {
        return (lat, lng, LocationSource::NetworkEstimate);
    }

    if let Some((lat, lng)) = stations.find_station(station_id).and_then(|s| s.coordinates()) {
        return (lat, lng, LocationSource::ConfigFile);
    }

    (DEFAULT_LATITUDE, DEFAULT_LONGITUDE, LocationSource::Default)
}

/// The "user" location set in the network console, else any other
/// location the network server attached.
fn network_location(uplink: &Value) -> Option<(f64, f64)> {
    let locations = uplink.get("locations")?.as_object()?;
    let coords = |loc: &Value| {
        as_number(loc.get("latitude")?).zip(as_number(loc.get("longitude")?))
    };
    locations
        .get("user")
        .and_then(coords)
        .or_else(|| locations.values().find_map(coords))
}

// ---------------------------------------------------------------------------
// Radio metadata
// ---------------------------------------------------------------------------

/// RSSI and SNR from the first gateway that heard the uplink.
fn signal_metadata(uplink: &Value) -> (i32, f64) {
    let first = uplink
        .get("rx_metadata")
        .and_then(Value::as_array)
        .and_then(|gateways| gateways.first());

    match first {
        Some(gw) => (
            gw.get("rssi")
                .and_then(as_number)
                .map(|r| r.round() as i32)
                .unwrap_or(RSSI_MISSING),
            gw.get("snr").and_then(as_number).unwrap_or(0.0),
        ),
        None => (RSSI_MISSING, 0.0),
    }
}

/// "SF7BW125" when LoRa parameters are present, else the raw data-rate
/// index, else "0".
fn data_rate_label(uplink: &Value) -> String {
    let data_rate = uplink.get("settings").and_then(|s| s.get("data_rate"));

    let lora = data_rate.and_then(|dr| dr.get("lora")).and_then(|lora| {
        let sf = lora.get("spreading_factor").and_then(as_number)?;
        let bw = lora.get("bandwidth").and_then(as_number)?;
        Some(format!("SF{}BW{}", sf, bw / 1000.0))
    });
    if let Some(label) = lora {
        return label;
    }

    data_rate
        .and_then(|dr| dr.get("index"))
        .and_then(as_number)
        .map(|idx| format!("{}", idx))
        .unwrap_or_else(|| "0".to_string())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A JSON number, or a string that parses as one.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// The first candidate field holding a usable number.
fn probe_number(obj: &Value, candidates: &[&str]) -> Option<f64> {
    candidates
        .iter()
        .find_map(|field| obj.get(*field).and_then(as_number))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
