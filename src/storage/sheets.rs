/// Spreadsheet persistence (Google Sheets).
///
/// Append-only: every reading becomes one new row on the `Float` or
/// `Static` tab, chosen by sensor class. Timestamps are written as local
/// time strings, so reading history back means parsing them again and
/// throwing away header rows and anything else that doesn't parse.
///
/// Row layout:
///
/// | A         | B          | C            | D          | E        | F         | G    | H   | I       | J          |
/// |-----------|------------|--------------|------------|----------|-----------|------|-----|---------|------------|
/// | local ts  | station id | station name | water lvl  | pressure | data rate | rssi | snr | battery | sensor type|

use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{StorageBackend, group_by_station};
use crate::logging::{self, Component};
use crate::model::{
    HistoryEntry, HistorySnapshot, RSSI_MISSING, SensorClass, StationMeta, StorageError,
};

/// Timestamp format of column A, e.g. "16/10/2026 15:30:00".
pub const SHEET_TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

const SHEET_TABS: [SensorClass; 2] = [SensorClass::Float, SensorClass::Static];

/// Operations the service needs from a spreadsheet API.
pub trait SheetClient: Send + Sync {
    fn append_row(&self, sheet: &str, row: Vec<Value>) -> Result<(), StorageError>;

    /// Every row of `sheet` as display strings, header included.
    fn read_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, StorageError>;
}

// ---------------------------------------------------------------------------
// Backend adapter
// ---------------------------------------------------------------------------

pub struct SpreadsheetBackend<C> {
    client: C,
    offset: FixedOffset,
}

impl<C: SheetClient> SpreadsheetBackend<C> {
    /// `utc_offset_hours` is the local zone of the timestamp column.
    /// Out-of-range offsets fall back to UTC.
    pub fn new(client: C, utc_offset_hours: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
        SpreadsheetBackend { client, offset }
    }

    pub fn format_timestamp(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset).format(SHEET_TIMESTAMP_FORMAT).to_string()
    }

    pub fn parse_timestamp(&self, raw: &str) -> Option<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(raw.trim(), SHEET_TIMESTAMP_FORMAT).ok()?;
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|local| local.with_timezone(&Utc))
    }

    fn to_row(&self, entry: &HistoryEntry, meta: &StationMeta) -> Vec<Value> {
        vec![
            json!(self.format_timestamp(entry.observed_at)),
            json!(entry.station_id),
            json!(meta.name),
            json!(entry.water_level),
            json!(entry.pressure),
            json!(entry.data_rate),
            json!(entry.rssi),
            json!(entry.snr),
            json!(entry.battery),
            json!(entry.sensor_class.as_str()),
        ]
    }

    /// Parses one sheet row. Returns `None` for headers, blanks and rows
    /// whose timestamp doesn't parse.
    fn parse_row(&self, row: &[String], tab: SensorClass) -> Option<HistoryEntry> {
        let observed_at = self.parse_timestamp(row.first()?)?;
        let station_id = row.get(1).map(|s| s.trim()).filter(|s| !s.is_empty())?;
        let number = |idx: usize| row.get(idx).and_then(|s| s.trim().parse::<f64>().ok());

        Some(HistoryEntry {
            station_id: station_id.to_string(),
            water_level: number(3).unwrap_or(0.0),
            pressure: number(4).unwrap_or(0.0),
            data_rate: row.get(5).cloned().unwrap_or_default(),
            rssi: number(6).map(|r| r.round() as i32).unwrap_or(RSSI_MISSING),
            snr: number(7).unwrap_or(0.0),
            battery: number(8).unwrap_or(0.0),
            sensor_class: row
                .get(9)
                .filter(|s| !s.trim().is_empty())
                .map(|s| SensorClass::from_label(s))
                .unwrap_or(tab),
            observed_at,
        })
    }
}

impl<C: SheetClient> StorageBackend for SpreadsheetBackend<C> {
    fn name(&self) -> &'static str {
        "sheets"
    }

    fn component(&self) -> Component {
        Component::Sheets
    }

    fn persist(&self, entry: &HistoryEntry, meta: &StationMeta) -> Result<(), StorageError> {
        let tab = entry.sensor_class.as_str();
        self.client.append_row(tab, self.to_row(entry, meta))
    }

    /// Reads both tabs. One unreadable tab is logged and skipped; the
    /// backend only counts as unavailable if neither can be read.
    fn load_history(&self, since: DateTime<Utc>) -> Result<HistorySnapshot, StorageError> {
        let mut entries = Vec::new();
        let mut last_error = None;
        let mut any_read = false;

        for tab in SHEET_TABS {
            match self.client.read_all_rows(tab.as_str()) {
                Ok(rows) => {
                    any_read = true;
                    let before = entries.len();
                    entries.extend(
                        rows.iter()
                            .filter_map(|row| self.parse_row(row, tab))
                            .filter(|entry| entry.observed_at > since),
                    );
                    logging::debug(
                        Component::Sheets,
                        None,
                        &format!(
                            "{} tab: {} rows, {} in window",
                            tab.as_str(),
                            rows.len(),
                            entries.len() - before
                        ),
                    );
                }
                Err(e) => {
                    logging::log_backend_failure(
                        Component::Sheets,
                        None,
                        &format!("read {} tab", tab.as_str()),
                        &e,
                    );
                    last_error = Some(e);
                }
            }
        }

        if !any_read {
            return Err(last_error.unwrap_or(StorageError::BackendUnavailable {
                backend: "sheets",
                reason: "no tabs readable".to_string(),
            }));
        }

        // Stable sort keeps each tab's own order for equal timestamps
        entries.sort_by_key(|e| e.observed_at);
        Ok(group_by_station(entries))
    }
}

// ---------------------------------------------------------------------------
// Google Sheets REST client
// ---------------------------------------------------------------------------

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

/// Blocking client for the Sheets v4 values API.
///
/// Authentication is a bearer token supplied by the deployment; minting
/// and refreshing it is outside this service.
pub struct GoogleSheetsClient {
    http: reqwest::blocking::Client,
    api_base: String,
    spreadsheet_id: String,
    token: String,
}

impl GoogleSheetsClient {
    pub fn new(
        api_base: impl Into<String>,
        spreadsheet_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Request(e.to_string()))?;
        Ok(GoogleSheetsClient {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            token: token.into(),
        })
    }

    pub fn values_url(&self, range: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values/{}",
            self.api_base, self.spreadsheet_id, range
        )
    }

    /// Sends a request, retrying once on transport errors and 5xx.
    fn send<F>(&self, build: F) -> Result<reqwest::blocking::Response, StorageError>
    where
        F: Fn() -> reqwest::blocking::RequestBuilder,
    {
        let mut last_error = StorageError::Request("no attempt made".to_string());
        for attempt in 1..=MAX_ATTEMPTS {
            match build().bearer_auth(&self.token).send() {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().is_server_error() => {
                    last_error = StorageError::Http(resp.status().as_u16());
                }
                Ok(resp) => return Err(StorageError::Http(resp.status().as_u16())),
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_error = StorageError::BackendUnavailable {
                        backend: "sheets",
                        reason: e.to_string(),
                    };
                }
                Err(e) => return Err(StorageError::Request(e.to_string())),
            }
            if attempt < MAX_ATTEMPTS {
                logging::debug(Component::Sheets, None, &format!("Retrying after: {}", last_error));
            }
        }
        Err(last_error)
    }
}

impl SheetClient for GoogleSheetsClient {
    fn append_row(&self, sheet: &str, row: Vec<Value>) -> Result<(), StorageError> {
        let url = format!("{}:append", self.values_url(sheet));
        let body = json!({ "values": [row] });
        self.send(|| {
            self.http
                .post(&url)
                .query(&[("valueInputOption", "USER_ENTERED")])
                .json(&body)
        })?;
        Ok(())
    }

    fn read_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, StorageError> {
        let url = self.values_url(sheet);
        let resp = self.send(|| self.http.get(&url))?;
        let range: ValueRange = resp.json().map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(range
            .values
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|cell| match cell {
                        Value::String(s) => s,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .collect())
    }
}
