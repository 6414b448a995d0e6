//! Persistence backends and the router that fans readings out to them.
//!
//! Every backend implements the same two-operation contract, `persist`
//! and `load_history`. The router holds the enabled backends in priority
//! order: writes go to all of them independently, and the startup history
//! load takes the first one that answers.
//!
//! Backend calls are blocking (the adapters use `postgres` and
//! `reqwest::blocking`), so the router drives each one on tokio's blocking
//! pool. A slow or failing backend never holds up intake or the other
//! backends.

pub mod relational;
pub mod sheets;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::config::{self, ConfigError, DataSourceConfig, SheetsConfig};
use crate::logging::{self, Component};
use crate::model::{HistoryEntry, HistorySnapshot, StationMeta, StorageError};

pub use relational::{PostgresStore, RelationalBackend, RelationalStore};
pub use sheets::{GoogleSheetsClient, SheetClient, SpreadsheetBackend};

/// One persistence destination.
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &'static str;

    fn component(&self) -> Component;

    /// Writes one reading. Implementations apply their own retry and
    /// timeout policy.
    fn persist(&self, entry: &HistoryEntry, meta: &StationMeta) -> Result<(), StorageError>;

    /// Returns every reading observed after `since`, grouped by station
    /// and ordered by observation time.
    fn load_history(&self, since: DateTime<Utc>) -> Result<HistorySnapshot, StorageError>;
}

/// Handles for one reading's in-flight writes.
///
/// Dropping it leaves the writes running; awaiting `settled` waits for
/// all of them (used at shutdown and in tests).
#[must_use = "drop the handle to fire-and-forget, or await settled()"]
pub struct PersistHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl PersistHandle {
    pub async fn settled(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Result of the startup history load.
#[derive(Debug, Default)]
pub struct Bootstrap {
    /// Name of the backend that supplied the history, if any.
    pub source: Option<&'static str>,
    pub history: HistorySnapshot,
}

/// Upper bound on one backend's startup history load.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PersistenceRouter {
    backends: Vec<Arc<dyn StorageBackend>>,
    bootstrap_timeout: Duration,
}

impl PersistenceRouter {
    /// `backends` must be in bootstrap priority order.
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        PersistenceRouter {
            backends,
            bootstrap_timeout: BOOTSTRAP_TIMEOUT,
        }
    }

    pub fn disabled() -> Self {
        PersistenceRouter::new(Vec::new())
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Dispatches one reading to every backend. Must be called from
    /// within a tokio runtime. Failures are logged, never returned.
    pub fn persist(&self, entry: HistoryEntry, meta: StationMeta) -> PersistHandle {
        let record = Arc::new((entry, meta));
        let tasks = self
            .backends
            .iter()
            .map(|backend| {
                let backend = Arc::clone(backend);
                let record = Arc::clone(&record);
                tokio::task::spawn_blocking(move || {
                    let (entry, meta) = &*record;
                    match backend.persist(entry, meta) {
                        Ok(()) => logging::debug(
                            backend.component(),
                            Some(&entry.station_id),
                            &format!(
                                "Saved to {}: L={} P={}",
                                backend.name(),
                                entry.water_level,
                                entry.pressure
                            ),
                        ),
                        Err(e) => logging::log_backend_failure(
                            backend.component(),
                            Some(&entry.station_id),
                            "persist",
                            &e,
                        ),
                    }
                })
            })
            .collect();
        PersistHandle { tasks }
    }

    /// Loads prior history from the highest-priority backend that
    /// answers. Backends that fail or exceed the bootstrap timeout are
    /// skipped for the rest of the bootstrap only; they still receive
    /// writes afterwards.
    pub async fn bootstrap(&self, since: DateTime<Utc>) -> Bootstrap {
        for backend in &self.backends {
            logging::info(
                backend.component(),
                None,
                &format!("Loading history from {}...", backend.name()),
            );
            let loader = Arc::clone(backend);
            let load = tokio::task::spawn_blocking(move || loader.load_history(since));
            let result = match tokio::time::timeout(self.bootstrap_timeout, load).await {
                Ok(joined) => joined,
                // The blocking call keeps running; only the wait is abandoned
                Err(_) => Ok(Err(StorageError::BackendUnavailable {
                    backend: backend.name(),
                    reason: format!("no history within {:?}", self.bootstrap_timeout),
                })),
            };
            match result {
                Ok(Ok(history)) => {
                    logging::log_bootstrap_summary(
                        backend.component(),
                        history.len(),
                        history.values().map(Vec::len).sum(),
                    );
                    return Bootstrap {
                        source: Some(backend.name()),
                        history,
                    };
                }
                Ok(Err(e)) => {
                    logging::log_backend_failure(backend.component(), None, "history load", &e)
                }
                Err(join) => logging::error(
                    backend.component(),
                    None,
                    &format!("history load task aborted: {}", join),
                ),
            }
        }
        logging::warn(Component::System, None, "No history backend available, starting empty");
        Bootstrap::default()
    }
}

/// Builds the enabled backends from configuration, relational first.
///
/// A backend whose secret or spreadsheet id is missing is left out with
/// a warning; the service still runs on whatever remains.
pub fn configured_backends(source: &DataSourceConfig) -> Vec<Arc<dyn StorageBackend>> {
    let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();

    if source.relational_enabled() {
        match config::database_url() {
            Ok(url) => backends.push(Arc::new(RelationalBackend::new(PostgresStore::new(url)))),
            Err(e) => logging::warn(Component::Postgres, None, &format!("Relational store disabled: {}", e)),
        }
    }

    if source.spreadsheet_enabled() {
        let sheets = &source.google_sheets;
        match sheets_client(sheets) {
            Ok(client) => backends.push(Arc::new(SpreadsheetBackend::new(client, sheets.utc_offset_hours))),
            Err(e) => logging::warn(Component::Sheets, None, &format!("Spreadsheet disabled: {}", e)),
        }
    }

    backends
}

fn sheets_client(sheets: &SheetsConfig) -> Result<GoogleSheetsClient, Box<dyn std::error::Error>> {
    let id = sheets
        .spreadsheet_id
        .clone()
        .ok_or(ConfigError::Missing("data_source.google_sheets.spreadsheet_id"))?;
    let token = config::sheets_token()?;
    Ok(GoogleSheetsClient::new(sheets.api_base.as_str(), id, token)?)
}

/// Groups a time-ordered list of entries by station.
pub(crate) fn group_by_station(entries: impl IntoIterator<Item = HistoryEntry>) -> HistorySnapshot {
    let mut history = HistorySnapshot::new();
    for entry in entries {
        history.entry(entry.station_id.clone()).or_default().push(entry);
    }
    history
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::model::{LocationSource, SensorClass};
    use chrono::TimeZone;
    use std::time::Instant;

    fn entry(station: &str, level: f64) -> HistoryEntry {
        HistoryEntry {
            station_id: station.to_string(),
            water_level: level,
            pressure: 0.1,
            battery: 3.8,
            rssi: -100,
            snr: 4.0,
            data_rate: "SF9BW125".to_string(),
            sensor_class: SensorClass::Float,
            observed_at: Utc.with_ymd_and_hms(2026, 10, 16, 6, 0, 0).unwrap(),
        }
    }

    fn meta(station: &str) -> StationMeta {
        StationMeta {
            station_id: station.to_string(),
            name: "Test".to_string(),
            latitude: 14.0,
            longitude: 100.0,
            location_source: LocationSource::ConfigFile,
        }
    }

    fn since() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_persist_reaches_every_backend() {
        let a = Arc::new(RecordingBackend::new("a"));
        let b = Arc::new(RecordingBackend::new("b"));
        let router = PersistenceRouter::new(vec![a.clone(), b.clone()]);

        router.persist(entry("s1", 1.0), meta("s1")).settled().await;

        assert_eq!(a.written().len(), 1);
        assert_eq!(b.written().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_backend_does_not_block_the_other() {
        let failing = Arc::new(FailingBackend { delay: Duration::from_millis(1500) });
        let healthy = Arc::new(RecordingBackend::new("healthy"));
        let router = PersistenceRouter::new(vec![failing as Arc<dyn StorageBackend>, healthy.clone()]);

        let started = Instant::now();
        let handle = router.persist(entry("s1", 1.0), meta("s1"));
        assert!(started.elapsed() < Duration::from_millis(200), "dispatch must not wait on backends");

        // The healthy write lands long before the failing one gives up
        let deadline = Instant::now() + Duration::from_millis(1000);
        while healthy.written().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(healthy.written().len(), 1);
        assert!(started.elapsed() < Duration::from_millis(1500));

        handle.settled().await;
    }

    #[tokio::test]
    async fn test_empty_router_persists_nothing() {
        let router = PersistenceRouter::disabled();
        assert!(router.is_empty());
        router.persist(entry("s1", 1.0), meta("s1")).settled().await;
    }

    #[tokio::test]
    async fn test_bootstrap_prefers_first_backend() {
        let mut relational = HistorySnapshot::new();
        relational.insert("s1".to_string(), vec![entry("s1", 1.0)]);
        let mut sheet = HistorySnapshot::new();
        sheet.insert("s2".to_string(), vec![entry("s2", 2.0)]);

        let router = PersistenceRouter::new(vec![
            Arc::new(RecordingBackend::with_history("postgres", relational)),
            Arc::new(RecordingBackend::with_history("sheets", sheet)),
        ]);
        let boot = router.bootstrap(since()).await;
        assert_eq!(boot.source, Some("postgres"));
        assert!(boot.history.contains_key("s1"));
        assert!(!boot.history.contains_key("s2"));
    }

    #[tokio::test]
    async fn test_bootstrap_falls_through_unreachable_backend() {
        let mut sheet = HistorySnapshot::new();
        sheet.insert("s2".to_string(), vec![entry("s2", 2.0)]);
        let router = PersistenceRouter::new(vec![
            Arc::new(RecordingBackend::unreachable("postgres")),
            Arc::new(RecordingBackend::with_history("sheets", sheet)),
        ]);
        let boot = router.bootstrap(since()).await;
        assert_eq!(boot.source, Some("sheets"));
        assert_eq!(boot.history["s2"].len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bootstrap_skips_backend_that_never_answers() {
        let mut sheet = HistorySnapshot::new();
        sheet.insert("s2".to_string(), vec![entry("s2", 2.0)]);
        let router = PersistenceRouter::new(vec![
            Arc::new(StallingBackend { delay: Duration::from_secs(3) }) as Arc<dyn StorageBackend>,
            Arc::new(RecordingBackend::with_history("sheets", sheet)),
        ])
        .with_bootstrap_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let boot = router.bootstrap(since()).await;
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert_eq!(boot.source, Some("sheets"));
        assert_eq!(boot.history["s2"].len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_with_nothing_available_is_empty() {
        let router = PersistenceRouter::new(vec![Arc::new(RecordingBackend::unreachable("postgres"))]);
        let boot = router.bootstrap(since()).await;
        assert_eq!(boot.source, None);
        assert!(boot.history.is_empty());
    }

    #[test]
    fn test_group_by_station_preserves_order() {
        let grouped = group_by_station(vec![entry("a", 1.0), entry("b", 5.0), entry("a", 2.0)]);
        let a: Vec<f64> = grouped["a"].iter().map(|e| e.water_level).collect();
        assert_eq!(a, vec![1.0, 2.0]);
        assert_eq!(grouped["b"].len(), 1);
    }
}
