/// End-to-end tests for the ingestion pipeline
///
/// These tests drive `Orchestrator::handle_message` with raw uplink
/// documents and observe every outbound side through in-memory fakes:
/// 1. Normalization (unit heuristic, pressure fallback, default location)
/// 2. History, trend and real-time delivery order
/// 3. Fan-out to storage backends, including a failing one
/// 4. Legacy republish topics and payloads
/// 5. Station settings reload between messages
///
/// No broker, database or network is needed.
///
/// Run with: cargo test --test pipeline_integration

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};

use hydrolink_service::broadcast::{Broadcaster, LegacyBus, RealtimeEvent, RealtimeHub, SubscriberSet};
use hydrolink_service::config::{LegacySensor, SensorChannel};
use hydrolink_service::history::HistoryStore;
use hydrolink_service::logging::Component;
use hydrolink_service::model::{
    HistoryEntry, HistorySnapshot, LocationSource, SensorClass, StationMeta, StorageError,
    TransportError, Trend,
};
use hydrolink_service::pipeline::Orchestrator;
use hydrolink_service::stations::{StationDirectory, StationSettings};
use hydrolink_service::storage::{
    PersistenceRouter, SheetClient, SpreadsheetBackend, StorageBackend,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryBackend {
    written: Mutex<Vec<(HistoryEntry, StationMeta)>>,
    history: HistorySnapshot,
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn component(&self) -> Component {
        Component::Postgres
    }

    fn persist(&self, entry: &HistoryEntry, meta: &StationMeta) -> Result<(), StorageError> {
        self.written.lock().unwrap().push((entry.clone(), meta.clone()));
        Ok(())
    }

    fn load_history(&self, since: DateTime<Utc>) -> Result<HistorySnapshot, StorageError> {
        Ok(self
            .history
            .iter()
            .map(|(id, entries)| {
                let kept = entries.iter().filter(|e| e.observed_at > since).cloned().collect();
                (id.clone(), kept)
            })
            .collect())
    }
}

/// Hangs for a while, then fails.
struct StuckBackend;

impl StorageBackend for StuckBackend {
    fn name(&self) -> &'static str {
        "stuck"
    }

    fn component(&self) -> Component {
        Component::Sheets
    }

    fn persist(&self, _entry: &HistoryEntry, _meta: &StationMeta) -> Result<(), StorageError> {
        std::thread::sleep(StdDuration::from_secs(2));
        Err(StorageError::Http(503))
    }

    fn load_history(&self, _since: DateTime<Utc>) -> Result<HistorySnapshot, StorageError> {
        Err(StorageError::BackendUnavailable {
            backend: "stuck",
            reason: "timed out".to_string(),
        })
    }
}

#[derive(Default)]
struct MemoryBus {
    messages: Mutex<Vec<(String, Value)>>,
}

impl LegacyBus for MemoryBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let body = serde_json::from_slice(&payload).map_err(|e| TransportError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        self.messages.lock().unwrap().push((topic.to_string(), body));
        Ok(())
    }
}

struct Service {
    pipeline: Orchestrator,
    bus: Arc<MemoryBus>,
}

fn service(stations: StationDirectory, backends: Vec<Arc<dyn StorageBackend>>) -> Service {
    let hub = Arc::new(RealtimeHub::default());
    let bus = Arc::new(MemoryBus::default());
    let mut legacy = HashMap::new();
    legacy.insert(
        "test-hel-v3".to_string(),
        vec![
            LegacySensor { id: "SEN001".to_string(), channel: SensorChannel::Level },
            LegacySensor { id: "SEN002".to_string(), channel: SensorChannel::Pressure },
        ],
    );
    let subscribers: Arc<dyn SubscriberSet> = hub.clone();
    let legacy_bus: Arc<dyn LegacyBus> = bus.clone();
    let pipeline = Orchestrator::new(
        stations,
        HistoryStore::default(),
        PersistenceRouter::new(backends),
        Broadcaster::new(subscribers, Some(legacy_bus), legacy),
        hub,
    );
    Service { pipeline, bus }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
}

fn uplink(device: Option<&str>, decoded: Value) -> Vec<u8> {
    let mut doc = json!({ "uplink_message": { "decoded_payload": decoded } });
    if let Some(id) = device {
        doc["end_device_ids"] = json!({ "device_id": id });
    }
    doc.to_string().into_bytes()
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_centimeter_level_is_normalized() {
    let svc = service(StationDirectory::fixed(StationSettings::empty()), Vec::new());
    let out = svc
        .pipeline
        .handle_message(&uplink(Some("d1"), json!({ "waterLevel": 124 })), now())
        .unwrap();
    assert!((out.update.water_level - 1.24).abs() < 1e-9);
}

#[tokio::test]
async fn test_pressure_backfills_missing_level() {
    let svc = service(StationDirectory::fixed(StationSettings::empty()), Vec::new());
    let out = svc
        .pipeline
        .handle_message(&uplink(Some("d1"), json!({ "pressure": 2 })), now())
        .unwrap();
    assert!((out.update.water_level - 20.394).abs() < 1e-9);
    assert_eq!(out.update.pressure, 2.0);
}

#[tokio::test]
async fn test_unconfigured_device_falls_back_to_default_location() {
    let svc = service(StationDirectory::fixed(StationSettings::empty()), Vec::new());
    let out = svc
        .pipeline
        .handle_message(&uplink(None, json!({ "waterLevel": 1.5 })), now())
        .unwrap();
    assert_eq!(out.update.station_id, "unknown");
    assert_eq!(out.update.src, LocationSource::Default);
    assert_eq!((out.update.lat, out.update.lng), (13.7563, 100.5018));
    assert_eq!(out.update.rssi, -999);
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reading_reaches_storage_with_station_metadata() {
    let memory = Arc::new(MemoryBackend::default());
    let svc = service(
        StationDirectory::fixed(StationSettings::default()),
        vec![memory.clone()],
    );
    let out = svc
        .pipeline
        .handle_message(&uplink(Some("test-hel-v3"), json!({ "waterLevel": 0.8 })), now())
        .unwrap();
    out.persisted.settled().await;

    let written = memory.written.lock().unwrap().clone();
    assert_eq!(written.len(), 1);
    let (entry, meta) = &written[0];
    assert_eq!(entry.sensor_class, SensorClass::Float);
    assert_eq!(meta.name, "Float Station");
    assert_eq!(meta.location_source, LocationSource::ConfigFile);
    assert_eq!(meta.latitude, 14.422328);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stuck_backend_blocks_neither_intake_nor_other_backend() {
    let memory = Arc::new(MemoryBackend::default());
    let svc = service(
        StationDirectory::fixed(StationSettings::empty()),
        vec![Arc::new(StuckBackend) as Arc<dyn StorageBackend>, memory.clone()],
    );

    let started = Instant::now();
    let first = svc
        .pipeline
        .handle_message(&uplink(Some("d1"), json!({ "waterLevel": 1.0 })), now())
        .unwrap();
    let second = svc
        .pipeline
        .handle_message(&uplink(Some("d1"), json!({ "waterLevel": 1.1 })), now())
        .unwrap();
    assert!(
        started.elapsed() < StdDuration::from_millis(500),
        "intake waited on storage"
    );

    let deadline = Instant::now() + StdDuration::from_millis(1500);
    while memory.written.lock().unwrap().len() < 2 && Instant::now() < deadline {
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert_eq!(memory.written.lock().unwrap().len(), 2);
    assert!(started.elapsed() < StdDuration::from_secs(2));

    first.persisted.settled().await;
    second.persisted.settled().await;
}

#[tokio::test]
async fn test_legacy_topics_use_display_id() {
    let svc = service(StationDirectory::fixed(StationSettings::default()), Vec::new());
    let _ = svc
        .pipeline
        .handle_message(
            &uplink(Some("test-hel-v3"), json!({ "waterLevel": 2.5, "pressure": 0.3 })),
            now(),
        )
        .unwrap();

    let messages = svc.bus.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].0, "water/ST001/SEN001");
    assert_eq!(messages[0].1, json!({ "value": 2.5 }));
    assert_eq!(messages[1].0, "water/ST001/SEN002");
    assert_eq!(messages[1].1, json!({ "value": 0.3 }));
}

// ---------------------------------------------------------------------------
// History, bootstrap and subscribers
// ---------------------------------------------------------------------------

fn stored(station: &str, level: f64, hours_ago: i64) -> HistoryEntry {
    HistoryEntry {
        station_id: station.to_string(),
        water_level: level,
        pressure: 0.0,
        battery: 3.6,
        rssi: -101,
        snr: 2.0,
        data_rate: "SF10BW125".to_string(),
        sensor_class: SensorClass::Static,
        observed_at: now() - Duration::hours(hours_ago),
    }
}

#[tokio::test]
async fn test_bootstrap_window_then_live_trend() {
    let mut history = HistorySnapshot::new();
    history.insert(
        "d1".to_string(),
        vec![stored("d1", 3.0, 72), stored("d1", 2.0, 5), stored("d1", 2.4, 1)],
    );
    let memory = Arc::new(MemoryBackend {
        history,
        ..MemoryBackend::default()
    });
    let svc = service(StationDirectory::fixed(StationSettings::empty()), vec![memory]);

    let boot = svc.pipeline.bootstrap(now() - Duration::hours(48)).await;
    assert_eq!(boot.source, Some("memory"));
    assert_eq!(boot.history["d1"].len(), 2, "72h-old row is outside the window");

    let out = svc
        .pipeline
        .handle_message(&uplink(Some("d1"), json!({ "waterLevel": 2.4 })), now())
        .unwrap();
    assert_eq!(out.update.trend, Trend::Stable);
    assert_eq!(out.update.history.len(), 3);
}

#[tokio::test]
async fn test_history_is_capped_at_twenty() {
    let svc = service(StationDirectory::fixed(StationSettings::empty()), Vec::new());
    let mut last = None;
    for i in 0..25 {
        let level = 1.0 + i as f64 / 100.0;
        last = Some(
            svc.pipeline
                .handle_message(&uplink(Some("d1"), json!({ "waterLevel": level })), now())
                .unwrap(),
        );
    }
    let history = last.unwrap().update.history;
    assert_eq!(history.len(), 20);
    assert!((history[0].water_level - 1.05).abs() < 1e-9, "oldest five evicted");
}

#[tokio::test]
async fn test_subscriber_sees_baseline_before_updates() {
    let svc = service(StationDirectory::fixed(StationSettings::empty()), Vec::new());
    let _ = svc
        .pipeline
        .handle_message(&uplink(Some("d1"), json!({ "waterLevel": 1.0 })), now())
        .unwrap();

    let mut sub = svc.pipeline.subscribe();
    let baseline: Value = serde_json::from_str(&sub.baseline.to_json().unwrap()).unwrap();
    assert_eq!(baseline["event"], "init-data");
    assert_eq!(baseline["data"]["d1"].as_array().unwrap().len(), 1);

    let _ = svc
        .pipeline
        .handle_message(&uplink(Some("d1"), json!({ "waterLevel": 0.9 })), now())
        .unwrap();
    match sub.live.recv().await.unwrap() {
        RealtimeEvent::SensorUpdate(update) => assert_eq!(update.trend, Trend::Down),
        other => panic!("expected sensor-update, got {}", other.name()),
    }
}

// ---------------------------------------------------------------------------
// Settings reload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_station_edit_applies_to_next_message() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stations.toml");
    std::fs::write(&path, "float_id_patterns = []\n").unwrap();
    let svc = service(StationDirectory::open(&path).unwrap(), Vec::new());

    let before = svc
        .pipeline
        .handle_message(&uplink(Some("river-7"), json!({ "waterLevel": 1.0 })), now())
        .unwrap();
    assert_eq!(before.update.station_name, "river-7");
    assert_eq!(before.update.sensor_type, SensorClass::Static);

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(file, "[stations.\"river-7\"]\nname = \"River Float 7\"\nlat = 15.0\nlng = 101.0").unwrap();
    file.set_modified(std::time::SystemTime::now() + StdDuration::from_secs(5)).unwrap();
    drop(file);

    let after = svc
        .pipeline
        .handle_message(&uplink(Some("river-7"), json!({ "waterLevel": 1.0 })), now())
        .unwrap();
    assert_eq!(after.update.station_name, "River Float 7");
    assert_eq!(after.update.sensor_type, SensorClass::Float);
    assert_eq!(after.update.src, LocationSource::ConfigFile);
}

// ---------------------------------------------------------------------------
// Spreadsheet backend through the router
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemorySheets {
    tabs: Mutex<HashMap<String, Vec<Vec<String>>>>,
}

impl SheetClient for MemorySheets {
    fn append_row(&self, sheet: &str, row: Vec<Value>) -> Result<(), StorageError> {
        let cells = row
            .into_iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect();
        self.tabs.lock().unwrap().entry(sheet.to_string()).or_default().push(cells);
        Ok(())
    }

    fn read_all_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, StorageError> {
        Ok(self.tabs.lock().unwrap().get(sheet).cloned().unwrap_or_default())
    }
}

#[tokio::test]
async fn test_sheet_rows_feed_the_next_bootstrap() {
    let sheets = Arc::new(SpreadsheetBackend::new(MemorySheets::default(), 7));
    let svc = service(StationDirectory::fixed(StationSettings::default()), vec![sheets.clone()]);
    for (device, level) in [("test-hel-v3", 1.0), ("test-hel-v3-n2", 2.0), ("other", 3.0)] {
        let out = svc
            .pipeline
            .handle_message(&uplink(Some(device), json!({ "waterLevel": level })), now())
            .unwrap();
        out.persisted.settled().await;
    }

    // A restarted service bootstraps from what the sheet now holds
    let restarted = service(StationDirectory::fixed(StationSettings::default()), vec![sheets]);
    let boot = restarted.pipeline.bootstrap(now() - Duration::hours(48)).await;
    assert_eq!(boot.source, Some("sheets"));
    assert_eq!(boot.history.len(), 3);
    assert_eq!(boot.history["other"][0].sensor_class, SensorClass::Static);
    assert_eq!(boot.history["other"][0].observed_at, now());
}
