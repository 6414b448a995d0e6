/// Relational persistence (PostgreSQL).
///
/// The store keeps one `stations` row per station (upserted, last writer
/// wins) and one immutable `readings` row per uplink. Because `readings`
/// references `stations`, every write upserts the station first and
/// inserts the reading second, in the same call.
///
/// Schema lives in `sql/001_base_schema.sql` and is applied by operators;
/// this module never issues DDL.

use std::sync::{Mutex, MutexGuard, TryLockError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls};

use super::{StorageBackend, group_by_station};
use crate::logging::{self, Component};
use crate::model::{
    HistoryEntry, HistorySnapshot, RSSI_MISSING, SensorClass, StationMeta, StorageError,
};

/// Operations the service needs from a relational store.
pub trait RelationalStore: Send + Sync {
    fn upsert_station(&self, meta: &StationMeta, active_at: DateTime<Utc>) -> Result<(), StorageError>;

    fn insert_reading(&self, entry: &HistoryEntry) -> Result<(), StorageError>;

    /// Readings newer than `since`, oldest first.
    fn readings_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryEntry>, StorageError>;
}

// ---------------------------------------------------------------------------
// Backend adapter
// ---------------------------------------------------------------------------

pub struct RelationalBackend<R> {
    store: R,
}

impl<R: RelationalStore> RelationalBackend<R> {
    pub fn new(store: R) -> Self {
        RelationalBackend { store }
    }
}

impl<R: RelationalStore> StorageBackend for RelationalBackend<R> {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn component(&self) -> Component {
        Component::Postgres
    }

    fn persist(&self, entry: &HistoryEntry, meta: &StationMeta) -> Result<(), StorageError> {
        self.store.upsert_station(meta, entry.observed_at)?;
        self.store.insert_reading(entry)
    }

    fn load_history(&self, since: DateTime<Utc>) -> Result<HistorySnapshot, StorageError> {
        Ok(group_by_station(self.store.readings_since(since)?))
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Socket connect plus the startup exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Server-side cap on any one statement.
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(15);
/// Unacknowledged writes older than this drop the connection.
const TCP_USER_TIMEOUT: Duration = Duration::from_secs(20);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
/// How long a call waits for the connection held by another call.
const LOCK_WAIT: Duration = Duration::from_secs(20);
const MAX_ATTEMPTS: u32 = 2;

const UPSERT_STATION: &str = "
    INSERT INTO stations (station_id, name, latitude, longitude, location_source, last_active_at)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (station_id) DO UPDATE SET
        name = EXCLUDED.name,
        latitude = EXCLUDED.latitude,
        longitude = EXCLUDED.longitude,
        location_source = EXCLUDED.location_source,
        last_active_at = EXCLUDED.last_active_at
";

const INSERT_READING: &str = "
    INSERT INTO readings
        (station_id, water_level, pressure, data_rate, rssi, snr, battery, sensor_type, timestamp)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
";

const READINGS_SINCE: &str = "
    SELECT station_id, water_level, pressure, data_rate, rssi, snr, battery, sensor_type, timestamp
    FROM readings
    WHERE timestamp > $1
    ORDER BY timestamp ASC
";

/// A lazily connected PostgreSQL client.
///
/// The connection is opened on first use and dropped when the server
/// closes it; the next call reconnects. A statement that fails on a closed
/// connection is retried once on a fresh one.
///
/// No call blocks indefinitely. `HANDSHAKE_TIMEOUT` caps connection setup
/// and `LOCK_WAIT` caps the wait for the shared connection. Statements rely
/// on the server's `statement_timeout` plus TCP keepalives.
pub struct PostgresStore {
    url: String,
    handshake_timeout: Duration,
    client: Mutex<Option<Client>>,
}

impl PostgresStore {
    pub fn new(url: impl Into<String>) -> Self {
        PostgresStore {
            url: url.into(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            client: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Opens the connection now so startup can report reachability.
    pub fn connect_now(&self) -> Result<(), StorageError> {
        self.with_client(|client| client.simple_query("SELECT 1").map(|_| ()))
    }

    fn connect(&self) -> Result<Client, StorageError> {
        let mut config: postgres::Config =
            self.url.parse().map_err(|e: postgres::Error| StorageError::BackendUnavailable {
                backend: "postgres",
                reason: format!("invalid DATABASE_URL: {}", e),
            })?;
        config
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_user_timeout(TCP_USER_TIMEOUT)
            .keepalives(true)
            .keepalives_idle(KEEPALIVE_IDLE)
            .options(&format!("-c statement_timeout={}", STATEMENT_TIMEOUT.as_millis()));

        // `connect_timeout` covers the socket only, so a server that accepts
        // and then stays silent is cut off here. The stuck thread is left to
        // die with its socket.
        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("pg-connect".to_string())
            .spawn(move || {
                let _ = tx.send(config.connect(NoTls));
            })
            .map_err(|e| StorageError::BackendUnavailable {
                backend: "postgres",
                reason: format!("cannot spawn connect thread: {}", e),
            })?;

        let client = match rx.recv_timeout(self.handshake_timeout) {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(StorageError::BackendUnavailable {
                    backend: "postgres",
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(StorageError::BackendUnavailable {
                    backend: "postgres",
                    reason: format!("no handshake response within {:?}", self.handshake_timeout),
                });
            }
        };
        logging::info(Component::Postgres, None, "Connected to PostgreSQL");
        Ok(client)
    }

    /// Waits up to `LOCK_WAIT` for the shared connection.
    fn lock_client(&self) -> Result<MutexGuard<'_, Option<Client>>, StorageError> {
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match self.client.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                    return Err(StorageError::BackendUnavailable {
                        backend: "postgres",
                        reason: format!("connection busy for {:?}", LOCK_WAIT),
                    });
                }
                Err(TryLockError::WouldBlock) => thread::sleep(Duration::from_millis(20)),
            }
        }
    }

    fn with_client<T, F>(&self, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut(&mut Client) -> Result<T, postgres::Error>,
    {
        let mut guard = self.lock_client()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let client = match guard.take() {
                Some(existing) if !existing.is_closed() => guard.insert(existing),
                _ => guard.insert(self.connect()?),
            };
            match op(client) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_closed() => {
                    *guard = None;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(e.into());
                    }
                    logging::debug(Component::Postgres, None, "Connection closed, reconnecting");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl RelationalStore for PostgresStore {
    fn upsert_station(&self, meta: &StationMeta, active_at: DateTime<Utc>) -> Result<(), StorageError> {
        self.with_client(|client| {
            client
                .execute(
                    UPSERT_STATION,
                    &[
                        &meta.station_id,
                        &meta.name,
                        &meta.latitude,
                        &meta.longitude,
                        &meta.location_source.as_str(),
                        &active_at,
                    ],
                )
                .map(|_| ())
        })
    }

    fn insert_reading(&self, entry: &HistoryEntry) -> Result<(), StorageError> {
        self.with_client(|client| {
            client
                .execute(
                    INSERT_READING,
                    &[
                        &entry.station_id,
                        &entry.water_level,
                        &entry.pressure,
                        &entry.data_rate,
                        &entry.rssi,
                        &entry.snr,
                        &entry.battery,
                        &entry.sensor_class.as_str(),
                        &entry.observed_at,
                    ],
                )
                .map(|_| ())
        })
    }

    fn readings_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows = self.with_client(|client| client.query(READINGS_SINCE, &[&since]))?;
        Ok(rows
            .iter()
            .map(|row| HistoryEntry {
                station_id: row.get(0),
                water_level: row.get::<_, Option<f64>>(1).unwrap_or(0.0),
                pressure: row.get::<_, Option<f64>>(2).unwrap_or(0.0),
                data_rate: row.get::<_, Option<String>>(3).unwrap_or_default(),
                rssi: row.get::<_, Option<i32>>(4).unwrap_or(RSSI_MISSING),
                snr: row.get::<_, Option<f64>>(5).unwrap_or(0.0),
                battery: row.get::<_, Option<f64>>(6).unwrap_or(0.0),
                sensor_class: SensorClass::from_label(
                    &row.get::<_, Option<String>>(7).unwrap_or_default(),
                ),
                observed_at: row.get(8),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocationSource;
    use chrono::TimeZone;

    /// Records call order and can refuse the upsert.
    #[derive(Default)]
    struct ScriptedStore {
        calls: Mutex<Vec<String>>,
        refuse_upsert: bool,
        rows: Vec<HistoryEntry>,
    }

    impl RelationalStore for ScriptedStore {
        fn upsert_station(&self, meta: &StationMeta, _at: DateTime<Utc>) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push(format!("upsert:{}", meta.station_id));
            if self.refuse_upsert {
                return Err(StorageError::Query("permission denied".to_string()));
            }
            Ok(())
        }

        fn insert_reading(&self, entry: &HistoryEntry) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push(format!("insert:{}", entry.station_id));
            Ok(())
        }

        fn readings_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryEntry>, StorageError> {
            Ok(self.rows.iter().filter(|e| e.observed_at > since).cloned().collect())
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, hour, 0, 0).unwrap()
    }

    fn entry(station: &str, hour: u32) -> HistoryEntry {
        HistoryEntry {
            station_id: station.to_string(),
            water_level: hour as f64 / 10.0,
            pressure: 0.0,
            battery: 0.0,
            rssi: RSSI_MISSING,
            snr: 0.0,
            data_rate: String::new(),
            sensor_class: SensorClass::Static,
            observed_at: at(hour),
        }
    }

    fn meta(station: &str) -> StationMeta {
        StationMeta {
            station_id: station.to_string(),
            name: station.to_string(),
            latitude: 0.0,
            longitude: 0.0,
            location_source: LocationSource::Default,
        }
    }

    #[test]
    fn test_persist_upserts_station_before_reading() {
        let backend = RelationalBackend::new(ScriptedStore::default());
        backend.persist(&entry("new-station", 1), &meta("new-station")).unwrap();
        let calls = backend.store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["upsert:new-station", "insert:new-station"]);
    }

    #[test]
    fn test_failed_upsert_skips_reading_insert() {
        let backend = RelationalBackend::new(ScriptedStore {
            refuse_upsert: true,
            ..ScriptedStore::default()
        });
        assert!(backend.persist(&entry("s1", 1), &meta("s1")).is_err());
        let calls = backend.store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["upsert:s1"]);
    }

    #[test]
    fn test_load_history_groups_rows_by_station() {
        let backend = RelationalBackend::new(ScriptedStore {
            rows: vec![entry("a", 1), entry("b", 2), entry("a", 3), entry("a", 4)],
            ..ScriptedStore::default()
        });
        let history = backend.load_history(at(2)).unwrap();
        assert_eq!(history["a"].len(), 2);
        assert!(!history.contains_key("b"), "rows at the cutoff are excluded");
    }

    #[test]
    fn test_unreachable_server_reports_backend_unavailable() {
        // Port 1 on localhost refuses immediately on any sane host
        let store = PostgresStore::new("postgres://nobody@127.0.0.1:1/none");
        let err = store.connect_now().unwrap_err();
        assert!(matches!(err, StorageError::BackendUnavailable { .. }), "got {:?}", err);
    }

    #[test]
    fn test_silent_server_times_out_during_handshake() {
        use std::net::TcpListener;

        // Accepts connections and never says a word
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                held.push(stream);
            }
        });

        let store = PostgresStore::new(format!("postgres://u@127.0.0.1:{}/db", port))
            .with_handshake_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let err = store.connect_now().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        assert!(err.to_string().contains("no handshake response"), "got {}", err);

        // The connection slot is free again for the next caller
        let started = Instant::now();
        assert!(store.connect_now().is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_url_reports_backend_unavailable() {
        let store = PostgresStore::new("not a url at all ::");
        let err = store.connect_now().unwrap_err();
        assert!(err.to_string().contains("invalid DATABASE_URL"), "got {}", err);
    }
}
