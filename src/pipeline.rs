/// Per-message orchestration.
///
/// Wires decoder → history → persistence + broadcast for each uplink, and
/// owns the two lifecycle hooks around it: seeding history from the
/// authoritative backend at startup, and handing each new real-time
/// subscriber its baseline snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::broadcast::{Broadcaster, RealtimeHub, Subscription};
use crate::history::HistoryStore;
use crate::ingest::uplink;
use crate::logging::{self, Component};
use crate::model::{DecodeError, HistoryEntry, StationMeta, StationUpdate};
use crate::stations::StationDirectory;
use crate::storage::{Bootstrap, PersistHandle, PersistenceRouter};

/// Result of handling one accepted uplink.
pub struct Processed {
    pub update: StationUpdate,
    /// In-flight writes. Dropping it does not cancel them.
    pub persisted: PersistHandle,
}

pub struct Orchestrator {
    stations: StationDirectory,
    history: HistoryStore,
    persistence: PersistenceRouter,
    broadcaster: Broadcaster,
    hub: Arc<RealtimeHub>,
}

impl Orchestrator {
    pub fn new(
        stations: StationDirectory,
        history: HistoryStore,
        persistence: PersistenceRouter,
        broadcaster: Broadcaster,
        hub: Arc<RealtimeHub>,
    ) -> Self {
        Orchestrator {
            stations,
            history,
            persistence,
            broadcaster,
            hub,
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Loads readings newer than `since` from the authoritative backend
    /// and seeds each station with them. Run before intake starts.
    pub async fn bootstrap(&self, since: DateTime<Utc>) -> Bootstrap {
        let boot = self.persistence.bootstrap(since).await;
        for (station_id, entries) in &boot.history {
            self.history.seed(station_id, entries.clone());
        }
        boot
    }

    /// Registers a real-time subscriber; its baseline is the current
    /// snapshot.
    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe(|| self.history.snapshot())
    }

    /// Handles one raw uplink received at `received_at`.
    ///
    /// Must be called from within a tokio runtime. Only a decode failure
    /// is returned; it has already been logged and the message dropped.
    pub fn handle_message(
        &self,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Processed, DecodeError> {
        self.stations.refresh_if_changed();
        let settings = self.stations.current();

        let reading = uplink::decode(payload, &settings, received_at).map_err(|e| {
            logging::warn(Component::Uplink, None, &format!("Dropped uplink: {}", e));
            e
        })?;
        let station_id = reading.station_id.clone();
        let station_name = settings.display_name(&station_id);

        let entry = HistoryEntry::from_reading(&reading);
        let appended = self.history.append_located(
            &station_id,
            entry.clone(),
            Some((reading.latitude, reading.longitude)),
        );

        let meta = StationMeta {
            station_id: station_id.clone(),
            name: station_name.clone(),
            latitude: reading.latitude,
            longitude: reading.longitude,
            location_source: reading.location_source,
        };
        let persisted = self.persistence.persist(entry.clone(), meta);

        let update = StationUpdate {
            display_id: settings.display_id(&station_id),
            station_id: station_id.clone(),
            station_name,
            water_level: entry.water_level,
            pressure: entry.pressure,
            lat: reading.latitude,
            lng: reading.longitude,
            src: reading.location_source,
            timestamp: reading.observed_at,
            history: appended.history,
            trend: appended.trend,
            data_rate: entry.data_rate,
            rssi: entry.rssi,
            snr: entry.snr,
            battery: entry.battery,
            sensor_type: entry.sensor_class,
        };
        self.broadcaster.publish(&update);

        logging::info(
            Component::Uplink,
            Some(&station_id),
            &format!(
                "{} | level {:.2} m | {} | SNR {} | RSSI {} | {:?}",
                update.station_name,
                update.water_level,
                update.data_rate,
                update.snr,
                update.rssi,
                update.trend
            ),
        );

        Ok(Processed { update, persisted })
    }
}
