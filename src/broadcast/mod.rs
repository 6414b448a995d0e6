//! Outbound fan-out of enriched readings.
//!
//! Two destinations:
//! - real-time subscribers (dashboard connections), reached through a
//!   `SubscriberSet`
//! - the legacy topic bus, which gets one scalar per mapped sub-sensor
//!
//! Neither destination can fail the caller. Real-time delivery is best
//! effort to whoever is connected right now; legacy publish errors are
//! logged and dropped.

pub mod legacy;
pub mod realtime;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::config::{LegacySensor, SensorChannel};
use crate::logging::{self, Component};
use crate::model::{HistorySnapshot, StationUpdate, TransportError};

pub use legacy::MqttLegacyBus;
pub use realtime::{RealtimeHub, Subscription};

/// Events delivered to real-time subscribers, serialized as
/// `{"event": "...", "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum RealtimeEvent {
    /// Full history snapshot, sent once per connection before any update.
    #[serde(rename = "init-data")]
    InitData(HistorySnapshot),
    #[serde(rename = "sensor-update")]
    SensorUpdate(StationUpdate),
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::InitData(_) => "init-data",
            RealtimeEvent::SensorUpdate(_) => "sensor-update",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// The set of currently connected real-time subscribers.
pub trait SubscriberSet: Send + Sync {
    /// Delivers `event` to every live subscriber. Never blocks on a slow one.
    fn broadcast(&self, event: RealtimeEvent);

    fn subscriber_count(&self) -> usize;
}

/// Downstream bus that receives per-sensor scalars.
pub trait LegacyBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Topic for one legacy sub-sensor: `water/{display_id}/{sensor_id}`.
pub fn legacy_topic(display_id: &str, sensor_id: &str) -> String {
    format!("water/{}/{}", display_id, sensor_id)
}

pub struct Broadcaster {
    subscribers: Arc<dyn SubscriberSet>,
    legacy: Option<Arc<dyn LegacyBus>>,
    legacy_sensors: HashMap<String, Vec<LegacySensor>>,
}

impl Broadcaster {
    /// `legacy_sensors` maps a station id to the sub-sensors republished
    /// for it. Stations missing from the map are never republished.
    pub fn new(
        subscribers: Arc<dyn SubscriberSet>,
        legacy: Option<Arc<dyn LegacyBus>>,
        legacy_sensors: HashMap<String, Vec<LegacySensor>>,
    ) -> Self {
        Broadcaster {
            subscribers,
            legacy,
            legacy_sensors,
        }
    }

    pub fn publish(&self, update: &StationUpdate) {
        self.subscribers
            .broadcast(RealtimeEvent::SensorUpdate(update.clone()));
        self.republish_legacy(update);
    }

    /// Republishes mapped sub-sensors. Returns how many messages the bus
    /// accepted.
    fn republish_legacy(&self, update: &StationUpdate) -> usize {
        let Some(bus) = &self.legacy else {
            return 0;
        };
        let Some(sensors) = self.legacy_sensors.get(&update.station_id) else {
            return 0;
        };

        let mut sent = 0;
        for sensor in sensors {
            let value = match sensor.channel {
                SensorChannel::Level => update.water_level,
                SensorChannel::Pressure => update.pressure,
            };
            let topic = legacy_topic(&update.display_id, &sensor.id);
            let payload = json!({ "value": value }).to_string().into_bytes();
            match bus.publish(&topic, payload) {
                Ok(()) => sent += 1,
                Err(e) => logging::warn(
                    Component::Legacy,
                    Some(&update.station_id),
                    &e.to_string(),
                ),
            }
        }
        sent
    }
}
