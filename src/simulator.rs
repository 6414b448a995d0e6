/// Development mode: synthetic uplinks for a local broker
///
/// When no field hardware is reachable, use this module to publish
/// network-server-shaped uplinks so a local `run` instance has something
/// to ingest.

use std::time::Duration;

use rand::Rng;
use rumqttc::{Event, Packet, QoS};
use serde_json::{Value, json};

use crate::config::MqttConfig;
use crate::ingest::mqtt::{connect, mqtt_options};
use crate::logging::{self, Component};
use crate::model::TransportError;

/// A fake device and where it claims to be.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
}

pub fn default_devices() -> Vec<SimulatedDevice> {
    [
        ("Device_001", 13.7563, 100.5018),
        ("Device_002", 13.7600, 100.5100),
        ("Device_003", 13.7500, 100.4900),
    ]
    .into_iter()
    .map(|(id, lat, lng)| SimulatedDevice {
        id: id.to_string(),
        lat,
        lng,
    })
    .collect()
}

/// Configuration for synthetic uplink publishing
pub struct Simulator {
    /// Application id in the topic path
    pub app_id: String,
    pub devices: Vec<SimulatedDevice>,
    /// Publish interval (default: 2 seconds)
    pub interval: Duration,
}

impl Simulator {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            devices: default_devices(),
            interval: Duration::from_secs(2),
        }
    }

    /// `v3/{app}/devices/{device}/up`
    pub fn topic(&self, device: &SimulatedDevice) -> String {
        format!("v3/{}/devices/{}/up", self.app_id, device.id)
    }

    /// One uplink document for `device` with randomized readings.
    pub fn uplink<R: Rng>(&self, device: &SimulatedDevice, rng: &mut R) -> Value {
        let round2 = |v: f64| (v * 100.0).round() / 100.0;
        json!({
            "end_device_ids": {
                "device_id": device.id,
                "application_ids": { "application_id": self.app_id }
            },
            "uplink_message": {
                "decoded_payload": {
                    "waterLevel": round2(rng.gen_range(0.05..5.0)),
                    "pressure": round2(rng.gen_range(0.0..10.0)),
                    "battery": round2(rng.gen_range(3.3..4.2)),
                    "lat": device.lat,
                    "lng": device.lng
                },
                "rx_metadata": [
                    { "rssi": rng.gen_range(-130..-80), "snr": round2(rng.gen_range(-5.0..10.0)) }
                ],
                "settings": {
                    "data_rate": { "lora": { "spreading_factor": 7, "bandwidth": 125000 } }
                }
            }
        })
    }

    /// Publishes one round per interval until the process is stopped.
    pub async fn run(&self, broker: &MqttConfig, password: Option<String>) -> Result<(), TransportError> {
        let credentials = broker
            .username
            .clone()
            .map(|user| (user, password.unwrap_or_default()));
        let options = mqtt_options(
            &format!("{}-sim", broker.client_id),
            &broker.host,
            broker.port,
            broker.tls,
            credentials,
            broker.keep_alive_secs,
        );
        let (client, mut eventloop) = connect(options);

        // Wait for the session before publishing anything
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connection(e.to_string())),
            }
        }
        logging::info(
            Component::System,
            None,
            &format!("Simulator connected to {}:{}", broker.host, broker.port),
        );

        tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    logging::warn(Component::System, None, &format!("Simulator connection: {}", e));
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            for device in &self.devices {
                let (topic, body) = {
                    let mut rng = rand::thread_rng();
                    (self.topic(device), self.uplink(device, &mut rng))
                };
                let level = body["uplink_message"]["decoded_payload"]["waterLevel"].clone();
                client
                    .publish(topic.as_str(), QoS::AtLeastOnce, false, body.to_string())
                    .await
                    .map_err(|e| TransportError::Publish {
                        topic: topic.clone(),
                        reason: e.to_string(),
                    })?;
                logging::info(
                    Component::System,
                    Some(&device.id),
                    &format!("Sim -> {} m", level),
                );
            }
        }
    }
}
