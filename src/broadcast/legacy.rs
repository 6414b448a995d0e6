/// Legacy republish bus over MQTT.
///
/// Publishing never waits: messages are queued on the client's request
/// channel with `try_publish`, and a background task drives the event
/// loop. While the broker is down the queue fills and publishes fail,
/// which the broadcaster logs and drops.

use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, QoS};

use super::LegacyBus;
use crate::config::LegacyBusConfig;
use crate::ingest::mqtt::{connect, mqtt_options};
use crate::logging::{self, Component};
use crate::model::TransportError;

const KEEP_ALIVE_SECS: u64 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct MqttLegacyBus {
    client: AsyncClient,
}

impl MqttLegacyBus {
    /// Returns the bus and the event loop that must be driven with
    /// [`drive`] for anything to reach the broker.
    pub fn connect(config: &LegacyBusConfig) -> (Self, EventLoop) {
        let options = mqtt_options(
            &config.client_id,
            &config.host,
            config.port,
            false,
            None,
            KEEP_ALIVE_SECS,
        );
        let (client, eventloop) = connect(options);
        (MqttLegacyBus { client }, eventloop)
    }
}

impl LegacyBus for MqttLegacyBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Polls the legacy connection forever, logging state changes.
pub async fn drive(mut eventloop: EventLoop) {
    let mut connected = false;
    loop {
        match eventloop.poll().await {
            Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                connected = true;
                logging::info(Component::Legacy, None, "Connected to legacy broker");
            }
            Ok(_) => {}
            Err(e) => {
                if connected {
                    logging::warn(Component::Legacy, None, &format!("Disconnected: {}", e));
                } else {
                    logging::debug(Component::Legacy, None, &format!("Connect failed: {}", e));
                }
                connected = false;
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
