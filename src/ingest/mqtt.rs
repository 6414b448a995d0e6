/// Inbound uplink subscription over MQTT.
///
/// Messages are handled one at a time in arrival order: the next publish
/// is not polled until the orchestrator has decoded, recorded, dispatched
/// and broadcast the current one. Persistence is dispatched to the
/// blocking pool, so it never holds up the loop.
///
/// Connection drops are handled by `rumqttc`'s reconnect-on-poll; the loop
/// only backs off and resubscribes on each new session.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};

use crate::config::MqttConfig;
use crate::logging::{self, Component};
use crate::pipeline::Orchestrator;

/// Floor for the keep-alive interval.
const MIN_KEEP_ALIVE_SECS: u64 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 64;

/// Builds client options for a broker connection.
pub fn mqtt_options(
    client_id: &str,
    host: &str,
    port: u16,
    tls: bool,
    credentials: Option<(String, String)>,
    keep_alive_secs: u64,
) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(keep_alive_secs.max(MIN_KEEP_ALIVE_SECS)));
    if tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    if let Some((username, password)) = credentials {
        options.set_credentials(username, password);
    }
    options
}

/// Options for the inbound broker. The password only applies when a
/// username is configured.
pub fn inbound_options(config: &MqttConfig, password: Option<String>) -> MqttOptions {
    let credentials = config
        .username
        .clone()
        .map(|user| (user, password.unwrap_or_default()));
    mqtt_options(
        &config.client_id,
        &config.host,
        config.port,
        config.tls,
        credentials,
        config.keep_alive_secs,
    )
}

pub fn connect(options: MqttOptions) -> (AsyncClient, EventLoop) {
    AsyncClient::new(options, REQUEST_CAPACITY)
}

/// Consumes uplinks forever.
pub async fn run_intake(config: &MqttConfig, password: Option<String>, pipeline: Arc<Orchestrator>) {
    let (client, mut eventloop) = connect(inbound_options(config, password));
    logging::info(
        Component::Uplink,
        None,
        &format!("Connecting to {}:{} ({})", config.host, config.port, config.topic),
    );

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                logging::info(Component::Uplink, None, "Connected, subscribing");
                if let Err(e) = client.try_subscribe(config.topic.as_str(), QoS::AtLeastOnce) {
                    logging::error(Component::Uplink, None, &format!("Subscribe failed: {}", e));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                logging::debug(
                    Component::Uplink,
                    None,
                    &format!("{} ({} bytes)", publish.topic, publish.payload.len()),
                );
                if let Ok(processed) = pipeline.handle_message(&publish.payload, Utc::now()) {
                    drop(processed.persisted);
                }
            }
            Ok(_) => {}
            Err(e) => {
                logging::warn(
                    Component::Uplink,
                    None,
                    &format!("Connection error: {}; retrying in {:?}", e, RECONNECT_DELAY),
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
