//! Inbound side: uplink decoding and the MQTT subscription feeding it.

pub mod mqtt;
pub mod uplink;
