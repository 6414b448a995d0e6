//! hydrolink: water-level telemetry ingestion.
//!
//! Uplinks arrive over MQTT, are decoded into normalized readings, kept in
//! a bounded per-station history, persisted to the configured backends
//! and pushed to real-time subscribers and the legacy topic bus.

pub mod broadcast;
pub mod config;
pub mod history;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod simulator;
pub mod stations;
pub mod storage;
pub mod verify;
