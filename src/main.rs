use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};

use hydrolink_service::broadcast::{
    Broadcaster, LegacyBus, MqttLegacyBus, RealtimeHub, SubscriberSet, legacy, ws,
};
use hydrolink_service::config::{self, AppConfig, DEFAULT_CONFIG_PATH};
use hydrolink_service::history::HistoryStore;
use hydrolink_service::ingest::mqtt;
use hydrolink_service::logging::{self, Component, LogLevel};
use hydrolink_service::pipeline::Orchestrator;
use hydrolink_service::simulator::Simulator;
use hydrolink_service::stations::StationDirectory;
use hydrolink_service::storage::{PersistenceRouter, configured_backends};
use hydrolink_service::verify;

/// Water-level telemetry ingestion service
#[derive(Parser, Debug)]
#[command(name = "hydrolink")]
#[command(version)]
struct Cli {
    /// Service configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest uplinks and serve real-time subscribers (default)
    Run,
    /// Publish synthetic uplinks to the inbound broker
    Simulate {
        /// Application id used in the uplink topic
        #[arg(long, default_value = "ieeew2025")]
        app_id: String,
        /// Seconds between publish rounds
        #[arg(long, default_value_t = 2)]
        interval_secs: u64,
    },
    /// Probe the configured storage backends and print a report
    Verify {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    config::load_env();
    let app = AppConfig::load(&cli.config)?;

    let level = cli
        .log_level
        .as_deref()
        .or(app.logging.level.as_deref())
        .map(|raw| raw.parse::<LogLevel>())
        .transpose()?
        .unwrap_or(LogLevel::Info);
    logging::init_logger(level, app.logging.file.as_deref(), app.logging.timestamps);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(app).await,
        Command::Simulate {
            app_id,
            interval_secs,
        } => {
            let mut simulator = Simulator::new(app_id);
            simulator.interval = std::time::Duration::from_secs(interval_secs.max(1));
            simulator.run(&app.mqtt, config::mqtt_password()).await?;
            Ok(())
        }
        Command::Verify { json } => {
            let backends = configured_backends(&app.data_source);
            let hours = app.history.bootstrap_hours;
            let report = tokio::task::spawn_blocking(move || {
                verify::run_full_verification(&backends, hours, Utc::now(), &mut std::io::stderr())
            })
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                verify::print_summary(&report);
            }
            Ok(())
        }
    }
}

async fn run(app: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::info(
        Component::System,
        None,
        &format!("hydrolink v{} starting", env!("CARGO_PKG_VERSION")),
    );

    let stations = StationDirectory::open(Path::new(&app.stations_file))?;
    let persistence = PersistenceRouter::new(configured_backends(&app.data_source))
        .with_bootstrap_timeout(std::time::Duration::from_secs(app.history.bootstrap_timeout_secs.max(1)));
    if persistence.is_empty() {
        logging::warn(Component::System, None, "No storage backend enabled, readings will not be persisted");
    } else {
        logging::info(
            Component::System,
            None,
            &format!("Storage backends: {}", persistence.backend_names().join(", ")),
        );
    }

    let legacy_bus: Option<Arc<dyn LegacyBus>> = if app.legacy_bus.enabled {
        let (bus, eventloop) = MqttLegacyBus::connect(&app.legacy_bus);
        tokio::spawn(legacy::drive(eventloop));
        Some(Arc::new(bus))
    } else {
        None
    };

    let hub = Arc::new(RealtimeHub::default());
    let subscribers: Arc<dyn SubscriberSet> = hub.clone();
    let broadcaster = Broadcaster::new(subscribers, legacy_bus, app.legacy_sensors.clone());
    let pipeline = Arc::new(Orchestrator::new(
        stations,
        HistoryStore::new(app.history.capacity),
        persistence,
        broadcaster,
        hub.clone(),
    ));

    // History must be seeded before the first live uplink is handled
    let since = Utc::now() - Duration::hours(app.history.bootstrap_hours);
    let boot = pipeline.bootstrap(since).await;
    if let Some(source) = boot.source {
        logging::info(Component::System, None, &format!("History loaded from {}", source));
    }

    let realtime = ws::RealtimeState {
        pipeline: Arc::clone(&pipeline),
        hub,
    };
    let bind = app.realtime.bind.clone();
    let server = tokio::spawn(async move { ws::serve(&bind, realtime).await });

    tokio::select! {
        _ = mqtt::run_intake(&app.mqtt, config::mqtt_password(), Arc::clone(&pipeline)) => {}
        result = server => {
            match result {
                Ok(Err(e)) => logging::error(Component::Realtime, None, &format!("Server failed: {}", e)),
                Err(e) => logging::error(Component::Realtime, None, &format!("Server task aborted: {}", e)),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            logging::info(Component::System, None, "Shutting down");
        }
    }

    Ok(())
}
