/// Structured logging for the ingestion service
///
/// Provides component-tagged logging with station identifiers on top of
/// `tracing`. Supports console output and an append-mode log file for
/// daemon operation. `RUST_LOG` overrides the configured minimum level.

use std::fmt;
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt as tfmt};

// ---------------------------------------------------------------------------
// Log Levels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Uplink,
    Postgres,
    Sheets,
    Realtime,
    Legacy,
    System,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Uplink => write!(f, "UPLINK"),
            Component::Postgres => write!(f, "PG"),
            Component::Sheets => write!(f, "SHEETS"),
            Component::Realtime => write!(f, "RT"),
            Component::Legacy => write!(f, "LEGACY"),
            Component::System => write!(f, "SYS"),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureType {
    /// Expected failure - backend deliberately not configured
    Expected,
    /// Unexpected failure - indicates service degradation or configuration issue
    Unexpected,
    /// Unknown - cannot determine if this is expected or not
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Installs the global subscriber.
///
/// With `console_timestamps` off the console layer drops timestamps and
/// targets, which reads better under a supervisor that adds its own. The
/// file layer, when configured, always carries full timestamps.
/// Calling this twice is harmless; the second call is ignored.
pub fn init_logger(min_level: LogLevel, log_file: Option<&str>, console_timestamps: bool) {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(min_level.as_filter()))
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    // Console output goes to stderr; stdout is reserved for command output
    if console_timestamps {
        layers.push(
            tfmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(filter())
                .boxed(),
        );
    } else {
        layers.push(
            tfmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_target(false)
                .with_filter(filter())
                .boxed(),
        );
    }

    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => layers.push(
                tfmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter())
                    .boxed(),
            ),
            Err(e) => eprintln!("Failed to open log file {}: {}", path, e),
        }
    }

    let _ = tracing_subscriber::registry().with(layers).try_init();
}

// ---------------------------------------------------------------------------
// Public Logging Functions
// ---------------------------------------------------------------------------

/// Log a general informational message
pub fn info(component: Component, station_id: Option<&str>, message: &str) {
    tracing::info!(component = %component, station = station_id.unwrap_or("-"), "{}", message);
}

/// Log a warning message
pub fn warn(component: Component, station_id: Option<&str>, message: &str) {
    tracing::warn!(component = %component, station = station_id.unwrap_or("-"), "{}", message);
}

/// Log an error message
pub fn error(component: Component, station_id: Option<&str>, message: &str) {
    tracing::error!(component = %component, station = station_id.unwrap_or("-"), "{}", message);
}

/// Log a debug message
pub fn debug(component: Component, station_id: Option<&str>, message: &str) {
    tracing::debug!(component = %component, station = station_id.unwrap_or("-"), "{}", message);
}

// ---------------------------------------------------------------------------
// Failure Classification Helpers
// ---------------------------------------------------------------------------

/// Classify a backend failure from its rendered error message.
pub fn classify_backend_failure(error_message: &str) -> FailureType {
    if error_message.contains("not configured") {
        FailureType::Expected
    }
    // Connectivity problems are the backend's fault, not the data's
    else if error_message.contains("unavailable")
        || error_message.contains("HTTP error")
        || error_message.contains("timed out")
    {
        FailureType::Unexpected
    } else {
        FailureType::Unknown
    }
}

/// Log a backend failure with automatic classification
pub fn log_backend_failure(
    component: Component,
    station_id: Option<&str>,
    operation: &str,
    err: &dyn std::error::Error,
) {
    let error_msg = err.to_string();
    let failure_type = classify_backend_failure(&error_msg);

    let message = format!("{} failed [{}]: {}", operation, failure_type, error_msg);

    match failure_type {
        FailureType::Expected => debug(component, station_id, &message),
        FailureType::Unexpected => error(component, station_id, &message),
        FailureType::Unknown => warn(component, station_id, &message),
    }
}

// ---------------------------------------------------------------------------
// Bootstrap Summary Logging
// ---------------------------------------------------------------------------

/// Log a summary of the startup history load
pub fn log_bootstrap_summary(component: Component, stations: usize, entries: usize) {
    let message = format!(
        "History bootstrap complete: {} entries across {} stations",
        entries, stations
    );

    if stations == 0 {
        warn(component, None, &message);
    } else {
        info(component, None, &message);
    }
}
