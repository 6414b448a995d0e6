//! Backend Verification Module
//!
//! Probes every configured persistence backend the way startup would use
//! it (connect, then read the bootstrap window) and reports which ones are
//! reachable and how much history they hold.
//!
//! Use this before pointing a deployment at a new database or sheet.

use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageBackend;

// ============================================================================
// Verification Results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub timestamp: String,
    pub window_hours: i64,
    pub backends: Vec<BackendVerification>,
    pub summary: VerificationSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub working: usize,
    pub failed: usize,
    /// Backend the service would bootstrap from right now.
    pub authoritative: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendVerification {
    pub backend: String,
    pub status: VerificationStatus,
    pub stations: usize,
    pub entries: usize,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum VerificationStatus {
    /// Reachable and holding readings inside the window.
    Success,
    /// Reachable but empty for the window.
    PartialSuccess,
    Failed,
}

// ============================================================================
// Probing
// ============================================================================

/// Reads history newer than `since` from one backend. Blocking.
pub fn verify_backend(backend: &dyn StorageBackend, since: DateTime<Utc>) -> BackendVerification {
    let mut result = BackendVerification {
        backend: backend.name().to_string(),
        status: VerificationStatus::Failed,
        stations: 0,
        entries: 0,
        error_message: None,
    };

    match backend.load_history(since) {
        Ok(history) => {
            result.stations = history.len();
            result.entries = history.values().map(Vec::len).sum();
            result.status = if result.entries > 0 {
                VerificationStatus::Success
            } else {
                VerificationStatus::PartialSuccess
            };
        }
        Err(e) => result.error_message = Some(e.to_string()),
    }

    result
}

/// Probes `backends` in priority order, writing progress lines to
/// `progress` (stderr from the CLI, so stdout carries only the report).
/// Blocking.
pub fn run_full_verification(
    backends: &[Arc<dyn StorageBackend>],
    window_hours: i64,
    now: DateTime<Utc>,
    progress: &mut dyn Write,
) -> VerificationReport {
    let since = now - Duration::hours(window_hours);
    let mut results = Vec::new();

    let _ = writeln!(progress, "Verifying {} backend(s)...", backends.len());
    for backend in backends {
        let _ = write!(progress, "  {} ... ", backend.name());
        let result = verify_backend(backend.as_ref(), since);
        let _ = match result.status {
            VerificationStatus::Success => writeln!(
                progress,
                "OK ({} entries, {} stations)",
                result.entries, result.stations
            ),
            VerificationStatus::PartialSuccess => {
                writeln!(progress, "reachable, no data in window")
            }
            VerificationStatus::Failed => writeln!(
                progress,
                "FAILED: {}",
                result.error_message.as_deref().unwrap_or("Unknown")
            ),
        };
        results.push(result);
    }

    let working = results
        .iter()
        .filter(|r| r.status != VerificationStatus::Failed)
        .count();
    let authoritative = results
        .iter()
        .find(|r| r.status != VerificationStatus::Failed)
        .map(|r| r.backend.clone());

    VerificationReport {
        timestamp: now.to_rfc3339(),
        window_hours,
        summary: VerificationSummary {
            total: results.len(),
            working,
            failed: results.len() - working,
            authoritative,
        },
        backends: results,
    }
}

pub fn print_summary(report: &VerificationReport) {
    println!();
    println!("=== VERIFICATION SUMMARY ===");
    println!(
        "Backends: {}/{} working ({} failed)",
        report.summary.working, report.summary.total, report.summary.failed
    );
    match &report.summary.authoritative {
        Some(name) => println!("Bootstrap source: {} (last {} h)", name, report.window_hours),
        None => println!("Bootstrap source: none, service would start with empty history"),
    }
}
