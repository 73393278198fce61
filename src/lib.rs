//! Local archive for browser tabs.
//!
//! Tabs are kept in an embedded SQLite store with url-level dedup on save,
//! overlapping custom groups, a trash with time-based expiry, rule-driven url
//! normalization and a resumable link health checker. [`ArchiveCore`] is the
//! entry point for all of it.

mod archive;
pub mod db;
pub mod errors;
pub mod link_checker;
mod maintenance;
pub mod models;
pub mod normalization;

pub use crate::archive::ArchiveCore;
pub use crate::errors::{AppError, AppResult};
pub use crate::link_checker::{HttpProbe, LinkChecker, LinkProbe, ProbeOutcome};
pub use crate::maintenance::spawn_trash_sweeper;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs JSON logging to a daily rolling file under `data_dir/logs`.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(data_dir: &Path) -> Result<(), String> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "tab-archive.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
