//! # geotrackd: Headless Location Tracker
//!
//! Wires the pipeline crates into a long-running process.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Daemon Startup                                 │
//! │                                                                         │
//! │  1. Initialize Logging ───────────────────────────────────────────────► │
//! │     • tracing-subscriber with env filter                                │
//! │     • Default: info,geotrack=debug,sqlx=warn (RUST_LOG overrides)       │
//! │                                                                         │
//! │  2. Load Configuration ───────────────────────────────────────────────► │
//! │     • tracker.toml (written on first run to pin the device id)          │
//! │     • GEOTRACK_* environment overrides                                  │
//! │                                                                         │
//! │  3. Open Database ────────────────────────────────────────────────────► │
//! │     • GEOTRACK_DB_PATH or <data dir>/geotrack.db                        │
//! │     • SQLite with WAL mode, pending migrations                          │
//! │                                                                         │
//! │  4. Start Supervisor ─────────────────────────────────────────────────► │
//! │     • Interrupted deliveries return to the queue                        │
//! │     • Sampling starts unless this is a boot launch that should not      │
//! │       resume                                                            │
//! │                                                                         │
//! │  5. Wait for SIGINT / SIGTERM, then shut down gracefully                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```text
//! geotrackd [--boot] [--config <PATH>]
//! geotrackd --help
//! ```

pub mod feed;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use directories::ProjectDirs;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use geotrack_db::{Database, DbConfig, DbError, ServicePreferences};
use geotrack_sync::{
    CycleReport, PipelineEventEmitter, PipelineStatus, Supervisor, SyncError, TrackerConfig,
};

use crate::feed::JsonLinesProvider;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Pipeline(#[from] SyncError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not determine the data directory")]
    NoDataDir,
}

// =============================================================================
// Command Line
// =============================================================================

/// Command line options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Parser)]
#[command(name = "geotrackd")]
#[command(about = "Background location tracker with durable, resumable delivery")]
#[command(version)]
pub struct Options {
    /// Launched by the OS at boot rather than by the user
    #[arg(long)]
    pub boot: bool,

    /// Tracker configuration file (default: platform config dir)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Whether sampling starts right away.
pub fn should_start_sampling(options: &Options, preferences: &ServicePreferences) -> bool {
    !options.boot || preferences.should_resume_on_boot()
}

// =============================================================================
// Event Emitter
// =============================================================================

/// Forwards pipeline events to the log.
struct LogEmitter;

impl PipelineEventEmitter for LogEmitter {
    fn emit_status(&self, status: &PipelineStatus) {
        debug!(
            sampling = ?status.sampling,
            engine = %status.engine,
            pending = status.pending,
            delivered = status.delivered,
            failed = status.failed,
            "Pipeline status"
        );
    }

    fn emit_progress(&self, pending: i64, delivered: i64) {
        info!(pending, delivered, "Delivery progress");
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        if retryable {
            warn!(message, "Pipeline error");
        } else {
            error!(message, "Pipeline error, user action needed");
        }
    }

    fn emit_cycle(&self, report: &CycleReport) {
        debug!(outcome = ?report.outcome, selected = report.selected, "Cycle finished");
    }
}

// =============================================================================
// Entry Point
// =============================================================================

/// Runs the daemon until a shutdown signal arrives.
pub async fn run(options: Options) -> Result<(), DaemonError> {
    init_tracing();
    info!(boot = options.boot, "Starting geotrackd");

    let config = load_config(options.config.clone())?;
    info!(
        device_id = config.device_id(),
        batch_size = config.sync.batch_size,
        functions_url = %config.backend.functions_url,
        "Configuration loaded"
    );

    let db_path = database_path()?;
    let db = Database::new(DbConfig::new(&db_path)).await?;
    db.preferences().set_auto_start(config.supervisor.auto_start).await?;
    let preferences = db.preferences().get().await?;

    let provider = Arc::new(JsonLinesProvider::from_env().await?);
    let handle = Supervisor::builder(config, db.clone())
        .with_provider(provider)
        .with_emitter(Arc::new(LogEmitter))
        .build()?
        .start()
        .await?;

    if should_start_sampling(&options, &preferences) {
        match handle.start_sampling().await {
            Ok(()) => {}
            // the supervisor keeps retrying in the background
            Err(err) if err.is_retryable() => warn!(%err, "Sampling not started yet"),
            // the backlog is still delivered
            Err(err) => error!(%err, "Sampling not started"),
        }
    } else {
        info!(
            service_running = preferences.service_running,
            auto_start = preferences.auto_start_enabled,
            "Boot launch, tracking not resumed"
        );
    }
    handle.trigger_sync().await?;

    shutdown_signal().await;

    handle.shutdown().await?;
    db.close().await;
    info!("geotrackd stopped");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show all debug logs
/// - `RUST_LOG=geotrack=trace` - Show trace for geotrack crates only
/// - Default: info, debug for geotrack crates
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    log_subscriber(filter).init();
}

const DEFAULT_LOG_FILTER: &str = "info,geotrack=debug,sqlx=warn";

/// The filter alone decides what is recorded.
fn log_subscriber(filter: EnvFilter) -> impl tracing::Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish()
}

/// Loads the tracker configuration and writes it out on first run, so the
/// generated device id stays the same across restarts.
fn load_config(path: Option<PathBuf>) -> Result<TrackerConfig, DaemonError> {
    let path = path.or_else(TrackerConfig::default_config_path);
    let first_run = path.as_ref().is_some_and(|p| !p.exists());

    let config = TrackerConfig::load(path.clone())?;
    if first_run {
        match config.save(path) {
            Ok(()) => info!(device_id = config.device_id(), "Device identity created"),
            Err(err) => warn!(%err, "Could not persist config, device id changes on restart"),
        }
    }
    Ok(config)
}

/// Determines the database file path.
///
/// ## Platform-Specific Paths
/// - **macOS**: `~/Library/Application Support/dev.geotrack.geotrack/geotrack.db`
/// - **Windows**: `%APPDATA%\geotrack\geotrack\data\geotrack.db`
/// - **Linux**: `~/.local/share/geotrack/geotrack.db`
///
/// ## Override
/// Set `GEOTRACK_DB_PATH` to use a custom path.
fn database_path() -> Result<PathBuf, DaemonError> {
    if let Ok(path) = std::env::var("GEOTRACK_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    let dirs = ProjectDirs::from("dev", "geotrack", "geotrack").ok_or(DaemonError::NoDataDir)?;
    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;

    info!(path = %data_dir.display(), "Data directory");
    Ok(data_dir.join("geotrack.db"))
}

/// Completes on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(?err, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping pipeline");
}
