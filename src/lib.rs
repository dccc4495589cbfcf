//! # nexrad-sync
//!
//! Bulk synchronization of NEXRAD Level 2 radar archives from a public object
//! store, plus progress tracking for an external format converter.
//!
//! ## Design Philosophy
//!
//! nexrad-sync is designed to be:
//! - **Library-first** - No CLI, purely a Rust crate for embedding
//! - **Sensible defaults** - Works against the public NOAA bucket with zero configuration
//! - **Fail per file, never per run** - Transfer failures are counted, not propagated
//! - **Cancellable** - A graceful *stop* and an immediate *kill* reach every task
//!
//! ## Quick Start
//!
//! ```no_run
//! use nexrad_sync::{CancellationController, Config, DateRange, StationId, sync_from_bucket};
//! use chrono::NaiveDate;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.download.data_root = "/data1".into();
//!
//!     let controller = CancellationController::new();
//!     let _signals = nexrad_sync::install_interrupt_handler(controller.clone());
//!
//!     let day = DateRange::day(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
//!     let outcome = sync_from_bucket(
//!         &config,
//!         &controller,
//!         &day,
//!         &[StationId::from("KTLX"), StationId::from("KINX")],
//!     )
//!     .await?;
//!
//!     println!("{} files, {} failed", outcome.summary.succeeded, outcome.summary.failed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Stop and kill signals
pub mod cancel;
/// Configuration types
pub mod config;
/// Top-level conversion run
pub mod conversion;
/// External converter launching
pub mod converter;
/// Error types
pub mod error;
/// Local archive layout and bucket naming
pub mod layout;
/// Single-consumer log aggregation
pub mod log_aggregator;
/// Conversion completion monitor
pub mod monitor;
/// Fixed-width summary table
pub mod report;
/// Retry logic with exponential backoff
pub mod retry;
/// Task enumeration and queue routing
pub mod scheduler;
/// Remote object store access
pub mod store;
/// Top-level download run
pub mod sync;
/// Core types
pub mod types;
/// Download workers
pub mod worker;

#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use cancel::CancellationController;
pub use config::{Config, ConversionConfig, DownloadConfig, RetryConfig, SentinelMode, StoreConfig};
pub use conversion::{ConversionSummary, convert_stations, convert_with_wct};
pub use converter::{ConversionJob, ConverterLauncher, RunningConversion, WctLauncher};
pub use error::{Error, Result};
pub use log_aggregator::{LogAggregator, LogHandle, LogLevel, LogRecord, LogSink, MemorySink, TracingSink};
pub use monitor::{ConversionMonitor, MonitorReport, StationProgress, StationState};
pub use scheduler::Scheduler;
pub use store::{HttpBucketStore, ObjectStore};
pub use sync::{SyncOutcome, sync_from_bucket, sync_stations};
pub use types::{
    DateRange, DownloadTask, EnqueueReport, ObjectRef, QueueItem, StationId, StationSyncReport,
    SyncSummary, WorkerResult,
};
pub use worker::DownloadWorker;

/// Set kill on the first interrupt.
///
/// Returns the listening task; abort it to uninstall the handler.
///
/// Only an interrupt (SIGINT, or Ctrl+C off unix) is recognized. SIGTERM and
/// every other signal are left alone.
///
/// # Example
///
/// ```no_run
/// use nexrad_sync::{CancellationController, install_interrupt_handler};
///
/// #[tokio::main]
/// async fn main() {
///     let controller = CancellationController::new();
///     let handler = install_interrupt_handler(controller.clone());
///
///     // ... run a sync with `controller` ...
///
///     handler.abort();
/// }
/// ```
pub fn install_interrupt_handler(
    controller: CancellationController,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        controller.kill();
    })
}

/// Resolves on the first interrupt. Other signals keep their default action.
#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::interrupt()) {
        Ok(mut interrupts) => {
            interrupts.recv().await;
            tracing::info!("Interrupt received, killing sync");
        }
        Err(e) => {
            tracing::warn!(error = %e, "No SIGINT stream, falling back to ctrl_c");
            wait_for_ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl+C received, killing sync"),
        Err(e) => {
            // without a listener the handler would kill at once; wait forever instead
            tracing::error!(error = %e, "Cannot listen for Ctrl+C, interrupts are ignored");
            std::future::pending::<()>().await;
        }
    }
}
