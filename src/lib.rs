//! # bulk-data-client
//!
//! Client library for the FHIR Bulk Data Access export operation.
//!
//! ## Design Philosophy
//!
//! bulk-data-client is designed to be:
//! - **Configurable** - every request, poll and download knob lives in [`Config`]
//! - **Streaming** - files flow from the server to the destination without being buffered whole
//! - **Library-first** - no CLI, purely a Rust crate for embedding
//! - **Event-driven** - consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use bulk_data_client::{BulkDataClient, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.server.fhir_url = "https://fhir.example.com/r4".to_string();
//!     config.download.destination = "./downloads".to_string();
//!
//!     let client = BulkDataClient::new(config)?;
//!
//!     // Subscribe to events
//!     let mut events = client.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let summary = client.run().await?;
//!     println!("{} files, {} resources", summary.files, summary.resources);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// DocumentReference attachment resolution
pub mod attachments;
/// Access tokens for protected servers
pub mod auth;
/// Configuration types
pub mod config;
/// Output destinations (filesystem, object store, HTTP, discard)
pub mod destination;
/// Error types
pub mod error;
/// NDJSON export log writer
pub mod event_log;
/// Export orchestration (decomposed into focused submodules)
pub mod export;
/// Streaming file fetch and decompression
pub mod fetch;
/// NDJSON line framing and serialization
pub mod ndjson;
/// Bounded-concurrency download queue
pub mod queue;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

mod http;

// Re-export commonly used types
pub use attachments::{NoTextExtractor, TextExtractor};
pub use auth::{AccessToken, NoAuth, StaticTokenProvider, TokenProvider};
pub use config::Config;
pub use destination::{Destination, ObjectUploader};
pub use error::{
    Error, ErrorDetail, ErrorReport, FramingError, IntegrityError, ResponseDetails, Result,
};
pub use event_log::EventLogger;
pub use export::{BulkDataClient, BulkDataClientBuilder, poll_delay};
pub use types::{
    Event, ExportManifest, ExportStatus, ExportSummary, ExportType, FileDownloadStatus,
    ManifestFileRef,
};

/// Cancel the client's export when the process receives a termination signal
///
/// Waits for a signal, then calls [`BulkDataClient::cancel`], which asks the
/// server to delete the export once it has been kicked off. Returns whether
/// the server acknowledged the cancellation.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use bulk_data_client::{BulkDataClient, Config, cancel_on_signal};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = BulkDataClient::new(Config::default())?;
///
///     tokio::spawn(cancel_on_signal(client.clone()));
///     client.run().await?;
///
///     Ok(())
/// }
/// ```
pub async fn cancel_on_signal(client: BulkDataClient) -> bool {
    wait_for_signal().await;
    client.cancel().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
