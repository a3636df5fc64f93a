//! End-to-end tests against a real Bulk Data server
//!
//! These tests run a real export using the server named in the environment.
//! All tests are marked #[ignore] to prevent running in normal CI.
//!
//! # Running the tests
//!
//! ```bash
//! BULK_DATA_FHIR_URL=https://bulk-data.smarthealthit.org/fhir \
//!     cargo test --features live-tests --test e2e_live -- --ignored --nocapture
//! ```
//!
//! # Environment variables
//!
//! - `BULK_DATA_FHIR_URL` - FHIR base URL (required)
//! - `BULK_DATA_GROUP` - Group id for a group-level export (optional)
//! - `BULK_DATA_TYPES` - `_type` parameter (optional, default: Patient)

#![cfg(feature = "live-tests")]

mod common;

use common::{create_client, has_live_server, load_live_config, read_ndjson};
use tempfile::TempDir;

#[tokio::test]
#[ignore]
async fn test_live_export_completes() {
    if !has_live_server() {
        eprintln!("Skipping: BULK_DATA_FHIR_URL not set");
        return;
    }

    let dir = TempDir::new().unwrap();
    let config = load_live_config(&dir).unwrap();
    let client = create_client(config);

    let summary = client.run().await.expect("live export should complete");
    println!(
        "Downloaded {} files, {} resources in {} ms",
        summary.files, summary.resources, summary.duration_ms
    );

    assert!(summary.is_complete_success(), "failed files: {:?}", summary.downloads);
    for download in &summary.downloads {
        let mut path = dir.path().join("out");
        if let Some(folder) = download.export_type.sub_folder() {
            path.push(folder);
        }
        path.push(&download.name);
        let records = read_ndjson(&path);
        assert_eq!(records.len() as u64, download.resources);
    }
}

#[tokio::test]
#[ignore]
async fn test_live_export_can_be_cancelled() {
    if !has_live_server() {
        eprintln!("Skipping: BULK_DATA_FHIR_URL not set");
        return;
    }

    let dir = TempDir::new().unwrap();
    let client = create_client(load_live_config(&dir).unwrap());

    let url = client.kick_off().await.expect("kick-off should be accepted");
    println!("Export accepted, status URL {url}");

    let acknowledged = client.cancel_export(&url).await;
    println!("Server acknowledged cancellation: {acknowledged}");
    assert!(client.cancellation_token().is_cancelled());
}
