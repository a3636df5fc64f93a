//! End-to-end export runs against a mock FHIR server
//!
//! Each test mounts a kick-off endpoint, a status endpoint that reports
//! progress once before returning the manifest, and the listed files, then
//! drives a full `BulkDataClient::run()` into a temporary directory.
//!
//! # Running the tests
//!
//! ```bash
//! cargo test --test export_flow
//! ```

mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bulk_data_client::{Error, Event};
use common::{
    OBSERVATIONS_NDJSON, PATIENTS_NDJSON, assert_files_exist, create_client, drain_events,
    event_ids, file_entry, manifest, mock_config, mount_file, mount_gzip_file, mount_kick_off,
    mount_status, read_ndjson, record_ids,
};
use serde_json::{Value, json};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_two_file_export(server: &MockServer, patient_count: u64) {
    mount_kick_off(server).await;
    mount_status(
        server,
        manifest(
            server,
            vec![
                file_entry(server, "Patient", "/files/Patient.ndjson", patient_count),
                file_entry(server, "Observation", "/files/Observation.ndjson", 2),
            ],
        ),
    )
    .await;
    mount_gzip_file(server, "/files/Patient.ndjson", PATIENTS_NDJSON).await;
    mount_gzip_file(server, "/files/Observation.ndjson", OBSERVATIONS_NDJSON).await;
}

// ============================================================================
// Complete runs
// ============================================================================

#[tokio::test]
async fn full_export_downloads_every_file_and_saves_manifest() {
    let server = MockServer::start().await;
    mount_two_file_export(&server, 3).await;

    let dir = TempDir::new().unwrap();
    let mut config = mock_config(&server, &dir);
    config.download.add_destination_to_manifest = true;
    let client = create_client(config);
    let mut events = client.subscribe();

    let summary = tokio_test::assert_ok!(client.run().await);

    assert_eq!(summary.files, 2);
    assert_eq!(summary.failed_files, 0);
    assert_eq!(summary.resources, 5);
    assert!(summary.is_complete_success());

    let out = dir.path().join("out");
    assert_files_exist(&out, &["Patient.ndjson", "Observation.ndjson", "manifest.json"]);
    assert_eq!(record_ids(&out.join("Patient.ndjson")), vec!["p1", "p2", "p3"]);
    assert_eq!(record_ids(&out.join("Observation.ndjson")), vec!["o1", "o2"]);

    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("manifest.json")).unwrap())
            .unwrap();
    assert_eq!(saved["output"].as_array().unwrap().len(), 2);
    assert_eq!(
        saved["output"][0]["destination"],
        out.join("Patient.ndjson").display().to_string()
    );
    assert_eq!(saved["transactionTime"], "2024-01-01T00:00:00Z");

    let events = drain_events(&mut events);
    let ids = event_ids(&events);
    assert_eq!(ids.first(), Some(&"kickoff"));
    assert_eq!(ids.last(), Some(&"export_complete"));
    assert!(ids.contains(&"status_progress"));
    assert!(ids.contains(&"status_complete"));
    assert!(ids.contains(&"manifest_saved"));
    assert!(ids.contains(&"all_downloads_complete"));
    assert_eq!(ids.iter().filter(|id| **id == "download_complete").count(), 2);
}

#[tokio::test]
async fn count_mismatch_fails_only_that_file() {
    let server = MockServer::start().await;
    mount_two_file_export(&server, 5).await;

    let dir = TempDir::new().unwrap();
    let client = create_client(mock_config(&server, &dir));
    let mut events = client.subscribe();

    let summary = tokio_test::assert_ok!(client.run().await);

    assert_eq!(summary.files, 2);
    assert_eq!(summary.failed_files, 1);
    assert!(!summary.is_complete_success());
    assert_eq!(
        record_ids(&dir.path().join("out/Observation.ndjson")),
        vec!["o1", "o2"]
    );

    let failed = summary
        .downloads
        .iter()
        .find(|d| d.error.is_some())
        .unwrap();
    assert_eq!(failed.name, "Patient.ndjson");

    let download_error = drain_events(&mut events)
        .into_iter()
        .find_map(|event| match event {
            Event::DownloadError { file, error, .. } => Some((file, error)),
            _ => None,
        })
        .unwrap();
    assert_eq!(download_error.0, "Patient.ndjson");
    assert_eq!(download_error.1.error.code, "resource_count_mismatch");
}

#[tokio::test]
async fn resource_type_mismatch_fails_the_file() {
    let server = MockServer::start().await;
    mount_kick_off(&server).await;
    mount_status(
        &server,
        manifest(
            &server,
            vec![file_entry(&server, "Patient", "/files/mixed.ndjson", 2)],
        ),
    )
    .await;
    mount_file(&server, "/files/mixed.ndjson", OBSERVATIONS_NDJSON).await;

    let dir = TempDir::new().unwrap();
    let client = create_client(mock_config(&server, &dir));

    let summary = tokio_test::assert_ok!(client.run().await);

    assert_eq!(summary.failed_files, 1);
    let error = summary.downloads[0].error.as_deref().unwrap();
    assert!(error.contains("Observation"), "unexpected error: {error}");
}

#[tokio::test]
async fn standard_file_names_and_sub_folders() {
    let server = MockServer::start().await;
    mount_kick_off(&server).await;
    let mut listed = manifest(
        &server,
        vec![
            file_entry(&server, "Patient", "/files/a", 3),
            file_entry(&server, "Observation", "/files/b", 2),
        ],
    );
    listed["error"] = json!([file_entry(&server, "OperationOutcome", "/files/c", 1)]);
    mount_status(&server, listed).await;
    mount_file(&server, "/files/a", PATIENTS_NDJSON).await;
    mount_gzip_file(&server, "/files/b", OBSERVATIONS_NDJSON).await;
    mount_file(
        &server,
        "/files/c",
        r#"{"resourceType":"OperationOutcome","id":"e1","issue":[]}"#,
    )
    .await;

    let dir = TempDir::new().unwrap();
    let mut config = mock_config(&server, &dir);
    config.download.force_standard_file_names = true;
    let client = create_client(config);

    let summary = tokio_test::assert_ok!(client.run().await);

    assert_eq!(summary.files, 3);
    assert!(summary.is_complete_success());
    let out = dir.path().join("out");
    assert_files_exist(
        &out,
        &[
            "1.Patient.ndjson",
            "1.Observation.ndjson",
            "error/1.OperationOutcome.ndjson",
        ],
    );
    assert_eq!(record_ids(&out.join("error/1.OperationOutcome.ndjson")), vec!["e1"]);
}

// ============================================================================
// Attachments
// ============================================================================

#[tokio::test]
async fn attachments_are_inlined_or_offloaded() {
    let server = MockServer::start().await;
    mount_kick_off(&server).await;
    mount_status(
        &server,
        manifest(
            &server,
            vec![file_entry(&server, "DocumentReference", "/files/docs.ndjson", 1)],
        ),
    )
    .await;

    let document = json!({
        "resourceType": "DocumentReference",
        "id": "d1",
        "content": [
            {"attachment": {"url": format!("{}/attachments/note", server.uri())}},
            {"attachment": {"url": format!("{}/attachments/scan", server.uri())}},
        ],
    });
    mount_file(&server, "/files/docs.ndjson", &document.to_string()).await;

    Mock::given(method("GET"))
        .and(path("/attachments/note"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain")
                .set_body_string("hello"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/attachments/scan"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3]),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(mock_config(&server, &dir));

    let summary = tokio_test::assert_ok!(client.run().await);

    assert!(summary.is_complete_success());
    assert_eq!(summary.attachments, 2);

    let out = dir.path().join("out");
    let records = read_ndjson(&out.join("docs.ndjson"));
    assert_eq!(records.len(), 1);

    let inlined = &records[0]["content"][0]["attachment"];
    assert_eq!(inlined["data"], BASE64.encode("hello"));
    assert_eq!(inlined["contentType"], "text/plain");
    assert_eq!(inlined["size"], 5);
    assert!(inlined.get("url").is_none());

    let offloaded = &records[0]["content"][1]["attachment"];
    let url = offloaded["url"].as_str().unwrap();
    assert!(url.starts_with("./attachments/"), "unexpected url: {url}");
    assert!(url.ends_with(".png"), "unexpected url: {url}");
    assert!(offloaded.get("data").is_none());
    assert_eq!(
        std::fs::read(out.join(url.trim_start_matches("./"))).unwrap(),
        vec![0x89, b'P', b'N', b'G', 0, 1, 2, 3]
    );
}

#[tokio::test]
async fn disabled_attachment_download_leaves_records_untouched() {
    let server = MockServer::start().await;
    mount_kick_off(&server).await;
    mount_status(
        &server,
        manifest(
            &server,
            vec![file_entry(&server, "DocumentReference", "/files/docs.ndjson", 1)],
        ),
    )
    .await;
    let document = json!({
        "resourceType": "DocumentReference",
        "id": "d1",
        "content": [{"attachment": {"url": "https://elsewhere.example/doc"}}],
    });
    mount_file(&server, "/files/docs.ndjson", &document.to_string()).await;

    let dir = TempDir::new().unwrap();
    let mut config = mock_config(&server, &dir);
    config.attachments.download_attachments = false;
    let client = create_client(config);

    let summary = tokio_test::assert_ok!(client.run().await);

    assert_eq!(summary.attachments, 0);
    let records = read_ndjson(&dir.path().join("out/docs.ndjson"));
    assert_eq!(records[0], document);
}

// ============================================================================
// Export log
// ============================================================================

#[tokio::test]
async fn export_log_records_every_event() {
    let server = MockServer::start().await;
    mount_two_file_export(&server, 3).await;

    let dir = TempDir::new().unwrap();
    let mut config = mock_config(&server, &dir);
    config.log.enabled = true;
    config.log.metadata = Some(json!({"run": "nightly"}));
    let client = create_client(config);

    tokio_test::assert_ok!(client.run().await);

    let lines = read_ndjson(&dir.path().join("log.ndjson"));
    assert!(!lines.is_empty());
    assert_eq!(lines[0]["eventId"], "kickoff");
    assert_eq!(lines.last().unwrap()["eventId"], "export_complete");
    for line in &lines {
        assert_eq!(line["run"], "nightly");
        assert_eq!(
            line["exportUrl"],
            format!("{}/fhir/Patient/$export", server.uri())
        );
        assert!(line["timestamp"].is_string());
    }
}

// ============================================================================
// Failures and cancellation
// ============================================================================

#[tokio::test]
async fn rejected_kick_off_aborts_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/$export"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "invalid", "diagnostics": "bad _type"}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(mock_config(&server, &dir));
    let mut events = client.subscribe();

    let err = client.run().await.unwrap_err();

    assert_eq!(err.error_code(), "protocol_error");
    assert!(matches!(
        drain_events(&mut events).first(),
        Some(Event::StatusError {
            status_url: None,
            ..
        })
    ));
    assert!(!dir.path().join("out").exists());
}

#[tokio::test]
async fn cancel_during_polling_deletes_the_export() {
    let server = MockServer::start().await;
    mount_kick_off(&server).await;
    Mock::given(method("GET"))
        .and(path("/status/1"))
        .respond_with(ResponseTemplate::new(202).insert_header("retry-after", "60"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/status/1"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = create_client(mock_config(&server, &dir));
    let mut events = client.subscribe();

    let run = tokio::spawn({
        let client = client.clone();
        async move { client.run().await }
    });

    let progress = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(Event::StatusProgress { .. }) = events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(progress.is_ok(), "export never reported progress");

    assert!(client.cancel().await);

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run should stop after cancel")
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}
