//! Mock FHIR server fixtures: kick-off, status and file endpoints

use async_compression::tokio::write::GzipEncoder;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Three Patient records
pub const PATIENTS_NDJSON: &str = concat!(
    r#"{"resourceType":"Patient","id":"p1"}"#,
    "\n",
    r#"{"resourceType":"Patient","id":"p2"}"#,
    "\n",
    r#"{"resourceType":"Patient","id":"p3"}"#,
    "\n",
);

/// Two Observation records
pub const OBSERVATIONS_NDJSON: &str = concat!(
    r#"{"resourceType":"Observation","id":"o1","status":"final"}"#,
    "\n",
    r#"{"resourceType":"Observation","id":"o2","status":"final"}"#,
    "\n",
);

/// Gzip `data` as a server with `content-encoding: gzip` would
pub async fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder
        .write_all(data)
        .await
        .expect("gzip write should succeed");
    encoder.shutdown().await.expect("gzip finish should succeed");
    encoder.into_inner()
}

/// A manifest entry for `{server}{file_path}`
pub fn file_entry(server: &MockServer, resource_type: &str, file_path: &str, count: u64) -> Value {
    json!({
        "type": resource_type,
        "url": format!("{}{}", server.uri(), file_path),
        "count": count,
    })
}

/// A complete manifest listing `output`
pub fn manifest(server: &MockServer, output: Vec<Value>) -> Value {
    json!({
        "transactionTime": "2024-01-01T00:00:00Z",
        "request": format!("{}/fhir/Patient/$export", server.uri()),
        "requiresAccessToken": false,
        "output": output,
        "error": [],
    })
}

/// Kick-off at `/fhir/Patient/$export` answering with status URL `/status/1`
pub async fn mount_kick_off(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/fhir/Patient/$export"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("content-location", format!("{}/status/1", server.uri())),
        )
        .expect(1)
        .mount(server)
        .await;
}

/// Status endpoint reporting "in progress" once, then returning `manifest`
pub async fn mount_status(server: &MockServer, manifest: Value) {
    Mock::given(method("GET"))
        .and(path("/status/1"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("x-progress", "50%")
                .insert_header("retry-after", "0"),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/status/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
        .mount(server)
        .await;
}

/// Serve `body` at `file_path`, gzip-encoded
pub async fn mount_gzip_file(server: &MockServer, file_path: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "gzip")
                .insert_header("content-type", "application/fhir+ndjson")
                .set_body_bytes(gzip(body.as_bytes()).await),
        )
        .mount(server)
        .await;
}

/// Serve `body` at `file_path` without compression
pub async fn mount_file(server: &MockServer, file_path: &str, body: &str) {
    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/fhir+ndjson")
                .set_body_string(body),
        )
        .mount(server)
        .await;
}
