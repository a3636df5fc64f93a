//! Test configuration helpers for mock and live FHIR servers

use std::time::Duration;
use tempfile::TempDir;
use wiremock::MockServer;

use bulk_data_client::{BulkDataClient, Config};

/// Error type for test configuration
#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Config for a mock server at `{server}/fhir`, writing into `dir`
///
/// Polls and retries are fast so a whole export finishes in well under a second.
pub fn mock_config(server: &MockServer, dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.server.fhir_url = format!("{}/fhir", server.uri());
    config.server.request_timeout = Duration::from_secs(5);
    config.download.base_dir = dir.path().to_path_buf();
    config.download.destination = dir.path().join("out").display().to_string();
    config.poll.retry_after_default = Duration::from_millis(100);
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config
}

/// Build a client, failing the test on configuration errors
pub fn create_client(config: Config) -> BulkDataClient {
    BulkDataClient::new(config).expect("client config should be valid")
}

/// Load a live server configuration from the environment
///
/// Required environment variables:
/// - `BULK_DATA_FHIR_URL` - FHIR base URL of a Bulk Data server
///
/// Optional environment variables:
/// - `BULK_DATA_GROUP` - Group id for a group-level export
/// - `BULK_DATA_TYPES` - `_type` parameter (default: Patient)
pub fn load_live_config(dir: &TempDir) -> Result<Config, ConfigError> {
    let fhir_url = std::env::var("BULK_DATA_FHIR_URL")
        .map_err(|_| ConfigError("BULK_DATA_FHIR_URL not set in environment".to_string()))?;

    let mut config = Config::default();
    config.server.fhir_url = fhir_url;
    config.export.group = std::env::var("BULK_DATA_GROUP").ok();
    config.export.types =
        Some(std::env::var("BULK_DATA_TYPES").unwrap_or_else(|_| "Patient".to_string()));
    config.download.base_dir = dir.path().to_path_buf();
    config.download.destination = dir.path().join("out").display().to_string();
    Ok(config)
}

/// Check if a live server is configured
pub fn has_live_server() -> bool {
    std::env::var("BULK_DATA_FHIR_URL").is_ok()
}
