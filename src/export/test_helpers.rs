//! Shared fixtures for export unit tests

use std::time::Duration;
use wiremock::MockServer;

use super::BulkDataClient;
use crate::config::Config;

/// Config pointing at `{server}/fhir` with fast retries and no destination
pub(crate) fn test_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.server.fhir_url = format!("{}/fhir", server.uri());
    config.server.request_timeout = Duration::from_secs(5);
    config.download.destination = "none".into();
    config.poll.retry_after_default = Duration::from_millis(100);
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = false;
    config
}

pub(crate) fn client_for(config: Config) -> BulkDataClient {
    BulkDataClient::new(config).unwrap()
}
