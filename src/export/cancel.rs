//! Export cancellation

use reqwest::Method;
use tokio_util::sync::CancellationToken;

use super::BulkDataClient;
use crate::types::Event;

impl BulkDataClient {
    /// Cancel the export: abort all in-flight work, then ask the server to
    /// delete the job with `DELETE status_url`
    ///
    /// The DELETE is best-effort. Returns whether the server acknowledged it
    /// with a success status. Partially written files are left in place.
    pub async fn cancel_export(&self, status_url: &str) -> bool {
        tracing::info!(status_url = %status_url, "Cancelling export");
        self.cancel.cancel();

        // The export's own token is cancelled by now, so the DELETE gets a fresh one
        let acknowledged = match self
            .http
            .send(
                Method::DELETE,
                status_url,
                true,
                &CancellationToken::new(),
                |request| request,
            )
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(
                    status_url = %status_url,
                    status = %response.status(),
                    "Server did not acknowledge export cancellation"
                );
                false
            }
            Err(e) => {
                tracing::warn!(status_url = %status_url, error = %e, "Failed to send export cancellation");
                false
            }
        };

        self.emit(Event::ExportCancelled {
            status_url: status_url.to_string(),
            acknowledged,
        });
        acknowledged
    }

    /// Cancel the current export
    ///
    /// Sends the DELETE when the kick-off has already been accepted; otherwise
    /// only stops local work.
    pub async fn cancel(&self) -> bool {
        match self.status_url().await {
            Some(status_url) => self.cancel_export(&status_url).await,
            None => {
                tracing::info!("Cancelling export before kick-off completed");
                self.cancel.cancel();
                false
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::super::test_helpers::{client_for, test_config};
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn cancel_export_sends_delete_and_cancels_work() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/status/1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(test_config(&server));
        let mut events = client.subscribe();

        let acknowledged = client
            .cancel_export(&format!("{}/status/1", server.uri()))
            .await;

        assert!(acknowledged);
        assert!(client.cancellation_token().is_cancelled());
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::ExportCancelled {
                acknowledged: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rejected_delete_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(test_config(&server));

        let acknowledged = client
            .cancel_export(&format!("{}/status/1", server.uri()))
            .await;

        assert!(!acknowledged);
        assert!(client.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_before_kick_off_only_stops_local_work() {
        let server = MockServer::start().await;
        let client = client_for(test_config(&server));

        assert!(!client.cancel().await);
        assert!(client.cancellation_token().is_cancelled());
    }
}
