//! Export orchestration split into focused submodules.
//!
//! The [`BulkDataClient`] struct and its methods are organized by phase:
//! - [`kickoff`] - Kick-off request (endpoint, parameters, GET/POST forms)
//! - [`status`] - Status polling state machine and manifest pagination
//! - [`downloads`] - Per-file download pipeline and file naming
//! - [`cancel`] - Export cancellation
//! - [`run`] - Full export run tying the phases together

mod cancel;
mod downloads;
mod kickoff;
mod run;
mod status;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use status::poll_delay;

use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::attachments::{NoTextExtractor, TextExtractor};
use crate::auth::{NoAuth, TokenProvider};
use crate::config::Config;
use crate::destination::{Destination, ObjectUploader};
use crate::error::Result;
use crate::http::HttpClient;
use crate::types::Event;

/// Bulk Data export client (cloneable - all fields are Arc-wrapped)
///
/// One client drives one export run. Cancelling it (see
/// [`cancel_export`](Self::cancel_export)) affects every clone.
#[derive(Clone)]
pub struct BulkDataClient {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// FHIR base URL with a trailing slash
    pub(crate) base_url: Url,
    /// Shared authorized request path
    pub(crate) http: Arc<HttpClient>,
    /// Where files, attachments and the manifest are written
    pub(crate) destination: Destination,
    /// PDF to text conversion capability
    pub(crate) text_extractor: Arc<dyn TextExtractor>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Cancels every request, poll delay and pipeline of this export
    pub(crate) cancel: CancellationToken,
    /// Status URL of the export once kicked off
    pub(crate) status_url: Arc<RwLock<Option<String>>>,
}

impl std::fmt::Debug for BulkDataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkDataClient")
            .field("base_url", &self.base_url.as_str())
            .field("destination", &self.destination)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Builder for [`BulkDataClient`], for plugging in capabilities
pub struct BulkDataClientBuilder {
    config: Config,
    token_provider: Option<Box<dyn TokenProvider>>,
    object_uploader: Option<Arc<dyn ObjectUploader>>,
    text_extractor: Option<Arc<dyn TextExtractor>>,
}

impl BulkDataClientBuilder {
    /// Obtain bearer tokens from `provider` (default: no authorization)
    pub fn token_provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.token_provider = Some(Box::new(provider));
        self
    }

    /// Upload `s3://` destinations through `uploader`
    pub fn object_uploader(mut self, uploader: Arc<dyn ObjectUploader>) -> Self {
        self.object_uploader = Some(uploader);
        self
    }

    /// Convert PDF attachments with `extractor`
    pub fn text_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.text_extractor = Some(extractor);
        self
    }

    /// Validate the configuration and create the client
    pub fn build(self) -> Result<BulkDataClient> {
        self.config.validate()?;
        let base_url = self.config.fhir_base()?;
        let config = Arc::new(self.config);

        // Create broadcast channel with buffer size of 1000 events
        let (event_tx, _rx) = broadcast::channel(1000);

        let http = Arc::new(HttpClient::new(
            config.clone(),
            self.token_provider.unwrap_or_else(|| Box::new(NoAuth)),
            event_tx.clone(),
        )?);

        let destination = Destination::parse(
            &config.download.destination,
            &config.download.base_dir,
            self.object_uploader,
            http.inner(),
        )?;

        Ok(BulkDataClient {
            config,
            base_url,
            http,
            destination,
            text_extractor: self
                .text_extractor
                .unwrap_or_else(|| Arc::new(NoTextExtractor)),
            event_tx,
            cancel: CancellationToken::new(),
            status_url: Arc::new(RwLock::new(None)),
        })
    }
}

impl BulkDataClient {
    /// Create a client for an open server with the default capabilities
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use bulk_data_client::{BulkDataClient, Config};
    ///
    /// # async fn example() -> bulk_data_client::Result<()> {
    /// let mut config = Config::default();
    /// config.server.fhir_url = "https://bulk-data.smarthealthit.org/fhir".into();
    ///
    /// let client = BulkDataClient::new(config)?;
    /// let summary = client.run().await?;
    /// println!("{} resources in {} files", summary.resources, summary.files);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a client with custom capabilities
    pub fn builder(config: Config) -> BulkDataClientBuilder {
        BulkDataClientBuilder {
            config,
            token_provider: None,
            object_uploader: None,
            text_extractor: None,
        }
    }

    /// Subscribe to export events
    ///
    /// Receivers may be dropped at any time; a receiver that falls more than
    /// 1000 events behind skips the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The configuration this client was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The resolved destination
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Token cancelled when the export is cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Status URL of the current export, once the kick-off was accepted
    pub async fn status_url(&self) -> Option<String> {
        self.status_url.read().await.clone()
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}
