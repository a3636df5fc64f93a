//! Shared, authorized request path
//!
//! Every outgoing request (kick-off, status polls, file and attachment
//! downloads, cancellation) goes through [`HttpClient::send`], which applies
//! custom headers, attaches the bearer token, enforces the response timeout,
//! honors cancellation and retries transient failures of idempotent requests.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::auth::{TokenCache, TokenProvider};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::retry::{IsRetryable, with_retry_observed};
use crate::types::Event;

/// Outcome of one attempt, keeping retryable responses intact so the last one
/// can be handed back to the caller once attempts run out
enum AttemptError {
    Status(Response),
    Failed(Error),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Status(response) => write!(f, "HTTP status {}", response.status()),
            AttemptError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl IsRetryable for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Status(_) => false,
            AttemptError::Failed(e) => e.is_retryable(),
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            AttemptError::Status(response) => Some(response.status().as_u16()),
            AttemptError::Failed(e) => e.status_code(),
        }
    }
}

/// HTTP client shared by every component of one export run
pub(crate) struct HttpClient {
    client: reqwest::Client,
    config: Arc<Config>,
    custom_headers: HeaderMap,
    tokens: TokenCache,
    event_tx: broadcast::Sender<Event>,
}

impl HttpClient {
    pub(crate) fn new(
        config: Arc<Config>,
        provider: Box<dyn TokenProvider>,
        event_tx: broadcast::Sender<Event>,
    ) -> Result<Self> {
        let mut custom_headers = HeaderMap::new();
        for (name, value) in &config.server.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config("headers", format!("invalid header name '{name}': {e}")))?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                Error::config("headers", format!("invalid value for header '{name}': {e}"))
            })?;
            custom_headers.insert(header_name, header_value);
        }

        // Built without the gzip/brotli features, so bodies arrive exactly as sent
        let client = reqwest::Client::builder()
            .user_agent(concat!("bulk-data-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            custom_headers,
            tokens: TokenCache::new(provider),
            event_tx,
        })
    }

    /// The underlying reqwest client, for sinks that stream request bodies
    pub(crate) fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request, retrying transient failures of GET and DELETE
    ///
    /// `customize` is applied on every attempt, so it must be cheap and
    /// repeatable. When the final response carries a retryable status it is
    /// returned as-is; interpreting statuses is up to the caller.
    pub(crate) async fn send<F>(
        &self,
        method: Method,
        url: &str,
        authorize: bool,
        cancel: &CancellationToken,
        customize: F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let response = self
            .send_with_retry(&method, url, authorize, cancel, &customize)
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED && authorize {
            tracing::warn!(url = %url, "Request unauthorized, refreshing access token");
            self.tokens.invalidate().await;
            return self
                .send_with_retry(&method, url, authorize, cancel, &customize)
                .await;
        }

        Ok(response)
    }

    async fn send_with_retry<F>(
        &self,
        method: &Method,
        url: &str,
        authorize: bool,
        cancel: &CancellationToken,
        customize: &F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let idempotent = matches!(*method, Method::GET | Method::DELETE | Method::HEAD);
        if !idempotent {
            return self
                .execute_once(method, url, authorize, cancel, customize)
                .await;
        }

        let retry_statuses = &self.config.retry.status_codes;
        let result = with_retry_observed(
            &self.config.retry,
            cancel,
            |attempt, error: &AttemptError, delay: Duration| {
                let _ = self.event_tx.send(Event::RequestRetry {
                    url: url.to_string(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    reason: error.to_string(),
                });
            },
            || async move {
                let response = self
                    .execute_once(method, url, authorize, cancel, customize)
                    .await
                    .map_err(AttemptError::Failed)?;
                if retry_statuses.contains(&response.status().as_u16()) {
                    return Err(AttemptError::Status(response));
                }
                Ok(response)
            },
        )
        .await;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match result {
            Ok(response) | Err(AttemptError::Status(response)) => Ok(response),
            Err(AttemptError::Failed(e)) => Err(e),
        }
    }

    async fn execute_once<F>(
        &self,
        method: &Method,
        url: &str,
        authorize: bool,
        cancel: &CancellationToken,
        customize: &F,
    ) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut request = customize(self.client.request(method.clone(), url))
            .headers(self.custom_headers.clone());

        if authorize {
            let token = self.tokens.get().await?;
            if !token.is_empty() {
                request = request.bearer_auth(token);
            }
        }

        let timeout = self.config.server.request_timeout;
        tracing::debug!(method = %method, url = %url, "Sending request");

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, request.send()) => match result {
                Ok(response) => Ok(response?),
                Err(_) => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no response from {url} within {} ms", timeout.as_millis()),
                ))),
            },
        }
    }
}
