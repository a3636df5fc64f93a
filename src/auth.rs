//! Bearer token acquisition and caching
//!
//! How a token is obtained (client credentials, SMART backend services, a
//! static secret) is up to the embedding application, which plugs in through
//! [`TokenProvider`]. The client only caches the token and refreshes it when
//! it is about to expire.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::error::Result;

/// Tokens are refreshed this long before their stated expiry
const EXPIRY_MARGIN_SECS: i64 = 10;

/// A bearer token and the instant it stops being valid
///
/// An empty `token` means the server is open and no `authorization` header
/// should be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessToken {
    /// The bearer token (possibly empty)
    pub token: String,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token is still usable at `now`, allowing a safety margin
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS) > now
    }
}

/// Capability that obtains a bearer token
///
/// # Examples
///
/// ```
/// use bulk_data_client::auth::{StaticTokenProvider, TokenProvider};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = StaticTokenProvider::new("secret");
/// let token = provider.fetch_token().await?;
/// assert_eq!(token.token, "secret");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a fresh token
    async fn fetch_token(&self) -> Result<AccessToken>;
}

/// Provider for open servers: always yields an empty token that never expires
pub struct NoAuth;

#[async_trait]
impl TokenProvider for NoAuth {
    async fn fetch_token(&self) -> Result<AccessToken> {
        Ok(AccessToken {
            token: String::new(),
            expires_at: DateTime::<Utc>::MAX_UTC,
        })
    }
}

/// Provider returning a fixed, pre-issued token
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Wrap a pre-issued token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<AccessToken> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_at: DateTime::<Utc>::MAX_UTC,
        })
    }
}

/// Lazily refreshed, shared token cache
///
/// The mutex is held across the refresh, so concurrent callers wait for the
/// single in-flight fetch instead of starting their own.
pub(crate) struct TokenCache {
    provider: Box<dyn TokenProvider>,
    current: Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub(crate) fn new(provider: Box<dyn TokenProvider>) -> Self {
        Self {
            provider,
            current: Mutex::new(None),
        }
    }

    /// The cached token if still valid, otherwise a freshly fetched one
    pub(crate) async fn get(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref().filter(|t| t.is_valid_at(Utc::now())) {
            return Ok(token.token.clone());
        }

        tracing::debug!("Fetching access token");
        let token = self.provider.fetch_token().await?;
        let value = token.token.clone();
        *current = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next [`get`](Self::get) fetches a new one
    pub(crate) async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}
