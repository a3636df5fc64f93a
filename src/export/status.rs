//! Status polling
//!
//! The status endpoint answers 202 while the export runs and 200 with a
//! manifest once it is done. Servers that support partial manifests return
//! one page at a time with a `next` link; every page is handed to the caller
//! as soon as it arrives and the `next` URL is polled right away.

use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::header::{ACCEPT, HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use url::Url;

use super::BulkDataClient;
use crate::error::{Error, ErrorReport, ResponseDetails, Result, header_map};
use crate::types::{Event, ExportManifest, ExportStatus};

/// Lower bound for the delay between polls
pub const MIN_POLL_DELAY: Duration = Duration::from_millis(100);
/// Upper bound for the delay between polls
pub const MAX_POLL_DELAY: Duration = Duration::from_secs(60);

/// Delay before the next status request
///
/// A numeric `retry-after` is read as seconds, an HTTP-date as the time left
/// until that date; anything else falls back to `default`. The result is
/// clamped to [`MIN_POLL_DELAY`]..=[`MAX_POLL_DELAY`].
///
/// # Examples
///
/// ```
/// use bulk_data_client::poll_delay;
/// use std::time::Duration;
///
/// let now = chrono::Utc::now();
/// assert_eq!(poll_delay(Some("5"), Duration::from_secs(1), now), Duration::from_secs(5));
/// assert_eq!(poll_delay(Some("3600"), Duration::from_secs(1), now), Duration::from_secs(60));
/// assert_eq!(poll_delay(None, Duration::from_millis(10), now), Duration::from_millis(100));
/// ```
pub fn poll_delay(retry_after: Option<&str>, default: Duration, now: DateTime<Utc>) -> Duration {
    let requested = retry_after
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| match value.parse::<f64>() {
            Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => Some(Duration::from_secs_f64(
                seconds.min(MAX_POLL_DELAY.as_secs_f64()),
            )),
            Ok(_) => None,
            Err(_) => DateTime::parse_from_rfc2822(value).ok().map(|date| {
                let millis = (date.with_timezone(&Utc) - now).num_milliseconds();
                Duration::from_millis(millis.max(0) as u64)
            }),
        })
        .unwrap_or(default);

    requested.clamp(MIN_POLL_DELAY, MAX_POLL_DELAY)
}

/// Leading number of an `x-progress` value such as `"45% complete"`
fn parse_progress(x_progress: &str) -> Option<f64> {
    let number: String = x_progress
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value = number.parse::<f64>().ok()?;
    (x_progress.trim()[number.len()..].trim_start().starts_with('%')).then_some(value.min(100.0))
}

/// Polling state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PollState {
    Started,
    Polling,
    PageReceived,
    Complete,
}

impl BulkDataClient {
    /// Poll `status_url` until the export completes and return the manifest
    ///
    /// Paginated manifests are merged into one.
    pub async fn wait_for_export(&self, status_url: &str) -> Result<ExportManifest> {
        self.poll_status(status_url, |_| Ok(())).await
    }

    /// Poll `status_url`, calling `on_page` with each manifest page as it arrives
    pub(crate) async fn poll_status<F>(&self, status_url: &str, on_page: F) -> Result<ExportManifest>
    where
        F: FnMut(&ExportManifest) -> Result<()>,
    {
        let result = self.poll_loop(status_url, on_page).await;
        if let Err(e) = &result {
            if !matches!(e, Error::Cancelled) {
                tracing::error!(status_url = %status_url, error = %e, "Export status check failed");
                self.emit(Event::StatusError {
                    status_url: Some(status_url.to_string()),
                    error: ErrorReport::from(e),
                });
            }
        }
        result
    }

    async fn poll_loop<F>(&self, status_url: &str, mut on_page: F) -> Result<ExportManifest>
    where
        F: FnMut(&ExportManifest) -> Result<()>,
    {
        let clock = Instant::now();
        let mut status = ExportStatus::new(status_url, Utc::now());
        let mut state = PollState::Started;
        let mut merged: Option<ExportManifest> = None;
        let mut seen_pages: HashSet<String> = HashSet::from([status_url.to_string()]);
        let mut url = status_url.to_string();

        loop {
            tracing::debug!(url = %url, state = ?state, "Checking export status");
            let response = self
                .http
                .send(Method::GET, &url, true, &self.cancel, |request| {
                    request.header(ACCEPT, "application/json")
                })
                .await?;

            let code = response.status().as_u16();
            let headers = response.headers().clone();

            match code {
                202 => {
                    state = PollState::Polling;
                    self.wait_before_next_poll(&mut status, &headers, clock)
                        .await?;
                }
                200 => {
                    let body = tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        body = response.text() => body?,
                    };
                    let details = || ResponseDetails {
                        status: code,
                        headers: header_map(&headers),
                        body: body.clone(),
                    };

                    let json: Value = serde_json::from_str(&body).map_err(|e| {
                        Error::protocol_with_response(
                            format!("the export manifest is not valid JSON: {e}"),
                            details(),
                        )
                    })?;

                    // Pagination metadata without a manifest means "not done yet"
                    if json.get("output").is_none() && json.get("link").is_some() {
                        state = PollState::Polling;
                        self.wait_before_next_poll(&mut status, &headers, clock)
                            .await?;
                        continue;
                    }

                    check_manifest_shape(&json).map_err(|message| {
                        Error::protocol_with_response(message, details())
                    })?;
                    let page: ExportManifest = serde_json::from_value(json).map_err(|e| {
                        Error::protocol_with_response(
                            format!("the export manifest is malformed: {e}"),
                            details(),
                        )
                    })?;

                    status.percent_complete = Some(100.0);
                    status.elapsed_ms = clock.elapsed().as_millis() as u64;
                    status.message = "Bulk Data export completed".to_string();
                    self.emit(Event::StatusProgress {
                        status: status.clone(),
                    });

                    let next = page
                        .next_page()
                        .map(|next| resolve_url(&url, next))
                        .transpose()?;
                    tracing::info!(
                        url = %url,
                        files = page.file_count(),
                        has_next_page = next.is_some(),
                        "Export manifest received"
                    );
                    self.emit(Event::ManifestReceived {
                        url: url.clone(),
                        files: page.file_count(),
                        has_next_page: next.is_some(),
                    });

                    on_page(&page)?;
                    match merged.as_mut() {
                        Some(manifest) => manifest.merge_page(page),
                        None => merged = Some(page),
                    }

                    match next {
                        Some(next) if seen_pages.insert(next.clone()) => {
                            state = PollState::PageReceived;
                            url = next;
                            continue;
                        }
                        Some(next) => {
                            tracing::warn!(url = %next, "Manifest page was already received, stopping pagination");
                        }
                        None => {}
                    }

                    state = PollState::Complete;
                    let now = Utc::now();
                    status.completed_at = Some(now);
                    status.next_check_after = None;
                    status.elapsed_ms = clock.elapsed().as_millis() as u64;
                    tracing::debug!(state = ?state, elapsed_ms = status.elapsed_ms, "Export status complete");
                    self.emit(Event::StatusComplete { status });

                    let mut manifest = merged.unwrap_or_default();
                    // The merged manifest is the whole export, not a page
                    manifest.link.clear();
                    return Ok(manifest);
                }
                _ => {
                    let details = ResponseDetails::capture(response).await;
                    return Err(Error::protocol_with_response(
                        format!("the status endpoint returned unexpected status {code}"),
                        details,
                    ));
                }
            }
        }
    }

    async fn wait_before_next_poll(
        &self,
        status: &mut ExportStatus,
        headers: &HeaderMap,
        clock: Instant,
    ) -> Result<()> {
        let retry_after = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok());
        let x_progress = headers.get("x-progress").and_then(|v| v.to_str().ok());
        let now = Utc::now();
        let delay = poll_delay(retry_after, self.config.poll.retry_after_default, now);

        status.retry_after = retry_after.map(str::to_string);
        status.x_progress = x_progress.map(str::to_string);
        if let Some(percent) = x_progress.and_then(parse_progress) {
            status.percent_complete = Some(percent);
        }
        status.next_check_after =
            Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
        status.elapsed_ms = clock.elapsed().as_millis() as u64;
        status.message = match x_progress {
            Some(progress) => format!("Bulk Data export: {progress}"),
            None => "Bulk Data export: in progress".to_string(),
        };

        tracing::debug!(
            delay_ms = delay.as_millis() as u64,
            x_progress = ?x_progress,
            "Export in progress"
        );
        self.emit(Event::StatusProgress {
            status: status.clone(),
        });

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// `output` must be an array; `deleted` and `error` too when present
fn check_manifest_shape(json: &Value) -> std::result::Result<(), String> {
    if !json.is_object() {
        return Err("the export manifest is not a JSON object".to_string());
    }
    if !json.get("output").is_some_and(Value::is_array) {
        return Err("the export manifest output is not an array".to_string());
    }
    for key in ["deleted", "error"] {
        if json.get(key).is_some_and(|v| !v.is_array() && !v.is_null()) {
            return Err(format!("the export manifest {key} is not an array"));
        }
    }
    Ok(())
}

fn resolve_url(current: &str, next: &str) -> Result<String> {
    let base = Url::parse(current)
        .map_err(|e| Error::protocol(format!("invalid status URL '{current}': {e}")))?;
    base.join(next)
        .map(|url| url.to_string())
        .map_err(|e| Error::protocol(format!("invalid next page URL '{next}': {e}")))
}
