//! DocumentReference attachment resolution
//!
//! External attachments referenced from `DocumentReference.content[].attachment.url`
//! are fetched while their record passes through the download pipeline, then
//! either inlined as base64 `data` or written to the `attachments` folder of
//! the destination with the record's `url` rewritten to point at the copy.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::AttachmentConfig;
use crate::destination::{Destination, once_stream};
use crate::error::{Error, ErrorReport, Result, header_map};
use crate::http::HttpClient;
use crate::types::Event;

const ATTACHMENTS_FOLDER: &str = "attachments";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Capability that converts a PDF document to plain text
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract the text of `pdf`
    async fn extract(&self, pdf: Bytes) -> Result<String>;
}

/// Extractor used when no PDF support is configured
pub struct NoTextExtractor;

#[async_trait]
impl TextExtractor for NoTextExtractor {
    async fn extract(&self, _pdf: Bytes) -> Result<String> {
        Err(Error::NotSupported(
            "PDF to text conversion requires a text extractor. \
             Configure one with BulkDataClient::builder().text_extractor(..)."
                .into(),
        ))
    }
}

/// The file a record belongs to, and how to reach the server for it
pub(crate) struct AttachmentContext<'a> {
    pub(crate) file: &'a str,
    pub(crate) authorize: bool,
    pub(crate) cancel: &'a CancellationToken,
}

/// How one attachment ended up
#[derive(Debug, PartialEq, Eq)]
enum Placement {
    Inlined,
    Offloaded(String),
}

pub(crate) struct AttachmentResolver {
    http: Arc<HttpClient>,
    base_url: Url,
    config: AttachmentConfig,
    destination: Destination,
    extractor: Arc<dyn TextExtractor>,
    event_tx: broadcast::Sender<Event>,
}

impl AttachmentResolver {
    pub(crate) fn new(
        http: Arc<HttpClient>,
        base_url: Url,
        config: AttachmentConfig,
        destination: Destination,
        extractor: Arc<dyn TextExtractor>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            http,
            base_url,
            config,
            destination,
            extractor,
            event_tx,
        }
    }

    /// Resolve the external attachments of `record` in place
    ///
    /// Returns how many attachments were resolved. Records other than
    /// DocumentReference are left untouched.
    pub(crate) async fn resolve(
        &self,
        record: &mut Value,
        ctx: &AttachmentContext<'_>,
    ) -> Result<u64> {
        if record.get("resourceType").and_then(Value::as_str) != Some("DocumentReference") {
            return Ok(0);
        }
        let Some(contents) = record.get_mut("content").and_then(Value::as_array_mut) else {
            return Ok(0);
        };

        let mut resolved = 0;
        for content in contents.iter_mut() {
            let Some(attachment) = content.get_mut("attachment").and_then(Value::as_object_mut)
            else {
                continue;
            };
            let Some(url) = attachment
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                continue;
            };

            match self.resolve_one(attachment, &url, ctx).await {
                Ok(placement) => {
                    resolved += 1;
                    let size = attachment.get("size").and_then(Value::as_u64).unwrap_or(0);
                    tracing::debug!(file = %ctx.file, url = %url, size, placement = ?placement, "Attachment resolved");
                    let _ = self.event_tx.send(Event::AttachmentResolved {
                        file: ctx.file.to_string(),
                        url,
                        size,
                        inlined: placement == Placement::Inlined,
                    });
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    let ignored = self.config.ignore_errors;
                    let _ = self.event_tx.send(Event::AttachmentError {
                        file: ctx.file.to_string(),
                        url: url.clone(),
                        error: ErrorReport::from(&e),
                        ignored,
                    });
                    if !ignored {
                        return Err(e);
                    }
                    tracing::warn!(file = %ctx.file, url = %url, error = %e, "Skipping failed attachment");
                }
            }
        }

        Ok(resolved)
    }

    async fn resolve_one(
        &self,
        attachment: &mut Map<String, Value>,
        url: &str,
        ctx: &AttachmentContext<'_>,
    ) -> Result<Placement> {
        let absolute = self
            .base_url
            .join(url)
            .map_err(|e| Error::Other(format!("invalid attachment URL '{url}': {e}")))?;

        let response = self
            .http
            .send(Method::GET, absolute.as_str(), ctx.authorize, ctx.cancel, |r| r)
            .await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(Error::FileDownload {
                status: status.as_u16(),
                url: absolute.to_string(),
                headers: header_map(response.headers()),
            });
        }

        let header_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            body = response.bytes() => body?,
        };

        let record_type = attachment.get("contentType").and_then(Value::as_str);
        let (mut data, mut content_type) =
            unwrap_binary(body, header_type.as_deref(), record_type)?;

        if self.config.pdf_to_text && content_type.starts_with("application/pdf") {
            let text = self.extractor.extract(data).await?;
            data = Bytes::from(text);
            content_type = "text/plain".to_string();
        }

        let size = data.len() as u64;
        attachment.insert("contentType".into(), Value::String(content_type.clone()));
        attachment.insert("size".into(), Value::from(size));

        if self.should_inline(size, &content_type) {
            attachment.insert("data".into(), Value::String(BASE64.encode(&data)));
            attachment.remove("url");
            return Ok(Placement::Inlined);
        }

        let name = offload_name(&content_type);
        self.destination
            .write(&name, Some(ATTACHMENTS_FOLDER), once_stream(data))
            .await?;
        let relative = format!("./{ATTACHMENTS_FOLDER}/{name}");
        attachment.insert("url".into(), Value::String(relative.clone()));
        Ok(Placement::Offloaded(relative))
    }

    fn should_inline(&self, size: u64, content_type: &str) -> bool {
        size <= self.config.inline_threshold
            && self
                .config
                .inline_types
                .iter()
                .any(|allowed| content_type.starts_with(allowed.as_str()))
    }
}

/// Split a response into bytes and content type, unwrapping FHIR `Binary` envelopes
///
/// Content type precedence: envelope, then the record's own `contentType`,
/// then the response header.
fn unwrap_binary(
    body: Bytes,
    header_type: Option<&str>,
    record_type: Option<&str>,
) -> Result<(Bytes, String)> {
    if header_type.is_some_and(|t| t.contains("json")) {
        if let Some((data, content_type)) = binary_envelope(&body) {
            let decoded = BASE64
                .decode(data)
                .map_err(|e| Error::Other(format!("invalid base64 in Binary resource: {e}")))?;
            return Ok((Bytes::from(decoded), content_type));
        }
    }

    let content_type = record_type
        .or(header_type)
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    Ok((body, content_type))
}

/// `data` and `contentType` of a JSON `Binary` resource
fn binary_envelope(body: &[u8]) -> Option<(String, String)> {
    let envelope: Value = serde_json::from_slice(body).ok()?;
    let data = envelope.get("data")?.as_str()?;
    let content_type = envelope.get("contentType")?.as_str()?;
    Some((data.to_string(), content_type.to_string()))
}

/// `{timestamp}-{random}{ext}`
fn offload_name(content_type: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..u32::MAX);
    format!(
        "{}-{:08x}{}",
        Utc::now().timestamp_millis(),
        suffix,
        extension_for(content_type)
    )
}

fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "text/plain" => ".txt",
        "text/html" => ".html",
        "application/xhtml+xml" => ".xhtml",
        "application/pdf" => ".pdf",
        "application/json" | "application/fhir+json" => ".json",
        "application/xml" | "text/xml" | "application/fhir+xml" => ".xml",
        "application/rtf" | "text/rtf" => ".rtf",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/tiff" => ".tiff",
        _ => ".bin",
    }
}
