//! Error types for bulk-data-client
//!
//! This module provides the error taxonomy for the library:
//! - Protocol errors raised while kicking off or polling an export
//! - File download errors for HTTP failures on files and attachments
//! - Framing and integrity errors raised by the NDJSON line framer
//! - Transport errors (network, decompression, broken destinations)
//! - A serializable [`ErrorReport`] giving a machine-readable description
//!   of any failure (status code, body, headers)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Result type alias for bulk-data-client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bulk-data-client
///
/// Each variant carries enough context to diagnose the failure without
/// re-running the export.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "fhir_url")
        key: Option<String>,
    },

    /// Malformed or unexpected server response during kick-off or status polling
    #[error("protocol error: {message}")]
    Protocol {
        /// What went wrong
        message: String,
        /// The offending response, if one was received
        response: Option<Box<ResponseDetails>>,
    },

    /// HTTP status >= 400 while downloading a file or an attachment
    #[error("download of {url} failed with status {status}")]
    FileDownload {
        /// HTTP status code
        status: u16,
        /// The URL that was requested
        url: String,
        /// Response headers
        headers: BTreeMap<String, String>,
    },

    /// NDJSON framing failure (buffer overflow or malformed line)
    #[error("NDJSON framing error: {0}")]
    Framing(#[from] FramingError),

    /// Record content did not match the manifest's expectations
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Transport failure below HTTP (decompression, broken streams, closed sinks)
    #[error("transport error: {0}")]
    Transport(String),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Download queue misuse (finalized twice, job added after finalize)
    #[error("download queue error: {0}")]
    Queue(String),

    /// The export was cancelled
    #[error("export cancelled")]
    Cancelled,

    /// Operation not supported (missing capability, unknown destination kind)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// NDJSON framing errors
#[derive(Debug, Error)]
pub enum FramingError {
    /// A line grew past the configured maximum before a newline was found
    #[error("buffer overflow on line {line}: no EOL found in {max_line_length} subsequent bytes")]
    BufferOverflow {
        /// 1-based line number
        line: u64,
        /// The configured limit
        max_line_length: usize,
    },

    /// A line could not be parsed as JSON
    #[error("error parsing NDJSON on line {line}: {message}")]
    InvalidLine {
        /// 1-based line number
        line: u64,
        /// Parser message
        message: String,
    },
}

/// Integrity errors raised against manifest expectations
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// A record declared a different resource type than the file
    #[error("expected resource type {expected} on line {line}, found {found}")]
    ResourceTypeMismatch {
        /// 1-based line number
        line: u64,
        /// Resource type declared by the manifest entry
        expected: String,
        /// Resource type found in the record ("undefined" when missing)
        found: String,
    },

    /// The number of records differs from the manifest's `count`
    #[error("expected {expected} resources but found {found}")]
    ResourceCountMismatch {
        /// Count declared by the manifest entry
        expected: u64,
        /// Records actually parsed
        found: u64,
    },
}

/// Captured HTTP response used to describe protocol failures
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseDetails {
    /// HTTP status code
    pub status: u16,
    /// Response headers (lower-cased names)
    pub headers: BTreeMap<String, String>,
    /// Response body as text (possibly truncated)
    pub body: String,
}

/// Bodies longer than this are truncated in error reports
const MAX_REPORTED_BODY: usize = 64 * 1024;

impl ResponseDetails {
    /// Consume a response and capture its status, headers and body
    pub async fn capture(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let headers = header_map(response.headers());
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_REPORTED_BODY {
            let mut cut = MAX_REPORTED_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Self {
            status,
            headers,
            body,
        }
    }
}

/// Flatten a header map into sorted `name -> value` pairs
pub(crate) fn header_map(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

impl Error {
    /// Build a protocol error without an attached response
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
            response: None,
        }
    }

    /// Build a protocol error carrying the offending response
    pub fn protocol_with_response(message: impl Into<String>, response: ResponseDetails) -> Self {
        Error::Protocol {
            message: message.into(),
            response: Some(Box::new(response)),
        }
    }

    /// Build a configuration error for the given key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Get the machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Protocol { .. } => "protocol_error",
            Error::FileDownload { .. } => "file_download_error",
            Error::Framing(e) => match e {
                FramingError::BufferOverflow { .. } => "buffer_overflow",
                FramingError::InvalidLine { .. } => "invalid_ndjson_line",
            },
            Error::Integrity(e) => match e {
                IntegrityError::ResourceTypeMismatch { .. } => "resource_type_mismatch",
                IntegrityError::ResourceCountMismatch { .. } => "resource_count_mismatch",
            },
            Error::Transport(_) => "transport_error",
            Error::Network(_) => "network_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Queue(_) => "queue_error",
            Error::Cancelled => "cancelled",
            Error::NotSupported(_) => "not_supported",
            Error::Other(_) => "internal_error",
        }
    }

    /// Process exit code for a run that terminated with this error
    ///
    /// Always non-zero. Cancellation maps to 130 to match the shell's Ctrl+C convention.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Cancelled => 130,
            Error::Config { .. } => 2,
            Error::Protocol { .. } => 3,
            Error::FileDownload { .. } | Error::Network(_) | Error::Transport(_) => 4,
            Error::Framing(_) | Error::Integrity(_) => 5,
            _ => 1,
        }
    }
}

/// Structured error report
///
/// This is what observers and log files receive when an operation fails.
///
/// # Example JSON
///
/// ```json
/// {
///   "error": {
///     "code": "protocol_error",
///     "message": "protocol error: status endpoint returned 500",
///     "details": { "status": 500, "body": "...", "headers": {} }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "protocol_error")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context (status, body, headers, line numbers)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for ErrorReport {
    fn from(error: &Error) -> Self {
        let details = match error {
            Error::Config { key: Some(key), .. } => Some(serde_json::json!({ "key": key })),
            Error::Protocol {
                response: Some(response),
                ..
            } => Some(serde_json::json!({
                "status": response.status,
                "headers": response.headers,
                "body": response.body,
            })),
            Error::FileDownload {
                status,
                url,
                headers,
            } => Some(serde_json::json!({
                "status": status,
                "url": url,
                "headers": headers,
            })),
            Error::Framing(FramingError::BufferOverflow {
                line,
                max_line_length,
            }) => Some(serde_json::json!({
                "line": line,
                "max_line_length": max_line_length,
            })),
            Error::Framing(FramingError::InvalidLine { line, .. }) => {
                Some(serde_json::json!({ "line": line }))
            }
            Error::Integrity(IntegrityError::ResourceTypeMismatch {
                line,
                expected,
                found,
            }) => Some(serde_json::json!({
                "line": line,
                "expected": expected,
                "found": found,
            })),
            Error::Integrity(IntegrityError::ResourceCountMismatch { expected, found }) => {
                Some(serde_json::json!({
                    "expected": expected,
                    "found": found,
                }))
            }
            _ => None,
        };

        ErrorReport {
            error: ErrorDetail {
                code: error.error_code().to_string(),
                message: error.to_string(),
                details,
            },
        }
    }
}

impl From<Error> for ErrorReport {
    fn from(error: Error) -> Self {
        ErrorReport::from(&error)
    }
}
