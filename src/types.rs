//! Core types for bulk-data-client

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::ErrorReport;

/// Export manifest returned by the status endpoint once an export is complete
///
/// Unknown members are preserved in `extra` so a saved manifest round-trips.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    /// Server time at which the export snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_time: Option<String>,

    /// The kick-off request URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,

    /// Whether file downloads need the bearer token
    #[serde(default)]
    pub requires_access_token: bool,

    /// Exported resource files
    pub output: Vec<ManifestFileRef>,

    /// Files of deleted resources
    #[serde(default, deserialize_with = "null_as_empty")]
    pub deleted: Vec<ManifestFileRef>,

    /// OperationOutcome files
    #[serde(default, deserialize_with = "null_as_empty")]
    pub error: Vec<ManifestFileRef>,

    /// Pagination links (partial manifests)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<ManifestLink>,

    /// Any other members
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Some servers send `null` instead of omitting an empty file list
fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl ExportManifest {
    /// URL of the next manifest page, if this is a partial manifest
    pub fn next_page(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|link| link.relation == "next")
            .map(|link| link.url.as_str())
    }

    /// All file references paired with the subset they belong to
    pub fn files(&self) -> impl Iterator<Item = (ExportType, &ManifestFileRef)> {
        self.output
            .iter()
            .map(|f| (ExportType::Output, f))
            .chain(self.deleted.iter().map(|f| (ExportType::Deleted, f)))
            .chain(self.error.iter().map(|f| (ExportType::Error, f)))
    }

    /// Total number of file references
    pub fn file_count(&self) -> usize {
        self.output.len() + self.deleted.len() + self.error.len()
    }

    /// Append another page's files to this manifest
    pub(crate) fn merge_page(&mut self, page: ExportManifest) {
        self.output.extend(page.output);
        self.deleted.extend(page.deleted);
        self.error.extend(page.error);
        self.link = page.link;
    }
}

/// One file listed in a manifest
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestFileRef {
    /// Resource type contained in the file
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Download URL
    pub url: String,

    /// Number of resources in the file, when the server reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,

    /// Any other members (e.g. `destination` added after download)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Link between manifest pages
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestLink {
    /// Link relation ("next")
    pub relation: String,
    /// Target URL
    pub url: String,
}

/// Which manifest array a file came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportType {
    /// `output`
    #[default]
    Output,
    /// `deleted`
    Deleted,
    /// `error`
    Error,
}

impl ExportType {
    /// Destination subfolder for this subset (output files go to the root)
    pub fn sub_folder(self) -> Option<&'static str> {
        match self {
            ExportType::Output => None,
            ExportType::Deleted => Some("deleted"),
            ExportType::Error => Some("error"),
        }
    }
}

impl std::fmt::Display for ExportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportType::Output => write!(f, "output"),
            ExportType::Deleted => write!(f, "deleted"),
            ExportType::Error => write!(f, "error"),
        }
    }
}

/// Progress of the export as seen through the status endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatus {
    /// The status URL being polled
    pub status_url: String,
    /// When polling began
    pub started_at: DateTime<Utc>,
    /// When the manifest arrived
    pub completed_at: Option<DateTime<Utc>>,
    /// Progress reported by the server (0-100)
    pub percent_complete: Option<f64>,
    /// When the next poll is scheduled
    pub next_check_after: Option<DateTime<Utc>>,
    /// Human-readable state description
    pub message: String,
    /// Last `retry-after` header value
    pub retry_after: Option<String>,
    /// Last `x-progress` header value
    pub x_progress: Option<String>,
    /// Milliseconds elapsed since `started_at`
    pub elapsed_ms: u64,
}

impl ExportStatus {
    /// A fresh status record for an export that has just been accepted
    pub fn new(status_url: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            status_url: status_url.into(),
            started_at,
            completed_at: None,
            percent_complete: None,
            next_check_after: None,
            message: "Bulk Data export started".to_string(),
            retry_after: None,
            x_progress: None,
            elapsed_ms: 0,
        }
    }
}

/// Live state of one file download, written only by its own worker
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownloadStatus {
    /// Source URL
    pub url: String,
    /// Resource type from the manifest
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Name the file is written under
    pub name: String,
    /// Network chunks received
    pub downloaded_chunks: u64,
    /// Bytes received on the wire
    pub downloaded_bytes: u64,
    /// Bytes after decompression
    pub uncompressed_bytes: u64,
    /// Records parsed so far
    pub resources: u64,
    /// Attachments resolved so far
    pub attachments: u64,
    /// Whether the download finished (successfully or not)
    pub completed: bool,
    /// Failure message, if it failed
    pub error: Option<String>,
    /// Manifest subset the file belongs to
    pub export_type: ExportType,
}

/// Totals for a finished export run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    /// The (merged) manifest that was downloaded
    pub manifest: ExportManifest,
    /// Files attempted
    pub files: usize,
    /// Files that failed
    pub failed_files: usize,
    /// Records written
    pub resources: u64,
    /// Attachments resolved
    pub attachments: u64,
    /// Bytes received on the wire
    pub downloaded_bytes: u64,
    /// Bytes after decompression
    pub uncompressed_bytes: u64,
    /// Wall-clock duration of the run in milliseconds
    pub duration_ms: u64,
    /// Per-file outcomes
    pub downloads: Vec<FileDownloadStatus>,
}

impl ExportSummary {
    /// Whether every file downloaded successfully
    pub fn is_complete_success(&self) -> bool {
        self.failed_files == 0
    }

    pub(crate) fn from_downloads(
        manifest: ExportManifest,
        downloads: Vec<FileDownloadStatus>,
        duration: Duration,
    ) -> Self {
        Self {
            manifest,
            files: downloads.len(),
            failed_files: downloads.iter().filter(|d| d.error.is_some()).count(),
            resources: downloads.iter().map(|d| d.resources).sum(),
            attachments: downloads.iter().map(|d| d.attachments).sum(),
            downloaded_bytes: downloads.iter().map(|d| d.downloaded_bytes).sum(),
            uncompressed_bytes: downloads.iter().map(|d| d.uncompressed_bytes).sum(),
            duration_ms: duration.as_millis() as u64,
            downloads,
        }
    }
}

/// Event emitted during an export
///
/// Subscribe with [`BulkDataClient::subscribe`](crate::BulkDataClient::subscribe);
/// receivers may be dropped at any time without affecting the export.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Kick-off request accepted
    KickOff {
        /// The kick-off URL
        url: String,
        /// The status URL from `content-location`
        status_url: String,
        /// "GET" or "POST"
        method: String,
    },

    /// Export still in progress
    StatusProgress {
        /// Current status snapshot
        status: ExportStatus,
    },

    /// A manifest (or manifest page) was received
    ManifestReceived {
        /// URL the manifest came from
        url: String,
        /// Number of files listed
        files: usize,
        /// Whether more pages follow
        has_next_page: bool,
    },

    /// The export job finished on the server
    StatusComplete {
        /// Final status snapshot
        status: ExportStatus,
    },

    /// Kick-off or status polling failed
    StatusError {
        /// The status URL being polled, if known
        status_url: Option<String>,
        /// Failure description
        error: ErrorReport,
    },

    /// A request is being retried
    RequestRetry {
        /// Requested URL
        url: String,
        /// Attempt number that failed (1-based)
        attempt: u32,
        /// Delay before the next attempt
        delay_ms: u64,
        /// Why it failed
        reason: String,
    },

    /// A file download started
    DownloadStart {
        /// File name
        file: String,
        /// Source URL
        url: String,
        /// Manifest subset
        export_type: ExportType,
    },

    /// Bytes flowed for a file
    DownloadProgress {
        /// Snapshot of the file's status
        status: FileDownloadStatus,
    },

    /// A file was fully written
    DownloadComplete {
        /// Final status of the file
        status: FileDownloadStatus,
    },

    /// A file failed
    DownloadError {
        /// File name
        file: String,
        /// Source URL
        url: String,
        /// Failure description
        error: ErrorReport,
    },

    /// An attachment was downloaded and inlined or offloaded
    AttachmentResolved {
        /// Owning file name
        file: String,
        /// Attachment URL
        url: String,
        /// Size after any conversion
        size: u64,
        /// Whether it was inlined (otherwise offloaded)
        inlined: bool,
    },

    /// An attachment could not be resolved
    AttachmentError {
        /// Owning file name
        file: String,
        /// Attachment URL
        url: String,
        /// Failure description
        error: ErrorReport,
        /// Whether the error was skipped
        ignored: bool,
    },

    /// Download queue counts changed
    QueueProgress {
        /// Jobs known to the queue
        total: usize,
        /// Jobs currently running
        running: usize,
        /// Jobs completed (successfully or not)
        completed: usize,
        /// Jobs that failed
        failed: usize,
    },

    /// Every queued download finished
    AllDownloadsComplete {
        /// Files attempted
        files: usize,
        /// Files that failed
        failed: usize,
    },

    /// The manifest was persisted
    ManifestSaved {
        /// Where it was written
        location: String,
    },

    /// The export was cancelled
    ExportCancelled {
        /// Status URL the DELETE was sent to
        status_url: String,
        /// Whether the server acknowledged the DELETE
        acknowledged: bool,
    },

    /// The export run finished
    ExportComplete {
        /// Totals
        summary: ExportSummary,
    },
}

impl Event {
    /// Short identifier used by the export log
    pub fn event_id(&self) -> &'static str {
        match self {
            Event::KickOff { .. } => "kickoff",
            Event::StatusProgress { .. } => "status_progress",
            Event::ManifestReceived { .. } => "status_page",
            Event::StatusComplete { .. } => "status_complete",
            Event::StatusError { .. } => "status_error",
            Event::RequestRetry { .. } => "request_retry",
            Event::DownloadStart { .. } => "download_request",
            Event::DownloadProgress { .. } => "download_progress",
            Event::DownloadComplete { .. } => "download_complete",
            Event::DownloadError { .. } => "download_error",
            Event::AttachmentResolved { .. } => "attachment_resolved",
            Event::AttachmentError { .. } => "attachment_error",
            Event::QueueProgress { .. } => "queue_progress",
            Event::AllDownloadsComplete { .. } => "all_downloads_complete",
            Event::ManifestSaved { .. } => "manifest_saved",
            Event::ExportCancelled { .. } => "export_cancelled",
            Event::ExportComplete { .. } => "export_complete",
        }
    }
}
