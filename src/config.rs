//! Configuration types for bulk-data-client
//!
//! A [`Config`] is built once per export run and shared read-only (behind an
//! `Arc`) by every component. Loading it from a file or from command-line
//! arguments is left to the embedding application; every struct here derives
//! `Deserialize` with sensible defaults so any serde format works.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use url::Url;

use crate::error::{Error, Result};

/// FHIR server connection settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// FHIR server base URL (e.g. "https://fhir.example.com/r4")
    #[serde(default)]
    pub fhir_url: String,

    /// Maximum time to wait for response headers (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Kick-off request parameters
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    /// System-level export (`[base]/$export`)
    #[serde(default)]
    pub global: bool,

    /// Group-level export (`[base]/Group/{id}/$export`)
    #[serde(default)]
    pub group: Option<String>,

    /// Patient ids to restrict the export to (forces a POST kick-off)
    #[serde(default)]
    pub patient: Vec<String>,

    /// Send the kick-off as a POST with a `Parameters` body
    #[serde(default)]
    pub post: bool,

    /// Ask the server to be lenient (`prefer: handling=lenient`)
    #[serde(default)]
    pub lenient: bool,

    /// `_outputFormat`
    #[serde(default)]
    pub output_format: Option<String>,

    /// `_since`
    #[serde(default)]
    pub since: Option<String>,

    /// `_type` (comma-separated resource types)
    #[serde(default)]
    pub types: Option<String>,

    /// `_elements`
    #[serde(default)]
    pub elements: Option<String>,

    /// `includeAssociatedData`
    #[serde(default)]
    pub include_associated_data: Option<String>,

    /// `_typeFilter` (one entry per filter)
    #[serde(default)]
    pub type_filter: Vec<String>,

    /// `allowPartialManifests`
    #[serde(default)]
    pub allow_partial_manifests: bool,

    /// `organizeOutputBy`
    #[serde(default)]
    pub organize_output_by: Option<String>,

    /// Arbitrary extra `name=value` kick-off parameters
    #[serde(default)]
    pub custom_params: BTreeMap<String, String>,
}

/// Status polling settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between polls when the server sends no usable `retry-after` (default: 1 second)
    #[serde(default = "default_retry_after", with = "duration_serde")]
    pub retry_after_default: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            retry_after_default: default_retry_after(),
        }
    }
}

/// File download and destination settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Maximum concurrent file downloads (default: 5)
    #[serde(default = "default_parallel_downloads")]
    pub parallel_downloads: usize,

    /// Where files go: "" / "none", a filesystem path, "file://…", "s3://bucket/prefix",
    /// or "http(s)://…" (default: "./downloads")
    #[serde(default = "default_destination")]
    pub destination: String,

    /// Base directory for relative filesystem destinations (default: current directory)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Write the manifest to `manifest.json` at the destination (default: true)
    #[serde(default = "default_true")]
    pub save_manifest: bool,

    /// Name files `{n}.{type}.ndjson` instead of using the URL's last path segment
    #[serde(default)]
    pub force_standard_file_names: bool,

    /// Record each file's persisted location in the saved manifest
    #[serde(default)]
    pub add_destination_to_manifest: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            parallel_downloads: default_parallel_downloads(),
            destination: default_destination(),
            base_dir: default_base_dir(),
            save_manifest: true,
            force_standard_file_names: false,
            add_destination_to_manifest: false,
        }
    }
}

/// NDJSON parsing guards
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NdjsonConfig {
    /// Maximum bytes buffered for one line before failing (default: 10 MB)
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Require each record's `resourceType` to match the manifest entry (default: true)
    #[serde(default = "default_true")]
    pub validate_resource_type: bool,

    /// Require the record count to match the manifest entry's `count` (default: true)
    #[serde(default = "default_true")]
    pub validate_resource_count: bool,
}

impl Default for NdjsonConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
            validate_resource_type: true,
            validate_resource_count: true,
        }
    }
}

/// DocumentReference attachment handling
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Resolve external attachment URLs at all (default: true)
    #[serde(default = "default_true")]
    pub download_attachments: bool,

    /// Inline attachments up to this many bytes (default: 5 MB)
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold: u64,

    /// Content-type prefixes eligible for inlining
    #[serde(default = "default_inline_types")]
    pub inline_types: Vec<String>,

    /// Convert PDF attachments to plain text before deciding (default: false)
    #[serde(default)]
    pub pdf_to_text: bool,

    /// Skip failed attachments instead of failing the owning file (default: false)
    #[serde(default)]
    pub ignore_errors: bool,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            download_attachments: true,
            inline_threshold: default_inline_threshold(),
            inline_types: default_inline_types(),
            pdf_to_text: false,
            ignore_errors: false,
        }
    }
}

/// Retry configuration for transient request failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// HTTP status codes that trigger a retry of idempotent requests
    #[serde(default = "default_retry_status_codes")]
    pub status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
            status_codes: default_retry_status_codes(),
        }
    }
}

/// Export log settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Append every export event to an NDJSON log file
    #[serde(default)]
    pub enabled: bool,

    /// Log file path (default: "{base_dir}/log.ndjson")
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Extra members merged into every log line
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Main configuration for one export run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// FHIR server connection settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Kick-off parameters
    #[serde(default)]
    pub export: ExportConfig,

    /// Status polling
    #[serde(default)]
    pub poll: PollConfig,

    /// File downloads and destination
    #[serde(default)]
    pub download: DownloadConfig,

    /// NDJSON guards
    #[serde(default)]
    pub ndjson: NdjsonConfig,

    /// Attachment handling
    #[serde(default)]
    pub attachments: AttachmentConfig,

    /// Request retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Export log
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Check settings that would otherwise fail deep inside an export
    pub fn validate(&self) -> Result<()> {
        self.fhir_base()?;

        if self.download.parallel_downloads == 0 {
            return Err(Error::config(
                "parallel_downloads",
                "parallel_downloads must be at least 1",
            ));
        }

        if self.ndjson.max_line_length == 0 {
            return Err(Error::config(
                "max_line_length",
                "max_line_length must be at least 1",
            ));
        }

        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::config(
                "backoff_multiplier",
                "backoff_multiplier must be a finite number of at least 1.0",
            ));
        }

        if self.export.global && self.export.group.is_some() {
            return Err(Error::config(
                "group",
                "a group export cannot also be a global export",
            ));
        }

        Ok(())
    }

    /// The FHIR base URL with a guaranteed trailing slash, so relative joins keep its path
    pub fn fhir_base(&self) -> Result<Url> {
        let raw = self.server.fhir_url.trim();
        if raw.is_empty() {
            return Err(Error::config("fhir_url", "fhir_url is required"));
        }

        let with_slash = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };

        Url::parse(&with_slash)
            .map_err(|e| Error::config("fhir_url", format!("invalid fhir_url '{raw}': {e}")))
    }

    /// Path of the export log file
    pub fn log_file(&self) -> PathBuf {
        self.log
            .file
            .clone()
            .unwrap_or_else(|| self.download.base_dir.join("log.ndjson"))
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_after() -> Duration {
    Duration::from_secs(1)
}

fn default_parallel_downloads() -> usize {
    5
}

fn default_destination() -> String {
    "./downloads".to_string()
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}

fn default_max_line_length() -> usize {
    10_000_000
}

fn default_inline_threshold() -> u64 {
    5 * 1024 * 1024
}

fn default_inline_types() -> Vec<String> {
    vec![
        "text/plain".into(),
        "text/html".into(),
        "application/xhtml+xml".into(),
    ]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

// Durations are (de)serialized as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_url(url: &str) -> Config {
        let mut config = Config::default();
        config.server.fhir_url = url.to_string();
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();

        assert_eq!(config.download.parallel_downloads, 5);
        assert_eq!(config.poll.retry_after_default, Duration::from_secs(1));
        assert!(config.ndjson.validate_resource_type);
        assert!(config.ndjson.validate_resource_count);
        assert!(config.attachments.download_attachments);
        assert_eq!(config.retry.status_codes, vec![408, 429, 500, 502, 503, 504]);
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").expect("deserialize failed");

        assert_eq!(config.download.destination, "./downloads");
        assert_eq!(config.ndjson.max_line_length, 10_000_000);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn durations_deserialize_from_milliseconds() {
        let json = r#"{"poll":{"retry_after_default":250},"retry":{"initial_delay":20}}"#;

        let config: Config = serde_json::from_str(json).expect("deserialize failed");

        assert_eq!(config.poll.retry_after_default, Duration::from_millis(250));
        assert_eq!(config.retry.initial_delay, Duration::from_millis(20));
    }

    #[test]
    fn durations_serialize_as_milliseconds() {
        let config = PollConfig {
            retry_after_default: Duration::from_millis(1500),
        };

        let json = serde_json::to_value(&config).expect("serialize failed");

        assert_eq!(json["retry_after_default"], 1500);
    }

    #[test]
    fn validate_requires_fhir_url() {
        let err = Config::default().validate().unwrap_err();

        assert!(
            matches!(err, Error::Config { ref key, .. } if key.as_deref() == Some("fhir_url")),
            "expected fhir_url config error, got {err:?}"
        );
    }

    #[test]
    fn validate_rejects_zero_parallelism() {
        let mut config = config_with_url("http://localhost/fhir");
        config.download.parallel_downloads = 0;

        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unusable_backoff_multipliers() {
        for multiplier in [f64::NAN, f64::INFINITY, -2.0, 0.5] {
            let mut config = config_with_url("http://localhost/fhir");
            config.retry.backoff_multiplier = multiplier;

            let err = config.validate().unwrap_err();
            assert!(
                matches!(&err, Error::Config { key: Some(key), .. } if key == "backoff_multiplier"),
                "{multiplier} gave {err:?}"
            );
        }

        let mut config = config_with_url("http://localhost/fhir");
        config.retry.backoff_multiplier = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_group_with_global() {
        let mut config = config_with_url("http://localhost/fhir");
        config.export.global = true;
        config.export.group = Some("abc".into());

        assert!(config.validate().is_err());
    }

    #[test]
    fn fhir_base_appends_trailing_slash() {
        let config = config_with_url("http://localhost:8080/fhir");

        let base = config.fhir_base().unwrap();

        assert_eq!(base.as_str(), "http://localhost:8080/fhir/");
        assert_eq!(
            base.join("Patient/$export").unwrap().as_str(),
            "http://localhost:8080/fhir/Patient/$export"
        );
    }

    #[test]
    fn log_file_defaults_under_base_dir() {
        let mut config = Config::default();
        config.download.base_dir = PathBuf::from("/tmp/export");

        assert_eq!(config.log_file(), PathBuf::from("/tmp/export/log.ndjson"));
    }
}
