//! Destination sinks for downloaded files
//!
//! A destination string is parsed once into a [`Destination`]:
//!
//! | Destination            | Meaning                                             |
//! |------------------------|-----------------------------------------------------|
//! | `""` or `none`         | Drain and discard                                   |
//! | `s3://bucket/prefix`   | Hand to an [`ObjectUploader`] under `prefix/sub/name` |
//! | `http(s)://…`          | POST to `{destination}/{name}?folder={sub}`         |
//! | anything else          | Filesystem path (absolute, `file://`, or relative)  |

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::error::{Error, Result};

/// Stream of bytes handed to a sink
pub type ByteStream = ReceiverStream<Result<Bytes>>;

/// Create a bounded channel feeding a [`ByteStream`]
pub fn byte_channel(capacity: usize) -> (mpsc::Sender<Result<Bytes>>, ByteStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, ReceiverStream::new(rx))
}

/// A [`ByteStream`] carrying a single buffer
pub fn once_stream(bytes: Bytes) -> ByteStream {
    let (tx, rx) = mpsc::channel(1);
    // Capacity 1 guarantees the send succeeds
    let _ = tx.try_send(Ok(bytes));
    ReceiverStream::new(rx)
}

/// Capability that stores a stream in cloud object storage
#[async_trait]
pub trait ObjectUploader: Send + Sync {
    /// Upload `body` to `bucket` under `key`
    async fn upload(&self, bucket: &str, key: &str, body: ByteStream) -> Result<()>;
}

/// Where downloaded files are written
#[derive(Clone)]
pub enum Destination {
    /// Drain and discard
    Discard,
    /// Local directory
    Filesystem {
        /// Root directory
        root: PathBuf,
    },
    /// Cloud object storage
    ObjectStore {
        /// Bucket name
        bucket: String,
        /// Key prefix (no leading or trailing slash)
        prefix: String,
        /// Upload capability
        uploader: Arc<dyn ObjectUploader>,
    },
    /// HTTP POST target
    Http {
        /// Base URL files are posted under
        url: Url,
        /// Client used to POST
        client: reqwest::Client,
    },
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Discard => write!(f, "Discard"),
            Destination::Filesystem { root } => {
                f.debug_struct("Filesystem").field("root", root).finish()
            }
            Destination::ObjectStore { bucket, prefix, .. } => f
                .debug_struct("ObjectStore")
                .field("bucket", bucket)
                .field("prefix", prefix)
                .finish_non_exhaustive(),
            Destination::Http { url, .. } => f
                .debug_struct("Http")
                .field("url", &url.as_str())
                .finish_non_exhaustive(),
        }
    }
}

impl Destination {
    /// Parse a destination string
    ///
    /// `s3://` destinations require an uploader; relative filesystem paths are
    /// resolved against `base_dir`.
    pub fn parse(
        spec: &str,
        base_dir: &Path,
        uploader: Option<Arc<dyn ObjectUploader>>,
        client: &reqwest::Client,
    ) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec.eq_ignore_ascii_case("none") {
            return Ok(Destination::Discard);
        }

        if let Some(rest) = spec.strip_prefix("s3://") {
            let uploader = uploader.ok_or_else(|| {
                Error::config(
                    "destination",
                    "s3:// destinations need an object uploader (BulkDataClient::builder().object_uploader(..))",
                )
            })?;
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(Error::config("destination", "s3:// destination has no bucket"));
            }
            return Ok(Destination::ObjectStore {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
                uploader,
            });
        }

        if spec.starts_with("http://") || spec.starts_with("https://") {
            let url = Url::parse(spec).map_err(|e| {
                Error::config("destination", format!("invalid destination URL '{spec}': {e}"))
            })?;
            return Ok(Destination::Http {
                url,
                client: client.clone(),
            });
        }

        if spec.starts_with("file://") {
            let root = Url::parse(spec)
                .ok()
                .and_then(|url| url.to_file_path().ok())
                .ok_or_else(|| {
                    Error::config("destination", format!("invalid file URL '{spec}'"))
                })?;
            return Ok(Destination::Filesystem { root });
        }

        let path = PathBuf::from(spec);
        let root = if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        };
        Ok(Destination::Filesystem { root })
    }

    /// Human-readable location of `name` in this destination
    pub fn location(&self, name: &str, sub_folder: Option<&str>) -> String {
        match self {
            Destination::Discard => String::new(),
            Destination::Filesystem { root } => {
                folder_path(root, sub_folder).join(name).display().to_string()
            }
            Destination::ObjectStore { bucket, prefix, .. } => {
                format!("s3://{bucket}/{}", object_key(prefix, sub_folder, name))
            }
            Destination::Http { url, .. } => match sub_folder {
                Some(folder) => format!(
                    "{}?folder={}",
                    http_target(url, name),
                    urlencoding::encode(folder)
                ),
                None => http_target(url, name),
            },
        }
    }

    /// Persist `body` as `name`, inside `sub_folder` when given
    pub async fn write(&self, name: &str, sub_folder: Option<&str>, body: ByteStream) -> Result<()> {
        match self {
            Destination::Discard => {
                let mut body = body;
                while let Some(chunk) = body.next().await {
                    chunk?;
                }
                Ok(())
            }
            Destination::Filesystem { root } => {
                let dir = folder_path(root, sub_folder);
                tokio::fs::create_dir_all(&dir).await?;
                let path = dir.join(name);

                let mut file = tokio::fs::File::create(&path).await?;
                let mut body = body;
                while let Some(chunk) = body.next().await {
                    file.write_all(&chunk?).await?;
                }
                file.flush().await?;

                tracing::debug!(path = %path.display(), "File written");
                Ok(())
            }
            Destination::ObjectStore {
                bucket,
                prefix,
                uploader,
            } => {
                let key = object_key(prefix, sub_folder, name);
                tracing::debug!(bucket = %bucket, key = %key, "Uploading object");
                uploader.upload(bucket, &key, body).await
            }
            Destination::Http { url, client } => {
                let target = http_target(url, name);
                let mut request = client
                    .post(&target)
                    .body(reqwest::Body::wrap_stream(body));
                if let Some(folder) = sub_folder {
                    request = request.query(&[("folder", folder)]);
                }

                let response = request.send().await?;
                let status = response.status();
                if status.as_u16() >= 400 {
                    return Err(Error::Transport(format!(
                        "destination {target} rejected upload with status {status}"
                    )));
                }
                Ok(())
            }
        }
    }
}

fn folder_path(root: &Path, sub_folder: Option<&str>) -> PathBuf {
    match sub_folder {
        Some(folder) => root.join(folder),
        None => root.to_path_buf(),
    }
}

fn object_key(prefix: &str, sub_folder: Option<&str>, name: &str) -> String {
    [Some(prefix), sub_folder, Some(name)]
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn http_target(url: &Url, name: &str) -> String {
    format!(
        "{}/{}",
        url.as_str().trim_end_matches('/'),
        urlencoding::encode(name)
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait]
    impl ObjectUploader for RecordingUploader {
        async fn upload(&self, bucket: &str, key: &str, body: ByteStream) -> Result<()> {
            let chunks: Vec<Result<Bytes>> = body.collect().await;
            let mut data = Vec::new();
            for chunk in chunks {
                data.extend_from_slice(&chunk?);
            }
            self.uploads
                .lock()
                .unwrap()
                .push((bucket.to_string(), key.to_string(), data));
            Ok(())
        }
    }

    fn parse(spec: &str, base_dir: &Path) -> Result<Destination> {
        Destination::parse(spec, base_dir, None, &reqwest::Client::new())
    }

    fn two_chunks() -> ByteStream {
        let (tx, rx) = byte_channel(4);
        tx.try_send(Ok(Bytes::from_static(b"{\"a\":1}"))).unwrap();
        tx.try_send(Ok(Bytes::from_static(b"\n{\"a\":2}"))).unwrap();
        rx
    }

    #[test]
    fn parses_every_destination_kind() {
        let base = Path::new("/base");

        assert!(matches!(parse("", base).unwrap(), Destination::Discard));
        assert!(matches!(parse("none", base).unwrap(), Destination::Discard));
        assert!(matches!(
            parse("https://sink.example.com/in", base).unwrap(),
            Destination::Http { .. }
        ));
        match parse("downloads", base).unwrap() {
            Destination::Filesystem { root } => assert_eq!(root, PathBuf::from("/base/downloads")),
            other => panic!("expected filesystem, got {other:?}"),
        }
        match parse("file:///tmp/out", base).unwrap() {
            Destination::Filesystem { root } => assert_eq!(root, PathBuf::from("/tmp/out")),
            other => panic!("expected filesystem, got {other:?}"),
        }
    }

    #[test]
    fn s3_requires_an_uploader() {
        let err = parse("s3://bucket/prefix", Path::new(".")).unwrap_err();

        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn filesystem_writes_into_sub_folders() {
        let dir = TempDir::new().unwrap();
        let destination = parse(dir.path().to_str().unwrap(), Path::new(".")).unwrap();

        destination
            .write("1.Patient.ndjson", Some("deleted"), two_chunks())
            .await
            .unwrap();

        let written = std::fs::read_to_string(dir.path().join("deleted/1.Patient.ndjson")).unwrap();
        assert_eq!(written, "{\"a\":1}\n{\"a\":2}");
    }

    #[tokio::test]
    async fn failed_stream_fails_the_write() {
        let dir = TempDir::new().unwrap();
        let destination = parse(dir.path().to_str().unwrap(), Path::new(".")).unwrap();
        let (tx, rx) = byte_channel(4);
        tx.try_send(Ok(Bytes::from_static(b"partial"))).unwrap();
        tx.try_send(Err(Error::Transport("connection reset".into())))
            .unwrap();
        drop(tx);

        let result = destination.write("f.ndjson", None, rx).await;

        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn object_store_uses_prefixed_keys() {
        let uploader = Arc::new(RecordingUploader::default());
        let destination = Destination::parse(
            "s3://exports/run-1/",
            Path::new("."),
            Some(uploader.clone()),
            &reqwest::Client::new(),
        )
        .unwrap();

        destination
            .write("f.ndjson", Some("error"), once_stream(Bytes::from_static(b"x")))
            .await
            .unwrap();

        let uploads = uploader.uploads.lock().unwrap();
        assert_eq!(uploads[0].0, "exports");
        assert_eq!(uploads[0].1, "run-1/error/f.ndjson");
        assert_eq!(uploads[0].2, b"x");
        assert_eq!(
            destination.location("f.ndjson", None),
            "s3://exports/run-1/f.ndjson"
        );
    }

    #[tokio::test]
    async fn http_destination_posts_with_folder_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sink/f.ndjson"))
            .and(query_param("folder", "deleted"))
            .and(body_string("{\"a\":1}\n{\"a\":2}"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let destination = parse(&format!("{}/sink", server.uri()), Path::new(".")).unwrap();

        destination
            .write("f.ndjson", Some("deleted"), two_chunks())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn http_destination_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let destination = parse(&server.uri(), Path::new(".")).unwrap();

        let result = destination
            .write("f.ndjson", None, once_stream(Bytes::from_static(b"x")))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn discard_drains_the_stream() {
        let destination = parse("none", Path::new(".")).unwrap();

        destination.write("f", None, two_chunks()).await.unwrap();

        assert_eq!(destination.location("f", None), "");
    }
}
