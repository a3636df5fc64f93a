//! File fetcher: one authorized GET with streaming decompression
//!
//! The body stream returned by [`FileFetcher::run`] is lazy. No bytes are read
//! from the connection until the caller polls it, so downstream stages are
//! always attached before data flows.

use async_compression::tokio::bufread::{BrotliDecoder, GzipDecoder, ZlibDecoder};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Method;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, header_map};
use crate::http::HttpClient;

const ACCEPTED_ENCODINGS: &str = "gzip, deflate, br, identity";

/// Content coding of a response body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentEncoding {
    /// `gzip` (multi-member streams supported)
    Gzip,
    /// `deflate` (zlib-wrapped)
    Deflate,
    /// `br`
    Brotli,
    /// No coding
    Identity,
}

impl ContentEncoding {
    /// Pick the decoder for a `content-encoding` header value
    ///
    /// Unknown codings are passed through untouched.
    pub fn from_header(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return ContentEncoding::Identity;
        };

        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => ContentEncoding::Gzip,
            "deflate" => ContentEncoding::Deflate,
            "br" => ContentEncoding::Brotli,
            "" | "identity" => ContentEncoding::Identity,
            other => {
                tracing::warn!(encoding = %other, "Unsupported content-encoding, reading body as-is");
                ContentEncoding::Identity
            }
        }
    }
}

/// Byte and chunk counters, updated as data flows through a fetched body
#[derive(Debug, Default)]
pub struct DownloadCounters {
    downloaded_chunks: AtomicU64,
    downloaded_bytes: AtomicU64,
    uncompressed_bytes: AtomicU64,
}

/// Point-in-time copy of [`DownloadCounters`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchProgress {
    /// Network chunks received
    pub downloaded_chunks: u64,
    /// Bytes received on the wire
    pub downloaded_bytes: u64,
    /// Bytes after decompression
    pub uncompressed_bytes: u64,
}

impl DownloadCounters {
    /// Read all counters
    pub fn snapshot(&self) -> FetchProgress {
        FetchProgress {
            downloaded_chunks: self.downloaded_chunks.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            uncompressed_bytes: self.uncompressed_bytes.load(Ordering::Relaxed),
        }
    }
}

/// A response whose decoded body has not started flowing yet
pub struct FetchedFile {
    /// Coding the body was decoded from
    pub encoding: ContentEncoding,
    /// Live counters
    pub counters: Arc<DownloadCounters>,
    /// Decoded body, in arrival order
    pub stream: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for FetchedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedFile")
            .field("encoding", &self.encoding)
            .field("counters", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

/// Fetches NDJSON files through the shared request path
#[derive(Clone)]
pub(crate) struct FileFetcher {
    http: Arc<HttpClient>,
}

impl FileFetcher {
    pub(crate) fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }

    /// GET `url` and wrap its body in the matching decoder
    pub(crate) async fn run(
        &self,
        url: &str,
        authorize: bool,
        cancel: &CancellationToken,
    ) -> Result<FetchedFile> {
        let response = self
            .http
            .send(Method::GET, url, authorize, cancel, |request| {
                request.header(ACCEPT_ENCODING, ACCEPTED_ENCODINGS)
            })
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(Error::FileDownload {
                status: status.as_u16(),
                url: url.to_string(),
                headers: header_map(response.headers()),
            });
        }

        let encoding = ContentEncoding::from_header(
            response
                .headers()
                .get(CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );
        tracing::debug!(url = %url, encoding = ?encoding, "File response received");

        let counters = Arc::new(DownloadCounters::default());
        let stream = decode_body(response.bytes_stream(), encoding, counters.clone());

        Ok(FetchedFile {
            encoding,
            counters,
            stream,
        })
    }
}

/// Count raw chunks, decode, then count decoded bytes
pub(crate) fn decode_body<S>(
    raw: S,
    encoding: ContentEncoding,
    counters: Arc<DownloadCounters>,
) -> BoxStream<'static, Result<Bytes>>
where
    S: futures::Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let wire_counters = counters.clone();
    let counted = raw.map(move |chunk| {
        let chunk = chunk.map_err(std::io::Error::other)?;
        wire_counters
            .downloaded_chunks
            .fetch_add(1, Ordering::Relaxed);
        wire_counters
            .downloaded_bytes
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok::<_, std::io::Error>(chunk)
    });
    let reader = StreamReader::new(counted);

    let decoded: BoxStream<'static, std::io::Result<Bytes>> = match encoding {
        ContentEncoding::Gzip => {
            let mut decoder = GzipDecoder::new(reader);
            decoder.multiple_members(true);
            ReaderStream::new(decoder).boxed()
        }
        ContentEncoding::Deflate => ReaderStream::new(ZlibDecoder::new(reader)).boxed(),
        ContentEncoding::Brotli => ReaderStream::new(BrotliDecoder::new(reader)).boxed(),
        ContentEncoding::Identity => ReaderStream::new(reader).boxed(),
    };

    decoded
        .map(move |chunk| match chunk {
            Ok(bytes) => {
                counters
                    .uncompressed_bytes
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                Ok(bytes)
            }
            Err(e) => Err(Error::Transport(format!("failed to read response body: {e}"))),
        })
        .boxed()
}
