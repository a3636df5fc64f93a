//! Per-file download pipeline
//!
//! fetch → decompress → frame lines → resolve attachments → re-serialize → sink
//!
//! The sink runs concurrently with the producer and is fed through a bounded
//! channel, so a slow destination slows the download down instead of
//! buffering the file in memory.

use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::attachments::{AttachmentContext, AttachmentResolver};
use crate::config::Config;
use crate::destination::{Destination, byte_channel};
use crate::error::{Error, ErrorReport, Result};
use crate::fetch::{FetchedFile, FileFetcher};
use crate::ndjson::{LineFramer, NdjsonOptions, NdjsonSerializer};
use crate::queue::{DownloadJob, JobStatusSender};
use crate::types::{Event, ExportType, FileDownloadStatus, ManifestFileRef};

/// Buffered chunks between the producer and the sink
const SINK_CHANNEL_CAPACITY: usize = 16;

/// Minimum interval between progress events for one file
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Names output files, either after their URL or as `{n}.{type}.ndjson`
#[derive(Debug, Default)]
pub(crate) struct FileNamer {
    standard: bool,
    counters: HashMap<String, u32>,
}

impl FileNamer {
    pub(crate) fn new(force_standard_file_names: bool) -> Self {
        Self {
            standard: force_standard_file_names,
            counters: HashMap::new(),
        }
    }

    pub(crate) fn name_for(&mut self, file: &ManifestFileRef) -> String {
        if !self.standard {
            if let Some(name) = last_path_segment(&file.url) {
                return name;
            }
        }

        let counter = self.counters.entry(file.resource_type.clone()).or_insert(0);
        *counter += 1;
        format!("{}.{}.ndjson", counter, file.resource_type)
    }
}

fn last_path_segment(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.rev().find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(segment).ok()?;
    // Decoded separators would escape the destination folder
    if decoded.contains('/') || decoded.contains('\\') || decoded == ".." {
        return None;
    }
    Some(decoded.into_owned())
}

/// Everything a download worker needs, shared by all workers of a run
pub(crate) struct DownloadContext {
    pub(crate) config: Arc<Config>,
    pub(crate) fetcher: FileFetcher,
    pub(crate) attachments: Option<AttachmentResolver>,
    pub(crate) destination: Destination,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) cancel: CancellationToken,
}

/// One file, as the worker sees it
struct FileSpec {
    file: ManifestFileRef,
    export_type: ExportType,
    name: String,
    authorize: bool,
}

/// Why the producer side of a pipeline stopped early
enum PipelineError {
    /// The sink dropped its end of the channel; its own error explains why
    SinkClosed,
    Failed(Error),
}

impl From<Error> for PipelineError {
    fn from(e: Error) -> Self {
        PipelineError::Failed(e)
    }
}

impl DownloadContext {
    /// Build the queue job for one manifest entry
    pub(crate) fn job(
        self: &Arc<Self>,
        file: &ManifestFileRef,
        export_type: ExportType,
        name: String,
        authorize: bool,
    ) -> DownloadJob {
        let status = FileDownloadStatus {
            url: file.url.clone(),
            resource_type: file.resource_type.clone(),
            name: name.clone(),
            export_type,
            ..Default::default()
        };
        let spec = FileSpec {
            file: file.clone(),
            export_type,
            name,
            authorize,
        };
        let ctx = Arc::clone(self);

        DownloadJob::new(
            file.clone(),
            status,
            Box::new(move |status| ctx.download(spec, status).boxed()),
        )
    }

    async fn download(self: Arc<Self>, spec: FileSpec, status: JobStatusSender) -> Result<()> {
        let _ = self.event_tx.send(Event::DownloadStart {
            file: spec.name.clone(),
            url: spec.file.url.clone(),
            export_type: spec.export_type,
        });
        tracing::debug!(file = %spec.name, url = %spec.file.url, "Download started");

        let result = self.transfer(&spec, &status).await;

        match &result {
            Ok(()) => {
                status.update(|s| s.completed = true);
                let final_status = status.get();
                tracing::info!(
                    file = %spec.name,
                    resources = final_status.resources,
                    bytes = final_status.uncompressed_bytes,
                    "Download complete"
                );
                let _ = self.event_tx.send(Event::DownloadComplete {
                    status: final_status,
                });
            }
            Err(e) => {
                status.update(|s| {
                    s.completed = true;
                    s.error = Some(e.to_string());
                });
                tracing::warn!(file = %spec.name, url = %spec.file.url, error = %e, "Download failed");
                let _ = self.event_tx.send(Event::DownloadError {
                    file: spec.name.clone(),
                    url: spec.file.url.clone(),
                    error: ErrorReport::from(e),
                });
            }
        }

        result
    }

    async fn transfer(&self, spec: &FileSpec, status: &JobStatusSender) -> Result<()> {
        let fetched = self
            .fetcher
            .run(&spec.file.url, spec.authorize, &self.cancel)
            .await?;

        let ndjson = &self.config.ndjson;
        let options = NdjsonOptions {
            max_line_length: ndjson.max_line_length,
            expected_resource_type: ndjson
                .validate_resource_type
                .then(|| spec.file.resource_type.clone()),
            expected_count: if ndjson.validate_resource_count {
                spec.file.count
            } else {
                None
            },
        };

        let (tx, rx) = byte_channel(SINK_CHANNEL_CAPACITY);
        let sink = self
            .destination
            .write(&spec.name, spec.export_type.sub_folder(), rx);
        let producer = self.produce(fetched, options, spec, status, tx);

        match tokio::join!(producer, sink) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(PipelineError::Failed(e)), _) => Err(e),
            (Ok(()), Err(e)) | (Err(PipelineError::SinkClosed), Err(e)) => Err(e),
            (Err(PipelineError::SinkClosed), Ok(())) => Err(Error::Transport(format!(
                "destination stopped reading {} before it was complete",
                spec.name
            ))),
        }
    }

    async fn produce(
        &self,
        fetched: FetchedFile,
        options: NdjsonOptions,
        spec: &FileSpec,
        status: &JobStatusSender,
        tx: mpsc::Sender<Result<bytes::Bytes>>,
    ) -> std::result::Result<(), PipelineError> {
        let result = self.pump(fetched, options, spec, status, &tx).await;
        if let Err(PipelineError::Failed(e)) = &result {
            // Make the sink fail too, so no destination commits a truncated file
            let _ = tx
                .send(Err(Error::Transport(format!("download aborted: {e}"))))
                .await;
        }
        result
    }

    async fn pump(
        &self,
        fetched: FetchedFile,
        options: NdjsonOptions,
        spec: &FileSpec,
        status: &JobStatusSender,
        tx: &mpsc::Sender<Result<bytes::Bytes>>,
    ) -> std::result::Result<(), PipelineError> {
        let FetchedFile {
            counters,
            mut stream,
            ..
        } = fetched;
        let mut framer = LineFramer::new(options);
        let mut serializer = NdjsonSerializer::new();
        let attachment_ctx = AttachmentContext {
            file: &spec.name,
            authorize: spec.authorize,
            cancel: &self.cancel,
        };
        let mut last_progress = Instant::now();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled.into()),
                chunk = stream.next() => chunk,
            };

            let finished = chunk.is_none();
            let records = match chunk {
                Some(bytes) => framer.push(&bytes?)?,
                None => framer.finish()?,
            };

            for mut record in records {
                if let Some(resolver) = &self.attachments {
                    let resolved = resolver.resolve(&mut record, &attachment_ctx).await?;
                    if resolved > 0 {
                        status.update(|s| s.attachments += resolved);
                    }
                }
                let encoded = serializer.encode(&record)?;
                tx.send(Ok(encoded))
                    .await
                    .map_err(|_| PipelineError::SinkClosed)?;
                status.update(|s| s.resources += 1);
            }

            let progress = counters.snapshot();
            status.update(|s| {
                s.downloaded_chunks = progress.downloaded_chunks;
                s.downloaded_bytes = progress.downloaded_bytes;
                s.uncompressed_bytes = progress.uncompressed_bytes;
            });

            if finished {
                break;
            }
            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                let _ = self.event_tx.send(Event::DownloadProgress {
                    status: status.get(),
                });
            }
        }

        framer.verify_count()?;
        Ok(())
    }
}
