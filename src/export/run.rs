//! Full export run: kick-off, polling and downloads

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::BulkDataClient;
use super::downloads::{DownloadContext, FileNamer};
use crate::attachments::AttachmentResolver;
use crate::destination::{Destination, once_stream};
use crate::error::{Error, Result};
use crate::event_log::EventLogger;
use crate::fetch::FileFetcher;
use crate::queue::{DownloadQueue, JobView, QueueCounts};
use crate::types::{Event, ExportManifest, ExportSummary, ExportType, FileDownloadStatus};

const MANIFEST_FILE_NAME: &str = "manifest.json";

impl BulkDataClient {
    /// Run a complete export
    ///
    /// Kicks off the export, polls until the manifest is ready and downloads
    /// every listed file with at most `parallel_downloads` in flight. Files of
    /// a paginated manifest start downloading as soon as their page arrives.
    ///
    /// Kick-off and status failures abort the run. A failed file only fails
    /// itself: the run still succeeds and the failure is reported in the
    /// returned [`ExportSummary`].
    pub async fn run(&self) -> Result<ExportSummary> {
        let logger = if self.config.log.enabled {
            Some(EventLogger::spawn(
                self.subscribe(),
                self.config.log_file(),
                self.kick_off_url()?.to_string(),
                self.config.log.metadata.clone(),
            ))
        } else {
            None
        };

        let result = self.run_export().await;

        if let Some(logger) = logger {
            logger.finish().await;
        }
        result
    }

    async fn run_export(&self) -> Result<ExportSummary> {
        let started = Instant::now();
        let status_url = self.kick_off().await?;

        let progress_tx = self.event_tx.clone();
        let complete_tx = self.event_tx.clone();
        let (queue, runner) = DownloadQueue::new(self.config.download.parallel_downloads)
            .on_progress(move |jobs| {
                let counts = QueueCounts::from_jobs(jobs);
                let _ = progress_tx.send(Event::QueueProgress {
                    total: counts.total,
                    running: counts.running,
                    completed: counts.completed,
                    failed: counts.failed,
                });
            })
            .on_complete(move |jobs| {
                let counts = QueueCounts::from_jobs(jobs);
                tracing::info!(files = counts.total, failed = counts.failed, "All downloads complete");
                let _ = complete_tx.send(Event::AllDownloadsComplete {
                    files: counts.total,
                    failed: counts.failed,
                });
            })
            .start();

        // Cancelled by the client, or when polling fails mid-export
        let downloads_cancel = self.cancel.child_token();
        let context = Arc::new(self.download_context(downloads_cancel.clone()));
        let mut namer = FileNamer::new(self.config.download.force_standard_file_names);

        let polling = async {
            let result = self
                .poll_status(&status_url, |page| {
                    for (export_type, file) in page.files() {
                        let name = namer.name_for(file);
                        queue.add_job(context.job(
                            file,
                            export_type,
                            name,
                            page.requires_access_token,
                        ))?;
                    }
                    Ok(())
                })
                .await;

            match &result {
                Ok(_) => queue.finalize()?,
                Err(_) => downloads_cancel.cancel(),
            }
            result
        };

        let (manifest, jobs) = tokio::join!(polling, runner.run(downloads_cancel.clone()));
        let manifest = manifest?;

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if self.config.download.save_manifest && !matches!(self.destination, Destination::Discard)
        {
            self.save_manifest(&manifest, &jobs).await?;
        }

        let downloads: Vec<FileDownloadStatus> = jobs.into_iter().map(|job| job.status).collect();
        let summary = ExportSummary::from_downloads(manifest, downloads, started.elapsed());
        tracing::info!(
            files = summary.files,
            failed = summary.failed_files,
            resources = summary.resources,
            duration_ms = summary.duration_ms,
            "Export complete"
        );
        self.emit(Event::ExportComplete {
            summary: summary.clone(),
        });

        Ok(summary)
    }

    fn download_context(&self, cancel: CancellationToken) -> DownloadContext {
        let attachments = self.config.attachments.download_attachments.then(|| {
            AttachmentResolver::new(
                self.http.clone(),
                self.base_url.clone(),
                self.config.attachments.clone(),
                self.destination.clone(),
                self.text_extractor.clone(),
                self.event_tx.clone(),
            )
        });

        DownloadContext {
            config: self.config.clone(),
            fetcher: FileFetcher::new(self.http.clone()),
            attachments,
            destination: self.destination.clone(),
            event_tx: self.event_tx.clone(),
            cancel,
        }
    }

    /// Write the manifest as pretty JSON next to the downloaded files
    async fn save_manifest(&self, manifest: &ExportManifest, jobs: &[JobView]) -> Result<()> {
        let mut saved = manifest.clone();

        if self.config.download.add_destination_to_manifest {
            let locations: HashMap<(ExportType, &str), String> = jobs
                .iter()
                .map(|job| {
                    let status = &job.status;
                    (
                        (status.export_type, status.url.as_str()),
                        self.destination
                            .location(&status.name, status.export_type.sub_folder()),
                    )
                })
                .collect();

            for (export_type, files) in [
                (ExportType::Output, &mut saved.output),
                (ExportType::Deleted, &mut saved.deleted),
                (ExportType::Error, &mut saved.error),
            ] {
                for file in files.iter_mut() {
                    if let Some(location) = locations.get(&(export_type, file.url.as_str())) {
                        file.extra
                            .insert("destination".into(), Value::String(location.clone()));
                    }
                }
            }
        }

        let json = serde_json::to_vec_pretty(&saved)?;
        self.destination
            .write(MANIFEST_FILE_NAME, None, once_stream(Bytes::from(json)))
            .await?;

        let location = self.destination.location(MANIFEST_FILE_NAME, None);
        tracing::info!(location = %location, "Manifest saved");
        self.emit(Event::ManifestSaved { location });
        Ok(())
    }
}
