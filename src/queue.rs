//! Bounded-concurrency download queue
//!
//! A [`DownloadQueue`] is split into a cloneable [`QueueHandle`] for adding jobs
//! and a [`QueueRunner`] that drives them. The runner is the only task that
//! starts jobs and calls the progress/completion callbacks, so callbacks never
//! run concurrently.

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{FileDownloadStatus, ManifestFileRef};

/// The work a job performs, given the writer side of its status
pub type JobWorker = Box<dyn FnOnce(JobStatusSender) -> BoxFuture<'static, Result<()>> + Send>;

type ProgressCallback = Box<dyn FnMut(&[JobView]) + Send>;
type CompleteCallback = Box<dyn FnOnce(&[JobView]) + Send>;

/// Single writer of a job's [`FileDownloadStatus`]
#[derive(Clone)]
pub struct JobStatusSender(Arc<watch::Sender<FileDownloadStatus>>);

impl JobStatusSender {
    /// Apply `f` to the status in place
    pub fn update(&self, f: impl FnOnce(&mut FileDownloadStatus)) {
        self.0.send_modify(f);
    }

    /// Copy of the current status
    pub fn get(&self) -> FileDownloadStatus {
        self.0.borrow().clone()
    }

    /// A reader that observes every update
    pub fn subscribe(&self) -> watch::Receiver<FileDownloadStatus> {
        self.0.subscribe()
    }
}

/// One file to download
pub struct DownloadJob {
    descriptor: ManifestFileRef,
    status: JobStatusSender,
    worker: JobWorker,
}

impl DownloadJob {
    /// Create a job from its manifest entry, initial status and worker
    pub fn new(descriptor: ManifestFileRef, status: FileDownloadStatus, worker: JobWorker) -> Self {
        let (tx, _rx) = watch::channel(status);
        Self {
            descriptor,
            status: JobStatusSender(Arc::new(tx)),
            worker,
        }
    }

    /// The manifest entry this job downloads
    pub fn descriptor(&self) -> &ManifestFileRef {
        &self.descriptor
    }

    /// A reader of the job's status
    pub fn status(&self) -> watch::Receiver<FileDownloadStatus> {
        self.status.subscribe()
    }
}

/// Scheduling state of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for a free slot
    Pending,
    /// Worker running
    Running,
    /// Worker finished (successfully or not)
    Completed,
}

/// Snapshot of a job handed to callbacks
#[derive(Clone, Debug)]
pub struct JobView {
    /// The manifest entry
    pub descriptor: ManifestFileRef,
    /// Scheduling state
    pub state: JobState,
    /// Latest status
    pub status: FileDownloadStatus,
}

/// Counts over a set of jobs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// All jobs
    pub total: usize,
    /// Running jobs
    pub running: usize,
    /// Completed jobs
    pub completed: usize,
    /// Completed jobs that failed
    pub failed: usize,
}

impl QueueCounts {
    /// Count `jobs` by state
    pub fn from_jobs(jobs: &[JobView]) -> Self {
        jobs.iter().fold(
            QueueCounts {
                total: jobs.len(),
                ..Default::default()
            },
            |mut counts, job| {
                match job.state {
                    JobState::Running => counts.running += 1,
                    JobState::Completed => {
                        counts.completed += 1;
                        if job.status.error.is_some() {
                            counts.failed += 1;
                        }
                    }
                    JobState::Pending => {}
                }
                counts
            },
        )
    }
}

enum Command {
    Add(DownloadJob),
    Finalize,
}

/// Queue builder
///
/// # Examples
///
/// ```no_run
/// use bulk_data_client::queue::{DownloadQueue, QueueCounts};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let (handle, runner) = DownloadQueue::new(5)
///     .on_progress(|jobs| println!("{:?}", QueueCounts::from_jobs(jobs)))
///     .on_complete(|jobs| println!("{} jobs done", jobs.len()))
///     .start();
///
/// let driver = tokio::spawn(runner.run(CancellationToken::new()));
/// // handle.add_job(..) for each file, then:
/// handle.finalize().unwrap();
/// let jobs = driver.await.unwrap();
/// # }
/// ```
pub struct DownloadQueue {
    parallel_jobs: usize,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompleteCallback>,
}

impl DownloadQueue {
    /// A queue running at most `parallel_jobs` jobs at once
    pub fn new(parallel_jobs: usize) -> Self {
        Self {
            parallel_jobs: parallel_jobs.max(1),
            on_progress: None,
            on_complete: None,
        }
    }

    /// Called after every job start and finish
    pub fn on_progress(mut self, f: impl FnMut(&[JobView]) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called once, when the queue is finalized and every job has completed
    pub fn on_complete(mut self, f: impl FnOnce(&[JobView]) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Split into a handle for adding jobs and the runner that drives them
    pub fn start(self) -> (QueueHandle, QueueRunner) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = QueueHandle {
            tx,
            finalized: Arc::new(AtomicBool::new(false)),
        };
        let runner = QueueRunner {
            parallel_jobs: self.parallel_jobs,
            on_progress: self.on_progress,
            on_complete: self.on_complete,
            commands: rx,
        };
        (handle, runner)
    }
}

/// Adds jobs to a running queue
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<Command>,
    finalized: Arc<AtomicBool>,
}

impl QueueHandle {
    /// Queue a job; fails once the queue is finalized
    pub fn add_job(&self, job: DownloadJob) -> Result<()> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(Error::Queue(format!(
                "cannot add {} after the queue was finalized",
                job.descriptor.url
            )));
        }
        self.tx
            .send(Command::Add(job))
            .map_err(|_| Error::Queue("download queue is no longer running".into()))
    }

    /// Declare that no more jobs will be added; fails if called twice
    pub fn finalize(&self) -> Result<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(Error::Queue("download queue already finalized".into()));
        }
        self.tx
            .send(Command::Finalize)
            .map_err(|_| Error::Queue("download queue is no longer running".into()))
    }

    /// Whether [`finalize`](Self::finalize) has been called
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }
}

struct JobEntry {
    descriptor: ManifestFileRef,
    state: JobState,
    status: JobStatusSender,
}

impl JobEntry {
    fn view(&self) -> JobView {
        JobView {
            descriptor: self.descriptor.clone(),
            state: self.state,
            status: self.status.get(),
        }
    }
}

/// Drives queued jobs
pub struct QueueRunner {
    parallel_jobs: usize,
    on_progress: Option<ProgressCallback>,
    on_complete: Option<CompleteCallback>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl QueueRunner {
    /// Run until the queue is finalized and drained, every handle is dropped,
    /// or `cancel` fires
    ///
    /// After cancellation no further jobs are started; jobs already running
    /// are awaited. Returns the final view of every job.
    pub async fn run(mut self, cancel: CancellationToken) -> Vec<JobView> {
        let mut entries: Vec<JobEntry> = Vec::new();
        let mut pending: VecDeque<(usize, JobWorker)> = VecDeque::new();
        let mut running: FuturesUnordered<BoxFuture<'static, (usize, Result<()>)>> =
            FuturesUnordered::new();
        let mut finalized = false;
        let mut closed = false;

        loop {
            while !cancel.is_cancelled() && running.len() < self.parallel_jobs {
                let Some((index, worker)) = pending.pop_front() else {
                    break;
                };
                let entry = &mut entries[index];
                entry.state = JobState::Running;
                tracing::debug!(url = %entry.descriptor.url, "Starting download job");

                let status = entry.status.clone();
                let handle = tokio::spawn(worker(status));
                running.push(Box::pin(async move {
                    let result = match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(Error::Other(format!("download task failed: {e}"))),
                    };
                    (index, result)
                }));
                self.notify_progress(&entries);
            }

            if running.is_empty() {
                if finalized && pending.is_empty() {
                    if let Some(on_complete) = self.on_complete.take() {
                        let views = views(&entries);
                        on_complete(&views);
                    }
                    break;
                }
                if cancel.is_cancelled() || (closed && pending.is_empty()) {
                    break;
                }
            }

            tokio::select! {
                command = self.commands.recv(), if !closed => match command {
                    Some(Command::Add(job)) => {
                        let index = entries.len();
                        entries.push(JobEntry {
                            descriptor: job.descriptor,
                            state: JobState::Pending,
                            status: job.status,
                        });
                        pending.push_back((index, job.worker));
                    }
                    Some(Command::Finalize) => finalized = true,
                    None => closed = true,
                },
                Some((index, result)) = running.next() => {
                    let entry = &mut entries[index];
                    entry.state = JobState::Completed;
                    entry.status.update(|status| {
                        status.completed = true;
                        if let Err(e) = &result {
                            status.error = Some(e.to_string());
                        }
                    });
                    if let Err(e) = &result {
                        tracing::warn!(url = %entry.descriptor.url, error = %e, "Download job failed");
                    }
                    self.notify_progress(&entries);
                },
                _ = cancel.cancelled(), if running.is_empty() => {},
            }
        }

        views(&entries)
    }

    fn notify_progress(&mut self, entries: &[JobEntry]) {
        if let Some(on_progress) = self.on_progress.as_mut() {
            on_progress(&views(entries));
        }
    }
}

fn views(entries: &[JobEntry]) -> Vec<JobView> {
    entries.iter().map(JobEntry::view).collect()
}
