//! Export log: every event appended to an NDJSON file
//!
//! Each line looks like
//!
//! ```json
//! {"eventId":"kickoff","timestamp":"2024-01-01T00:00:00Z","exportUrl":"https://…/$export","url":"…","status_url":"…","method":"GET"}
//! ```
//!
//! The logger is an ordinary event subscriber: failing to write the log never
//! affects the export.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::Event;

/// Background task writing events to a log file
pub struct EventLogger {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl EventLogger {
    /// Start logging `events` to `path`
    ///
    /// `metadata`, when it is a JSON object, is merged into every line.
    pub fn spawn(
        events: broadcast::Receiver<Event>,
        path: PathBuf,
        export_url: String,
        metadata: Option<Value>,
    ) -> Self {
        let stop = CancellationToken::new();
        let task = tokio::spawn(write_log(events, path, export_url, metadata, stop.clone()));
        Self { stop, task }
    }

    /// Write out the events already sent, then stop
    pub async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Export log task failed");
        }
    }
}

/// One log line for `event`
pub fn log_line(event: &Event, export_url: &str, metadata: Option<&Value>) -> Result<String> {
    let mut line = Map::new();
    if let Some(Value::Object(metadata)) = metadata {
        line.extend(metadata.clone());
    }
    line.insert("eventId".into(), Value::String(event.event_id().to_string()));
    line.insert(
        "timestamp".into(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    line.insert("exportUrl".into(), Value::String(export_url.to_string()));

    if let Value::Object(fields) = serde_json::to_value(event)? {
        line.extend(fields.into_iter().filter(|(key, _)| key != "type"));
    }

    Ok(serde_json::to_string(&Value::Object(line))?)
}

async fn write_log(
    mut events: broadcast::Receiver<Event>,
    path: PathBuf,
    export_url: String,
    metadata: Option<Value>,
    stop: CancellationToken,
) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!(path = %path.display(), error = %e, "Cannot create export log directory");
            return;
        }
    }

    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Cannot open export log");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => append(&mut file, &event, &export_url, metadata.as_ref()).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Export log fell behind, events skipped");
                }
                Err(RecvError::Closed) => break,
            },
            _ = stop.cancelled() => {
                loop {
                    match events.try_recv() {
                        Ok(event) => append(&mut file, &event, &export_url, metadata.as_ref()).await,
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = file.flush().await {
        tracing::warn!(path = %path.display(), error = %e, "Cannot flush export log");
    }
}

async fn append(
    file: &mut tokio::fs::File,
    event: &Event,
    export_url: &str,
    metadata: Option<&Value>,
) {
    let line = match log_line(event, export_url, metadata) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot serialize export log line");
            return;
        }
    };
    if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
        tracing::warn!(error = %e, "Cannot write export log");
    }
}
