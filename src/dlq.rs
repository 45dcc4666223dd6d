//! Dead-letter queue: append-only JSONL persistence of parse failures.
//!
//! Durability here is subordinate to pipeline liveness — a failed write
//! is logged and dropped, and a full backlog sheds oldest entries first
//! (the broadcast subscription lags rather than blocking the parser).

use crate::bus::EventBus;
use crate::metrics::PipelineMetrics;
use crate::model::ParseFailure;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_PATH: &str = "logs/failed-messages.jsonl";

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const BATCH_CAP: usize = 128;

/// Subscribes to `parse-error` and appends one JSON object per line.
pub async fn run(
    bus: Arc<EventBus>,
    path: PathBuf,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    let mut rx = bus.subscribe_parse_error();
    let mut batch: Vec<Arc<ParseFailure>> = Vec::with_capacity(BATCH_CAP);
    let mut iv = tokio::time::interval(FLUSH_INTERVAL);
    info!(path = %path.display(), "dead-letter queue writer started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush(&path, &mut batch, &metrics).await;
                return;
            }
            recv = rx.recv() => match recv {
                Ok(failure) => {
                    batch.push(failure);
                    if batch.len() >= BATCH_CAP {
                        flush(&path, &mut batch, &metrics).await;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    metrics.dlq_dropped.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
                    warn!(dropped = n, "dead-letter backlog shed oldest entries");
                }
                Err(RecvError::Closed) => {
                    flush(&path, &mut batch, &metrics).await;
                    return;
                }
            },
        }
    }
}

async fn flush(path: &Path, batch: &mut Vec<Arc<ParseFailure>>, metrics: &PipelineMetrics) {
    if batch.is_empty() {
        return;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
    }
    match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
        Ok(mut f) => {
            for failure in batch.iter() {
                if let Ok(line) = serde_json::to_string(failure.as_ref()) {
                    if let Err(e) = f.write_all(format!("{line}\n").as_bytes()).await {
                        warn!(error = %e, "dead-letter write failed");
                        break;
                    }
                    PipelineMetrics::incr(&metrics.dlq_written);
                }
            }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "dead-letter open failed");
        }
    }
    batch.clear();
}
