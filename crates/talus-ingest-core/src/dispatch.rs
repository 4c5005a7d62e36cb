//! Per-file parse job: decode, parse, recompute touched sessions, hand row
//! batches to the sink. One job owns one file end-to-end and is retry-safe:
//! every row it writes has a deterministic key.

use crate::envelope::{parse_text, FileContext};
use crate::model::{Metrics, RowBatch, SinkMessage, UploadJob};
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use talus_analysis::session::reconstruct_session;
use talus_decoder::CipherConfig;
use talus_events::{EventRepository, LogEvent, LogFileStatus, LogFileSummary};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub(crate) struct DispatchState {
    pub pending: std::collections::HashSet<String>,
    pub inflight: std::collections::HashSet<String>,
}

impl DispatchState {
    pub fn new() -> Self {
        Self {
            pending: Default::default(),
            inflight: Default::default(),
        }
    }

    pub fn is_tracked(&self, file_id: &str) -> bool {
        self.pending.contains(file_id) || self.inflight.contains(file_id)
    }
}

fn file_summary(job: &UploadJob, status: LogFileStatus) -> LogFileSummary {
    LogFileSummary {
        file_id: job.file_id.clone(),
        project_id: job.project_id.clone(),
        file_name: job.file_name.clone(),
        size_bytes: job.bytes.len() as u64,
        status,
        event_count: 0,
        error_count: 0,
        invalid_lines: 0,
        failure: String::new(),
    }
}

async fn send_batch(sink_tx: &mpsc::Sender<SinkMessage>, batch: RowBatch) -> Result<()> {
    sink_tx
        .send(SinkMessage::Batch(batch))
        .await
        .context("sink channel closed")
}

/// Recomputes the materialized session for every link code this file
/// touches. The fold runs over the union of already-persisted events and
/// this file's in-memory events, deduplicated by event id, so a retry or an
/// interleaved earlier upload cannot skew the result.
async fn recompute_sessions(
    job: &UploadJob,
    file_events: &[LogEvent],
    repo: &Arc<dyn EventRepository>,
) -> Result<Vec<Value>> {
    let mut by_link: BTreeMap<&str, Vec<&LogEvent>> = BTreeMap::new();
    for event in file_events {
        if let Some(link_code) = event.tracking.link_code.as_deref() {
            by_link.entry(link_code).or_default().push(event);
        }
    }

    let mut session_rows = Vec::with_capacity(by_link.len());
    for (link_code, members) in by_link {
        let persisted = repo
            .events_for_link_code(&job.project_id, link_code, None, None)
            .await
            .map_err(|err| anyhow!("failed reading events for {link_code}: {err}"))?;

        let mut merged: HashMap<String, LogEvent> = persisted
            .into_iter()
            .map(|event| (event.event_id.clone(), event))
            .collect();
        for event in members {
            merged.insert(event.event_id.clone(), event.clone());
        }

        let mut events: Vec<LogEvent> = merged.into_values().collect();
        events.sort_by_key(|event| (event.timestamp_ms, event.line_no));

        let session = reconstruct_session(&job.project_id, link_code, &events);
        session_rows.push(session.to_row());
    }

    Ok(session_rows)
}

pub(crate) async fn process_upload(
    batch_size: usize,
    job: &UploadJob,
    cipher: Option<&CipherConfig>,
    repo: &Arc<dyn EventRepository>,
    sink_tx: &mpsc::Sender<SinkMessage>,
    metrics: &Arc<Metrics>,
) -> Result<()> {
    let mut file = file_summary(job, LogFileStatus::Parsing);
    send_batch(
        sink_tx,
        RowBatch {
            file_rows: vec![file.to_row()],
            ..RowBatch::default()
        },
    )
    .await?;

    let text = match talus_decoder::decode(&job.bytes, cipher) {
        Ok(text) => text,
        Err(err) => {
            // File-level fatal: nothing partial gets exposed as parsed.
            file.status = LogFileStatus::Failed;
            file.failure = err.to_string();
            info!("decode failed for {}: {err}", job.file_id);
            metrics.files_failed.fetch_add(1, Ordering::Relaxed);
            return send_batch(
                sink_tx,
                RowBatch {
                    file_rows: vec![file.to_row()],
                    ..RowBatch::default()
                },
            )
            .await;
        }
    };

    let parsed = parse_text(
        &text,
        &FileContext {
            file_id: &job.file_id,
            project_id: &job.project_id,
        },
    );
    debug!(
        "parsed {}: {} events, {} invalid lines",
        job.file_id, parsed.event_count, parsed.invalid_lines
    );

    let session_rows = recompute_sessions(job, &parsed.events, repo).await?;

    let mut event_rows: Vec<Value> = parsed.events.iter().map(LogEvent::to_row).collect();
    while event_rows.len() > batch_size.max(1) {
        let rest = event_rows.split_off(batch_size.max(1));
        send_batch(
            sink_tx,
            RowBatch {
                event_rows,
                ..RowBatch::default()
            },
        )
        .await?;
        event_rows = rest;
    }

    file.status = LogFileStatus::Parsed;
    file.event_count = parsed.event_count;
    file.error_count = parsed.error_count;
    file.invalid_lines = parsed.invalid_lines;

    send_batch(
        sink_tx,
        RowBatch {
            event_rows,
            session_rows,
            file_rows: vec![file.to_row()],
        },
    )
    .await?;

    metrics.files_parsed.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Marks a file failed after a job-level error (backend unavailable,
/// channel closed mid-parse). Best effort: the sink may already be gone.
pub(crate) async fn mark_failed(
    job: &UploadJob,
    failure: &str,
    sink_tx: &mpsc::Sender<SinkMessage>,
) {
    let mut file = file_summary(job, LogFileStatus::Failed);
    file.failure = failure.to_string();
    let _ = sink_tx
        .send(SinkMessage::Batch(RowBatch {
            file_rows: vec![file.to_row()],
            ..RowBatch::default()
        }))
        .await;
}
