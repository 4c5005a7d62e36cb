//! Upload-driven ingestion: a bounded worker pool consumes queued log-file
//! uploads, each job decoding, parsing, and persisting one file end-to-end
//! through a shared batching sink.

mod dispatch;
mod envelope;
mod model;
mod sink;
mod tracking;

pub use model::{file_id_for_upload, Metrics, UploadReceipt};
pub use tracking::extract_tracking_fields;

use crate::dispatch::{mark_failed, process_upload, DispatchState};
use crate::model::{SinkMessage, UploadJob};
use crate::sink::spawn_sink_task;
use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use talus_clickhouse::ClickHouseClient;
use talus_config::AppConfig;
use talus_decoder::CipherConfig;
use talus_events::{EventRepository, LogFileStatus, LogFileSummary};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upload of {size} bytes exceeds the {limit} byte ceiling")]
    TooLarge { size: usize, limit: usize },
    #[error("project_id cannot be empty")]
    EmptyProject,
    #[error("ingest queue is shut down")]
    QueueClosed,
    #[error("backend error: {0}")]
    Backend(String),
}

pub struct IngestService {
    submit_tx: mpsc::Sender<UploadJob>,
    state: Arc<Mutex<DispatchState>>,
    metrics: Arc<Metrics>,
    clickhouse: ClickHouseClient,
    max_upload_bytes: usize,
}

pub struct IngestHandles {
    worker: JoinHandle<()>,
    sink: JoinHandle<()>,
}

impl IngestService {
    /// Spins up the worker pool and sink. The returned handles drain cleanly
    /// through [`IngestService::shutdown`].
    pub fn start(
        config: &AppConfig,
        clickhouse: ClickHouseClient,
        repo: Arc<dyn EventRepository>,
    ) -> Result<(Self, IngestHandles)> {
        let cipher = build_cipher(config)?;
        let workers = config.ingest.max_file_workers.max(1);
        let batch_size = config.ingest.batch_size.max(1);

        let metrics = Arc::new(Metrics::default());
        let state = Arc::new(Mutex::new(DispatchState::new()));

        let (submit_tx, mut submit_rx) =
            mpsc::channel::<UploadJob>(config.ingest.queue_capacity.max(1));
        let (sink_tx, sink_rx) =
            mpsc::channel::<SinkMessage>(config.ingest.queue_capacity.max(16));

        let sink_handle = spawn_sink_task(
            config.ingest.clone(),
            clickhouse.clone(),
            metrics.clone(),
            sink_rx,
        );

        let worker_handle = {
            let state = state.clone();
            let metrics = metrics.clone();
            let sem = Arc::new(Semaphore::new(workers));
            let cipher = cipher.map(Arc::new);

            tokio::spawn(async move {
                while let Some(job) = submit_rx.recv().await {
                    metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    {
                        let mut state = state.lock().expect("dispatch mutex poisoned");
                        state.pending.remove(&job.file_id);
                        state.inflight.insert(job.file_id.clone());
                    }

                    let permit = match sem.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let sink_tx_worker = sink_tx.clone();
                    let state_worker = state.clone();
                    let metrics_worker = metrics.clone();
                    let cipher_worker = cipher.clone();
                    let repo_worker = repo.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        let outcome = process_upload(
                            batch_size,
                            &job,
                            cipher_worker.as_deref(),
                            &repo_worker,
                            &sink_tx_worker,
                            &metrics_worker,
                        )
                        .await;

                        if let Err(exc) = outcome {
                            tracing::error!("failed processing upload {}: {exc:#}", job.file_id);
                            metrics_worker.files_failed.fetch_add(1, Ordering::Relaxed);
                            *metrics_worker
                                .last_error
                                .lock()
                                .expect("metrics last_error mutex poisoned") = exc.to_string();
                            mark_failed(&job, &exc.to_string(), &sink_tx_worker).await;
                        }

                        state_worker
                            .lock()
                            .expect("dispatch mutex poisoned")
                            .inflight
                            .remove(&job.file_id);
                    });
                }

                // Queue closed: stop accepting, let in-flight jobs finish,
                // then release the sink so it can drain.
                let _ = sem.acquire_many_owned(workers as u32).await;
                info!("ingest worker pool drained");
            })
        };

        let service = Self {
            submit_tx,
            state,
            metrics,
            clickhouse,
            max_upload_bytes: config.ingest.max_upload_bytes,
        };

        Ok((
            service,
            IngestHandles {
                worker: worker_handle,
                sink: sink_handle,
            },
        ))
    }

    /// Upload boundary: validates, persists the `queued` status row, and
    /// enqueues the parse job. Returns without waiting for the parse. A
    /// resubmission of a file already in flight collapses into the existing
    /// job.
    pub async fn submit(
        &self,
        project_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadReceipt, IngestError> {
        if project_id.trim().is_empty() {
            return Err(IngestError::EmptyProject);
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(IngestError::TooLarge {
                size: bytes.len(),
                limit: self.max_upload_bytes,
            });
        }

        let file_name = if file_name.trim().is_empty() {
            "upload.log"
        } else {
            file_name
        };
        let file_id = file_id_for_upload(project_id, file_name, &bytes);

        {
            let mut state = self.state.lock().expect("dispatch mutex poisoned");
            if state.is_tracked(&file_id) {
                return Ok(UploadReceipt {
                    file_id,
                    status: LogFileStatus::Queued,
                });
            }
            state.pending.insert(file_id.clone());
        }

        let summary = LogFileSummary {
            file_id: file_id.clone(),
            project_id: project_id.to_string(),
            file_name: file_name.to_string(),
            size_bytes: bytes.len() as u64,
            status: LogFileStatus::Queued,
            event_count: 0,
            error_count: 0,
            invalid_lines: 0,
            failure: String::new(),
        };

        if let Err(exc) = self
            .clickhouse
            .insert_rows("log_files", &[summary.to_row()])
            .await
        {
            self.state
                .lock()
                .expect("dispatch mutex poisoned")
                .pending
                .remove(&file_id);
            return Err(IngestError::Backend(exc.to_string()));
        }

        let job = UploadJob {
            file_id: file_id.clone(),
            project_id: project_id.to_string(),
            file_name: file_name.to_string(),
            bytes,
        };

        if self.submit_tx.send(job).await.is_err() {
            self.state
                .lock()
                .expect("dispatch mutex poisoned")
                .pending
                .remove(&file_id);
            return Err(IngestError::QueueClosed);
        }

        self.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
        Ok(UploadReceipt {
            file_id,
            status: LogFileStatus::Queued,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Stops accepting uploads and waits until in-flight jobs finish and the
    /// sink drains its last rows.
    pub async fn shutdown(self, handles: IngestHandles) -> Result<()> {
        let IngestService { submit_tx, .. } = self;
        drop(submit_tx);

        handles.worker.await.context("ingest worker panicked")?;
        handles.sink.await.context("ingest sink panicked")?;
        Ok(())
    }
}

fn build_cipher(config: &AppConfig) -> Result<Option<CipherConfig>> {
    let decoder = &config.decoder;
    if decoder.key_hex.trim().is_empty() && decoder.iv_hex.trim().is_empty() {
        return Ok(None);
    }

    let cipher = CipherConfig::from_hex(&decoder.key_hex, &decoder.iv_hex)
        .context("invalid decoder cipher configuration")?;
    Ok(Some(cipher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Query, State},
        http::StatusCode,
        routing::post,
        Router,
    };
    use std::collections::HashMap;
    use talus_events::{ClickHouseEventRepository, RepoConfig};

    type Recorded = Arc<Mutex<Vec<(String, String)>>>;

    #[derive(Clone)]
    struct MockState {
        recorded: Recorded,
        select_delay: std::time::Duration,
    }

    async fn spawn_recording_server() -> (String, Recorded) {
        spawn_recording_server_with_delay(std::time::Duration::ZERO).await
    }

    async fn spawn_recording_server_with_delay(
        select_delay: std::time::Duration,
    ) -> (String, Recorded) {
        async fn handler(
            Query(params): Query<HashMap<String, String>>,
            State(state): State<MockState>,
            body: String,
        ) -> (StatusCode, String) {
            let query = params.get("query").cloned().unwrap_or_default();
            let is_select = query.trim_start().to_ascii_uppercase().starts_with("SELECT");
            state
                .recorded
                .lock()
                .expect("recorded mutex poisoned")
                .push((query, body));
            if is_select && !state.select_delay.is_zero() {
                tokio::time::sleep(state.select_delay).await;
            }
            // SELECTs come back empty, which the client resolves to zero rows.
            (StatusCode::OK, String::new())
        }

        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new().route("/", post(handler)).with_state(MockState {
            recorded: recorded.clone(),
            select_delay,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (format!("http://{}", addr), recorded)
    }

    fn test_config(url: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.clickhouse.url = url.to_string();
        config.clickhouse.timeout_seconds = 5.0;
        config.ingest.batch_size = 2;
        config.ingest.flush_interval_seconds = 0.05;
        config
    }

    fn start_service(config: &AppConfig) -> (IngestService, IngestHandles) {
        let clickhouse =
            ClickHouseClient::new(config.clickhouse.clone()).expect("clickhouse client");
        let repo: Arc<dyn EventRepository> = Arc::new(ClickHouseEventRepository::new(
            clickhouse.clone(),
            RepoConfig::default(),
        ));
        IngestService::start(config, clickhouse, repo).expect("service starts")
    }

    fn sample_log() -> Vec<u8> {
        concat!(
            "{\"c\":\"clogan header\",\"f\":0,\"l\":0,\"n\":\"clogan\"}\n",
            "{\"c\":\"{\\\"event\\\":\\\"BLE_CONNECT\\\",\\\"msg\\\":{\\\"linkCode\\\":\\\"lk-1\\\",\\\"stage\\\":\\\"ble\\\",\\\"op\\\":\\\"connect\\\",\\\"result\\\":\\\"start\\\"}}\",\"f\":1,\"l\":1000,\"n\":\"main\"}\n",
            "{\"c\":\"{\\\"event\\\":\\\"BLE_AUTH\\\",\\\"msg\\\":{\\\"linkCode\\\":\\\"lk-1\\\",\\\"stage\\\":\\\"ble\\\",\\\"op\\\":\\\"auth\\\",\\\"result\\\":\\\"ok\\\"}}\",\"f\":2,\"l\":2000,\"n\":\"main\"}\n",
            "definitely not json\n",
        )
        .as_bytes()
        .to_vec()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_parses_and_persists_end_to_end() {
        let (url, recorded) = spawn_recording_server().await;
        let config = test_config(&url);
        let (service, handles) = start_service(&config);

        let receipt = service
            .submit("p1", "device.log", sample_log())
            .await
            .expect("submit accepts upload");
        assert_eq!(receipt.status, LogFileStatus::Queued);

        service.shutdown(handles).await.expect("clean shutdown");

        let recorded = recorded.lock().expect("recorded mutex poisoned");

        let event_lines: usize = recorded
            .iter()
            .filter(|(query, _)| query.contains("INSERT INTO") && query.contains("log_events"))
            .map(|(_, body)| body.lines().filter(|l| !l.trim().is_empty()).count())
            .sum();
        // Two real events plus the parser-error marker.
        assert_eq!(event_lines, 3);

        let file_bodies: Vec<&String> = recorded
            .iter()
            .filter(|(query, _)| query.contains("INSERT INTO") && query.contains("log_files"))
            .map(|(_, body)| body)
            .collect();
        assert!(file_bodies.iter().any(|b| b.contains("\"status\":\"queued\"")));
        assert!(file_bodies
            .iter()
            .any(|b| b.contains("\"status\":\"parsed\"")
                && b.contains("\"event_count\":2")
                && b.contains("\"invalid_lines\":1")));

        let session_lines: usize = recorded
            .iter()
            .filter(|(query, _)| {
                query.contains("INSERT INTO") && query.contains("device_sessions")
            })
            .map(|(_, body)| body.lines().filter(|l| !l.trim().is_empty()).count())
            .sum();
        assert_eq!(session_lines, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encrypted_upload_without_key_is_marked_failed() {
        let (url, recorded) = spawn_recording_server().await;
        let config = test_config(&url);
        let (service, handles) = start_service(&config);

        let mut container = talus_decoder::CONTAINER_MAGIC.to_vec();
        container.extend_from_slice(&[0u8; 32]);

        service
            .submit("p1", "device.bin", container)
            .await
            .expect("submit accepts container");
        service.shutdown(handles).await.expect("clean shutdown");

        let recorded = recorded.lock().expect("recorded mutex poisoned");
        let failed = recorded.iter().any(|(query, body)| {
            query.contains("log_files")
                && body.contains("\"status\":\"failed\"")
                && body.contains("cipher key")
        });
        assert!(failed, "decode failure should mark the file failed");

        let event_inserts = recorded
            .iter()
            .any(|(query, _)| query.contains("INSERT INTO") && query.contains("log_events"));
        assert!(!event_inserts, "nothing partial may be exposed as parsed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_upload_is_rejected_before_any_write() {
        let (url, recorded) = spawn_recording_server().await;
        let mut config = test_config(&url);
        config.ingest.max_upload_bytes = 8;
        let (service, handles) = start_service(&config);

        let err = service
            .submit("p1", "big.log", vec![0u8; 9])
            .await
            .expect_err("oversized upload must be rejected");
        assert!(matches!(err, IngestError::TooLarge { size: 9, limit: 8 }));

        let err = service
            .submit("  ", "x.log", vec![])
            .await
            .expect_err("empty project must be rejected");
        assert!(matches!(err, IngestError::EmptyProject));

        service.shutdown(handles).await.expect("clean shutdown");
        assert!(recorded.lock().expect("recorded mutex poisoned").is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_submission_collapses_into_one_job() {
        // Slow SELECTs pin the first job in its session recompute while the
        // duplicate submission arrives.
        let (url, recorded) =
            spawn_recording_server_with_delay(std::time::Duration::from_millis(300)).await;
        let mut config = test_config(&url);
        config.ingest.max_file_workers = 1;
        let (service, handles) = start_service(&config);

        let first = service
            .submit("p1", "device.log", sample_log())
            .await
            .expect("first submit");
        let second = service
            .submit("p1", "device.log", sample_log())
            .await
            .expect("duplicate submit");
        assert_eq!(first.file_id, second.file_id);

        service.shutdown(handles).await.expect("clean shutdown");

        let recorded = recorded.lock().expect("recorded mutex poisoned");
        let queued_rows: usize = recorded
            .iter()
            .filter(|(query, _)| query.contains("log_files"))
            .map(|(_, body)| body.matches("\"status\":\"queued\"").count())
            .sum();
        assert_eq!(queued_rows, 1, "duplicate submit must not re-queue");
    }
}
