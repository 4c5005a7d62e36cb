//! Batched writer between the parse workers and ClickHouse.
//!
//! Rows accumulate until the batch size or flush interval is hit. A failed
//! flush throttles intake and retries with backoff so parse workers apply
//! backpressure instead of dropping rows; a final drain runs at shutdown.

use crate::model::{Metrics, SinkMessage};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use talus_clickhouse::ClickHouseClient;
use talus_config::IngestConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub(crate) fn spawn_sink_task(
    cfg: IngestConfig,
    clickhouse: ClickHouseClient,
    metrics: Arc<Metrics>,
    mut rx: mpsc::Receiver<SinkMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut event_rows = Vec::<Value>::new();
        let mut session_rows = Vec::<Value>::new();
        let mut file_rows = Vec::<Value>::new();

        let flush_interval = Duration::from_secs_f64(cfg.flush_interval_seconds.max(0.05));
        let retry_backoff = Duration::from_secs_f64((cfg.flush_interval_seconds * 2.0).max(0.25));
        let mut flush_tick = tokio::time::interval(flush_interval);
        let mut throttling_flush_retries = false;

        loop {
            if throttling_flush_retries
                && has_pending_data(&event_rows, &session_rows, &file_rows)
            {
                if flush_pending(
                    &clickhouse,
                    &metrics,
                    &mut event_rows,
                    &mut session_rows,
                    &mut file_rows,
                )
                .await
                {
                    throttling_flush_retries = false;
                    info!("flush retry succeeded; resuming sink intake");
                } else {
                    tokio::time::sleep(retry_backoff).await;
                }
                continue;
            }

            tokio::select! {
                maybe_msg = rx.recv() => {
                    match maybe_msg {
                        Some(SinkMessage::Batch(batch)) => {
                            event_rows.extend(batch.event_rows);
                            session_rows.extend(batch.session_rows);
                            file_rows.extend(batch.file_rows);

                            let total = event_rows.len() + session_rows.len() + file_rows.len();
                            if total >= cfg.batch_size
                                && !flush_pending(
                                    &clickhouse,
                                    &metrics,
                                    &mut event_rows,
                                    &mut session_rows,
                                    &mut file_rows,
                                )
                                .await
                            {
                                if !throttling_flush_retries {
                                    warn!(
                                        "flush failed; pausing sink intake and retrying every {} ms",
                                        retry_backoff.as_millis()
                                    );
                                }
                                throttling_flush_retries = true;
                            }
                        }
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    if has_pending_data(&event_rows, &session_rows, &file_rows)
                        && !flush_pending(
                            &clickhouse,
                            &metrics,
                            &mut event_rows,
                            &mut session_rows,
                            &mut file_rows,
                        )
                        .await
                    {
                        if !throttling_flush_retries {
                            warn!(
                                "flush failed; pausing sink intake and retrying every {} ms",
                                retry_backoff.as_millis()
                            );
                        }
                        throttling_flush_retries = true;
                    }
                }
            }
        }

        if has_pending_data(&event_rows, &session_rows, &file_rows) {
            flush_pending(
                &clickhouse,
                &metrics,
                &mut event_rows,
                &mut session_rows,
                &mut file_rows,
            )
            .await;
        }
    })
}

fn has_pending_data(event_rows: &[Value], session_rows: &[Value], file_rows: &[Value]) -> bool {
    !(event_rows.is_empty() && session_rows.is_empty() && file_rows.is_empty())
}

async fn flush_pending(
    clickhouse: &ClickHouseClient,
    metrics: &Arc<Metrics>,
    event_rows: &mut Vec<Value>,
    session_rows: &mut Vec<Value>,
    file_rows: &mut Vec<Value>,
) -> bool {
    let started = Instant::now();

    // File-status rows land last so a reader that sees `parsed` can already
    // see the events behind it.
    let flush_result = async {
        clickhouse.insert_rows("log_events", event_rows).await?;
        clickhouse
            .insert_rows("device_sessions", session_rows)
            .await?;
        clickhouse.insert_rows("log_files", file_rows).await?;
        anyhow::Result::<()>::Ok(())
    }
    .await;

    match flush_result {
        Ok(()) => {
            metrics
                .event_rows_written
                .fetch_add(event_rows.len() as u64, Ordering::Relaxed);
            metrics
                .last_flush_ms
                .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);

            event_rows.clear();
            session_rows.clear();
            file_rows.clear();
            true
        }
        Err(exc) => {
            metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
            *metrics
                .last_error
                .lock()
                .expect("metrics last_error mutex poisoned") = exc.to_string();
            warn!("flush failed: {exc}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RowBatch;
    use serde_json::json;
    use talus_config::ClickHouseConfig;
    use tokio::time::timeout;

    fn single_row_batch(id: u64) -> SinkMessage {
        let mut batch = RowBatch::default();
        batch.event_rows.push(json!({ "event_id": id }));
        SinkMessage::Batch(batch)
    }

    #[tokio::test]
    async fn failed_flush_throttles_sink_consumption() {
        let ch_cfg = ClickHouseConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout_seconds: 1.0,
            ..ClickHouseConfig::default()
        };
        let ingest_cfg = IngestConfig {
            batch_size: 1,
            flush_interval_seconds: 0.05,
            ..IngestConfig::default()
        };

        let clickhouse =
            ClickHouseClient::new(ch_cfg).expect("clickhouse client should initialize");
        let metrics = Arc::new(Metrics::default());
        let (tx, rx) = mpsc::channel(1);

        let handle = spawn_sink_task(ingest_cfg, clickhouse, metrics, rx);

        tx.send(single_row_batch(1))
            .await
            .expect("first send should succeed");
        tx.send(single_row_batch(2))
            .await
            .expect("second send should succeed");

        let third_send = timeout(Duration::from_millis(350), tx.send(single_row_batch(3))).await;
        assert!(
            third_send.is_err(),
            "third send should block while sink retries failed flushes"
        );

        handle.abort();
    }
}
