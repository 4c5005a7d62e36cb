mod cli;

use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use talus_clickhouse::ClickHouseClient;
use talus_events::{ClickHouseEventRepository, EventRepository, RepoConfig};
use talus_ingest_core::IngestService;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = cli::parse_args();
    let config = talus_config::load_config(&args.config_path)
        .with_context(|| format!("failed to load config {}", args.config_path.display()))?;

    let clickhouse = ClickHouseClient::new(config.clickhouse.clone())?;
    clickhouse.ping().await.context("clickhouse ping failed")?;
    let executed = clickhouse.migrate().await?;
    if !executed.is_empty() {
        info!("applied migrations: {}", executed.join(", "));
    }

    let repo: Arc<dyn EventRepository> = Arc::new(ClickHouseEventRepository::new(
        clickhouse.clone(),
        RepoConfig {
            max_results: config.analysis.max_results,
            default_context_before: config.analysis.default_context_before,
            default_context_after: config.analysis.default_context_after,
            ..RepoConfig::default()
        },
    ));

    let (service, handles) = IngestService::start(&config, clickhouse, repo)?;

    for path in &args.files {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let receipt = service
            .submit(&args.project_id, &file_name, bytes)
            .await
            .with_context(|| format!("failed to enqueue {}", path.display()))?;
        info!(
            "queued {} as {} ({})",
            path.display(),
            receipt.file_id,
            receipt.status.as_str()
        );
    }

    let metrics = service.metrics();
    service.shutdown(handles).await?;

    info!(
        "done: {} parsed, {} failed, {} event rows written",
        metrics.files_parsed.load(Ordering::Relaxed),
        metrics.files_failed.load(Ordering::Relaxed),
        metrics.event_rows_written.load(Ordering::Relaxed),
    );

    Ok(())
}
