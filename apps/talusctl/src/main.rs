use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use talus_analysis::snapshot::SnapshotService;
use talus_analysis::AnalysisService;
use talus_clickhouse::ClickHouseClient;
use talus_config::AppConfig;
use talus_events::{
    ClickHouseEventRepository, EventRepository, KnownIssueRepository, RepoConfig,
    SnapshotRepository,
};
use tracing_subscriber::EnvFilter;

fn usage() {
    eprintln!(
        "usage:
  talusctl db migrate [--config <path>]
  talusctl db doctor [--config <path>]
  talusctl files <project> [--config <path>]
  talusctl sessions <project> [--from <ms>] [--to <ms>] [--refresh] [--config <path>]
  talusctl issues <project> [--config <path>]
  talusctl snapshots recompute <file-id>... [--config <path>]"
    );
}

struct CommonArgs {
    config_path: PathBuf,
    positional: Vec<String>,
    from_ms: Option<i64>,
    to_ms: Option<i64>,
    refresh: bool,
}

fn parse_common(mut args: impl Iterator<Item = String>) -> Result<CommonArgs> {
    let mut config_path: Option<PathBuf> = None;
    let mut positional = Vec::new();
    let mut from_ms = None;
    let mut to_ms = None;
    let mut refresh = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().context("--config requires a value")?;
                config_path = Some(PathBuf::from(value));
            }
            "--from" => {
                let value = args.next().context("--from requires a value")?;
                from_ms = Some(value.parse::<i64>().context("--from must be epoch millis")?);
            }
            "--to" => {
                let value = args.next().context("--to requires a value")?;
                to_ms = Some(value.parse::<i64>().context("--to must be epoch millis")?);
            }
            "--refresh" => refresh = true,
            other => positional.push(other.to_string()),
        }
    }

    Ok(CommonArgs {
        config_path: talus_config::resolve_config_path(config_path),
        positional,
        from_ms,
        to_ms,
        refresh,
    })
}

fn load(config_path: &PathBuf) -> Result<(AppConfig, ClickHouseClient)> {
    let config = talus_config::load_config(config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    let clickhouse = ClickHouseClient::new(config.clickhouse.clone())?;
    Ok((config, clickhouse))
}

fn repository(config: &AppConfig, clickhouse: &ClickHouseClient) -> ClickHouseEventRepository {
    ClickHouseEventRepository::new(
        clickhouse.clone(),
        RepoConfig {
            max_results: config.analysis.max_results,
            default_context_before: config.analysis.default_context_before,
            default_context_after: config.analysis.default_context_after,
            ..RepoConfig::default()
        },
    )
}

async fn cmd_db(common: CommonArgs) -> Result<()> {
    let action = common
        .positional
        .first()
        .context("db requires an action: migrate | doctor")?;
    let (_config, clickhouse) = load(&common.config_path)?;

    match action.as_str() {
        "migrate" => {
            let executed = clickhouse.migrate().await?;
            if executed.is_empty() {
                println!("migrations already up to date");
            } else {
                println!("applied migrations: {}", executed.join(", "));
            }
        }
        "doctor" => {
            let report = clickhouse.health_report().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        other => bail!("unknown db action: {other}"),
    }

    Ok(())
}

async fn cmd_files(common: CommonArgs) -> Result<()> {
    let project = common
        .positional
        .first()
        .context("files requires a project id")?;
    let (config, clickhouse) = load(&common.config_path)?;
    let repo = repository(&config, &clickhouse);

    let files = repo.list_files(project).await?;
    if files.is_empty() {
        println!("no files for project {project}");
        return Ok(());
    }

    for file in files {
        println!(
            "{}  {:<8} events={} errors={} invalid={} {}",
            file.file_id,
            file.status.as_str(),
            file.event_count,
            file.error_count,
            file.invalid_lines,
            file.file_name,
        );
        if !file.failure.is_empty() {
            println!("    failure: {}", file.failure);
        }
    }

    Ok(())
}

async fn cmd_sessions(common: CommonArgs) -> Result<()> {
    let project = common
        .positional
        .first()
        .context("sessions requires a project id")?;
    let (config, clickhouse) = load(&common.config_path)?;
    let repo = Arc::new(repository(&config, &clickhouse));

    let sessions = if common.refresh {
        let from_ms = common.from_ms.unwrap_or(0);
        let to_ms = common.to_ms.unwrap_or(i64::MAX);
        let service =
            AnalysisService::new(repo.clone() as Arc<dyn EventRepository>, config.analysis);
        service
            .refresh_sessions_in_window(project, from_ms, to_ms)
            .await?
    } else {
        repo.list_sessions(project, common.from_ms, common.to_ms, None)
            .await?
    };

    if sessions.is_empty() {
        println!("no sessions for project {project}");
        return Ok(());
    }

    for session in sessions {
        println!(
            "{}  {:<10} mac={} events={} errors={} commands={} duration={}ms",
            session.link_code,
            session.status.as_str(),
            session.device_mac.as_deref().unwrap_or("-"),
            session.event_count,
            session.error_count,
            session.command_count,
            session
                .duration_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    Ok(())
}

async fn cmd_issues(common: CommonArgs) -> Result<()> {
    let project = common
        .positional
        .first()
        .context("issues requires a project id")?;
    let (config, clickhouse) = load(&common.config_path)?;
    let repo = repository(&config, &clickhouse);

    let issues = repo.list_active(project).await?;
    let hit_counts = repo.hit_counts(project).await?;

    if issues.is_empty() {
        println!("no active issues for project {project}");
        return Ok(());
    }

    for issue in issues {
        let hits = hit_counts
            .iter()
            .find(|h| h.issue_id == issue.issue_id)
            .map(|h| h.hits)
            .unwrap_or(0);
        println!(
            "{}  sev={} hits={} [{}] {}",
            issue.issue_id, issue.severity, hits, issue.category, issue.title,
        );
    }

    Ok(())
}

async fn cmd_snapshots(common: CommonArgs) -> Result<()> {
    let action = common
        .positional
        .first()
        .context("snapshots requires an action: recompute")?;
    if action != "recompute" {
        bail!("unknown snapshots action: {action}");
    }
    let file_ids: Vec<String> = common.positional[1..].to_vec();
    if file_ids.is_empty() {
        bail!("snapshots recompute requires at least one file id");
    }

    let (config, clickhouse) = load(&common.config_path)?;
    let repo = Arc::new(repository(&config, &clickhouse));
    let service = SnapshotService::new(
        repo.clone() as Arc<dyn EventRepository>,
        repo as Arc<dyn SnapshotRepository>,
    );

    for file_id in file_ids {
        let snapshot = service.recompute(&file_id).await?;
        println!(
            "recomputed {} at template version {}",
            snapshot.file_id, snapshot.template_version
        );
    }

    Ok(())
}

async fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        usage();
        bail!("a command is required");
    };

    let common = parse_common(args)?;

    match command.as_str() {
        "db" => cmd_db(common).await,
        "files" => cmd_files(common).await,
        "sessions" => cmd_sessions(common).await,
        "issues" => cmd_issues(common).await,
        "snapshots" => cmd_snapshots(common).await,
        "-h" | "--help" | "help" => {
            usage();
            Ok(())
        }
        other => {
            usage();
            bail!("unknown command: {other}")
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
