use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickHouseConfig {
    #[serde(default = "default_ch_url")]
    pub url: String,
    #[serde(default = "default_ch_database")]
    pub database: String,
    #[serde(default = "default_ch_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "default_true")]
    pub async_insert: bool,
    #[serde(default = "default_true")]
    pub wait_for_async_insert: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    /// Hard ceiling on a single uploaded buffer, in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_max_file_workers")]
    pub max_file_workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: f64,
}

/// Key material for the encrypted on-device container. Hex-encoded in the
/// deployment config, never read from the uploaded file itself.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    #[serde(default)]
    pub key_hex: String,
    #[serde(default)]
    pub iv_hex: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_results")]
    pub max_results: u16,
    #[serde(default = "default_context_before")]
    pub default_context_before: u16,
    #[serde(default = "default_context_after")]
    pub default_context_after: u16,
    #[serde(default = "default_disconnect_threshold")]
    pub disconnect_threshold: usize,
    #[serde(default = "default_error_burst_threshold")]
    pub error_burst_threshold: usize,
    #[serde(default = "default_ack_timeout_threshold")]
    pub ack_timeout_threshold: usize,
    #[serde(default = "default_auth_failure_threshold")]
    pub auth_failure_threshold: usize,
    #[serde(default = "default_max_chains")]
    pub max_chains: usize,
    #[serde(default = "default_max_chain_events")]
    pub max_chain_events: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_ch_url(),
            database: default_ch_database(),
            username: default_ch_username(),
            password: String::new(),
            timeout_seconds: default_timeout_seconds(),
            async_insert: true,
            wait_for_async_insert: true,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            max_file_workers: default_max_file_workers(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_seconds: default_flush_interval_seconds(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            default_context_before: default_context_before(),
            default_context_after: default_context_after(),
            disconnect_threshold: default_disconnect_threshold(),
            error_burst_threshold: default_error_burst_threshold(),
            ack_timeout_threshold: default_ack_timeout_threshold(),
            auth_failure_threshold: default_auth_failure_threshold(),
            max_chains: default_max_chains(),
            max_chain_events: default_max_chain_events(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            clickhouse: ClickHouseConfig::default(),
            ingest: IngestConfig::default(),
            decoder: DecoderConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

/// Worker-pool bound above which a config value is clamped.
pub const MAX_FILE_WORKERS_CEILING: usize = 50;

fn default_ch_url() -> String {
    "http://127.0.0.1:8123".to_string()
}

fn default_ch_database() -> String {
    "talus".to_string()
}

fn default_ch_username() -> String {
    "default".to_string()
}

fn default_timeout_seconds() -> f64 {
    30.0
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_max_file_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

fn default_batch_size() -> usize {
    4000
}

fn default_flush_interval_seconds() -> f64 {
    0.5
}

fn default_max_results() -> u16 {
    100
}

fn default_context_before() -> u16 {
    5
}

fn default_context_after() -> u16 {
    5
}

fn default_disconnect_threshold() -> usize {
    5
}

fn default_error_burst_threshold() -> usize {
    10
}

fn default_ack_timeout_threshold() -> usize {
    3
}

fn default_auth_failure_threshold() -> usize {
    3
}

fn default_max_chains() -> usize {
    50
}

fn default_max_chain_events() -> usize {
    200
}

fn default_true() -> bool {
    true
}

fn home_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".talus").join("config.toml"))
}

fn repo_default_config_path() -> PathBuf {
    PathBuf::from("config/talus.toml")
}

fn resolve_config_path_with_overrides(
    raw_path: Option<PathBuf>,
    env_keys: &[&str],
    home_path: Option<PathBuf>,
    repo_default: PathBuf,
) -> PathBuf {
    if let Some(path) = raw_path {
        return path;
    }

    for key in env_keys {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
    }

    if let Some(path) = home_path {
        if path.exists() {
            return path;
        }
    }

    if repo_default.exists() {
        return repo_default;
    }

    home_config_path().unwrap_or(repo_default)
}

pub fn resolve_config_path(raw_path: Option<PathBuf>) -> PathBuf {
    resolve_config_path_with_overrides(
        raw_path,
        &["TALUS_CONFIG"],
        home_config_path(),
        repo_default_config_path(),
    )
}

fn normalize_config(mut cfg: AppConfig) -> AppConfig {
    cfg.ingest.max_file_workers = cfg
        .ingest
        .max_file_workers
        .clamp(1, MAX_FILE_WORKERS_CEILING);
    cfg.ingest.queue_capacity = cfg.ingest.queue_capacity.max(1);
    cfg.ingest.batch_size = cfg.ingest.batch_size.max(1);
    cfg
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
    let cfg: AppConfig = toml::from_str(&content).context("failed to parse TOML config")?;
    Ok(normalize_config(cfg))
}
