use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Name of the synthetic marker event appended when a file parse drops
/// malformed lines, so the loss stays visible in search results.
pub const PARSER_ERROR_EVENT: &str = "PARSER_ERROR";

/// Correlation identifiers pulled out of a free-form payload. Every field is
/// optional; absence is the common case, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingFields {
    pub device_sn: Option<String>,
    pub device_mac: Option<String>,
    pub link_code: Option<String>,
    pub request_id: Option<String>,
    pub attempt_id: Option<String>,
    pub error_code: Option<String>,
    pub reason_code: Option<String>,
    pub stage: Option<String>,
    pub op: Option<String>,
    pub result: Option<String>,
}

impl TrackingFields {
    pub fn is_empty(&self) -> bool {
        self.device_sn.is_none()
            && self.device_mac.is_none()
            && self.link_code.is_none()
            && self.request_id.is_none()
            && self.attempt_id.is_none()
            && self.error_code.is_none()
            && self.reason_code.is_none()
            && self.stage.is_none()
            && self.op.is_none()
            && self.result.is_none()
    }
}

/// One decoded log line. Immutable once parsed; only bulk file deletion ever
/// removes these rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub event_id: String,
    pub file_id: String,
    pub project_id: String,
    pub line_no: u64,
    /// Device-clock milliseconds; monotonic per device, not wall-clock.
    pub timestamp_ms: i64,
    /// Ordinal severity, 1 (debug) through 4 (error).
    pub level: u8,
    pub event_name: String,
    /// Normalized payload, serialized. Opaque to storage.
    pub payload_json: String,
    pub raw_line: String,
    pub tracking: TrackingFields,
}

impl LogEvent {
    pub fn is_error(&self) -> bool {
        self.level >= 3
    }

    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.payload_json).unwrap_or(Value::Null)
    }

    /// Flat storage row. Tracking absences become empty strings so the
    /// columns stay non-nullable and cheap to filter on.
    pub fn to_row(&self) -> Value {
        fn col(value: &Option<String>) -> &str {
            value.as_deref().unwrap_or("")
        }

        json!({
            "event_id": self.event_id,
            "file_id": self.file_id,
            "project_id": self.project_id,
            "line_no": self.line_no,
            "timestamp_ms": self.timestamp_ms,
            "level": self.level,
            "event_name": self.event_name,
            "payload_json": self.payload_json,
            "raw_line": self.raw_line,
            "device_sn": col(&self.tracking.device_sn),
            "device_mac": col(&self.tracking.device_mac),
            "link_code": col(&self.tracking.link_code),
            "request_id": col(&self.tracking.request_id),
            "attempt_id": col(&self.tracking.attempt_id),
            "error_code": col(&self.tracking.error_code),
            "reason_code": col(&self.tracking.reason_code),
            "stage": col(&self.tracking.stage),
            "op": col(&self.tracking.op),
            "result": col(&self.tracking.result),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFileStatus {
    Queued,
    Parsing,
    Parsed,
    Failed,
}

impl LogFileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Parsing => "parsing",
            Self::Parsed => "parsed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "parsing" => Some(Self::Parsing),
            "parsed" => Some(Self::Parsed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFileSummary {
    pub file_id: String,
    pub project_id: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub status: LogFileStatus,
    pub event_count: u64,
    pub error_count: u64,
    pub invalid_lines: u64,
    /// Decode failure text when status is `failed`, empty otherwise.
    pub failure: String,
}

impl LogFileSummary {
    pub fn to_row(&self) -> Value {
        json!({
            "file_id": self.file_id,
            "project_id": self.project_id,
            "file_name": self.file_name,
            "size_bytes": self.size_bytes,
            "status": self.status.as_str(),
            "event_count": self.event_count,
            "error_count": self.error_count,
            "invalid_lines": self.invalid_lines,
            "failure": self.failure,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventSearchFilter {
    pub project_id: String,
    #[serde(default)]
    pub from_ms: Option<i64>,
    #[serde(default)]
    pub to_ms: Option<i64>,
    #[serde(default)]
    pub min_level: Option<u8>,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub link_code: Option<String>,
    #[serde(default)]
    pub device_mac: Option<String>,
    #[serde(default)]
    pub device_sn: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    /// Case-insensitive free-text match against the raw line and payload.
    #[serde(default)]
    pub contains: Option<String>,
}

impl EventSearchFilter {
    /// Stable identity used to pin cursors to the filter that produced them.
    pub fn signature(&self) -> String {
        fn opt(value: &Option<String>) -> &str {
            value.as_deref().unwrap_or("")
        }

        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.project_id,
            self.from_ms.unwrap_or(i64::MIN),
            self.to_ms.unwrap_or(i64::MAX),
            self.min_level.unwrap_or(0),
            opt(&self.event_name),
            opt(&self.link_code),
            opt(&self.device_mac),
            opt(&self.device_sn),
            opt(&self.request_id),
            opt(&self.error_code),
            opt(&self.contains),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default = "default_page_limit")]
    pub limit: u16,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: default_page_limit(),
            cursor: None,
        }
    }
}

impl PageRequest {
    pub fn normalized_limit(&self, max_limit: u16) -> u16 {
        self.limit.max(1).min(max_limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContextRequest {
    pub event_id: String,
    #[serde(default)]
    pub before: Option<u16>,
    #[serde(default)]
    pub after: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEvent {
    pub is_target: bool,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    pub found: bool,
    pub event_id: String,
    pub project_id: String,
    pub target_timestamp_ms: i64,
    pub before: u16,
    pub after: u16,
    pub events: Vec<ContextEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Done,
    Timeout,
    Error,
    Incomplete,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Incomplete => "incomplete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "done" => Some(Self::Done),
            "timeout" => Some(Self::Timeout),
            "error" => Some(Self::Error),
            "incomplete" => Some(Self::Incomplete),
            _ => None,
        }
    }
}

/// Absolute phase-milestone timestamps observed for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMilestones {
    pub scan_start_ms: Option<i64>,
    pub pair_start_ms: Option<i64>,
    pub connect_start_ms: Option<i64>,
    pub auth_ok_ms: Option<i64>,
    pub ready_ok_ms: Option<i64>,
    pub connected_ms: Option<i64>,
    pub get_data_start_ms: Option<i64>,
    pub history_done_ms: Option<i64>,
    pub publish_start_ms: Option<i64>,
    pub publish_ok_ms: Option<i64>,
    pub ack_ok_ms: Option<i64>,
    pub disconnect_ms: Option<i64>,
}

impl SessionMilestones {
    /// Milestones re-expressed as offsets since `connect_start_ms`, for
    /// reporting. Milestones earlier than connect (scan, pair) are omitted.
    pub fn deltas_from_connect(&self) -> Vec<(&'static str, i64)> {
        let Some(connect) = self.connect_start_ms else {
            return Vec::new();
        };

        [
            ("auth_ok", self.auth_ok_ms),
            ("ready_ok", self.ready_ok_ms),
            ("connected", self.connected_ms),
            ("get_data_start", self.get_data_start_ms),
            ("history_done", self.history_done_ms),
            ("publish_start", self.publish_start_ms),
            ("publish_ok", self.publish_ok_ms),
            ("ack_ok", self.ack_ok_ms),
            ("disconnect", self.disconnect_ms),
        ]
        .into_iter()
        .filter_map(|(name, ms)| ms.map(|ms| (name, ms - connect)))
        .collect()
    }
}

/// Materialized view over one link code's events. Fully reproducible by
/// re-folding the underlying event set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSession {
    pub project_id: String,
    pub link_code: String,
    pub device_mac: Option<String>,
    pub status: SessionStatus,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub duration_ms: Option<i64>,
    pub event_count: u64,
    pub error_count: u64,
    pub command_count: u64,
    pub milestones: SessionMilestones,
}

impl DeviceSession {
    pub fn to_row(&self) -> Value {
        json!({
            "project_id": self.project_id,
            "link_code": self.link_code,
            "device_mac": self.device_mac.as_deref().unwrap_or(""),
            "status": self.status.as_str(),
            "start_ms": self.start_ms,
            "end_ms": self.end_ms,
            "duration_ms": self.duration_ms,
            "event_count": self.event_count,
            "error_count": self.error_count,
            "command_count": self.command_count,
            "scan_start_ms": self.milestones.scan_start_ms,
            "pair_start_ms": self.milestones.pair_start_ms,
            "connect_start_ms": self.milestones.connect_start_ms,
            "auth_ok_ms": self.milestones.auth_ok_ms,
            "ready_ok_ms": self.milestones.ready_ok_ms,
            "connected_ms": self.milestones.connected_ms,
            "get_data_start_ms": self.milestones.get_data_start_ms,
            "history_done_ms": self.milestones.history_done_ms,
            "publish_start_ms": self.milestones.publish_start_ms,
            "publish_ok_ms": self.milestones.publish_ok_ms,
            "ack_ok_ms": self.milestones.ack_ok_ms,
            "disconnect_ms": self.milestones.disconnect_ms,
        })
    }
}

/// Support-curated diagnosis rule. Deactivated by staff, never deleted by
/// the matching engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownIssue {
    pub issue_id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub solution: String,
    pub category: String,
    /// 1 (cosmetic) through 5 (critical).
    pub severity: u8,
    pub error_code: Option<String>,
    pub event_pattern: Option<String>,
    pub msg_pattern: Option<String>,
    pub is_active: bool,
}

impl KnownIssue {
    pub fn to_row(&self) -> Value {
        json!({
            "issue_id": self.issue_id,
            "project_id": self.project_id,
            "title": self.title,
            "description": self.description,
            "solution": self.solution,
            "category": self.category,
            "severity": self.severity,
            "error_code": self.error_code.as_deref().unwrap_or(""),
            "event_pattern": self.event_pattern.as_deref().unwrap_or(""),
            "msg_pattern": self.msg_pattern.as_deref().unwrap_or(""),
            "is_active": if self.is_active { 1u8 } else { 0u8 },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueHitCount {
    pub issue_id: String,
    pub hits: u64,
}

/// Versioned derived-artifact bundle for one log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub file_id: String,
    pub template_version: u32,
    /// Named sub-artifacts (main flow, event coverage, quality report).
    pub artifacts: Value,
}

impl AnalysisSnapshot {
    pub fn is_stale(&self, current_version: u32) -> bool {
        self.template_version < current_version
    }
}

fn default_page_limit() -> u16 {
    50
}

/// Tunables for the read repository.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub max_results: u16,
    pub default_context_before: u16,
    pub default_context_after: u16,
    /// Row cap for window fetches feeding reconstruction and anomaly scans.
    pub max_window_events: usize,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            max_results: 100,
            default_context_before: 5,
            default_context_after: 5,
            max_window_events: 200_000,
        }
    }
}
