use anyhow::Result as AnyResult;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use talus_clickhouse::ClickHouseClient;

use crate::cursor::{decode_cursor, encode_cursor, EventCursor};
use crate::domain::{
    AnalysisSnapshot, ContextEvent, DeviceSession, EventContext, EventContextRequest,
    EventSearchFilter, IssueHitCount, KnownIssue, LogEvent, LogFileStatus, LogFileSummary, Page,
    PageRequest, RepoConfig, SessionMilestones, SessionStatus, TrackingFields,
};
use crate::error::{RepoError, RepoResult};
use crate::repo::{EventRepository, KnownIssueRepository, SnapshotRepository};

const EVENT_COLUMNS: &str = "\
event_id, file_id, project_id, \
toUInt64(line_no) AS line_no, \
toInt64(timestamp_ms) AS timestamp_ms, \
toUInt8(level) AS level, \
event_name, payload_json, raw_line, \
device_sn, device_mac, link_code, request_id, attempt_id, \
error_code, reason_code, stage, op, result";

const SESSION_COLUMNS: &str = "\
project_id, link_code, device_mac, status, \
start_ms, end_ms, duration_ms, \
toUInt64(event_count) AS event_count, \
toUInt64(error_count) AS error_count, \
toUInt64(command_count) AS command_count, \
scan_start_ms, pair_start_ms, connect_start_ms, auth_ok_ms, ready_ok_ms, \
connected_ms, get_data_start_ms, history_done_ms, publish_start_ms, \
publish_ok_ms, ack_ok_ms, disconnect_ms";

#[derive(Clone)]
pub struct ClickHouseEventRepository {
    ch: ClickHouseClient,
    cfg: RepoConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct EventRow {
    event_id: String,
    file_id: String,
    project_id: String,
    line_no: u64,
    timestamp_ms: i64,
    level: u8,
    event_name: String,
    payload_json: String,
    raw_line: String,
    device_sn: String,
    device_mac: String,
    link_code: String,
    request_id: String,
    attempt_id: String,
    error_code: String,
    reason_code: String,
    stage: String,
    op: String,
    result: String,
}

#[derive(Debug, Clone, Deserialize)]
struct FileRow {
    file_id: String,
    project_id: String,
    file_name: String,
    size_bytes: u64,
    status: String,
    event_count: u64,
    error_count: u64,
    invalid_lines: u64,
    failure: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionRow {
    project_id: String,
    link_code: String,
    device_mac: String,
    status: String,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    duration_ms: Option<i64>,
    event_count: u64,
    error_count: u64,
    command_count: u64,
    scan_start_ms: Option<i64>,
    pair_start_ms: Option<i64>,
    connect_start_ms: Option<i64>,
    auth_ok_ms: Option<i64>,
    ready_ok_ms: Option<i64>,
    connected_ms: Option<i64>,
    get_data_start_ms: Option<i64>,
    history_done_ms: Option<i64>,
    publish_start_ms: Option<i64>,
    publish_ok_ms: Option<i64>,
    ack_ok_ms: Option<i64>,
    disconnect_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct IssueRow {
    issue_id: String,
    project_id: String,
    title: String,
    description: String,
    solution: String,
    category: String,
    severity: u8,
    error_code: String,
    event_pattern: String,
    msg_pattern: String,
    is_active: u8,
}

#[derive(Debug, Deserialize)]
struct HitRow {
    issue_id: String,
    hits: u64,
}

#[derive(Debug, Deserialize)]
struct SnapshotRow {
    file_id: String,
    template_version: u32,
    artifacts_json: String,
}

#[derive(Debug, Deserialize)]
struct LinkCodeRow {
    link_code: String,
}

#[derive(Debug, Deserialize)]
struct TargetRow {
    project_id: String,
    timestamp_ms: i64,
}

impl ClickHouseEventRepository {
    pub fn new(ch: ClickHouseClient, cfg: RepoConfig) -> Self {
        Self { ch, cfg }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.cfg
    }

    fn table_ref(&self, table: &str) -> String {
        format!(
            "{}.{}",
            talus_clickhouse::sql_ident(&self.ch.config().database),
            talus_clickhouse::sql_ident(table)
        )
    }

    fn map_backend<T>(&self, result: AnyResult<T>) -> RepoResult<T> {
        result.map_err(|err| RepoError::storage(err.to_string()))
    }

    fn validate_project_id(project_id: &str) -> RepoResult<()> {
        if project_id.trim().is_empty() {
            return Err(RepoError::invalid_field("project_id", "cannot be empty"));
        }
        Ok(())
    }

    fn validate_time_bounds(from_ms: Option<i64>, to_ms: Option<i64>) -> RepoResult<()> {
        if let (Some(from), Some(to)) = (from_ms, to_ms) {
            if to < from {
                return Err(RepoError::invalid_field(
                    "time_range",
                    format!("end {to} precedes start {from}"),
                ));
            }
        }
        Ok(())
    }

    fn validate_id(field: &'static str, id: &str) -> RepoResult<()> {
        if id.trim().is_empty() {
            return Err(RepoError::invalid_field(field, "cannot be empty"));
        }
        if id.len() > 256 {
            return Err(RepoError::invalid_field(field, "exceeds 256 characters"));
        }
        Ok(())
    }

    async fn query_events(&self, query: &str) -> RepoResult<Vec<LogEvent>> {
        let rows: Vec<EventRow> = self.map_backend(self.ch.query_rows(query).await)?;
        Ok(rows.into_iter().map(map_event_row).collect())
    }
}

fn opt_col(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn map_event_row(row: EventRow) -> LogEvent {
    LogEvent {
        event_id: row.event_id,
        file_id: row.file_id,
        project_id: row.project_id,
        line_no: row.line_no,
        timestamp_ms: row.timestamp_ms,
        level: row.level,
        event_name: row.event_name,
        payload_json: row.payload_json,
        raw_line: row.raw_line,
        tracking: TrackingFields {
            device_sn: opt_col(row.device_sn),
            device_mac: opt_col(row.device_mac),
            link_code: opt_col(row.link_code),
            request_id: opt_col(row.request_id),
            attempt_id: opt_col(row.attempt_id),
            error_code: opt_col(row.error_code),
            reason_code: opt_col(row.reason_code),
            stage: opt_col(row.stage),
            op: opt_col(row.op),
            result: opt_col(row.result),
        },
    }
}

fn map_file_row(row: FileRow) -> LogFileSummary {
    LogFileSummary {
        status: LogFileStatus::parse(&row.status).unwrap_or(LogFileStatus::Failed),
        file_id: row.file_id,
        project_id: row.project_id,
        file_name: row.file_name,
        size_bytes: row.size_bytes,
        event_count: row.event_count,
        error_count: row.error_count,
        invalid_lines: row.invalid_lines,
        failure: row.failure,
    }
}

fn map_session_row(row: SessionRow) -> DeviceSession {
    DeviceSession {
        status: SessionStatus::parse(&row.status).unwrap_or(SessionStatus::Incomplete),
        project_id: row.project_id,
        link_code: row.link_code,
        device_mac: opt_col(row.device_mac),
        start_ms: row.start_ms,
        end_ms: row.end_ms,
        duration_ms: row.duration_ms,
        event_count: row.event_count,
        error_count: row.error_count,
        command_count: row.command_count,
        milestones: SessionMilestones {
            scan_start_ms: row.scan_start_ms,
            pair_start_ms: row.pair_start_ms,
            connect_start_ms: row.connect_start_ms,
            auth_ok_ms: row.auth_ok_ms,
            ready_ok_ms: row.ready_ok_ms,
            connected_ms: row.connected_ms,
            get_data_start_ms: row.get_data_start_ms,
            history_done_ms: row.history_done_ms,
            publish_start_ms: row.publish_start_ms,
            publish_ok_ms: row.publish_ok_ms,
            ack_ok_ms: row.ack_ok_ms,
            disconnect_ms: row.disconnect_ms,
        },
    }
}

fn map_issue_row(row: IssueRow) -> KnownIssue {
    KnownIssue {
        issue_id: row.issue_id,
        project_id: row.project_id,
        title: row.title,
        description: row.description,
        solution: row.solution,
        category: row.category,
        severity: row.severity,
        error_code: opt_col(row.error_code),
        event_pattern: opt_col(row.event_pattern),
        msg_pattern: opt_col(row.msg_pattern),
        is_active: row.is_active == 1,
    }
}

/// WHERE clauses for an event search, cursor clause included. Split out so
/// the filter-to-SQL mapping is testable without a backend.
fn search_where_clauses(filter: &EventSearchFilter, cursor: Option<&EventCursor>) -> Vec<String> {
    let mut clauses = vec![format!("project_id = {}", sql_quote(&filter.project_id))];

    if let Some(from_ms) = filter.from_ms {
        clauses.push(format!("timestamp_ms >= {from_ms}"));
    }
    if let Some(to_ms) = filter.to_ms {
        clauses.push(format!("timestamp_ms < {to_ms}"));
    }
    if let Some(min_level) = filter.min_level {
        clauses.push(format!("level >= {min_level}"));
    }
    if let Some(event_name) = filter.event_name.as_deref() {
        clauses.push(format!("event_name = {}", sql_quote(event_name)));
    }

    for (column, value) in [
        ("link_code", filter.link_code.as_deref()),
        ("device_mac", filter.device_mac.as_deref()),
        ("device_sn", filter.device_sn.as_deref()),
        ("request_id", filter.request_id.as_deref()),
        ("error_code", filter.error_code.as_deref()),
    ] {
        if let Some(value) = value {
            clauses.push(format!("{column} = {}", sql_quote(value)));
        }
    }

    if let Some(needle) = filter.contains.as_deref() {
        let quoted = sql_quote(needle);
        clauses.push(format!(
            "(positionCaseInsensitive(raw_line, {quoted}) > 0 \
             OR positionCaseInsensitive(payload_json, {quoted}) > 0)"
        ));
    }

    if let Some(cursor) = cursor {
        clauses.push(format!(
            "(timestamp_ms > {ts} OR (timestamp_ms = {ts} AND event_id > {id}))",
            ts = cursor.last_timestamp_ms,
            id = sql_quote(&cursor.last_event_id)
        ));
    }

    clauses
}

#[async_trait]
impl EventRepository for ClickHouseEventRepository {
    async fn search_events(
        &self,
        filter: EventSearchFilter,
        page: PageRequest,
    ) -> RepoResult<Page<LogEvent>> {
        Self::validate_project_id(&filter.project_id)?;
        Self::validate_time_bounds(filter.from_ms, filter.to_ms)?;

        let limit = page.normalized_limit(self.cfg.max_results);
        let filter_sig = filter.signature();

        let cursor = if let Some(token) = page.cursor.as_deref() {
            let cursor: EventCursor = decode_cursor(token)?;
            if cursor.filter_sig != filter_sig {
                return Err(RepoError::bad_cursor(
                    "cursor does not match current search filter",
                ));
            }
            Some(cursor)
        } else {
            None
        };

        let where_sql = search_where_clauses(&filter, cursor.as_ref()).join("\n  AND ");
        let query = format!(
            "SELECT {EVENT_COLUMNS}
FROM {events} FINAL
WHERE {where_sql}
ORDER BY timestamp_ms ASC, event_id ASC
LIMIT {limit_plus}
FORMAT JSONEachRow",
            events = self.table_ref("log_events"),
            limit_plus = (limit as usize) + 1,
        );

        let rows: Vec<EventRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        let items: Vec<LogEvent> = rows
            .iter()
            .take(limit as usize)
            .cloned()
            .map(map_event_row)
            .collect();

        let next_cursor = if rows.len() > limit as usize {
            items
                .last()
                .map(|last| {
                    encode_cursor(&EventCursor {
                        last_timestamp_ms: last.timestamp_ms,
                        last_event_id: last.event_id.clone(),
                        filter_sig,
                    })
                })
                .transpose()?
        } else {
            None
        };

        Ok(Page { items, next_cursor })
    }

    async fn open_event(&self, req: EventContextRequest) -> RepoResult<EventContext> {
        let event_id = req.event_id.trim();
        Self::validate_id("event_id", event_id)?;

        let before = req.before.unwrap_or(self.cfg.default_context_before);
        let after = req.after.unwrap_or(self.cfg.default_context_after);
        let events_table = self.table_ref("log_events");

        let target_query = format!(
            "SELECT project_id, toInt64(timestamp_ms) AS timestamp_ms \
             FROM {events_table} FINAL WHERE event_id = {} LIMIT 1 FORMAT JSONEachRow",
            sql_quote(event_id)
        );
        let targets: Vec<TargetRow> =
            self.map_backend(self.ch.query_rows(&target_query).await)?;
        let Some(target) = targets.first() else {
            return Ok(EventContext {
                found: false,
                event_id: event_id.to_string(),
                project_id: String::new(),
                target_timestamp_ms: 0,
                before,
                after,
                events: Vec::new(),
            });
        };

        let project = sql_quote(&target.project_id);
        let ts = target.timestamp_ms;
        let id = sql_quote(event_id);

        let before_query = format!(
            "SELECT {EVENT_COLUMNS}
FROM {events_table} FINAL
WHERE project_id = {project}
  AND (timestamp_ms < {ts} OR (timestamp_ms = {ts} AND event_id < {id}))
ORDER BY timestamp_ms DESC, event_id DESC
LIMIT {before}
FORMAT JSONEachRow"
        );
        let after_query = format!(
            "SELECT {EVENT_COLUMNS}
FROM {events_table} FINAL
WHERE project_id = {project}
  AND (timestamp_ms > {ts} OR (timestamp_ms = {ts} AND event_id >= {id}))
ORDER BY timestamp_ms ASC, event_id ASC
LIMIT {after_plus}
FORMAT JSONEachRow",
            after_plus = (after as usize) + 1,
        );

        let mut earlier = self.query_events(&before_query).await?;
        earlier.reverse();
        let later = self.query_events(&after_query).await?;

        let events: Vec<ContextEvent> = earlier
            .into_iter()
            .chain(later)
            .map(|event| ContextEvent {
                is_target: event.event_id == event_id,
                event,
            })
            .collect();

        Ok(EventContext {
            found: true,
            event_id: event_id.to_string(),
            project_id: target.project_id.clone(),
            target_timestamp_ms: ts,
            before,
            after,
            events,
        })
    }

    async fn list_files(&self, project_id: &str) -> RepoResult<Vec<LogFileSummary>> {
        Self::validate_project_id(project_id)?;

        let query = format!(
            "SELECT file_id, project_id, file_name, \
             toUInt64(size_bytes) AS size_bytes, status, \
             toUInt64(event_count) AS event_count, \
             toUInt64(error_count) AS error_count, \
             toUInt64(invalid_lines) AS invalid_lines, failure
FROM {files} FINAL
WHERE project_id = {project}
ORDER BY updated_at DESC
FORMAT JSONEachRow",
            files = self.table_ref("log_files"),
            project = sql_quote(project_id),
        );

        let rows: Vec<FileRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        Ok(rows.into_iter().map(map_file_row).collect())
    }

    async fn get_file(&self, file_id: &str) -> RepoResult<Option<LogFileSummary>> {
        Self::validate_id("file_id", file_id)?;

        let query = format!(
            "SELECT file_id, project_id, file_name, \
             toUInt64(size_bytes) AS size_bytes, status, \
             toUInt64(event_count) AS event_count, \
             toUInt64(error_count) AS error_count, \
             toUInt64(invalid_lines) AS invalid_lines, failure
FROM {files} FINAL
WHERE file_id = {id}
LIMIT 1
FORMAT JSONEachRow",
            files = self.table_ref("log_files"),
            id = sql_quote(file_id),
        );

        let rows: Vec<FileRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        Ok(rows.into_iter().next().map(map_file_row))
    }

    async fn events_for_file(&self, file_id: &str) -> RepoResult<Vec<LogEvent>> {
        Self::validate_id("file_id", file_id)?;

        let query = format!(
            "SELECT {EVENT_COLUMNS}
FROM {events} FINAL
WHERE file_id = {id}
ORDER BY timestamp_ms ASC, event_id ASC
LIMIT {cap}
FORMAT JSONEachRow",
            events = self.table_ref("log_events"),
            id = sql_quote(file_id),
            cap = self.cfg.max_window_events,
        );

        self.query_events(&query).await
    }

    async fn events_for_link_code(
        &self,
        project_id: &str,
        link_code: &str,
        from_ms: Option<i64>,
        to_ms: Option<i64>,
    ) -> RepoResult<Vec<LogEvent>> {
        Self::validate_project_id(project_id)?;
        Self::validate_id("link_code", link_code)?;
        Self::validate_time_bounds(from_ms, to_ms)?;

        let mut where_clauses = vec![
            format!("project_id = {}", sql_quote(project_id)),
            format!("link_code = {}", sql_quote(link_code)),
        ];
        if let Some(from_ms) = from_ms {
            where_clauses.push(format!("timestamp_ms >= {from_ms}"));
        }
        if let Some(to_ms) = to_ms {
            where_clauses.push(format!("timestamp_ms < {to_ms}"));
        }

        let query = format!(
            "SELECT {EVENT_COLUMNS}
FROM {events} FINAL
WHERE {where_sql}
ORDER BY timestamp_ms ASC, event_id ASC
LIMIT {cap}
FORMAT JSONEachRow",
            events = self.table_ref("log_events"),
            where_sql = where_clauses.join("\n  AND "),
            cap = self.cfg.max_window_events,
        );

        self.query_events(&query).await
    }

    async fn events_in_window(
        &self,
        project_id: &str,
        from_ms: i64,
        to_ms: i64,
        device_mac: Option<&str>,
    ) -> RepoResult<Vec<LogEvent>> {
        Self::validate_project_id(project_id)?;
        Self::validate_time_bounds(Some(from_ms), Some(to_ms))?;

        let mut where_clauses = vec![
            format!("project_id = {}", sql_quote(project_id)),
            format!("timestamp_ms >= {from_ms}"),
            format!("timestamp_ms < {to_ms}"),
        ];
        if let Some(mac) = device_mac {
            where_clauses.push(format!("device_mac = {}", sql_quote(mac)));
        }

        let query = format!(
            "SELECT {EVENT_COLUMNS}
FROM {events} FINAL
WHERE {where_sql}
ORDER BY timestamp_ms ASC, event_id ASC
LIMIT {cap}
FORMAT JSONEachRow",
            events = self.table_ref("log_events"),
            where_sql = where_clauses.join("\n  AND "),
            cap = self.cfg.max_window_events,
        );

        self.query_events(&query).await
    }

    async fn link_codes_in_window(
        &self,
        project_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> RepoResult<Vec<String>> {
        Self::validate_project_id(project_id)?;
        Self::validate_time_bounds(Some(from_ms), Some(to_ms))?;

        let query = format!(
            "SELECT DISTINCT link_code
FROM {events}
WHERE project_id = {project}
  AND timestamp_ms >= {from_ms}
  AND timestamp_ms < {to_ms}
  AND link_code != ''
ORDER BY link_code ASC
LIMIT {cap}
FORMAT JSONEachRow",
            events = self.table_ref("log_events"),
            project = sql_quote(project_id),
            cap = self.cfg.max_window_events,
        );

        let rows: Vec<LinkCodeRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        Ok(rows.into_iter().map(|row| row.link_code).collect())
    }

    async fn upsert_sessions(&self, sessions: &[DeviceSession]) -> RepoResult<()> {
        if sessions.is_empty() {
            return Ok(());
        }

        let rows: Vec<Value> = sessions.iter().map(DeviceSession::to_row).collect();
        self.map_backend(self.ch.insert_rows("device_sessions", &rows).await)
    }

    async fn get_session(
        &self,
        project_id: &str,
        link_code: &str,
    ) -> RepoResult<Option<DeviceSession>> {
        Self::validate_project_id(project_id)?;
        Self::validate_id("link_code", link_code)?;

        let query = format!(
            "SELECT {SESSION_COLUMNS}
FROM {sessions} FINAL
WHERE project_id = {project} AND link_code = {link}
LIMIT 1
FORMAT JSONEachRow",
            sessions = self.table_ref("device_sessions"),
            project = sql_quote(project_id),
            link = sql_quote(link_code),
        );

        let rows: Vec<SessionRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        Ok(rows.into_iter().next().map(map_session_row))
    }

    async fn list_sessions(
        &self,
        project_id: &str,
        from_ms: Option<i64>,
        to_ms: Option<i64>,
        device_mac: Option<&str>,
    ) -> RepoResult<Vec<DeviceSession>> {
        Self::validate_project_id(project_id)?;
        Self::validate_time_bounds(from_ms, to_ms)?;

        let mut where_clauses = vec![format!("project_id = {}", sql_quote(project_id))];
        if let Some(from_ms) = from_ms {
            where_clauses.push(format!("ifNull(end_ms, {from_ms}) >= {from_ms}"));
        }
        if let Some(to_ms) = to_ms {
            where_clauses.push(format!("ifNull(start_ms, {to_ms} - 1) < {to_ms}"));
        }
        if let Some(mac) = device_mac {
            where_clauses.push(format!("device_mac = {}", sql_quote(mac)));
        }

        let query = format!(
            "SELECT {SESSION_COLUMNS}
FROM {sessions} FINAL
WHERE {where_sql}
ORDER BY ifNull(start_ms, 0) DESC, link_code ASC
LIMIT {cap}
FORMAT JSONEachRow",
            sessions = self.table_ref("device_sessions"),
            where_sql = where_clauses.join("\n  AND "),
            cap = self.cfg.max_results,
        );

        let rows: Vec<SessionRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        Ok(rows.into_iter().map(map_session_row).collect())
    }
}

#[async_trait]
impl KnownIssueRepository for ClickHouseEventRepository {
    async fn list_active(&self, project_id: &str) -> RepoResult<Vec<KnownIssue>> {
        Self::validate_project_id(project_id)?;

        let query = format!(
            "SELECT issue_id, project_id, title, description, solution, category, \
             toUInt8(severity) AS severity, error_code, event_pattern, msg_pattern, \
             toUInt8(is_active) AS is_active
FROM {issues} FINAL
WHERE project_id = {project} AND is_active = 1
ORDER BY severity DESC, issue_id ASC
FORMAT JSONEachRow",
            issues = self.table_ref("known_issues"),
            project = sql_quote(project_id),
        );

        let rows: Vec<IssueRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        Ok(rows.into_iter().map(map_issue_row).collect())
    }

    async fn upsert(&self, issue: &KnownIssue) -> RepoResult<()> {
        Self::validate_project_id(&issue.project_id)?;
        Self::validate_id("issue_id", &issue.issue_id)?;
        if !(1..=5).contains(&issue.severity) {
            return Err(RepoError::invalid_field(
                "severity",
                format!("must be 1..=5, got {}", issue.severity),
            ));
        }

        self.map_backend(
            self.ch
                .insert_rows("known_issues", &[issue.to_row()])
                .await,
        )
    }

    async fn deactivate(&self, project_id: &str, issue_id: &str) -> RepoResult<()> {
        Self::validate_project_id(project_id)?;
        Self::validate_id("issue_id", issue_id)?;

        let query = format!(
            "SELECT issue_id, project_id, title, description, solution, category, \
             toUInt8(severity) AS severity, error_code, event_pattern, msg_pattern, \
             toUInt8(is_active) AS is_active
FROM {issues} FINAL
WHERE project_id = {project} AND issue_id = {id}
LIMIT 1
FORMAT JSONEachRow",
            issues = self.table_ref("known_issues"),
            project = sql_quote(project_id),
            id = sql_quote(issue_id),
        );

        let rows: Vec<IssueRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        let Some(row) = rows.into_iter().next() else {
            return Err(RepoError::invalid_field(
                "issue_id",
                format!("unknown issue {issue_id}"),
            ));
        };

        let mut issue = map_issue_row(row);
        issue.is_active = false;
        self.map_backend(
            self.ch
                .insert_rows("known_issues", &[issue.to_row()])
                .await,
        )
    }

    async fn record_hits(&self, project_id: &str, issue_ids: &[String]) -> RepoResult<()> {
        Self::validate_project_id(project_id)?;
        if issue_ids.is_empty() {
            return Ok(());
        }

        let rows: Vec<Value> = issue_ids
            .iter()
            .map(|issue_id| {
                serde_json::json!({
                    "project_id": project_id,
                    "issue_id": issue_id,
                    "hits": 1u64,
                })
            })
            .collect();

        self.map_backend(self.ch.insert_rows("known_issue_hits", &rows).await)
    }

    async fn hit_counts(&self, project_id: &str) -> RepoResult<Vec<IssueHitCount>> {
        Self::validate_project_id(project_id)?;

        let query = format!(
            "SELECT issue_id, toUInt64(sum(hits)) AS hits
FROM {hits}
WHERE project_id = {project}
GROUP BY issue_id
ORDER BY hits DESC, issue_id ASC
FORMAT JSONEachRow",
            hits = self.table_ref("known_issue_hits"),
            project = sql_quote(project_id),
        );

        let rows: Vec<HitRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        Ok(rows
            .into_iter()
            .map(|row| IssueHitCount {
                issue_id: row.issue_id,
                hits: row.hits,
            })
            .collect())
    }
}

#[async_trait]
impl SnapshotRepository for ClickHouseEventRepository {
    async fn load(&self, file_id: &str) -> RepoResult<Option<AnalysisSnapshot>> {
        Self::validate_id("file_id", file_id)?;

        let query = format!(
            "SELECT file_id, toUInt32(template_version) AS template_version, artifacts_json
FROM {snapshots} FINAL
WHERE file_id = {id}
LIMIT 1
FORMAT JSONEachRow",
            snapshots = self.table_ref("analysis_snapshots"),
            id = sql_quote(file_id),
        );

        let rows: Vec<SnapshotRow> = self.map_backend(self.ch.query_rows(&query).await)?;
        Ok(rows.into_iter().next().map(|row| AnalysisSnapshot {
            file_id: row.file_id,
            template_version: row.template_version,
            artifacts: serde_json::from_str(&row.artifacts_json).unwrap_or(Value::Null),
        }))
    }

    async fn store(&self, snapshot: &AnalysisSnapshot) -> RepoResult<()> {
        Self::validate_id("file_id", &snapshot.file_id)?;

        let row = serde_json::json!({
            "file_id": snapshot.file_id,
            "template_version": snapshot.template_version,
            "artifacts_json": snapshot.artifacts.to_string(),
        });

        self.map_backend(
            self.ch
                .insert_rows("analysis_snapshots", &[row])
                .await,
        )
    }
}

fn sql_quote(value: &str) -> String {
    talus_clickhouse::sql_str(value)
}
