use async_trait::async_trait;

use crate::domain::{
    AnalysisSnapshot, DeviceSession, EventContext, EventContextRequest, EventSearchFilter,
    IssueHitCount, KnownIssue, LogEvent, LogFileSummary, Page, PageRequest,
};
use crate::error::RepoResult;

/// Read-mostly surface over persisted log events plus the derived-session
/// upsert the reconstructors feed.
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn search_events(
        &self,
        filter: EventSearchFilter,
        page: PageRequest,
    ) -> RepoResult<Page<LogEvent>>;

    async fn open_event(&self, req: EventContextRequest) -> RepoResult<EventContext>;

    async fn list_files(&self, project_id: &str) -> RepoResult<Vec<LogFileSummary>>;

    async fn get_file(&self, file_id: &str) -> RepoResult<Option<LogFileSummary>>;

    async fn events_for_file(&self, file_id: &str) -> RepoResult<Vec<LogEvent>>;

    async fn events_for_link_code(
        &self,
        project_id: &str,
        link_code: &str,
        from_ms: Option<i64>,
        to_ms: Option<i64>,
    ) -> RepoResult<Vec<LogEvent>>;

    /// Time-windowed slice, optionally narrowed to one device, feeding the
    /// anomaly scanners and command-chain reconstruction.
    async fn events_in_window(
        &self,
        project_id: &str,
        from_ms: i64,
        to_ms: i64,
        device_mac: Option<&str>,
    ) -> RepoResult<Vec<LogEvent>>;

    async fn link_codes_in_window(
        &self,
        project_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> RepoResult<Vec<String>>;

    async fn upsert_sessions(&self, sessions: &[DeviceSession]) -> RepoResult<()>;

    async fn get_session(
        &self,
        project_id: &str,
        link_code: &str,
    ) -> RepoResult<Option<DeviceSession>>;

    async fn list_sessions(
        &self,
        project_id: &str,
        from_ms: Option<i64>,
        to_ms: Option<i64>,
        device_mac: Option<&str>,
    ) -> RepoResult<Vec<DeviceSession>>;
}

#[async_trait]
pub trait KnownIssueRepository: Send + Sync {
    /// Active rules for a project, severity-descending, which is the order the
    /// matcher evaluates them in.
    async fn list_active(&self, project_id: &str) -> RepoResult<Vec<KnownIssue>>;

    async fn upsert(&self, issue: &KnownIssue) -> RepoResult<()>;

    async fn deactivate(&self, project_id: &str, issue_id: &str) -> RepoResult<()>;

    /// One atomic increment per issue id; callers dedupe ids per invocation.
    async fn record_hits(&self, project_id: &str, issue_ids: &[String]) -> RepoResult<()>;

    async fn hit_counts(&self, project_id: &str) -> RepoResult<Vec<IssueHitCount>>;
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn load(&self, file_id: &str) -> RepoResult<Option<AnalysisSnapshot>>;

    async fn store(&self, snapshot: &AnalysisSnapshot) -> RepoResult<()>;
}
