mod clickhouse_repo;
mod cursor;
mod domain;
mod error;
mod repo;

pub use clickhouse_repo::ClickHouseEventRepository;
pub use domain::{
    AnalysisSnapshot, ContextEvent, DeviceSession, EventContext, EventContextRequest,
    EventSearchFilter, IssueHitCount, KnownIssue, LogEvent, LogFileStatus, LogFileSummary, Page,
    PageRequest, RepoConfig, SessionMilestones, SessionStatus, TrackingFields, PARSER_ERROR_EVENT,
};
pub use error::{RepoError, RepoResult};
pub use repo::{EventRepository, KnownIssueRepository, SnapshotRepository};
