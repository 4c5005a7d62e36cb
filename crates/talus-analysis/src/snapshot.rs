//! Versioned analysis snapshots with lazy invalidation.
//!
//! Every stored artifact bundle is tagged with the engine version that
//! produced it. The read path recomputes synchronously when the stored tag
//! is older than the current engine; version-matching snapshots come back
//! untouched. Bulk refresh goes through a fire-and-forget trigger.

use crate::session::{final_phase, reconstruct_session};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use talus_events::{
    AnalysisSnapshot, EventRepository, LogEvent, RepoResult, SnapshotRepository,
    PARSER_ERROR_EVENT,
};
use tracing::warn;

/// Version of the analysis logic. Bump when any artifact shape or semantics
/// change; stored snapshots with an older tag recompute on next read.
pub const TEMPLATE_VERSION: u32 = 3;

/// Builds the named sub-artifacts for one file's (timestamp-sorted) events.
pub fn compute_artifacts(events: &[LogEvent]) -> Value {
    let mut by_link_code: BTreeMap<&str, Vec<&LogEvent>> = BTreeMap::new();
    let mut by_event_name: BTreeMap<&str, u64> = BTreeMap::new();
    let mut by_stage: BTreeMap<&str, u64> = BTreeMap::new();
    let mut error_events = 0u64;
    let mut invalid_lines = 0u64;
    let mut real_events = 0u64;

    for event in events {
        if event.event_name == PARSER_ERROR_EVENT {
            invalid_lines += event
                .payload()
                .get("invalid_lines")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            continue;
        }

        real_events += 1;
        if event.level >= 3 {
            error_events += 1;
        }
        *by_event_name.entry(event.event_name.as_str()).or_default() += 1;
        if let Some(stage) = event.tracking.stage.as_deref() {
            *by_stage.entry(stage).or_default() += 1;
        }
        if let Some(link_code) = event.tracking.link_code.as_deref() {
            by_link_code.entry(link_code).or_default().push(event);
        }
    }

    let main_flow: Vec<Value> = by_link_code
        .into_iter()
        .map(|(link_code, members)| {
            let owned: Vec<LogEvent> = members.into_iter().cloned().collect();
            let project_id = owned
                .first()
                .map(|e| e.project_id.clone())
                .unwrap_or_default();
            let session = reconstruct_session(&project_id, link_code, &owned);
            json!({
                "link_code": link_code,
                "status": session.status.as_str(),
                "final_phase": final_phase(&owned).as_str(),
                "duration_ms": session.duration_ms,
                "event_count": session.event_count,
                "error_count": session.error_count,
                "command_count": session.command_count,
                "milestone_deltas_ms": session
                    .milestones
                    .deltas_from_connect()
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
            })
        })
        .collect();

    let error_rate = if real_events > 0 {
        error_events as f64 / real_events as f64
    } else {
        0.0
    };

    json!({
        "main_flow": main_flow,
        "event_coverage": {
            "total_events": real_events,
            "by_event_name": by_event_name,
            "by_stage": by_stage,
        },
        "quality": {
            "error_events": error_events,
            "error_rate": error_rate,
            "invalid_lines": invalid_lines,
        },
    })
}

#[derive(Clone)]
pub struct SnapshotService {
    events: Arc<dyn EventRepository>,
    snapshots: Arc<dyn SnapshotRepository>,
}

impl SnapshotService {
    pub fn new(events: Arc<dyn EventRepository>, snapshots: Arc<dyn SnapshotRepository>) -> Self {
        Self { events, snapshots }
    }

    /// The synchronous read path: stored-and-current comes back as is;
    /// missing or stale recomputes, stores, and returns fresh. A caller is
    /// never handed a snapshot from an older engine version.
    pub async fn current(&self, file_id: &str) -> RepoResult<AnalysisSnapshot> {
        if let Some(existing) = self.snapshots.load(file_id).await? {
            if !existing.is_stale(TEMPLATE_VERSION) {
                return Ok(existing);
            }
        }

        self.recompute(file_id).await
    }

    pub async fn recompute(&self, file_id: &str) -> RepoResult<AnalysisSnapshot> {
        let events = self.events.events_for_file(file_id).await?;
        let snapshot = AnalysisSnapshot {
            file_id: file_id.to_string(),
            template_version: TEMPLATE_VERSION,
            artifacts: compute_artifacts(&events),
        };
        self.snapshots.store(&snapshot).await?;
        Ok(snapshot)
    }

    /// Fire-and-forget bulk refresh; failures are logged per file and do not
    /// affect the caller.
    pub fn trigger_recompute(&self, file_ids: Vec<String>) {
        let service = self.clone();
        tokio::spawn(async move {
            for file_id in file_ids {
                if let Err(err) = service.recompute(&file_id).await {
                    warn!("snapshot recompute failed for {file_id}: {err}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use talus_events::{
        DeviceSession, EventContext, EventContextRequest, EventSearchFilter, LogFileSummary, Page,
        PageRequest, RepoError, TrackingFields,
    };

    fn sample_event(ts: i64, name: &str, link_code: Option<&str>) -> LogEvent {
        LogEvent {
            event_id: format!("e-{ts}"),
            file_id: "f1".to_string(),
            project_id: "p1".to_string(),
            line_no: ts as u64,
            timestamp_ms: ts,
            level: if name.contains("FAIL") { 4 } else { 2 },
            event_name: name.to_string(),
            payload_json: "{}".to_string(),
            raw_line: "{}".to_string(),
            tracking: TrackingFields {
                link_code: link_code.map(str::to_string),
                ..TrackingFields::default()
            },
        }
    }

    fn marker_event(invalid_lines: u64) -> LogEvent {
        let mut event = sample_event(9_999, PARSER_ERROR_EVENT, None);
        event.payload_json = json!({ "invalid_lines": invalid_lines }).to_string();
        event.level = 3;
        event
    }

    struct FakeEventRepo {
        events: Vec<LogEvent>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl EventRepository for FakeEventRepo {
        async fn search_events(
            &self,
            _filter: EventSearchFilter,
            _page: PageRequest,
        ) -> RepoResult<Page<LogEvent>> {
            Err(RepoError::internal("not used in test"))
        }

        async fn open_event(&self, _req: EventContextRequest) -> RepoResult<EventContext> {
            Err(RepoError::internal("not used in test"))
        }

        async fn list_files(&self, _project_id: &str) -> RepoResult<Vec<LogFileSummary>> {
            Err(RepoError::internal("not used in test"))
        }

        async fn get_file(&self, _file_id: &str) -> RepoResult<Option<LogFileSummary>> {
            Err(RepoError::internal("not used in test"))
        }

        async fn events_for_file(&self, _file_id: &str) -> RepoResult<Vec<LogEvent>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.events.clone())
        }

        async fn events_for_link_code(
            &self,
            _project_id: &str,
            _link_code: &str,
            _from_ms: Option<i64>,
            _to_ms: Option<i64>,
        ) -> RepoResult<Vec<LogEvent>> {
            Err(RepoError::internal("not used in test"))
        }

        async fn events_in_window(
            &self,
            _project_id: &str,
            _from_ms: i64,
            _to_ms: i64,
            _device_mac: Option<&str>,
        ) -> RepoResult<Vec<LogEvent>> {
            Err(RepoError::internal("not used in test"))
        }

        async fn link_codes_in_window(
            &self,
            _project_id: &str,
            _from_ms: i64,
            _to_ms: i64,
        ) -> RepoResult<Vec<String>> {
            Err(RepoError::internal("not used in test"))
        }

        async fn upsert_sessions(&self, _sessions: &[DeviceSession]) -> RepoResult<()> {
            Err(RepoError::internal("not used in test"))
        }

        async fn get_session(
            &self,
            _project_id: &str,
            _link_code: &str,
        ) -> RepoResult<Option<DeviceSession>> {
            Err(RepoError::internal("not used in test"))
        }

        async fn list_sessions(
            &self,
            _project_id: &str,
            _from_ms: Option<i64>,
            _to_ms: Option<i64>,
            _device_mac: Option<&str>,
        ) -> RepoResult<Vec<DeviceSession>> {
            Err(RepoError::internal("not used in test"))
        }
    }

    #[derive(Default)]
    struct FakeSnapshotRepo {
        stored: Mutex<Option<AnalysisSnapshot>>,
        stores: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotRepository for FakeSnapshotRepo {
        async fn load(&self, _file_id: &str) -> RepoResult<Option<AnalysisSnapshot>> {
            Ok(self.stored.lock().expect("stored mutex poisoned").clone())
        }

        async fn store(&self, snapshot: &AnalysisSnapshot) -> RepoResult<()> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            *self.stored.lock().expect("stored mutex poisoned") = Some(snapshot.clone());
            Ok(())
        }
    }

    fn service(
        events: Vec<LogEvent>,
        stored: Option<AnalysisSnapshot>,
    ) -> (SnapshotService, Arc<FakeEventRepo>, Arc<FakeSnapshotRepo>) {
        let event_repo = Arc::new(FakeEventRepo {
            events,
            fetches: AtomicUsize::new(0),
        });
        let snapshot_repo = Arc::new(FakeSnapshotRepo {
            stored: Mutex::new(stored),
            stores: AtomicUsize::new(0),
        });
        (
            SnapshotService::new(event_repo.clone(), snapshot_repo.clone()),
            event_repo,
            snapshot_repo,
        )
    }

    #[tokio::test]
    async fn stale_snapshot_recomputes_on_read() {
        let stale = AnalysisSnapshot {
            file_id: "f1".to_string(),
            template_version: TEMPLATE_VERSION - 1,
            artifacts: json!({"old": true}),
        };
        let (service, events, snapshots) =
            service(vec![sample_event(1_000, "BLE", None)], Some(stale));

        let fresh = service.current("f1").await.expect("current");
        assert_eq!(fresh.template_version, TEMPLATE_VERSION);
        assert!(fresh.artifacts.get("old").is_none());
        assert_eq!(events.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(snapshots.stores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn current_snapshot_returns_unchanged_without_recompute() {
        let current = AnalysisSnapshot {
            file_id: "f1".to_string(),
            template_version: TEMPLATE_VERSION,
            artifacts: json!({"kept": true}),
        };
        let (service, events, snapshots) = service(Vec::new(), Some(current));

        let got = service.current("f1").await.expect("current");
        assert_eq!(got.artifacts["kept"], true);
        assert_eq!(events.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(snapshots.stores.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_snapshot_computes_and_stores() {
        let (service, _events, snapshots) =
            service(vec![sample_event(1_000, "BLE", Some("lk-1"))], None);

        let got = service.current("f1").await.expect("current");
        assert_eq!(got.template_version, TEMPLATE_VERSION);
        assert_eq!(snapshots.stores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trigger_recompute_runs_in_background() {
        let (service, _events, snapshots) =
            service(vec![sample_event(1_000, "BLE", None)], None);

        service.trigger_recompute(vec!["f1".to_string()]);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while snapshots.stores.load(Ordering::SeqCst) == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "background recompute never stored"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn artifacts_cover_flow_coverage_and_quality() {
        let events = vec![
            sample_event(1_000, "BLE_CONNECT", Some("lk-1")),
            sample_event(2_000, "BLE_CONNECT_FAIL", Some("lk-1")),
            sample_event(3_000, "MQTT_PUBLISH", None),
            marker_event(4),
        ];

        let artifacts = compute_artifacts(&events);

        assert_eq!(artifacts["event_coverage"]["total_events"], 3);
        assert_eq!(
            artifacts["event_coverage"]["by_event_name"]["BLE_CONNECT"],
            1
        );
        assert_eq!(artifacts["quality"]["error_events"], 1);
        assert_eq!(artifacts["quality"]["invalid_lines"], 4);

        let main_flow = artifacts["main_flow"].as_array().expect("main flow");
        assert_eq!(main_flow.len(), 1);
        assert_eq!(main_flow[0]["link_code"], "lk-1");
        assert_eq!(main_flow[0]["event_count"], 2);
        assert_eq!(main_flow[0]["final_phase"], "scanning");
    }

    #[test]
    fn empty_event_set_yields_zeroed_quality() {
        let artifacts = compute_artifacts(&[]);
        assert_eq!(artifacts["quality"]["error_rate"], 0.0);
        assert_eq!(artifacts["event_coverage"]["total_events"], 0);
    }
}
