//! Read-path orchestration: request-scoped, stateless derivations over the
//! persisted event set. Safe to run concurrently with ingestion; a
//! partially ingested file just yields the committed prefix.

use crate::anomaly::{default_scanners, detect, AnomalyReport, EventWindow, Scanner};
use crate::chain::{reconstruct_chains, ChainLimits, CommandChain};
use crate::session::reconstruct_session;
use std::sync::Arc;
use talus_config::AnalysisConfig;
use talus_events::{DeviceSession, EventRepository, RepoResult};

pub struct AnalysisService {
    repo: Arc<dyn EventRepository>,
    cfg: AnalysisConfig,
    scanners: Vec<Box<dyn Scanner>>,
}

impl AnalysisService {
    pub fn new(repo: Arc<dyn EventRepository>, cfg: AnalysisConfig) -> Self {
        let scanners = default_scanners(&cfg);
        Self {
            repo,
            cfg,
            scanners,
        }
    }

    /// Recomputes and persists the materialized session for one link code.
    pub async fn refresh_session(
        &self,
        project_id: &str,
        link_code: &str,
    ) -> RepoResult<DeviceSession> {
        let events = self
            .repo
            .events_for_link_code(project_id, link_code, None, None)
            .await?;
        let session = reconstruct_session(project_id, link_code, &events);
        self.repo.upsert_sessions(std::slice::from_ref(&session)).await?;
        Ok(session)
    }

    /// Recomputes every session touched inside a window and upserts them in
    /// one batch.
    pub async fn refresh_sessions_in_window(
        &self,
        project_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> RepoResult<Vec<DeviceSession>> {
        let link_codes = self
            .repo
            .link_codes_in_window(project_id, from_ms, to_ms)
            .await?;

        let mut sessions = Vec::with_capacity(link_codes.len());
        for link_code in &link_codes {
            let events = self
                .repo
                .events_for_link_code(project_id, link_code, None, None)
                .await?;
            sessions.push(reconstruct_session(project_id, link_code, &events));
        }

        self.repo.upsert_sessions(&sessions).await?;
        Ok(sessions)
    }

    pub async fn command_chains(
        &self,
        project_id: &str,
        from_ms: i64,
        to_ms: i64,
        device_mac: Option<&str>,
    ) -> RepoResult<Vec<CommandChain>> {
        let events = self
            .repo
            .events_in_window(project_id, from_ms, to_ms, device_mac)
            .await?;

        Ok(reconstruct_chains(
            &events,
            ChainLimits {
                max_chains: self.cfg.max_chains,
                max_events_per_chain: self.cfg.max_chain_events,
            },
        ))
    }

    pub async fn detect_anomalies(
        &self,
        project_id: &str,
        from_ms: i64,
        to_ms: i64,
        device_mac: Option<&str>,
    ) -> RepoResult<AnomalyReport> {
        let events = self
            .repo
            .events_in_window(project_id, from_ms, to_ms, device_mac)
            .await?;

        let window = EventWindow {
            project_id,
            from_ms,
            to_ms,
            device_mac,
            events: &events,
        };

        Ok(detect(&window, &self.scanners))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use talus_events::{
        EventContext, EventContextRequest, EventSearchFilter, LogEvent, LogFileSummary, Page,
        PageRequest, RepoError, SessionStatus, TrackingFields,
    };

    fn event(ts: i64, link_code: &str, request_id: &str) -> LogEvent {
        fn opt(raw: &str) -> Option<String> {
            if raw.is_empty() {
                None
            } else {
                Some(raw.to_string())
            }
        }

        LogEvent {
            event_id: format!("e-{ts}"),
            file_id: "f1".to_string(),
            project_id: "p1".to_string(),
            line_no: ts as u64,
            timestamp_ms: ts,
            level: 2,
            event_name: "BLE".to_string(),
            payload_json: "{}".to_string(),
            raw_line: "{}".to_string(),
            tracking: TrackingFields {
                link_code: opt(link_code),
                request_id: opt(request_id),
                ..TrackingFields::default()
            },
        }
    }

    struct FakeRepo {
        events: Vec<LogEvent>,
        upserted: Mutex<Vec<DeviceSession>>,
    }

    #[async_trait]
    impl EventRepository for FakeRepo {
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
            Err(RepoError::internal("not used in test"))
        }

        async fn events_for_link_code(
            &self,
            _project_id: &str,
            link_code: &str,
            _from_ms: Option<i64>,
            _to_ms: Option<i64>,
        ) -> RepoResult<Vec<LogEvent>> {
            Ok(self
                .events
                .iter()
                .filter(|e| e.tracking.link_code.as_deref() == Some(link_code))
                .cloned()
                .collect())
        }

        async fn events_in_window(
            &self,
            _project_id: &str,
            from_ms: i64,
            to_ms: i64,
            _device_mac: Option<&str>,
        ) -> RepoResult<Vec<LogEvent>> {
            Ok(self
                .events
                .iter()
                .filter(|e| e.timestamp_ms >= from_ms && e.timestamp_ms < to_ms)
                .cloned()
                .collect())
        }

        async fn link_codes_in_window(
            &self,
            _project_id: &str,
            _from_ms: i64,
            _to_ms: i64,
        ) -> RepoResult<Vec<String>> {
            let mut codes: Vec<String> = self
                .events
                .iter()
                .filter_map(|e| e.tracking.link_code.clone())
                .collect();
            codes.sort();
            codes.dedup();
            Ok(codes)
        }

        async fn upsert_sessions(&self, sessions: &[DeviceSession]) -> RepoResult<()> {
            self.upserted
                .lock()
                .expect("upserted mutex poisoned")
                .extend(sessions.iter().cloned());
            Ok(())
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

    fn service_with(events: Vec<LogEvent>) -> (AnalysisService, Arc<FakeRepo>) {
        let repo = Arc::new(FakeRepo {
            events,
            upserted: Mutex::new(Vec::new()),
        });
        (
            AnalysisService::new(repo.clone(), AnalysisConfig::default()),
            repo,
        )
    }

    #[tokio::test]
    async fn window_refresh_upserts_one_session_per_link_code() {
        let events = vec![
            event(1_000, "lk-1", ""),
            event(2_000, "lk-1", ""),
            event(3_000, "lk-2", ""),
        ];
        let (service, repo) = service_with(events);

        let sessions = service
            .refresh_sessions_in_window("p1", 0, 10_000)
            .await
            .expect("refresh");

        assert_eq!(sessions.len(), 2);
        assert!(sessions
            .iter()
            .all(|s| s.status == SessionStatus::Incomplete));

        let upserted = repo.upserted.lock().expect("upserted mutex poisoned");
        assert_eq!(upserted.len(), 2);
    }

    #[tokio::test]
    async fn command_chains_respect_configured_caps() {
        let mut cfg_events = Vec::new();
        for i in 0..60 {
            cfg_events.push(event(1_000 + i, "", &format!("req-{i}")));
        }
        let (service, _repo) = service_with(cfg_events);

        let chains = service
            .command_chains("p1", 0, 10_000, None)
            .await
            .expect("chains");
        // AnalysisConfig::default() caps at 50 chains.
        assert_eq!(chains.len(), 50);
    }

    #[tokio::test]
    async fn anomaly_detection_reports_summary_for_window() {
        let events = vec![event(1_000, "lk-1", ""), event(20_000, "lk-1", "")];
        let (service, _repo) = service_with(events);

        let report = service
            .detect_anomalies("p1", 0, 10_000, None)
            .await
            .expect("report");
        assert_eq!(report.summary.total_events, 1);
        assert!(report.patterns.is_empty());
    }
}
