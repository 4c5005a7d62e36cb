//! Session reconstruction: a pure fold over one link code's events.
//!
//! A device session walks scanning → pairing → connecting → connected →
//! communicating → disconnected, with timeout/error reachable from any
//! non-terminal phase. Evidence comes from (stage, op, result) triples and
//! named error codes in the tracking fields. The fold touches no shared
//! state, so distinct link codes reconstruct in parallel safely.

use talus_events::{DeviceSession, LogEvent, SessionMilestones, SessionStatus};

pub const ACK_TIMEOUT: &str = "ACK_TIMEOUT";
pub const ACK_PENDING: &str = "ACK_PENDING";
pub const DATA_STREAM_STALL_TIMEOUT: &str = "DATA_STREAM_STALL_TIMEOUT";
pub const DATA_PERSIST_TIMEOUT: &str = "DATA_PERSIST_TIMEOUT";
pub const INDEX_GAP_BLOCKED: &str = "INDEX_GAP_BLOCKED";

/// Error codes that mark the session failed regardless of phase. Only
/// `ACK_TIMEOUT` yields a timeout verdict; a stalled stream is a failure.
pub const FATAL_ERROR_CODES: [&str; 3] = [
    DATA_STREAM_STALL_TIMEOUT,
    DATA_PERSIST_TIMEOUT,
    INDEX_GAP_BLOCKED,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Scanning,
    Pairing,
    Connecting,
    Connected,
    Communicating,
    Disconnected,
    Timeout,
    Error,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Timeout | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scanning => "scanning",
            Self::Pairing => "pairing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Communicating => "communicating",
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

struct Fold {
    milestones: SessionMilestones,
    phase: SessionPhase,
    device_mac: Option<String>,
    saw_ack_ok: bool,
    saw_ack_timeout: bool,
    saw_fatal: bool,
    error_count: u64,
    request_ids: std::collections::HashSet<String>,
}

fn matches_ci(value: Option<&str>, expected: &str) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case(expected))
}

fn triple(event: &LogEvent, stage: &str, op: &str, result: &str) -> bool {
    matches_ci(event.tracking.stage.as_deref(), stage)
        && matches_ci(event.tracking.op.as_deref(), op)
        && matches_ci(event.tracking.result.as_deref(), result)
}

fn set_once(slot: &mut Option<i64>, ts: i64) -> bool {
    if slot.is_none() {
        *slot = Some(ts);
        true
    } else {
        false
    }
}

impl Fold {
    fn new() -> Self {
        Self {
            milestones: SessionMilestones::default(),
            phase: SessionPhase::Scanning,
            device_mac: None,
            saw_ack_ok: false,
            saw_ack_timeout: false,
            saw_fatal: false,
            error_count: 0,
            request_ids: std::collections::HashSet::new(),
        }
    }

    fn advance(&mut self, phase: SessionPhase) {
        // Terminal phases stick; everything else only moves forward.
        if !self.phase.is_terminal() {
            self.phase = phase;
        }
    }

    fn observe(&mut self, event: &LogEvent) {
        let ts = event.timestamp_ms;

        if self.device_mac.is_none() {
            self.device_mac = event.tracking.device_mac.clone();
        }
        if event.level >= 3 {
            self.error_count += 1;
        }
        if let Some(request_id) = event.tracking.request_id.as_deref() {
            self.request_ids.insert(request_id.to_string());
        }

        if triple(event, "ble", "scan", "start") {
            set_once(&mut self.milestones.scan_start_ms, ts);
            self.advance(SessionPhase::Scanning);
        }
        if triple(event, "ble", "pair", "start") {
            set_once(&mut self.milestones.pair_start_ms, ts);
            self.advance(SessionPhase::Pairing);
        }
        if triple(event, "ble", "connect", "start") {
            set_once(&mut self.milestones.connect_start_ms, ts);
            self.advance(SessionPhase::Connecting);
        }
        if triple(event, "ble", "connect", "ok") {
            set_once(&mut self.milestones.connected_ms, ts);
            self.advance(SessionPhase::Connected);
        }
        if triple(event, "ble", "auth", "ok") {
            set_once(&mut self.milestones.auth_ok_ms, ts);
            self.advance(SessionPhase::Connected);
        }
        if matches_ci(event.tracking.stage.as_deref(), "ble")
            && matches_ci(event.tracking.reason_code.as_deref(), "READY")
        {
            set_once(&mut self.milestones.ready_ok_ms, ts);
            self.advance(SessionPhase::Connected);
        }
        if triple(event, "ble", "getdata", "start") {
            set_once(&mut self.milestones.get_data_start_ms, ts);
            self.advance(SessionPhase::Communicating);
        }
        if triple(event, "ble", "receivedata", "ok") {
            set_once(&mut self.milestones.history_done_ms, ts);
            self.advance(SessionPhase::Communicating);
        }
        if triple(event, "mqtt", "publish", "start") {
            set_once(&mut self.milestones.publish_start_ms, ts);
            self.advance(SessionPhase::Communicating);
        }
        if triple(event, "mqtt", "publish", "ok") {
            set_once(&mut self.milestones.publish_ok_ms, ts);
            self.advance(SessionPhase::Communicating);
        }
        if matches_ci(event.tracking.op.as_deref(), "disconnect") {
            set_once(&mut self.milestones.disconnect_ms, ts);
            self.advance(SessionPhase::Disconnected);
        }

        let error_code = event.tracking.error_code.as_deref();

        if triple(event, "mqtt", "ack", "ok") {
            set_once(&mut self.milestones.ack_ok_ms, ts);
            self.saw_ack_ok = true;
            self.advance(SessionPhase::Communicating);
        }
        if triple(event, "mqtt", "ack", "timeout") || matches_ci(error_code, ACK_TIMEOUT) {
            self.saw_ack_timeout = true;
            self.advance(SessionPhase::Timeout);
        }
        if FATAL_ERROR_CODES
            .iter()
            .any(|code| matches_ci(error_code, code))
        {
            self.saw_fatal = true;
            self.advance(SessionPhase::Error);
        }
        // ACK_PENDING keeps the session open; it is evidence, not a verdict.
    }

    fn status(&self) -> SessionStatus {
        if self.saw_ack_ok {
            SessionStatus::Done
        } else if self.saw_ack_timeout {
            SessionStatus::Timeout
        } else if self.saw_fatal {
            SessionStatus::Error
        } else {
            SessionStatus::Incomplete
        }
    }
}

/// Final phase a (sorted) event slice reaches, for reporting alongside the
/// milestone record.
pub fn final_phase(events: &[LogEvent]) -> SessionPhase {
    let mut fold = Fold::new();
    for event in events {
        fold.observe(event);
    }
    fold.phase
}

/// Rebuilds the materialized session for one `(project, link_code)` pair.
///
/// Idempotent and side-effect free; persisting the result is the caller's
/// job. `events` must already be sorted by `timestamp_ms`; both the parser
/// and the repository hand slices over in that order.
pub fn reconstruct_session(
    project_id: &str,
    link_code: &str,
    events: &[LogEvent],
) -> DeviceSession {
    let mut fold = Fold::new();
    for event in events {
        fold.observe(event);
    }

    let start_ms = events.first().map(|e| e.timestamp_ms);
    let end_ms = events.last().map(|e| e.timestamp_ms);
    let duration_ms = match (start_ms, end_ms) {
        (Some(start), Some(end)) if events.len() >= 2 => Some(end - start),
        _ => None,
    };

    DeviceSession {
        project_id: project_id.to_string(),
        link_code: link_code.to_string(),
        device_mac: fold.device_mac.clone(),
        status: fold.status(),
        start_ms,
        end_ms,
        duration_ms,
        event_count: events.len() as u64,
        error_count: fold.error_count,
        command_count: fold.request_ids.len() as u64,
        milestones: fold.milestones,
    }
}
