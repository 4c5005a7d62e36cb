//! Command-chain reconstruction: events sharing a `request_id`, ordered and
//! classified. Both the number of chains and the events retained per chain
//! are capped so a hot window can never accumulate without bound.

use crate::session::{ACK_TIMEOUT, FATAL_ERROR_CODES};
use serde::Serialize;
use std::collections::HashMap;
use talus_events::LogEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Success,
    Pending,
    Error,
    Timeout,
}

impl ChainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Pending => "pending",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandChain {
    pub request_id: String,
    /// Ordered by timestamp, truncated to the per-chain cap.
    pub events: Vec<LogEvent>,
    /// Total observed, before truncation.
    pub event_count: u64,
    pub start_ms: i64,
    pub end_ms: i64,
    pub duration_ms: i64,
    pub status: ChainStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct ChainLimits {
    pub max_chains: usize,
    pub max_events_per_chain: usize,
}

const SUCCESS_OPS: [&str; 2] = ["ack", "done"];

fn ci_eq(value: Option<&str>, expected: &str) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case(expected))
}

fn is_terminal_success(event: &LogEvent) -> bool {
    ci_eq(event.tracking.result.as_deref(), "ok")
        && SUCCESS_OPS
            .iter()
            .any(|op| ci_eq(event.tracking.op.as_deref(), op))
}

fn is_terminal_timeout(event: &LogEvent) -> bool {
    ci_eq(event.tracking.result.as_deref(), "timeout")
        || ci_eq(event.tracking.error_code.as_deref(), ACK_TIMEOUT)
}

fn is_terminal_error(event: &LogEvent) -> bool {
    ci_eq(event.tracking.result.as_deref(), "fail")
        || ci_eq(event.tracking.result.as_deref(), "error")
        || FATAL_ERROR_CODES
            .iter()
            .any(|code| ci_eq(event.tracking.error_code.as_deref(), code))
}

fn chain_status(events: &[LogEvent]) -> ChainStatus {
    if events.iter().any(is_terminal_success) {
        ChainStatus::Success
    } else if events.iter().any(is_terminal_timeout) {
        ChainStatus::Timeout
    } else if events.iter().any(is_terminal_error) {
        ChainStatus::Error
    } else {
        ChainStatus::Pending
    }
}

/// Groups a (timestamp-sorted) event slice into per-request chains.
/// Events without a `request_id` are ignored. Chains come back ordered by
/// start time; at most `max_chains` are returned.
pub fn reconstruct_chains(events: &[LogEvent], limits: ChainLimits) -> Vec<CommandChain> {
    let mut grouped: HashMap<&str, Vec<&LogEvent>> = HashMap::new();
    for event in events {
        if let Some(request_id) = event.tracking.request_id.as_deref() {
            grouped.entry(request_id).or_default().push(event);
        }
    }

    let mut chains: Vec<CommandChain> = grouped
        .into_iter()
        .map(|(request_id, mut members)| {
            members.sort_by_key(|e| e.timestamp_ms);
            let start_ms = members.first().map(|e| e.timestamp_ms).unwrap_or(0);
            let end_ms = members.last().map(|e| e.timestamp_ms).unwrap_or(start_ms);
            let owned: Vec<LogEvent> = members.iter().map(|e| (*e).clone()).collect();
            let status = chain_status(&owned);
            let event_count = owned.len() as u64;

            let mut retained = owned;
            retained.truncate(limits.max_events_per_chain.max(1));

            CommandChain {
                request_id: request_id.to_string(),
                events: retained,
                event_count,
                start_ms,
                end_ms,
                duration_ms: end_ms - start_ms,
                status,
            }
        })
        .collect();

    chains.sort_by(|a, b| {
        a.start_ms
            .cmp(&b.start_ms)
            .then_with(|| a.request_id.cmp(&b.request_id))
    });
    chains.truncate(limits.max_chains.max(1));
    chains
}
