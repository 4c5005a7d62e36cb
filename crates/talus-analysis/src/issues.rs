//! Confidence-scored matching of events against support-curated known
//! issues.
//!
//! Per issue the rules run in priority order (exact error code, then event
//! name regex, then message regex) and the first success wins, so one issue
//! contributes at most one match per event. A broken stored regex is skipped
//! for the current scan only; it never aborts the batch and never deactivates
//! the rule.

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use talus_events::{KnownIssue, KnownIssueRepository, LogEvent, RepoResult};
use tracing::warn;

/// Upper bound on events accepted by a single batch-match call.
pub const MATCH_BATCH_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    ErrorCode,
    EventPattern,
    MsgPattern,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ErrorCode => "errorCode",
            Self::EventPattern => "eventPattern",
            Self::MsgPattern => "msgPattern",
        }
    }

    fn confidence(self) -> f64 {
        match self {
            Self::ErrorCode => 1.0,
            Self::EventPattern => 0.9,
            Self::MsgPattern => 0.8,
        }
    }
}

/// Ephemeral link between an event and a known issue. Not persisted; the
/// only durable side effect of matching is the per-issue hit counter.
#[derive(Debug, Clone, Serialize)]
pub struct IssueMatch {
    pub issue_id: String,
    pub title: String,
    pub severity: u8,
    pub match_type: MatchType,
    pub confidence: f64,
}

/// The slice of an event the matcher looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventProbe<'a> {
    pub event_name: &'a str,
    pub error_code: Option<&'a str>,
    pub msg: Option<&'a str>,
}

impl<'a> EventProbe<'a> {
    pub fn from_event(event: &'a LogEvent) -> Self {
        Self {
            event_name: &event.event_name,
            error_code: event.tracking.error_code.as_deref(),
            msg: Some(&event.payload_json),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub per_event: Vec<Vec<IssueMatch>>,
    /// Distinct issues hit anywhere in the batch, in first-hit order.
    pub hit_issue_ids: Vec<String>,
    /// True when the input was cut to [`MATCH_BATCH_LIMIT`] events.
    pub truncated: bool,
}

struct CompiledIssue<'a> {
    issue: &'a KnownIssue,
    event_re: Option<Regex>,
    msg_re: Option<Regex>,
}

fn compile_pattern(issue_id: &str, which: &str, pattern: Option<&str>) -> Option<Regex> {
    let pattern = pattern?;
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(err) => {
            warn!("issue {issue_id}: invalid {which} regex, rule skipped: {err}");
            None
        }
    }
}

fn compile_issues(issues: &[KnownIssue]) -> Vec<CompiledIssue<'_>> {
    issues
        .iter()
        .map(|issue| CompiledIssue {
            event_re: compile_pattern(
                &issue.issue_id,
                "event_pattern",
                issue.event_pattern.as_deref(),
            ),
            msg_re: compile_pattern(&issue.issue_id, "msg_pattern", issue.msg_pattern.as_deref()),
            issue,
        })
        .collect()
}

fn match_issue(compiled: &CompiledIssue<'_>, probe: &EventProbe<'_>) -> Option<IssueMatch> {
    let issue = compiled.issue;

    let match_type = if issue
        .error_code
        .as_deref()
        .zip(probe.error_code)
        .is_some_and(|(rule, code)| rule == code)
    {
        Some(MatchType::ErrorCode)
    } else if compiled
        .event_re
        .as_ref()
        .is_some_and(|re| re.is_match(probe.event_name))
    {
        Some(MatchType::EventPattern)
    } else if compiled
        .msg_re
        .as_ref()
        .zip(probe.msg)
        .is_some_and(|(re, msg)| re.is_match(msg))
    {
        Some(MatchType::MsgPattern)
    } else {
        None
    };

    match_type.map(|match_type| IssueMatch {
        issue_id: issue.issue_id.clone(),
        title: issue.title.clone(),
        severity: issue.severity,
        match_type,
        confidence: match_type.confidence(),
    })
}

/// Pure single-event matching over an (already severity-ordered) issue set.
pub fn match_event_rules(probe: &EventProbe<'_>, issues: &[KnownIssue]) -> Vec<IssueMatch> {
    let compiled = compile_issues(issues);
    compiled
        .iter()
        .filter_map(|issue| match_issue(issue, probe))
        .collect()
}

/// Pure batch matching; the input is capped, never rejected, so an oversized
/// caller still gets its first hundred events served.
pub fn match_batch_rules(probes: &[EventProbe<'_>], issues: &[KnownIssue]) -> BatchOutcome {
    let truncated = probes.len() > MATCH_BATCH_LIMIT;
    let probes = &probes[..probes.len().min(MATCH_BATCH_LIMIT)];

    let compiled = compile_issues(issues);
    let mut per_event = Vec::with_capacity(probes.len());
    let mut seen = HashSet::<String>::new();
    let mut hit_issue_ids = Vec::new();

    for probe in probes {
        let matches: Vec<IssueMatch> = compiled
            .iter()
            .filter_map(|issue| match_issue(issue, probe))
            .collect();

        for hit in &matches {
            if seen.insert(hit.issue_id.clone()) {
                hit_issue_ids.push(hit.issue_id.clone());
            }
        }
        per_event.push(matches);
    }

    BatchOutcome {
        per_event,
        hit_issue_ids,
        truncated,
    }
}

/// Matching front door that loads the active rule set and books hit counts.
///
/// Hit counting is deduplicated by issue id within one invocation: for the
/// batch call per the original contract, and for the single-event call by
/// decision (an issue matching several events, or several rules, in one call
/// still reflects one diagnosis).
#[derive(Clone)]
pub struct IssueMatcher {
    repo: Arc<dyn KnownIssueRepository>,
}

impl IssueMatcher {
    pub fn new(repo: Arc<dyn KnownIssueRepository>) -> Self {
        Self { repo }
    }

    pub async fn match_event(
        &self,
        project_id: &str,
        probe: &EventProbe<'_>,
    ) -> RepoResult<Vec<IssueMatch>> {
        let issues = self.repo.list_active(project_id).await?;
        let matches = match_event_rules(probe, &issues);

        let mut seen = HashSet::<&str>::new();
        let hit_ids: Vec<String> = matches
            .iter()
            .filter(|hit| seen.insert(hit.issue_id.as_str()))
            .map(|hit| hit.issue_id.clone())
            .collect();
        self.repo.record_hits(project_id, &hit_ids).await?;

        Ok(matches)
    }

    pub async fn match_batch(
        &self,
        project_id: &str,
        probes: &[EventProbe<'_>],
    ) -> RepoResult<BatchOutcome> {
        let issues = self.repo.list_active(project_id).await?;
        let outcome = match_batch_rules(probes, &issues);
        self.repo
            .record_hits(project_id, &outcome.hit_issue_ids)
            .await?;
        Ok(outcome)
    }
}
