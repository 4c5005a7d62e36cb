//! Two-level envelope parser for on-device log lines.
//!
//! The outer object carries `c` (inner JSON string), `f` (severity), `l`
//! (epoch millis), `n` (channel name) and optionally `i`/`m`. The inner JSON
//! carries `event` and a free-form `msg`. Corruption is the norm in these
//! files: a bad line is dropped and counted, never fatal for the batch.

use crate::tracking::extract_tracking_fields;
use serde_json::Value;
use sha2::{Digest, Sha256};
use talus_events::{LogEvent, PARSER_ERROR_EVENT};
use tracing::debug;

/// Channel/preamble sentinels the vendor logger writes before real records.
const HEADER_SENTINELS: [&str; 2] = ["clogan", "clogan header"];

const MAX_LEVEL: u8 = 4;

pub(crate) struct FileContext<'a> {
    pub file_id: &'a str,
    pub project_id: &'a str,
}

#[derive(Debug)]
pub(crate) enum LineOutcome {
    Event(EventDraft),
    Header,
    Invalid(&'static str),
}

#[derive(Debug)]
pub(crate) struct EventDraft {
    pub timestamp_ms: i64,
    pub level: u8,
    pub event_name: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
pub struct ParseOutput {
    pub events: Vec<LogEvent>,
    pub invalid_lines: u64,
    pub event_count: u64,
    pub error_count: u64,
}

fn is_header_sentinel(value: Option<&str>) -> bool {
    value.is_some_and(|raw| {
        let lowered = raw.trim().to_ascii_lowercase();
        HEADER_SENTINELS.iter().any(|s| *s == lowered)
    })
}

/// Opportunistic deep-parse: a string `msg` that trims to `{...}` is usually
/// a JSON object serialized twice by the SDK. Parse failure keeps the string.
fn normalize_msg(msg: Option<&Value>) -> Value {
    match msg {
        None => Value::Null,
        Some(Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.starts_with('{') && trimmed.ends_with('}') {
                serde_json::from_str::<Value>(trimmed)
                    .unwrap_or_else(|_| Value::String(raw.clone()))
            } else {
                Value::String(raw.clone())
            }
        }
        Some(other) => other.clone(),
    }
}

pub(crate) fn parse_line(raw: &str) -> LineOutcome {
    let outer: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => return LineOutcome::Invalid("outer envelope is not valid JSON"),
    };
    let Some(outer) = outer.as_object() else {
        return LineOutcome::Invalid("outer envelope is not a JSON object");
    };

    let c = outer.get("c").and_then(Value::as_str);
    let n = outer.get("n").and_then(Value::as_str);
    if is_header_sentinel(c) || is_header_sentinel(n) {
        return LineOutcome::Header;
    }

    let Some(c) = c else {
        return LineOutcome::Invalid("missing envelope field c");
    };

    let level = match outer.get("f").and_then(Value::as_i64) {
        Some(f) if f > 0 => (f.min(MAX_LEVEL as i64)) as u8,
        _ => return LineOutcome::Invalid("missing or zero envelope field f"),
    };

    let timestamp_ms = match outer.get("l").and_then(Value::as_i64) {
        Some(l) if l != 0 => l,
        _ => return LineOutcome::Invalid("missing or zero envelope field l"),
    };

    let inner: Value = match serde_json::from_str(c) {
        Ok(value) => value,
        Err(_) => return LineOutcome::Invalid("inner payload is not valid JSON"),
    };
    let Some(inner_obj) = inner.as_object() else {
        return LineOutcome::Invalid("inner payload is not a JSON object");
    };

    let event_name = match inner_obj.get("event").and_then(Value::as_str) {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => return LineOutcome::Invalid("missing inner event name"),
    };

    LineOutcome::Event(EventDraft {
        timestamp_ms,
        level,
        event_name,
        payload: normalize_msg(inner_obj.get("msg")),
    })
}

fn event_id(file_id: &str, line_no: u64, raw_line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_id.as_bytes());
    hasher.update([0]);
    hasher.update(line_no.to_le_bytes());
    hasher.update([0]);
    hasher.update(raw_line.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parses decoded text into ordered events plus running per-file aggregates.
///
/// Events keep encounter order, then get a stable sort by timestamp so a
/// device clock tie preserves the original line order. When any lines were
/// dropped, one synthetic `PARSER_ERROR` marker event is appended carrying
/// the count, so the loss shows up in search without corrupting real rows.
pub(crate) fn parse_text(text: &str, ctx: &FileContext<'_>) -> ParseOutput {
    let mut out = ParseOutput::default();
    let mut line_no = 0u64;

    for raw_line in text.lines() {
        line_no += 1;
        if raw_line.trim().is_empty() {
            continue;
        }

        match parse_line(raw_line) {
            LineOutcome::Header => {}
            LineOutcome::Invalid(reason) => {
                debug!("dropping line {line_no}: {reason}");
                out.invalid_lines += 1;
            }
            LineOutcome::Event(draft) => {
                let tracking = extract_tracking_fields(&draft.payload);
                out.event_count += 1;
                if draft.level >= 3 {
                    out.error_count += 1;
                }

                out.events.push(LogEvent {
                    event_id: event_id(ctx.file_id, line_no, raw_line),
                    file_id: ctx.file_id.to_string(),
                    project_id: ctx.project_id.to_string(),
                    line_no,
                    timestamp_ms: draft.timestamp_ms,
                    level: draft.level,
                    event_name: draft.event_name,
                    payload_json: draft.payload.to_string(),
                    raw_line: raw_line.to_string(),
                    tracking,
                });
            }
        }
    }

    // Vec::sort_by_key is stable, so equal timestamps keep encounter order.
    out.events.sort_by_key(|event| event.timestamp_ms);

    if out.invalid_lines > 0 {
        let marker_ts = out.events.last().map(|e| e.timestamp_ms).unwrap_or(0);
        let payload = serde_json::json!({ "invalid_lines": out.invalid_lines });
        out.events.push(LogEvent {
            event_id: event_id(ctx.file_id, 0, PARSER_ERROR_EVENT),
            file_id: ctx.file_id.to_string(),
            project_id: ctx.project_id.to_string(),
            line_no: 0,
            timestamp_ms: marker_ts,
            level: 3,
            event_name: PARSER_ERROR_EVENT.to_string(),
            payload_json: payload.to_string(),
            raw_line: String::new(),
            tracking: Default::default(),
        });
    }

    out
}
