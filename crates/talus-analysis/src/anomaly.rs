//! Heuristic anomaly scanners over a time-windowed event set.
//!
//! Each scanner is independent and side-effect free; one scanner failing
//! (malformed evidence, bad arithmetic) must never stop the others, so the
//! detector converts per-scanner errors into warnings and keeps going.

use anyhow::Result;
use serde::Serialize;
use talus_config::AnalysisConfig;
use talus_events::LogEvent;
use tracing::warn;

/// Event-name vocabulary counted by the disconnect scanner.
pub const DISCONNECT_VOCABULARY: [&str; 5] = [
    "DISCONNECT",
    "DISCONNECTED",
    "CONNECTION_LOST",
    "LINK_LOST",
    "GATT_CLOSED",
];

#[derive(Debug, Clone, Copy)]
pub struct EventWindow<'a> {
    pub project_id: &'a str,
    pub from_ms: i64,
    pub to_ms: i64,
    pub device_mac: Option<&'a str>,
    pub events: &'a [LogEvent],
}

/// Evidence keeps a bounded sample of event ids plus the full count.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyEvidence {
    pub event_ids: Vec<String>,
    pub count: usize,
}

const EVIDENCE_SAMPLE: usize = 20;

impl AnomalyEvidence {
    fn from_events<'a>(matched: impl Iterator<Item = &'a LogEvent>) -> Self {
        let mut event_ids = Vec::new();
        let mut count = 0usize;
        for event in matched {
            count += 1;
            if event_ids.len() < EVIDENCE_SAMPLE {
                event_ids.push(event.event_id.clone());
            }
        }
        Self { event_ids, count }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyPattern {
    pub pattern_type: String,
    pub description: String,
    pub evidence: AnomalyEvidence,
}

pub trait Scanner: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, window: &EventWindow<'_>) -> Result<Vec<AnomalyPattern>>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnomalySummary {
    pub total_events: usize,
    pub disconnect_events: usize,
    pub error_events: usize,
    pub scanners_run: usize,
    pub scanners_failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyReport {
    pub patterns: Vec<AnomalyPattern>,
    pub summary: AnomalySummary,
}

fn is_disconnect(event: &LogEvent) -> bool {
    let upper = event.event_name.to_ascii_uppercase();
    DISCONNECT_VOCABULARY
        .iter()
        .any(|token| upper.contains(token))
}

struct FrequentDisconnect {
    threshold: usize,
}

impl Scanner for FrequentDisconnect {
    fn id(&self) -> &'static str {
        "frequent_disconnect"
    }

    fn run(&self, window: &EventWindow<'_>) -> Result<Vec<AnomalyPattern>> {
        let evidence =
            AnomalyEvidence::from_events(window.events.iter().filter(|e| is_disconnect(e)));
        if evidence.count <= self.threshold {
            return Ok(Vec::new());
        }

        Ok(vec![AnomalyPattern {
            pattern_type: self.id().to_string(),
            description: format!(
                "{} disconnect events in window (threshold {})",
                evidence.count, self.threshold
            ),
            evidence,
        }])
    }
}

struct AckTimeoutCluster {
    threshold: usize,
}

impl Scanner for AckTimeoutCluster {
    fn id(&self) -> &'static str {
        "ack_timeout_cluster"
    }

    fn run(&self, window: &EventWindow<'_>) -> Result<Vec<AnomalyPattern>> {
        let evidence = AnomalyEvidence::from_events(window.events.iter().filter(|e| {
            e.tracking
                .error_code
                .as_deref()
                .is_some_and(|code| code.eq_ignore_ascii_case(crate::session::ACK_TIMEOUT))
        }));
        if evidence.count < self.threshold {
            return Ok(Vec::new());
        }

        Ok(vec![AnomalyPattern {
            pattern_type: self.id().to_string(),
            description: format!(
                "{} publish acknowledgements timed out in window",
                evidence.count
            ),
            evidence,
        }])
    }
}

struct ErrorBurst {
    threshold: usize,
}

impl Scanner for ErrorBurst {
    fn id(&self) -> &'static str {
        "error_burst"
    }

    fn run(&self, window: &EventWindow<'_>) -> Result<Vec<AnomalyPattern>> {
        let evidence = AnomalyEvidence::from_events(window.events.iter().filter(|e| e.level >= 3));
        if evidence.count < self.threshold {
            return Ok(Vec::new());
        }

        Ok(vec![AnomalyPattern {
            pattern_type: self.id().to_string(),
            description: format!("{} error-level events in window", evidence.count),
            evidence,
        }])
    }
}

struct AuthFailureRepeat {
    threshold: usize,
}

impl Scanner for AuthFailureRepeat {
    fn id(&self) -> &'static str {
        "auth_failure_repeat"
    }

    fn run(&self, window: &EventWindow<'_>) -> Result<Vec<AnomalyPattern>> {
        let evidence = AnomalyEvidence::from_events(window.events.iter().filter(|e| {
            e.tracking
                .op
                .as_deref()
                .is_some_and(|op| op.eq_ignore_ascii_case("auth"))
                && e.tracking
                    .result
                    .as_deref()
                    .is_some_and(|r| r.eq_ignore_ascii_case("fail") || r.eq_ignore_ascii_case("error"))
        }));
        if evidence.count < self.threshold {
            return Ok(Vec::new());
        }

        Ok(vec![AnomalyPattern {
            pattern_type: self.id().to_string(),
            description: format!("{} authentication failures in window", evidence.count),
            evidence,
        }])
    }
}

/// The fixed, ordered scanner registry.
pub fn default_scanners(cfg: &AnalysisConfig) -> Vec<Box<dyn Scanner>> {
    vec![
        Box::new(FrequentDisconnect {
            threshold: cfg.disconnect_threshold,
        }),
        Box::new(AckTimeoutCluster {
            threshold: cfg.ack_timeout_threshold,
        }),
        Box::new(ErrorBurst {
            threshold: cfg.error_burst_threshold,
        }),
        Box::new(AuthFailureRepeat {
            threshold: cfg.auth_failure_threshold,
        }),
    ]
}

/// Runs every scanner over the window. A failing scanner is logged and
/// skipped; the rest still contribute.
pub fn detect(window: &EventWindow<'_>, scanners: &[Box<dyn Scanner>]) -> AnomalyReport {
    let mut patterns = Vec::new();
    let mut failed = 0usize;

    for scanner in scanners {
        match scanner.run(window) {
            Ok(mut found) => patterns.append(&mut found),
            Err(err) => {
                failed += 1;
                warn!("anomaly scanner {} failed: {err:#}", scanner.id());
            }
        }
    }

    let summary = AnomalySummary {
        total_events: window.events.len(),
        disconnect_events: window.events.iter().filter(|e| is_disconnect(e)).count(),
        error_events: window.events.iter().filter(|e| e.level >= 3).count(),
        scanners_run: scanners.len(),
        scanners_failed: failed,
    };

    AnomalyReport { patterns, summary }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talus_events::TrackingFields;

    fn named_event(ts: i64, name: &str, level: u8) -> LogEvent {
        LogEvent {
            event_id: format!("e-{ts}"),
            file_id: "f1".to_string(),
            project_id: "p1".to_string(),
            line_no: ts as u64,
            timestamp_ms: ts,
            level,
            event_name: name.to_string(),
            payload_json: "{}".to_string(),
            raw_line: "{}".to_string(),
            tracking: TrackingFields::default(),
        }
    }

    fn window(events: &[LogEvent]) -> EventWindow<'_> {
        EventWindow {
            project_id: "p1",
            from_ms: 0,
            to_ms: 100_000,
            device_mac: None,
            events,
        }
    }

    fn config() -> AnalysisConfig {
        AnalysisConfig::default()
    }

    #[test]
    fn frequent_disconnect_flags_above_threshold() {
        let events: Vec<LogEvent> = (0..6)
            .map(|i| named_event(1_000 + i, "BLE_DISCONNECTED", 2))
            .collect();

        let report = detect(&window(&events), &default_scanners(&config()));
        let pattern = report
            .patterns
            .iter()
            .find(|p| p.pattern_type == "frequent_disconnect")
            .expect("disconnect pattern");
        assert_eq!(pattern.evidence.count, 6);
        assert_eq!(report.summary.disconnect_events, 6);
    }

    #[test]
    fn disconnect_at_threshold_is_not_flagged() {
        let events: Vec<LogEvent> = (0..5)
            .map(|i| named_event(1_000 + i, "CONNECTION_LOST", 2))
            .collect();

        let report = detect(&window(&events), &default_scanners(&config()));
        assert!(report
            .patterns
            .iter()
            .all(|p| p.pattern_type != "frequent_disconnect"));
    }

    #[test]
    fn ack_timeout_cluster_uses_error_codes() {
        let events: Vec<LogEvent> = (0..3)
            .map(|i| {
                let mut e = named_event(1_000 + i, "MQTT_ACK", 3);
                e.tracking.error_code = Some("ACK_TIMEOUT".to_string());
                e
            })
            .collect();

        let report = detect(&window(&events), &default_scanners(&config()));
        assert!(report
            .patterns
            .iter()
            .any(|p| p.pattern_type == "ack_timeout_cluster"));
    }

    #[test]
    fn failing_scanner_does_not_stop_the_rest() {
        struct Exploding;
        impl Scanner for Exploding {
            fn id(&self) -> &'static str {
                "exploding"
            }
            fn run(&self, _window: &EventWindow<'_>) -> Result<Vec<AnomalyPattern>> {
                anyhow::bail!("synthetic failure")
            }
        }

        let events: Vec<LogEvent> = (0..6)
            .map(|i| named_event(1_000 + i, "DISCONNECT", 2))
            .collect();

        let mut scanners = default_scanners(&config());
        scanners.insert(0, Box::new(Exploding));

        let report = detect(&window(&events), &scanners);
        assert_eq!(report.summary.scanners_failed, 1);
        assert!(report
            .patterns
            .iter()
            .any(|p| p.pattern_type == "frequent_disconnect"));
    }

    #[test]
    fn evidence_sample_is_bounded() {
        let events: Vec<LogEvent> = (0..50)
            .map(|i| named_event(1_000 + i, "DISCONNECT", 2))
            .collect();

        let report = detect(&window(&events), &default_scanners(&config()));
        let pattern = report
            .patterns
            .iter()
            .find(|p| p.pattern_type == "frequent_disconnect")
            .expect("disconnect pattern");
        assert_eq!(pattern.evidence.count, 50);
        assert_eq!(pattern.evidence.event_ids.len(), 20);
    }
}
