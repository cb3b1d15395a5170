//! Metrics reporting layer.
//!
//! Reporters read the state published by the daemon and produce output in
//! a presentation format:
//!
//! - [`PrometheusReporter`]: text exposition format for a `/metrics`
//!   endpoint

use std::fmt::Write as _;
use std::time::Duration;

use super::daemon::MetricsStateSnapshot;
use super::state::{AggregatedState, ThroughputHistory};
use crate::executor::{LaneKind, LaneSnapshot};
use crate::pipeline::{PipelineStatus, StageStatus};
use crate::resource::AdmissionState;

/// Window used for the exported error rate.
pub const DEFAULT_ERROR_RATE_WINDOW_SECS: u64 = 60;

/// Quantiles exported for stage durations.
pub const STAGE_DURATION_QUANTILES: [f64; 3] = [0.5, 0.9, 0.99];

// =============================================================================
// Reporter Trait
// =============================================================================

/// Transforms aggregated state into a presentation format.
pub trait MetricsReporter {
    type Output;

    fn report(&self, state: &AggregatedState, history: &ThroughputHistory) -> Self::Output;

    /// Convenience method to report from a snapshot.
    fn report_snapshot(&self, snapshot: &MetricsStateSnapshot) -> Self::Output {
        self.report(&snapshot.state, &snapshot.history)
    }
}

// =============================================================================
// Prometheus Reporter
// =============================================================================

/// Renders metrics in the Prometheus text exposition format.
///
/// Lane occupancy, dropped progress events and the admission state are not
/// metric events; the caller samples them and hands them to the reporter.
#[derive(Clone, Debug)]
pub struct PrometheusReporter {
    lanes: Vec<LaneSnapshot>,
    dropped_progress_events: u64,
    admission_state: AdmissionState,
    error_rate_window: Duration,
}

impl Default for PrometheusReporter {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PrometheusReporter {
    pub fn new(lanes: Vec<LaneSnapshot>) -> Self {
        Self {
            lanes,
            dropped_progress_events: 0,
            admission_state: AdmissionState::Open,
            error_rate_window: Duration::from_secs(DEFAULT_ERROR_RATE_WINDOW_SECS),
        }
    }

    pub fn with_dropped_progress_events(mut self, dropped: u64) -> Self {
        self.dropped_progress_events = dropped;
        self
    }

    pub fn with_admission_state(mut self, state: AdmissionState) -> Self {
        self.admission_state = state;
        self
    }

    pub fn with_error_rate_window(mut self, window: Duration) -> Self {
        self.error_rate_window = window;
        self
    }

    fn lane(&self, kind: LaneKind) -> Option<&LaneSnapshot> {
        self.lanes.iter().find(|l| l.lane == kind)
    }
}

impl MetricsReporter for PrometheusReporter {
    type Output = String;

    fn report(&self, state: &AggregatedState, history: &ThroughputHistory) -> String {
        let mut out = String::new();

        header(&mut out, "docflow_documents_total", "counter", "Documents finished, by pipeline status.");
        for status in PipelineStatus::ALL {
            sample(
                &mut out,
                "docflow_documents_total",
                &[("status", status.as_str())],
                state.documents(status) as f64,
            );
        }

        header(&mut out, "docflow_documents_in_flight", "gauge", "Documents started and not yet finished.");
        sample(&mut out, "docflow_documents_in_flight", &[], state.in_flight_documents() as f64);

        header(&mut out, "docflow_documents_per_second", "gauge", "Document completion rate over the last second.");
        sample(&mut out, "docflow_documents_per_second", &[], history.current_rate());

        header(&mut out, "docflow_stage_duration_seconds", "summary", "Stage duration over recent results.");
        for (stage, stats) in &state.stages {
            for q in STAGE_DURATION_QUANTILES {
                if let Some(value) = stats.latencies.percentile(q) {
                    let quantile = q.to_string();
                    sample(
                        &mut out,
                        "docflow_stage_duration_seconds",
                        &[("stage", stage.as_str()), ("quantile", quantile.as_str())],
                        value,
                    );
                }
            }
        }

        header(&mut out, "docflow_stage_results_total", "counter", "Stage results, by terminal status.");
        for (stage, stats) in &state.stages {
            for status in StageStatus::ALL {
                sample(
                    &mut out,
                    "docflow_stage_results_total",
                    &[("stage", stage.as_str()), ("status", status.as_str())],
                    stats.count(status) as f64,
                );
            }
        }

        header(&mut out, "docflow_stage_attempts_total", "counter", "Attempts dispatched to the worker pool.");
        for (stage, stats) in &state.stages {
            sample(&mut out, "docflow_stage_attempts_total", &[("stage", stage.as_str())], stats.attempts as f64);
        }

        header(&mut out, "docflow_stage_retries_total", "counter", "Stage attempts retried after a failure.");
        sample(&mut out, "docflow_stage_retries_total", &[], state.stage_retries as f64);

        header(&mut out, "docflow_error_rate", "gauge", "Fraction of recent stage results that failed.");
        sample(&mut out, "docflow_error_rate", &[], state.error_rate(self.error_rate_window));

        header(&mut out, "docflow_lane_queue_depth", "gauge", "Tasks waiting for a running slot.");
        for lane in &self.lanes {
            sample(&mut out, "docflow_lane_queue_depth", &[("lane", lane.lane.as_str())], lane.queued as f64);
        }

        header(&mut out, "docflow_lane_active", "gauge", "Tasks running.");
        for lane in &self.lanes {
            sample(&mut out, "docflow_lane_active", &[("lane", lane.lane.as_str())], lane.running as f64);
        }

        header(&mut out, "docflow_lane_rejected_total", "counter", "Submissions refused because the lane was full.");
        for kind in LaneKind::ALL {
            // The lane's own counter includes rejections the manager retried.
            let value = self
                .lane(kind)
                .map_or(state.rejections_for(kind), |l| l.rejected);
            sample(&mut out, "docflow_lane_rejected_total", &[("lane", kind.as_str())], value as f64);
        }

        header(&mut out, "docflow_admission_rejected_total", "counter", "Documents refused by admission control.");
        sample(&mut out, "docflow_admission_rejected_total", &[], state.admission_rejections as f64);

        header(&mut out, "docflow_progress_dropped_events_total", "counter", "Progress events dropped from full buffers.");
        sample(&mut out, "docflow_progress_dropped_events_total", &[], self.dropped_progress_events as f64);

        header(&mut out, "docflow_admission_state", "gauge", "Admission state: 0 open, 1 throttled, 2 closed.");
        sample(&mut out, "docflow_admission_state", &[], f64::from(self.admission_state.gauge_value()));

        out
    }
}

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

fn sample(out: &mut String, name: &str, labels: &[(&str, &str)], value: f64) {
    out.push_str(name);
    if !labels.is_empty() {
        out.push('{');
        for (i, (key, val)) in labels.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}=\"{}\"", key, escape_label_value(val));
        }
        out.push('}');
    }
    let _ = writeln!(out, " {}", value);
}

/// Escapes a label value per the exposition format.
fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn lane(kind: LaneKind, running: usize, queued: usize, rejected: u64) -> LaneSnapshot {
        LaneSnapshot {
            lane: kind,
            running,
            queued,
            max_concurrency: 4,
            max_queue_depth: 8,
            peak_running: running,
            rejected,
            completed: 0,
        }
    }

    fn state() -> AggregatedState {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        state.documents_started = 2;
        state.record_document_finished(PipelineStatus::PartialFailure, now);
        state.record_stage("parse".into(), StageStatus::Success, Duration::from_millis(250), 1, now);
        state.record_stage("ocr".into(), StageStatus::Failed, Duration::from_secs(1), 3, now);
        state.record_retry("ocr".into());
        state.record_retry("ocr".into());
        state
    }

    #[test]
    fn test_report_contains_series() {
        let reporter = PrometheusReporter::new(vec![lane(LaneKind::Io, 2, 5, 7)])
            .with_dropped_progress_events(4)
            .with_admission_state(AdmissionState::Throttled);
        let text = reporter.report(&state(), &ThroughputHistory::default());

        assert!(text.contains("# TYPE docflow_documents_total counter"));
        assert!(text.contains("docflow_documents_total{status=\"partial_failure\"} 1"));
        assert!(text.contains("docflow_documents_in_flight 1"));
        assert!(text.contains("docflow_stage_duration_seconds{stage=\"parse\",quantile=\"0.99\"} 0.25"));
        assert!(text.contains("docflow_stage_results_total{stage=\"ocr\",status=\"failed\"} 1"));
        assert!(text.contains("docflow_stage_attempts_total{stage=\"ocr\"} 3"));
        assert!(text.contains("docflow_stage_retries_total 2"));
        assert!(text.contains("docflow_error_rate 0.5"));
        assert!(text.contains("docflow_lane_queue_depth{lane=\"io\"} 5"));
        assert!(text.contains("docflow_lane_active{lane=\"io\"} 2"));
        assert!(text.contains("docflow_lane_rejected_total{lane=\"io\"} 7"));
        assert!(text.contains("docflow_lane_rejected_total{lane=\"cpu_heavy\"} 0"));
        assert!(text.contains("docflow_progress_dropped_events_total 4"));
        assert!(text.contains("docflow_admission_state 1"));
        assert!(text.contains("docflow_documents_per_second 0"));
    }

    #[test]
    fn test_every_sample_has_type() {
        let text = PrometheusReporter::default().report(&state(), &ThroughputHistory::default());
        let typed: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("# TYPE "))
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            let name = line.split(['{', ' ']).next().unwrap();
            assert!(typed.contains(&name), "untyped series {}", name);
        }
    }

    #[test]
    fn test_label_values_are_escaped() {
        assert_eq!(escape_label_value(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(escape_label_value("x\ny"), "x\\ny");

        let mut state = AggregatedState::new();
        state.record_stage("we\"ird".into(), StageStatus::Success, Duration::from_millis(1), 1, Instant::now());
        let text = PrometheusReporter::default().report(&state, &ThroughputHistory::default());
        assert!(text.contains("stage=\"we\\\"ird\""));
    }
}
