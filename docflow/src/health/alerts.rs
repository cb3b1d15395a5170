//! Threshold alerts over published metrics.
//!
//! An [`AlertRule`] watches one metric over a sliding window. Each call to
//! [`AlertManager::evaluate`] compares the current value against the
//! threshold:
//!
//! ```text
//!            value > threshold
//!            and cooldown elapsed
//!   ┌──────┐ ───────────────────▶ ┌────────┐
//!   │ Idle │                      │ Firing │
//!   └──────┘ ◀─────────────────── └────────┘
//!             value <= threshold
//!             (emits Resolved)
//! ```
//!
//! Callbacks run on the evaluating thread after the rule lock is released.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::metrics::MetricsStateSnapshot;

/// Default minimum time between two firings of the same rule.
pub const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 300;

/// The metric an alert rule watches.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AlertMetric {
    /// Fraction of stage results that failed.
    ErrorRate,
    /// 99th percentile stage duration in seconds, for one stage or all.
    StageLatencyP99 { stage: Option<String> },
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertMetric::ErrorRate => f.write_str("error_rate"),
            AlertMetric::StageLatencyP99 { stage: None } => f.write_str("stage_latency_p99"),
            AlertMetric::StageLatencyP99 { stage: Some(stage) } => {
                write!(f, "stage_latency_p99[{}]", stage)
            }
        }
    }
}

/// A threshold on a metric over a window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub window: Duration,
    pub cooldown: Duration,
}

impl AlertRule {
    pub fn new(name: impl Into<String>, metric: AlertMetric, threshold: f64, window: Duration) -> Self {
        Self {
            name: name.into(),
            metric,
            threshold,
            window,
            cooldown: Duration::from_secs(DEFAULT_ALERT_COOLDOWN_SECS),
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn measure(&self, snapshot: &MetricsStateSnapshot) -> f64 {
        match &self.metric {
            AlertMetric::ErrorRate => snapshot.error_rate(self.window),
            AlertMetric::StageLatencyP99 { stage } => snapshot
                .stage_p99(stage.as_deref(), self.window)
                .unwrap_or(0.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Firing,
    Resolved,
}

/// A rule crossing its threshold in either direction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    pub rule: String,
    pub metric: AlertMetric,
    pub value: f64,
    pub threshold: f64,
    pub state: AlertState,
    pub at: DateTime<Utc>,
}

/// Called for every alert produced by an evaluation.
pub type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

#[derive(Debug)]
struct RuleState {
    rule: AlertRule,
    firing: bool,
    last_fired: Option<Instant>,
}

/// Evaluates alert rules and dispatches alerts to callbacks.
#[derive(Default)]
pub struct AlertManager {
    rules: Mutex<Vec<RuleState>>,
    callbacks: Mutex<Vec<AlertCallback>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.lock().push(RuleState {
            rule,
            firing: false,
            last_fired: None,
        });
    }

    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Arc::new(callback));
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.lock().iter().map(|s| s.rule.clone()).collect()
    }

    /// Names of rules currently firing.
    pub fn firing(&self) -> Vec<String> {
        self.rules
            .lock()
            .iter()
            .filter(|s| s.firing)
            .map(|s| s.rule.name.clone())
            .collect()
    }

    /// Checks every rule against the snapshot and notifies callbacks.
    pub fn evaluate(&self, snapshot: &MetricsStateSnapshot) -> Vec<Alert> {
        let now = Instant::now();
        let mut alerts = Vec::new();

        {
            let mut rules = self.rules.lock();
            for state in rules.iter_mut() {
                let value = state.rule.measure(snapshot);
                let over = value > state.rule.threshold;

                let transition = if over && !state.firing {
                    let cooled = state
                        .last_fired
                        .map_or(true, |at| now.duration_since(at) >= state.rule.cooldown);
                    cooled.then_some(AlertState::Firing)
                } else if !over && state.firing {
                    Some(AlertState::Resolved)
                } else {
                    None
                };

                let Some(transition) = transition else {
                    continue;
                };
                match transition {
                    AlertState::Firing => {
                        state.firing = true;
                        state.last_fired = Some(now);
                        warn!(
                            rule = %state.rule.name,
                            metric = %state.rule.metric,
                            value,
                            threshold = state.rule.threshold,
                            "Alert firing"
                        );
                    }
                    AlertState::Resolved => {
                        state.firing = false;
                        info!(rule = %state.rule.name, value, "Alert resolved");
                    }
                }
                alerts.push(Alert {
                    rule: state.rule.name.clone(),
                    metric: state.rule.metric.clone(),
                    value,
                    threshold: state.rule.threshold,
                    state: transition,
                    at: Utc::now(),
                });
            }
        }

        if !alerts.is_empty() {
            let callbacks = self.callbacks.lock().clone();
            for alert in &alerts {
                for callback in &callbacks {
                    callback(alert);
                }
            }
        }

        alerts
    }
}

impl fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertManager")
            .field("rules", &self.rules.lock().len())
            .field("callbacks", &self.callbacks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageStatus;

    fn snapshot(success: usize, failed: usize, duration: Duration) -> MetricsStateSnapshot {
        let mut snapshot = MetricsStateSnapshot::default();
        let now = Instant::now();
        for _ in 0..success {
            snapshot
                .state
                .record_stage("ocr".into(), StageStatus::Success, duration, 1, now);
        }
        for _ in 0..failed {
            snapshot
                .state
                .record_stage("ocr".into(), StageStatus::Failed, duration, 1, now);
        }
        snapshot
    }

    fn error_rule(cooldown: Duration) -> AlertRule {
        AlertRule::new("errors", AlertMetric::ErrorRate, 0.25, Duration::from_secs(60))
            .with_cooldown(cooldown)
    }

    #[test]
    fn test_fires_once_then_resolves() {
        let manager = AlertManager::new();
        manager.add_rule(error_rule(Duration::ZERO));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.on_alert(move |alert| sink.lock().push(alert.state));

        let bad = snapshot(1, 3, Duration::from_millis(10));
        let fired = manager.evaluate(&bad);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state, AlertState::Firing);
        assert_eq!(fired[0].value, 0.75);
        assert_eq!(manager.firing(), vec!["errors".to_string()]);

        // Still over threshold: no repeat while firing.
        assert!(manager.evaluate(&bad).is_empty());

        let good = snapshot(10, 0, Duration::from_millis(10));
        let resolved = manager.evaluate(&good);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].state, AlertState::Resolved);
        assert!(manager.firing().is_empty());

        assert_eq!(*seen.lock(), vec![AlertState::Firing, AlertState::Resolved]);
    }

    #[test]
    fn test_cooldown_suppresses_refire() {
        let manager = AlertManager::new();
        manager.add_rule(error_rule(Duration::from_secs(3600)));

        let bad = snapshot(0, 4, Duration::from_millis(10));
        let good = snapshot(4, 0, Duration::from_millis(10));

        assert_eq!(manager.evaluate(&bad).len(), 1);
        assert_eq!(manager.evaluate(&good).len(), 1);
        assert!(manager.evaluate(&bad).is_empty());
    }

    #[test]
    fn test_latency_rule() {
        let manager = AlertManager::new();
        manager.add_rule(
            AlertRule::new(
                "slow-ocr",
                AlertMetric::StageLatencyP99 {
                    stage: Some("ocr".into()),
                },
                1.0,
                Duration::from_secs(60),
            )
            .with_cooldown(Duration::ZERO),
        );

        assert!(manager.evaluate(&snapshot(5, 0, Duration::from_millis(100))).is_empty());

        let alerts = manager.evaluate(&snapshot(5, 0, Duration::from_secs(2)));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule, "slow-ocr");
        assert_eq!(alerts[0].metric.to_string(), "stage_latency_p99[ocr]");
    }

    #[test]
    fn test_no_data_does_not_fire() {
        let manager = AlertManager::new();
        manager.add_rule(error_rule(Duration::ZERO));
        assert!(manager.evaluate(&MetricsStateSnapshot::default()).is_empty());
    }
}
