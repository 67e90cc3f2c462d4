//! In-memory metrics and alerting.
//!
//! Counters, gauges and timestamped histograms with a retention window,
//! plus configurable thresholds that publish [`Alert`]s on breach with a
//! per-threshold cooldown. Snapshots feed external dashboards; baselines
//! feed the auto-rollback monitor.

use crate::events::{EventBus, SystemEvent};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Well-known counter names recorded by the learning pipeline.
pub mod counters {
    pub const ERRORS_CAPTURED: &str = "errors_captured";
    pub const ERRORS_RESOLVED: &str = "errors_resolved";
    pub const FIXES_PROPOSED: &str = "fixes_proposed";
    pub const FIXES_APPLIED: &str = "fixes_applied";
    pub const FIXES_REJECTED: &str = "fixes_rejected";
    pub const ROLLBACKS_PERFORMED: &str = "rollbacks_performed";
    pub const VALIDATION_PASSES: &str = "validation_passes";
    pub const VALIDATION_FAILURES: &str = "validation_failures";
}

/// Alert severity classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// A published alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub name: String,
    pub severity: AlertSeverity,
    /// The metric that tripped the threshold.
    pub metric: String,
    pub threshold: f64,
    pub current_value: f64,
    pub acknowledged: bool,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A gauge threshold that raises an alert when exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub name: String,
    pub metric: String,
    pub max_value: f64,
    pub severity: AlertSeverity,
    /// Minimum seconds between consecutive firings.
    pub cooldown_secs: u64,
}

impl AlertThreshold {
    pub fn new(name: &str, metric: &str, max_value: f64, severity: AlertSeverity) -> Self {
        Self {
            name: name.to_string(),
            metric: metric.to_string(),
            max_value,
            severity,
            cooldown_secs: 300,
        }
    }
}

/// Aggregate view of one histogram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct HistogramStats {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric state captured at apply time, compared against by the
/// auto-rollback monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBaseline {
    pub captured_at: DateTime<Utc>,
    pub error_rate: f64,
    pub response_time_ms: f64,
    pub memory_mib: f64,
    pub error_kinds: HashSet<String>,
}

/// Serializable snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub taken_at: DateTime<Utc>,
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramStats>,
    pub active_alerts: Vec<Alert>,
}

/// The monitor. Owners wrap it in a lock; operations are synchronous.
pub struct Monitor {
    retention: Duration,
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Vec<(DateTime<Utc>, f64)>>,
    error_kinds: HashSet<String>,
    thresholds: Vec<AlertThreshold>,
    alerts: Vec<Alert>,
    last_fired: HashMap<String, DateTime<Utc>>,
    events: EventBus,
}

impl Monitor {
    pub fn new(retention_hours: i64, events: EventBus) -> Self {
        Self {
            retention: Duration::hours(retention_hours),
            counters: HashMap::new(),
            gauges: HashMap::new(),
            histograms: HashMap::new(),
            error_kinds: HashSet::new(),
            thresholds: Vec::new(),
            alerts: Vec::new(),
            last_fired: HashMap::new(),
            events,
        }
    }

    pub fn incr(&mut self, name: &str) {
        self.incr_by(name, 1);
    }

    pub fn incr_by(&mut self, name: &str, by: u64) {
        *self.counters.entry(name.to_string()).or_default() += by;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn set_gauge(&mut self, name: &str, value: f64) {
        self.gauges.insert(name.to_string(), value);
        self.check_thresholds(name, value);
    }

    pub fn gauge(&self, name: &str) -> f64 {
        self.gauges.get(name).copied().unwrap_or(0.0)
    }

    /// Record one histogram sample (typically a duration in ms).
    pub fn observe(&mut self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_default()
            .push((Utc::now(), value));
    }

    /// Track a distinct error kind for new-error detection.
    pub fn record_error_kind(&mut self, kind: &str) {
        self.error_kinds.insert(kind.to_string());
    }

    pub fn error_kinds(&self) -> &HashSet<String> {
        &self.error_kinds
    }

    /// Aggregate stats over a histogram's retained samples.
    pub fn histogram_stats(&self, name: &str) -> HistogramStats {
        let Some(samples) = self.histograms.get(name) else {
            return HistogramStats::default();
        };
        let mut values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
        if values.is_empty() {
            return HistogramStats::default();
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = values.len();
        let sum: f64 = values.iter().sum();
        HistogramStats {
            count,
            avg: sum / count as f64,
            min: values[0],
            max: values[count - 1],
            p50: percentile(&values, 50.0),
            p95: percentile(&values, 95.0),
            p99: percentile(&values, 99.0),
        }
    }

    /// Drop histogram samples older than the retention window.
    pub fn prune_expired(&mut self) {
        let horizon = Utc::now() - self.retention;
        for samples in self.histograms.values_mut() {
            samples.retain(|(t, _)| *t > horizon);
        }
    }

    pub fn add_threshold(&mut self, threshold: AlertThreshold) {
        self.thresholds.push(threshold);
    }

    fn check_thresholds(&mut self, metric: &str, value: f64) {
        let now = Utc::now();
        let mut raised = Vec::new();
        for threshold in &self.thresholds {
            if threshold.metric != metric || value <= threshold.max_value {
                continue;
            }
            if let Some(last) = self.last_fired.get(&threshold.name)
                && (now - *last) < Duration::seconds(threshold.cooldown_secs as i64)
            {
                continue;
            }
            let alert = Alert {
                id: Uuid::new_v4(),
                name: threshold.name.clone(),
                severity: threshold.severity,
                metric: metric.to_string(),
                threshold: threshold.max_value,
                current_value: value,
                acknowledged: false,
                raised_at: now,
                resolved_at: None,
            };
            raised.push((threshold.name.clone(), alert));
        }
        for (name, alert) in raised {
            self.last_fired.insert(name, now);
            self.events.emit(SystemEvent::AlertRaised {
                alert_id: alert.id,
                name: alert.name.clone(),
                severity: alert.severity.as_str().to_string(),
            });
            tracing::warn!(
                alert = %alert.name,
                metric = %alert.metric,
                value = alert.current_value,
                "alert raised"
            );
            self.alerts.push(alert);
        }
    }

    /// Raise an alert directly (e.g. CRITICAL integrity or checksum
    /// events that are not gauge-driven).
    pub fn raise_alert(&mut self, name: &str, metric: &str, severity: AlertSeverity) -> Uuid {
        let alert = Alert {
            id: Uuid::new_v4(),
            name: name.to_string(),
            severity,
            metric: metric.to_string(),
            threshold: 0.0,
            current_value: 0.0,
            acknowledged: false,
            raised_at: Utc::now(),
            resolved_at: None,
        };
        let id = alert.id;
        self.events.emit(SystemEvent::AlertRaised {
            alert_id: id,
            name: alert.name.clone(),
            severity: severity.as_str().to_string(),
        });
        self.alerts.push(alert);
        id
    }

    pub fn acknowledge(&mut self, alert_id: Uuid) -> bool {
        if let Some(alert) = self.alerts.iter_mut().find(|a| a.id == alert_id) {
            alert.acknowledged = true;
            true
        } else {
            false
        }
    }

    pub fn resolve(&mut self, alert_id: Uuid) -> bool {
        if let Some(alert) = self.alerts.iter_mut().find(|a| a.id == alert_id) {
            alert.resolved_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn active_alerts(&self) -> Vec<&Alert> {
        self.alerts.iter().filter(|a| a.resolved_at.is_none()).collect()
    }

    /// Capture the baseline the auto-rollback monitor compares against.
    pub fn capture_baseline(&self) -> MetricsBaseline {
        MetricsBaseline {
            captured_at: Utc::now(),
            error_rate: self.gauge("error_rate"),
            response_time_ms: self.gauge("response_time_ms"),
            memory_mib: self.gauge("memory_mib"),
            error_kinds: self.error_kinds.clone(),
        }
    }

    /// Full snapshot for dashboards.
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            taken_at: Utc::now(),
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
            histograms: self
                .histograms
                .keys()
                .map(|k| (k.clone(), self.histogram_stats(k)))
                .collect(),
            active_alerts: self
                .alerts
                .iter()
                .filter(|a| a.resolved_at.is_none())
                .cloned()
                .collect(),
        }
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Monitor {
        Monitor::new(24, EventBus::default())
    }

    #[test]
    fn counters_accumulate() {
        let mut m = monitor();
        m.incr(counters::ERRORS_CAPTURED);
        m.incr_by(counters::ERRORS_CAPTURED, 2);
        assert_eq!(m.counter(counters::ERRORS_CAPTURED), 3);
        assert_eq!(m.counter("never_touched"), 0);
    }

    #[test]
    fn histogram_stats_cover_the_declared_aggregates() {
        let mut m = monitor();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0] {
            m.observe("analysis_duration_ms", v);
        }
        let stats = m.histogram_stats("analysis_duration_ms");
        assert_eq!(stats.count, 10);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.avg, 55.0);
        assert_eq!(stats.p50, 50.0);
        assert_eq!(stats.p95, 100.0);
        assert_eq!(stats.p99, 100.0);
    }

    #[test]
    fn empty_histogram_is_all_zeroes() {
        let m = monitor();
        assert_eq!(m.histogram_stats("missing"), HistogramStats::default());
    }

    #[test]
    fn threshold_breach_raises_alert_once_within_cooldown() {
        let mut m = monitor();
        m.add_threshold(AlertThreshold::new(
            "high-error-rate",
            "error_rate",
            0.1,
            AlertSeverity::Error,
        ));

        m.set_gauge("error_rate", 0.05);
        assert!(m.active_alerts().is_empty());

        m.set_gauge("error_rate", 0.2);
        assert_eq!(m.active_alerts().len(), 1);

        // Second breach inside the cooldown does not duplicate.
        m.set_gauge("error_rate", 0.3);
        assert_eq!(m.active_alerts().len(), 1);
    }

    #[test]
    fn alert_acknowledge_and_resolve() {
        let mut m = monitor();
        let id = m.raise_alert("integrity-violation", "audit", AlertSeverity::Critical);
        assert!(m.acknowledge(id));
        assert!(m.resolve(id));
        assert!(m.active_alerts().is_empty());
        assert!(!m.acknowledge(Uuid::new_v4()));
    }

    #[test]
    fn baseline_captures_gauges_and_error_kinds() {
        let mut m = monitor();
        m.set_gauge("error_rate", 0.02);
        m.set_gauge("response_time_ms", 120.0);
        m.set_gauge("memory_mib", 256.0);
        m.record_error_kind("missing_parameter");

        let baseline = m.capture_baseline();
        assert_eq!(baseline.error_rate, 0.02);
        assert_eq!(baseline.response_time_ms, 120.0);
        assert_eq!(baseline.memory_mib, 256.0);
        assert!(baseline.error_kinds.contains("missing_parameter"));
    }

    #[test]
    fn snapshot_includes_everything() {
        let mut m = monitor();
        m.incr(counters::FIXES_APPLIED);
        m.set_gauge("error_rate", 0.01);
        m.observe("apply_duration_ms", 42.0);

        let snap = m.snapshot();
        assert_eq!(snap.counters.get(counters::FIXES_APPLIED), Some(&1));
        assert_eq!(snap.gauges.get("error_rate"), Some(&0.01));
        assert_eq!(snap.histograms.get("apply_duration_ms").unwrap().count, 1);
    }
}
