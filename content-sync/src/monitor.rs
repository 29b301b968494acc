//! Aggregates the records emitted by the other components into rolling
//! metrics, raises deduplicated threshold alerts and derives system health.

use crate::config::{AlertThresholds, SyncConfig};
use crate::types::{RecordReceiver, SyncRecord};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_ALERT_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    WebhookFailure,
    CachePerformance,
    ErrorRate,
    ResponseTime,
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn from_breaches(count: usize) -> Self {
        match count {
            0 => HealthStatus::Healthy,
            1..=2 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

/// Aggregates over the metrics window. Rates are percentages.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub collected_at: Option<DateTime<Utc>>,
    pub webhooks_total: u64,
    pub webhooks_succeeded: u64,
    pub webhooks_failed: u64,
    pub webhook_success_rate: f64,
    pub avg_processing_time_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub cache_operations: u64,
    pub cache_operation_failures: u64,
    pub avg_cache_operation_ms: f64,
    pub polls: u64,
    pub poll_failures: u64,
    pub changes_detected: u64,
    pub error_rate: f64,
    pub pending_retries: usize,
    pub security_events: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub metrics: Metrics,
    pub active_alerts: Vec<Alert>,
}

#[derive(Debug, Clone)]
enum Sample {
    Webhook { success: bool, processing_ms: u64 },
    CacheOperation { success: bool, duration_ms: u64 },
    CacheAccess { hit: bool },
    Security,
    Poll { success: bool, changes: usize },
}

struct Breach {
    alert_type: AlertType,
    message: String,
    value: f64,
    threshold: f64,
    severity: AlertSeverity,
}

#[derive(Default)]
struct MonitorState {
    samples: VecDeque<(DateTime<Utc>, Sample)>,
    pending_retries: usize,
    metrics: Metrics,
    open: Vec<Alert>,
    history: VecDeque<Alert>,
}

struct Inner {
    thresholds: AlertThresholds,
    window: chrono::Duration,
    interval: Duration,
    records: Mutex<RecordReceiver>,
    state: Mutex<MonitorState>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    pub fn new(config: &SyncConfig, records: RecordReceiver) -> Self {
        Self {
            inner: Arc::new(Inner {
                thresholds: config.alert_thresholds.clone(),
                window: chrono::Duration::milliseconds(config.metrics_window_ms as i64),
                interval: Duration::from_millis(config.monitor_interval_ms.max(1)),
                records: Mutex::new(records),
                state: Mutex::new(MonitorState::default()),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Collect and check alerts on the configured interval.
    pub fn start(&self) {
        let mut cancel = self.inner.cancel.lock();
        if cancel.is_some() {
            return;
        }
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        *cancel = Some(cancel_tx);
        drop(cancel);

        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.inner.interval);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {
                        monitor.collect();
                        monitor.check_alerts();
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(cancel) = self.inner.cancel.lock().take() {
            let _ = cancel.send(true);
        }
    }

    /// Drain pending records and recompute the aggregates.
    pub fn collect(&self) -> Metrics {
        self.collect_at(Utc::now())
    }

    fn collect_at(&self, now: DateTime<Utc>) -> Metrics {
        let drained: Vec<SyncRecord> = {
            let mut rx = self.inner.records.lock();
            let mut drained = Vec::new();
            while let Ok(record) = rx.try_recv() {
                drained.push(record);
            }
            drained
        };

        let mut state = self.inner.state.lock();
        for record in drained {
            let sample = match record {
                SyncRecord::Webhook(result) => Sample::Webhook {
                    success: result.success,
                    processing_ms: result.processing_time_ms,
                },
                SyncRecord::CacheOperation(op) => Sample::CacheOperation {
                    success: op.success,
                    duration_ms: op.duration_ms,
                },
                SyncRecord::CacheAccess { hit } => Sample::CacheAccess { hit },
                SyncRecord::SecurityEvent { .. } => Sample::Security,
                SyncRecord::Poll { success, changes, .. } => Sample::Poll { success, changes },
                SyncRecord::RetryQueue { pending } => {
                    state.pending_retries = pending;
                    continue;
                }
            };
            state.samples.push_back((now, sample));
        }

        let cutoff = now - self.inner.window;
        while state.samples.front().is_some_and(|(at, _)| *at < cutoff) {
            state.samples.pop_front();
        }

        let metrics = aggregate(&state.samples, state.pending_retries, now);
        debug!(
            webhooks = metrics.webhooks_total,
            success_rate = metrics.webhook_success_rate,
            cache_hit_rate = metrics.cache_hit_rate,
            "metrics collected"
        );
        state.metrics = metrics.clone();
        metrics
    }

    /// Compare the last collected metrics to the thresholds. Returns the
    /// alerts created by this call; a breach that already has an open alert
    /// with the same type and message creates nothing.
    pub fn check_alerts(&self) -> Vec<Alert> {
        let mut state = self.inner.state.lock();
        let breaches = evaluate(&state.metrics, &self.inner.thresholds);
        let mut created = Vec::new();

        for breach in breaches {
            let already_open = state
                .open
                .iter()
                .any(|a| a.alert_type == breach.alert_type && a.message == breach.message);
            if already_open {
                continue;
            }
            let alert = Alert {
                id: Uuid::new_v4(),
                alert_type: breach.alert_type,
                severity: breach.severity,
                message: breach.message,
                value: breach.value,
                threshold: breach.threshold,
                created_at: Utc::now(),
                resolved_at: None,
            };
            warn!(
                alert_id = %alert.id,
                alert_type = ?alert.alert_type,
                severity = ?alert.severity,
                value = alert.value,
                "{}",
                alert.message
            );
            state.open.push(alert.clone());
            created.push(alert);
        }
        created
    }

    /// Close an open alert. Returns `None` if it is unknown or already
    /// resolved.
    pub fn resolve_alert(&self, id: Uuid) -> Option<Alert> {
        let mut state = self.inner.state.lock();
        let pos = state.open.iter().position(|a| a.id == id)?;
        let mut alert = state.open.remove(pos);
        alert.resolved_at = Some(Utc::now());
        if state.history.len() >= MAX_ALERT_HISTORY {
            state.history.pop_front();
        }
        state.history.push_back(alert.clone());
        info!(alert_id = %id, "alert resolved");
        Some(alert)
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.inner.state.lock().open.clone()
    }

    /// Resolved alerts, newest first.
    pub fn alert_history(&self) -> Vec<Alert> {
        self.inner.state.lock().history.iter().rev().cloned().collect()
    }

    pub fn get_health_status(&self) -> HealthReport {
        let metrics = self.collect();
        let breaches = evaluate(&metrics, &self.inner.thresholds).len();
        HealthReport {
            status: HealthStatus::from_breaches(breaches),
            metrics,
            active_alerts: self.active_alerts(),
        }
    }

    pub fn export_metrics(&self) -> serde_json::Value {
        let report = self.get_health_status();
        serde_json::json!({
            "timestamp": Utc::now(),
            "status": report.status,
            "metrics": report.metrics,
            "thresholds": self.inner.thresholds,
            "activeAlerts": report.active_alerts,
            "resolvedAlerts": self.alert_history(),
        })
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn mean(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

fn aggregate(samples: &VecDeque<(DateTime<Utc>, Sample)>, pending_retries: usize, now: DateTime<Utc>) -> Metrics {
    let mut m = Metrics {
        collected_at: Some(now),
        pending_retries,
        ..Metrics::default()
    };
    let mut processing_total = 0;
    let mut cache_op_total = 0;

    for (_, sample) in samples {
        match sample {
            Sample::Webhook { success, processing_ms } => {
                m.webhooks_total += 1;
                if *success {
                    m.webhooks_succeeded += 1;
                } else {
                    m.webhooks_failed += 1;
                }
                processing_total += processing_ms;
            }
            Sample::CacheOperation { success, duration_ms } => {
                m.cache_operations += 1;
                if !success {
                    m.cache_operation_failures += 1;
                }
                cache_op_total += duration_ms;
            }
            Sample::CacheAccess { hit: true } => m.cache_hits += 1,
            Sample::CacheAccess { hit: false } => m.cache_misses += 1,
            Sample::Security => m.security_events += 1,
            Sample::Poll { success, changes } => {
                m.polls += 1;
                if !success {
                    m.poll_failures += 1;
                }
                m.changes_detected += *changes as u64;
            }
        }
    }

    m.webhook_success_rate = if m.webhooks_total == 0 {
        100.0
    } else {
        percent(m.webhooks_succeeded, m.webhooks_total)
    };
    m.avg_processing_time_ms = mean(processing_total, m.webhooks_total);
    m.cache_hit_rate = percent(m.cache_hits, m.cache_hits + m.cache_misses);
    m.avg_cache_operation_ms = mean(cache_op_total, m.cache_operations);

    let operations = m.webhooks_total + m.cache_operations + m.polls;
    let errors = m.webhooks_failed + m.cache_operation_failures + m.poll_failures;
    m.error_rate = percent(errors, operations);
    m
}

fn ceiling(value: f64, threshold: f64) -> AlertSeverity {
    if value >= threshold * 2.0 {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    }
}

fn evaluate(m: &Metrics, t: &AlertThresholds) -> Vec<Breach> {
    let mut breaches = Vec::new();

    let failure_rate = 100.0 - m.webhook_success_rate;
    if m.webhooks_total > 0 && failure_rate > t.webhook_failure_rate {
        breaches.push(Breach {
            alert_type: AlertType::WebhookFailure,
            message: format!("Webhook failure rate above {}%", t.webhook_failure_rate),
            value: failure_rate,
            threshold: t.webhook_failure_rate,
            severity: ceiling(failure_rate, t.webhook_failure_rate),
        });
    }

    if m.cache_hits + m.cache_misses > 0 && m.cache_hit_rate < t.cache_hit_rate {
        breaches.push(Breach {
            alert_type: AlertType::CachePerformance,
            message: format!("Cache hit rate below {}%", t.cache_hit_rate),
            value: m.cache_hit_rate,
            threshold: t.cache_hit_rate,
            severity: if m.cache_hit_rate <= t.cache_hit_rate / 2.0 {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            },
        });
    }

    if m.error_rate > t.error_rate {
        breaches.push(Breach {
            alert_type: AlertType::ErrorRate,
            message: format!("Error rate above {}%", t.error_rate),
            value: m.error_rate,
            threshold: t.error_rate,
            severity: ceiling(m.error_rate, t.error_rate),
        });
    }

    if m.webhooks_total > 0 && m.avg_processing_time_ms > t.response_time_ms {
        breaches.push(Breach {
            alert_type: AlertType::ResponseTime,
            message: format!("Average processing time above {}ms", t.response_time_ms),
            value: m.avg_processing_time_ms,
            threshold: t.response_time_ms,
            severity: ceiling(m.avg_processing_time_ms, t.response_time_ms),
        });
    }

    if m.security_events > t.security_events {
        let value = m.security_events as f64;
        let threshold = t.security_events as f64;
        breaches.push(Breach {
            alert_type: AlertType::Security,
            message: format!("More than {} security events in window", t.security_events),
            value,
            threshold,
            severity: ceiling(value, threshold),
        });
    }

    breaches
}
