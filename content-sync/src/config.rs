use crate::types::ContentType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_POLL_INTERVAL_MS: u64 = 1000;

/// Options recognized by the sync core. Passed in the `initialize` params;
/// every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    #[serde(default = "default_webhook_freshness_window_ms")]
    pub webhook_freshness_window_ms: u64,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
    #[serde(default = "default_poll_failure_limit")]
    pub poll_failure_limit: u32,
    #[serde(default = "default_poll_cooldown_ms")]
    pub poll_cooldown_ms: u64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_metrics_window_ms")]
    pub metrics_window_ms: u64,
    #[serde(default = "default_content_types")]
    pub content_types: Vec<ContentType>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    5000
}
fn default_retry_backoff_multiplier() -> f64 {
    2.0
}
fn default_webhook_freshness_window_ms() -> u64 {
    5 * 60 * 1000
}
fn default_poll_failure_limit() -> u32 {
    3
}
fn default_poll_cooldown_ms() -> u64 {
    30_000
}
fn default_monitor_interval_ms() -> u64 {
    30_000
}
fn default_metrics_window_ms() -> u64 {
    5 * 60 * 1000
}
fn default_content_types() -> Vec<ContentType> {
    ContentType::ALL.to_vec()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
            webhook_freshness_window_ms: default_webhook_freshness_window_ms(),
            alert_thresholds: AlertThresholds::default(),
            poll_failure_limit: default_poll_failure_limit(),
            poll_cooldown_ms: default_poll_cooldown_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            metrics_window_ms: default_metrics_window_ms(),
            content_types: default_content_types(),
            webhook_secret: None,
            source_url: None,
        }
    }
}

impl SyncConfig {
    /// Clamp values that would otherwise hammer the backend or never back off.
    pub fn normalized(mut self) -> Self {
        self.poll_interval_ms = clamp_poll_interval(self.poll_interval_ms);
        if self.retry_backoff_multiplier.is_nan() || self.retry_backoff_multiplier < 1.0 {
            self.retry_backoff_multiplier = 1.0;
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            self.retry_max_delay_ms = self.retry_base_delay_ms;
        }
        self.poll_failure_limit = self.poll_failure_limit.max(1);
        if self.content_types.is_empty() {
            self.content_types = default_content_types();
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            multiplier: self.retry_backoff_multiplier,
        }
    }
}

pub fn clamp_poll_interval(ms: u64) -> u64 {
    ms.max(MIN_POLL_INTERVAL_MS)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// `min(base * multiplier^retry_count, max)`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let ms = self.base_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// Alert thresholds, evaluated over the metrics window. Rates are percentages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertThresholds {
    #[serde(default = "default_webhook_failure_rate")]
    pub webhook_failure_rate: f64,
    #[serde(default = "default_cache_hit_rate")]
    pub cache_hit_rate: f64,
    #[serde(default = "default_error_rate")]
    pub error_rate: f64,
    #[serde(default = "default_response_time_ms")]
    pub response_time_ms: f64,
    #[serde(default = "default_security_events")]
    pub security_events: u64,
}

fn default_webhook_failure_rate() -> f64 {
    10.0
}
fn default_cache_hit_rate() -> f64 {
    80.0
}
fn default_error_rate() -> f64 {
    5.0
}
fn default_response_time_ms() -> f64 {
    1000.0
}
fn default_security_events() -> u64 {
    5
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            webhook_failure_rate: default_webhook_failure_rate(),
            cache_hit_rate: default_cache_hit_rate(),
            error_rate: default_error_rate(),
            response_time_ms: default_response_time_ms(),
            security_events: default_security_events(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: SyncConfig = serde_json::from_value(json!({ "maxRetries": 5 })).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.webhook_freshness_window_ms, 300_000);
        assert_eq!(config.alert_thresholds.cache_hit_rate, 80.0);
        assert_eq!(config.content_types, ContentType::ALL.to_vec());
    }

    #[test]
    fn poll_interval_is_clamped_to_minimum() {
        let config = SyncConfig {
            poll_interval_ms: 250,
            ..SyncConfig::default()
        }
        .normalized();
        assert_eq!(config.poll_interval_ms, MIN_POLL_INTERVAL_MS);
    }

    #[test]
    fn backoff_grows_then_caps() {
        let policy = SyncConfig::default().retry_policy();
        let delays: Vec<u64> = (0..8).map(|n| policy.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000, 5000]);
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
