//! Wires the components together behind one handle owned by the host.

use crate::bus::{BroadcastBus, ChannelTransport, Subscription};
use crate::cache::{ContentView, InvalidationEngine};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::monitor::{Alert, HealthReport, Monitor};
use crate::poller::{DriftDetector, PollOutcome, PollerStatus};
use crate::source::ContentSource;
use crate::types::{record_channel, CacheUpdate, ChangeEvent, ProcessingResult, RawChangeEvent};
use crate::webhook::{ChangeHandler, PendingRetry, VisibilityHandler, WebhookProcessor};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

pub struct ContentSync {
    config: SyncConfig,
    bus: Arc<BroadcastBus>,
    engine: InvalidationEngine,
    processor: WebhookProcessor,
    detector: DriftDetector,
    monitor: Monitor,
}

impl ContentSync {
    pub fn new(config: SyncConfig, source: Arc<dyn ContentSource>) -> Self {
        let handler = Arc::new(VisibilityHandler::new(source.clone()));
        Self::with_handler(config, source, handler)
    }

    pub fn with_handler(
        config: SyncConfig,
        source: Arc<dyn ContentSource>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        let config = config.normalized();
        let (records_tx, records_rx) = record_channel();
        let bus = Arc::new(BroadcastBus::new());
        let engine = InvalidationEngine::new(source.clone(), bus.clone(), records_tx.clone());
        let processor = WebhookProcessor::new(&config, handler, engine.clone(), records_tx.clone());
        let detector = DriftDetector::new(&config, source, engine.clone(), records_tx);
        let monitor = Monitor::new(&config, records_rx);

        Self {
            config,
            bus,
            engine,
            processor,
            detector,
            monitor,
        }
    }

    /// Start the poll loop and the monitor's collection loop.
    pub fn start(&self) {
        self.detector.start();
        self.monitor.start();
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            content_types = ?self.config.content_types,
            "content sync started"
        );
    }

    /// Stop polling and monitoring and cancel pending retries.
    pub fn stop(&self) {
        self.detector.stop();
        self.processor.stop();
        self.monitor.stop();
        info!("content sync stopped");
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn notify_change(
        &self,
        event: ChangeEvent,
        signature: Option<&str>,
    ) -> Result<ProcessingResult, SyncError> {
        self.processor.process(event, signature).await
    }

    pub async fn notify_raw(
        &self,
        raw: RawChangeEvent,
        signature: Option<&str>,
    ) -> Result<ProcessingResult, SyncError> {
        self.processor.process_raw(raw, signature).await
    }

    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn on_cache_update<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CacheUpdate) + Send + Sync + 'static,
    {
        self.bus.subscribe(listener)
    }

    /// Share cache updates with other instances attached to `transport`.
    /// Updates from other instances invalidate this instance's cache before
    /// local listeners are told.
    pub fn attach_transport(&self, transport: &ChannelTransport) -> JoinHandle<()> {
        transport.attach_with(&self.bus, Some(self.engine.remote_applier()))
    }

    pub async fn read(&self, view: &ContentView) -> Result<Value, SyncError> {
        self.engine.read(view).await
    }

    pub fn get_health_status(&self) -> HealthReport {
        self.monitor.get_health_status()
    }

    pub fn export_metrics(&self) -> Value {
        self.monitor.export_metrics()
    }

    /// Collect metrics and raise any new alerts now.
    pub fn check_alerts(&self) -> Vec<Alert> {
        self.monitor.collect();
        self.monitor.check_alerts()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.monitor.active_alerts()
    }

    pub fn resolve_alert(&self, id: Uuid) -> Option<Alert> {
        self.monitor.resolve_alert(id)
    }

    pub async fn force_check(&self) -> PollOutcome {
        self.detector.force_check().await
    }

    pub fn set_frequency(&self, ms: u64) -> u64 {
        self.detector.set_frequency(ms)
    }

    pub fn poller_status(&self) -> PollerStatus {
        self.detector.status()
    }

    pub fn recent_results(&self) -> Vec<ProcessingResult> {
        self.processor.recent_results()
    }

    pub fn retry_queue(&self) -> Vec<PendingRetry> {
        self.processor.retry_queue()
    }

    pub fn subscribe_results(&self) -> tokio::sync::broadcast::Receiver<ProcessingResult> {
        self.processor.subscribe_results()
    }
}
