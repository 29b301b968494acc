//! Validates, deduplicates and executes change events, retrying failures
//! with capped exponential backoff.

use crate::cache::InvalidationEngine;
use crate::config::{RetryPolicy, SyncConfig};
use crate::error::SyncError;
use crate::source::{ContentFilter, ContentSource};
use crate::types::{
    ChangeAction, ChangeEvent, InvalidationStrength, InvalidationTrigger, ProcessingResult,
    RawChangeEvent, RecordSender, SyncRecord,
};
use crate::verification;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const MAX_RECENT_RESULTS: usize = 50;
const MAX_COMPLETED_FINGERPRINTS: usize = 500;

/// What a handler learned while applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// The content is visible to public consumers, so cached views must be
    /// invalidated even for `create`/`update`.
    pub publicly_visible: bool,
}

/// Applies one change event. Implementations must be idempotent.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, event: &ChangeEvent) -> Result<HandlerOutcome, SyncError>;
}

/// Default handler: asks the content store whether the item is published.
pub struct VisibilityHandler {
    source: Arc<dyn ContentSource>,
}

impl VisibilityHandler {
    pub fn new(source: Arc<dyn ContentSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ChangeHandler for VisibilityHandler {
    async fn handle(&self, event: &ChangeEvent) -> Result<HandlerOutcome, SyncError> {
        match event.action {
            ChangeAction::Create | ChangeAction::Update => {
                let item = self
                    .source
                    .fetch_item(event.content_type, &event.content_id, ContentFilter::PublishedOnly)
                    .await
                    .map_err(|e| SyncError::processing(e.to_string()))?;
                Ok(HandlerOutcome {
                    publicly_visible: item.is_some(),
                })
            }
            ChangeAction::Delete | ChangeAction::Publish | ChangeAction::Unpublish => {
                Ok(HandlerOutcome {
                    publicly_visible: true,
                })
            }
        }
    }
}

/// One pending retry. Replacing the entry cancels the previous timer.
struct RetryEntry {
    token: u64,
    fingerprint: String,
    attempt: u32,
    due_at: DateTime<Utc>,
    cancel: watch::Sender<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRetry {
    pub webhook_id: String,
    pub attempt: u32,
    pub due_at: DateTime<Utc>,
}

/// Holds an event's `in_flight` slot for the duration of one attempt.
/// Dropping it releases the slot unless the attempt completed or handed the
/// event to a scheduled retry.
struct InFlightSlot {
    inner: Arc<Inner>,
    fingerprint: String,
    webhook_id: String,
    held: bool,
}

impl InFlightSlot {
    fn new(inner: Arc<Inner>, fingerprint: String, webhook_id: String) -> Self {
        Self {
            inner,
            fingerprint,
            webhook_id,
            held: true,
        }
    }

    fn keep(mut self) {
        self.held = false;
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.in_flight.get(&self.fingerprint) == Some(&self.webhook_id) {
            state.in_flight.remove(&self.fingerprint);
            debug!(webhook_id = %self.webhook_id, "released in-flight slot");
        }
    }
}

#[derive(Default)]
struct ProcessorState {
    /// fingerprint -> webhook id, for events between intake and completion.
    in_flight: HashMap<String, String>,
    completed: HashSet<String>,
    completed_order: VecDeque<String>,
    retries: HashMap<String, RetryEntry>,
    recent: VecDeque<ProcessingResult>,
}

impl ProcessorState {
    fn mark_completed(&mut self, fingerprint: &str) {
        self.in_flight.remove(fingerprint);
        if self.completed.insert(fingerprint.to_string()) {
            self.completed_order.push_back(fingerprint.to_string());
            if self.completed_order.len() > MAX_COMPLETED_FINGERPRINTS {
                if let Some(oldest) = self.completed_order.pop_front() {
                    self.completed.remove(&oldest);
                }
            }
        }
    }
}

struct Inner {
    policy: RetryPolicy,
    freshness_window_ms: u64,
    secret: Option<String>,
    handler: Arc<dyn ChangeHandler>,
    engine: InvalidationEngine,
    records: RecordSender,
    results: broadcast::Sender<ProcessingResult>,
    state: Mutex<ProcessorState>,
    counter: AtomicU64,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    inner: Arc<Inner>,
}

impl WebhookProcessor {
    pub fn new(
        config: &SyncConfig,
        handler: Arc<dyn ChangeHandler>,
        engine: InvalidationEngine,
        records: RecordSender,
    ) -> Self {
        let (results, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                policy: config.retry_policy(),
                freshness_window_ms: config.webhook_freshness_window_ms,
                secret: config.webhook_secret.clone(),
                handler,
                engine,
                records,
                results,
                state: Mutex::new(ProcessorState::default()),
                counter: AtomicU64::new(0),
            }),
        }
    }

    /// Validate a wire payload, then [`process`](Self::process) it.
    pub async fn process_raw(
        &self,
        raw: RawChangeEvent,
        signature: Option<&str>,
    ) -> Result<ProcessingResult, SyncError> {
        let embedded = raw.signature.clone();
        let signature = signature.or(embedded.as_deref());
        match ChangeEvent::try_from(raw) {
            Ok(event) => self.process(event, signature).await,
            Err(errors) => {
                let err = SyncError::Validation { errors };
                let webhook_id = format!("invalid:{}", self.next_counter());
                self.reject(webhook_id, 0, &err);
                Err(err)
            }
        }
    }

    /// Process one change event.
    ///
    /// Validation, signature and freshness failures are returned as errors
    /// and never retried. Handler and invalidation failures come back as an
    /// unsuccessful result with `retry_in_ms` set while retries remain; the
    /// outcome of later attempts is published on
    /// [`subscribe_results`](Self::subscribe_results).
    pub async fn process(
        &self,
        event: ChangeEvent,
        signature: Option<&str>,
    ) -> Result<ProcessingResult, SyncError> {
        let fingerprint = event.fingerprint();
        let webhook_id = format!("{fingerprint}:{}", self.next_counter());

        if let Err(err) = self.validate(&event, signature) {
            self.reject(webhook_id, event.retry_count, &err);
            return Err(err);
        }

        {
            let mut state = self.inner.state.lock();
            if state.completed.contains(&fingerprint) || state.in_flight.contains_key(&fingerprint)
            {
                drop(state);
                debug!(fingerprint = %fingerprint, "duplicate change event ignored");
                let result = ProcessingResult {
                    webhook_id,
                    success: true,
                    cache_invalidated: false,
                    retry_count: event.retry_count,
                    processing_time_ms: 0,
                    errors: Vec::new(),
                    duplicate: true,
                    retry_in_ms: None,
                    terminal: false,
                };
                emit(&self.inner, &result);
                return Ok(result);
            }
            state.in_flight.insert(fingerprint.clone(), webhook_id.clone());
        }
        let slot = InFlightSlot::new(self.inner.clone(), fingerprint, webhook_id.clone());

        info!(
            webhook_id = %webhook_id,
            action = %event.action,
            content_type = %event.content_type,
            content_id = %event.content_id,
            "processing change event"
        );
        Ok(attempt(self.inner.clone(), webhook_id, event, slot).await)
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<ProcessingResult> {
        self.inner.results.subscribe()
    }

    pub fn pending_retries(&self) -> usize {
        self.inner.state.lock().retries.len()
    }

    pub fn retry_queue(&self) -> Vec<PendingRetry> {
        let state = self.inner.state.lock();
        let mut queue: Vec<PendingRetry> = state
            .retries
            .iter()
            .map(|(id, entry)| PendingRetry {
                webhook_id: id.clone(),
                attempt: entry.attempt,
                due_at: entry.due_at,
            })
            .collect();
        queue.sort_by_key(|p| p.due_at);
        queue
    }

    /// Most recent results, newest first.
    pub fn recent_results(&self) -> Vec<ProcessingResult> {
        self.inner.state.lock().recent.iter().rev().cloned().collect()
    }

    /// Cancel every pending retry. Cancelled events give up their
    /// `in_flight` slot so a re-delivery is processed afresh.
    pub fn stop(&self) {
        let cancelled: Vec<RetryEntry> = {
            let mut state = self.inner.state.lock();
            let cancelled: Vec<RetryEntry> = state.retries.drain().map(|(_, entry)| entry).collect();
            for entry in &cancelled {
                state.in_flight.remove(&entry.fingerprint);
            }
            cancelled
        };
        for entry in &cancelled {
            let _ = entry.cancel.send(true);
        }
        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "cancelled pending retries");
        }
        let _ = self.inner.records.send(SyncRecord::RetryQueue { pending: 0 });
    }

    /// Arm the retry timer for `webhook_id`, cancelling any timer already
    /// armed for it.
    pub(crate) fn schedule_retry(&self, webhook_id: String, event: ChangeEvent, delay: Duration) {
        schedule_retry(&self.inner, webhook_id, event, delay);
    }

    fn validate(&self, event: &ChangeEvent, signature: Option<&str>) -> Result<(), SyncError> {
        if event.content_id.trim().is_empty() {
            return Err(SyncError::validation("contentId must not be empty"));
        }

        let signature = signature.or(event.signature.as_deref());
        if let Some(signature) = signature {
            let verified = match &self.inner.secret {
                Some(secret) => verification::verify_event_signature(secret, event, signature),
                None => false,
            };
            if !verified {
                return Err(SyncError::Authenticity);
            }
        }

        let age_ms = (Utc::now() - event.timestamp).num_milliseconds();
        if age_ms.unsigned_abs() > self.inner.freshness_window_ms {
            return Err(SyncError::StaleEvent {
                age_ms,
                window_ms: self.inner.freshness_window_ms,
            });
        }
        Ok(())
    }

    fn reject(&self, webhook_id: String, retry_count: u32, err: &SyncError) {
        if err.is_security_event() {
            warn!(webhook_id = %webhook_id, "change event failed signature check");
            let _ = self.inner.records.send(SyncRecord::SecurityEvent {
                reason: err.to_string(),
            });
        } else {
            warn!(webhook_id = %webhook_id, kind = err.kind(), error = %err, "change event rejected");
        }
        let result = ProcessingResult {
            webhook_id,
            success: false,
            cache_invalidated: false,
            retry_count,
            processing_time_ms: 0,
            errors: vec![err.to_string()],
            duplicate: false,
            retry_in_ms: None,
            terminal: true,
        };
        emit(&self.inner, &result);
    }

    fn next_counter(&self) -> u64 {
        self.inner.counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Run the handler and any invalidation for one attempt.
///
/// Boxed so retry tasks can spawn it recursively.
fn attempt(
    inner: Arc<Inner>,
    webhook_id: String,
    event: ChangeEvent,
    slot: InFlightSlot,
) -> BoxFuture<'static, ProcessingResult> {
    async move {
        let started = Instant::now();
        let mut cache_invalidated = false;

        let outcome = match inner.handler.handle(&event).await {
            Ok(out) => {
                let needed = event.action.strength() == InvalidationStrength::Immediate
                    || out.publicly_visible;
                if needed {
                    match inner.engine.apply_change(&event, InvalidationTrigger::Webhook).await {
                        Ok(_) => {
                            cache_invalidated = true;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };

        let processing_time_ms = started.elapsed().as_millis() as u64;
        let fingerprint = event.fingerprint();

        let result = match outcome {
            Ok(()) => {
                inner.state.lock().mark_completed(&fingerprint);
                slot.keep();
                info!(
                    webhook_id = %webhook_id,
                    cache_invalidated,
                    retry_count = event.retry_count,
                    processing_time_ms,
                    "change event processed"
                );
                ProcessingResult {
                    webhook_id,
                    success: true,
                    cache_invalidated,
                    retry_count: event.retry_count,
                    processing_time_ms,
                    errors: Vec::new(),
                    duplicate: false,
                    retry_in_ms: None,
                    terminal: false,
                }
            }
            Err(err) if inner.policy.should_retry(event.retry_count) => {
                let delay = inner.policy.delay_for(event.retry_count);
                warn!(
                    webhook_id = %webhook_id,
                    error = %err,
                    retry_count = event.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "change event failed, retry scheduled"
                );
                schedule_retry(&inner, webhook_id.clone(), event.next_attempt(), delay);
                slot.keep();
                ProcessingResult {
                    webhook_id,
                    success: false,
                    cache_invalidated,
                    retry_count: event.retry_count,
                    processing_time_ms,
                    errors: vec![err.to_string()],
                    duplicate: false,
                    retry_in_ms: Some(delay.as_millis() as u64),
                    terminal: false,
                }
            }
            Err(err) => {
                // Releasing the slot lets a later re-delivery start over.
                drop(slot);
                error!(
                    webhook_id = %webhook_id,
                    error = %err,
                    retry_count = event.retry_count,
                    "change event failed, retries exhausted"
                );
                ProcessingResult {
                    webhook_id,
                    success: false,
                    cache_invalidated,
                    retry_count: event.retry_count,
                    processing_time_ms,
                    errors: vec![err.to_string()],
                    duplicate: false,
                    retry_in_ms: None,
                    terminal: true,
                }
            }
        };

        emit(&inner, &result);
        result
    }
    .boxed()
}

fn schedule_retry(inner: &Arc<Inner>, webhook_id: String, event: ChangeEvent, delay: Duration) {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let token = inner.counter.fetch_add(1, Ordering::Relaxed);
    let due_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

    let pending = {
        let mut state = inner.state.lock();
        let entry = RetryEntry {
            token,
            fingerprint: event.fingerprint(),
            attempt: event.retry_count,
            due_at,
            cancel: cancel_tx,
        };
        if let Some(previous) = state.retries.insert(webhook_id.clone(), entry) {
            let _ = previous.cancel.send(true);
            debug!(webhook_id = %webhook_id, "replaced pending retry");
        }
        state.retries.len()
    };
    let _ = inner.records.send(SyncRecord::RetryQueue { pending });

    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let pending = {
            let mut state = inner.state.lock();
            match state.retries.get(&webhook_id) {
                Some(entry) if entry.token == token => {
                    state.retries.remove(&webhook_id);
                }
                _ => return,
            }
            state.retries.len()
        };
        let _ = inner.records.send(SyncRecord::RetryQueue { pending });

        debug!(webhook_id = %webhook_id, attempt = event.retry_count, "retrying change event");
        let slot = InFlightSlot::new(inner.clone(), event.fingerprint(), webhook_id.clone());
        attempt(inner, webhook_id, event, slot).await;
    });
}

fn emit(inner: &Inner, result: &ProcessingResult) {
    {
        let mut state = inner.state.lock();
        if state.recent.len() >= MAX_RECENT_RESULTS {
            state.recent.pop_front();
        }
        state.recent.push_back(result.clone());
    }
    let _ = inner.records.send(SyncRecord::Webhook(result.clone()));
    // No subscribers is fine.
    let _ = inner.results.send(result.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use crate::cache::ContentView;
    use crate::testing::{ts, MemorySource, ScriptedHandler};
    use crate::types::{record_channel, ContentStatus, ContentType, RecordReceiver};

    struct Fixture {
        processor: WebhookProcessor,
        handler: Arc<ScriptedHandler>,
        source: Arc<MemorySource>,
        engine: InvalidationEngine,
        bus: Arc<BroadcastBus>,
        records: RecordReceiver,
    }

    fn fixture(config: SyncConfig, handler: ScriptedHandler) -> Fixture {
        let source = Arc::new(MemorySource::new());
        source.upsert(ContentType::Article, "A1", ts(0), ContentStatus::Published);
        let bus = Arc::new(BroadcastBus::new());
        let (tx, rx) = record_channel();
        let engine = InvalidationEngine::new(source.clone(), bus.clone(), tx.clone());
        let handler = Arc::new(handler);
        let processor = WebhookProcessor::new(&config, handler.clone(), engine.clone(), tx);
        Fixture {
            processor,
            handler,
            source,
            engine,
            bus,
            records: rx,
        }
    }

    fn drain(rx: &mut RecordReceiver) -> Vec<SyncRecord> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_back_off_exponentially_then_stop() {
        let fx = fixture(SyncConfig::default(), ScriptedHandler::failing(u32::MAX));
        let mut results = fx.processor.subscribe_results();

        let event = ChangeEvent::new(ChangeAction::Update, ContentType::Article, "A1");
        let first = fx.processor.process(event, None).await.unwrap();
        assert!(!first.success);
        assert_eq!(first.retry_in_ms, Some(100));

        tokio::time::sleep(Duration::from_secs(30)).await;

        let calls = fx.handler.calls();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<u128> = calls.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![100, 200, 400]);
        assert_eq!(fx.processor.pending_retries(), 0);

        let mut seen = Vec::new();
        while let Ok(r) = results.try_recv() {
            seen.push(r);
        }
        assert_eq!(seen.len(), 4);
        let last = seen.last().unwrap();
        assert!(last.terminal);
        assert_eq!(last.retry_count, 3);
        assert!(seen.iter().all(|r| r.webhook_id == first.webhook_id));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failure() {
        let fx = fixture(SyncConfig::default(), ScriptedHandler::failing(1));
        let event = ChangeEvent::new(ChangeAction::Publish, ContentType::Article, "A1");
        fx.processor.process(event.clone(), None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fx.handler.calls().len(), 2);
        let recent = fx.processor.recent_results();
        assert!(recent[0].success);
        assert!(recent[0].cache_invalidated);
        assert_eq!(recent[0].retry_count, 1);

        // Completed now, so a re-delivery is a no-op.
        let again = fx.processor.process(event, None).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(fx.handler.calls().len(), 2);
    }

    #[tokio::test]
    async fn reprocessing_a_completed_event_has_no_side_effects() {
        let fx = fixture(SyncConfig::default(), ScriptedHandler::visible());
        let updates = Arc::new(Mutex::new(0));
        let counter = updates.clone();
        let _sub = fx.bus.subscribe(move |_| *counter.lock() += 1);

        let event = ChangeEvent::new(ChangeAction::Delete, ContentType::Article, "A1");
        let first = fx.processor.process(event.clone(), None).await.unwrap();
        let second = fx.processor.process(event, None).await.unwrap();

        assert!(first.success && !first.duplicate);
        assert!(second.success && second.duplicate);
        assert_eq!(fx.handler.calls().len(), 1);
        assert_eq!(*updates.lock(), 1);
    }

    #[tokio::test]
    async fn bad_signature_is_a_security_event_and_never_retried() {
        let config = SyncConfig {
            webhook_secret: Some("s3cret".into()),
            ..SyncConfig::default()
        };
        let mut fx = fixture(config, ScriptedHandler::visible());
        let event = ChangeEvent::new(ChangeAction::Publish, ContentType::Article, "A1");

        let err = fx.processor.process(event, Some("sha256=00")).await.unwrap_err();
        assert!(matches!(err, SyncError::Authenticity));
        assert_eq!(fx.processor.pending_retries(), 0);
        assert!(fx.handler.calls().is_empty());

        let security = drain(&mut fx.records)
            .into_iter()
            .filter(|r| matches!(r, SyncRecord::SecurityEvent { .. }))
            .count();
        assert_eq!(security, 1);
    }

    #[tokio::test]
    async fn valid_signature_is_accepted() {
        let config = SyncConfig {
            webhook_secret: Some("s3cret".into()),
            ..SyncConfig::default()
        };
        let fx = fixture(config, ScriptedHandler::visible());
        let event = ChangeEvent::new(ChangeAction::Publish, ContentType::Article, "A1");
        let sig = verification::sign_event("s3cret", &event);
        assert!(fx.processor.process(event, Some(&sig)).await.unwrap().success);
    }

    #[tokio::test]
    async fn old_and_future_events_are_stale() {
        let fx = fixture(SyncConfig::default(), ScriptedHandler::visible());
        let mut event = ChangeEvent::new(ChangeAction::Update, ContentType::Article, "A1");
        event.timestamp = Utc::now() - chrono::Duration::minutes(6);
        assert!(matches!(
            fx.processor.process(event.clone(), None).await,
            Err(SyncError::StaleEvent { .. })
        ));
        event.timestamp = Utc::now() + chrono::Duration::minutes(6);
        assert!(matches!(
            fx.processor.process(event, None).await,
            Err(SyncError::StaleEvent { .. })
        ));
        assert!(fx.handler.calls().is_empty());
    }

    #[tokio::test]
    async fn raw_payload_errors_are_validation_errors() {
        let fx = fixture(SyncConfig::default(), ScriptedHandler::visible());
        let raw = RawChangeEvent {
            action: Some("explode".into()),
            ..RawChangeEvent::default()
        };
        let err = fx.processor.process_raw(raw, None).await.unwrap_err();
        match err {
            SyncError::Validation { errors } => assert!(errors.len() >= 4),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.processor.recent_results().len(), 1);
    }

    #[tokio::test]
    async fn hidden_create_does_not_invalidate() {
        let fx = fixture(SyncConfig::default(), ScriptedHandler::hidden());
        let view = ContentView::item(ContentType::Article, "A1");
        fx.engine.read(&view).await.unwrap();

        let event = ChangeEvent::new(ChangeAction::Create, ContentType::Article, "A1");
        let result = fx.processor.process(event, None).await.unwrap();
        assert!(result.success);
        assert!(!result.cache_invalidated);
        assert!(fx.engine.is_fresh(&view));
    }

    #[tokio::test]
    async fn invalidation_failure_schedules_a_retry() {
        let fx = fixture(SyncConfig::default(), ScriptedHandler::visible());
        fx.engine.read(&ContentView::item(ContentType::Article, "A1")).await.unwrap();
        fx.source.fail_reads(1);

        let event = ChangeEvent::new(ChangeAction::Unpublish, ContentType::Article, "A1");
        let result = fx.processor.process(event, None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.retry_in_ms, Some(100));
        assert_eq!(fx.processor.pending_retries(), 1);
        fx.processor.stop();
        assert_eq!(fx.processor.pending_retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_after_stop_is_processed_again() {
        let fx = fixture(SyncConfig::default(), ScriptedHandler::failing(1));
        let event = ChangeEvent::new(ChangeAction::Publish, ContentType::Article, "A1");

        let first = fx.processor.process(event.clone(), None).await.unwrap();
        assert_eq!(first.retry_in_ms, Some(100));
        fx.processor.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.handler.calls().len(), 1);

        let again = fx.processor.process(event, None).await.unwrap();
        assert!(!again.duplicate);
        assert!(again.success);
        assert_eq!(fx.handler.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_attempt_releases_its_slot() {
        let source = Arc::new(MemorySource::new());
        source.upsert(ContentType::Article, "A1", ts(0), ContentStatus::Published);
        source.set_delay(Duration::from_secs(5));
        let bus = Arc::new(BroadcastBus::new());
        let (tx, _rx) = record_channel();
        let engine = InvalidationEngine::new(source.clone(), bus, tx.clone());
        let handler = Arc::new(VisibilityHandler::new(source.clone()));
        let processor = WebhookProcessor::new(&SyncConfig::default(), handler, engine, tx);

        let event = ChangeEvent::new(ChangeAction::Update, ContentType::Article, "A1");
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), processor.process(event.clone(), None)).await;
        assert!(abandoned.is_err());

        source.set_delay(Duration::ZERO);
        let result = processor.process(event, None).await.unwrap();
        assert!(!result.duplicate);
        assert!(result.success);
        assert!(result.cache_invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_the_same_id_cancels_the_previous_timer() {
        let fx = fixture(SyncConfig::default(), ScriptedHandler::visible());
        let event = ChangeEvent::new(ChangeAction::Publish, ContentType::Article, "A1");

        fx.processor
            .schedule_retry("wh-1".into(), event.next_attempt(), Duration::from_millis(100));
        fx.processor
            .schedule_retry("wh-1".into(), event.next_attempt(), Duration::from_millis(300));
        assert_eq!(fx.processor.pending_retries(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fx.handler.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.handler.calls().len(), 1);
        assert_eq!(fx.processor.pending_retries(), 0);
    }
}
