//! Drift detection: poll the authoritative store, diff consecutive
//! snapshots, and invalidate whatever changed without a webhook.

use crate::cache::InvalidationEngine;
use crate::config::{clamp_poll_interval, SyncConfig};
use crate::error::SyncError;
use crate::source::ContentSource;
use crate::types::{
    ChangeAction, ChangeDetectionResult, ChangeEvent, ChangeKind, ContentRecord, ContentSnapshot,
    ContentStatus, ContentType, DetectedChange, InvalidationTrigger, RecordSender, SyncRecord,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Diff two snapshots, per content type.
///
/// A record whose `lastModified` changed is `updated` even if its status also
/// changed; `status_changed` means same timestamp, different status.
pub fn detect_changes(old: &ContentSnapshot, new: &ContentSnapshot) -> ChangeDetectionResult {
    let types: BTreeSet<ContentType> = old.items.keys().chain(new.items.keys()).copied().collect();
    let mut result = ChangeDetectionResult::default();

    for ty in types {
        let before: HashMap<&str, &ContentRecord> =
            old.records(ty).iter().map(|r| (r.id.as_str(), r)).collect();
        let after: HashMap<&str, &ContentRecord> =
            new.records(ty).iter().map(|r| (r.id.as_str(), r)).collect();

        let mut changes = Vec::new();
        for record in new.records(ty) {
            let kind = match before.get(record.id.as_str()) {
                None => Some(ChangeKind::Created),
                Some(prev) if prev.last_modified != record.last_modified => Some(ChangeKind::Updated),
                Some(prev) if prev.status != record.status => Some(ChangeKind::StatusChanged),
                Some(_) => None,
            };
            if let Some(kind) = kind {
                changes.push(DetectedChange {
                    id: record.id.clone(),
                    action: kind,
                    status: Some(record.status),
                });
            }
        }
        for record in old.records(ty) {
            if !after.contains_key(record.id.as_str()) {
                changes.push(DetectedChange {
                    id: record.id.clone(),
                    action: ChangeKind::Deleted,
                    status: None,
                });
            }
        }

        if !changes.is_empty() {
            changes.sort_by(|a, b| a.id.cmp(&b.id));
            result.changes.insert(ty, changes);
        }
    }
    result
}

/// Build the change event a webhook would have carried for a detected drift.
pub fn synthesize_event(content_type: ContentType, change: &DetectedChange, at: DateTime<Utc>) -> ChangeEvent {
    let action = match change.action {
        ChangeKind::Created => ChangeAction::Create,
        ChangeKind::Updated => ChangeAction::Update,
        ChangeKind::Deleted => ChangeAction::Delete,
        ChangeKind::StatusChanged => match change.status {
            Some(ContentStatus::Published) => ChangeAction::Publish,
            _ => ChangeAction::Unpublish,
        },
    };
    ChangeEvent {
        action,
        content_type,
        content_id: change.id.clone(),
        timestamp: at,
        retry_count: 0,
        signature: None,
    }
}

/// What one poll tick did.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// Another fetch was still outstanding.
    Skipped,
    /// Cooling down after repeated failures.
    Suspended,
    /// First snapshot; nothing to diff against yet.
    Baseline,
    Changes(ChangeDetectionResult),
    Failed(String),
    /// The detector was stopped while the fetch was in flight.
    Discarded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerStatus {
    pub running: bool,
    pub suspended: bool,
    pub resumes_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub interval_ms: u64,
    pub last_poll: Option<DateTime<Utc>>,
    pub changes_detected: u64,
}

#[derive(Default)]
struct PollerState {
    previous: Option<ContentSnapshot>,
    consecutive_failures: u32,
    suspended_until: Option<Instant>,
    resumes_at: Option<DateTime<Utc>>,
    last_poll: Option<DateTime<Utc>>,
    changes_detected: u64,
    cancel: Option<watch::Sender<bool>>,
}

struct Inner {
    source: Arc<dyn ContentSource>,
    engine: InvalidationEngine,
    records: RecordSender,
    content_types: Vec<ContentType>,
    failure_limit: u32,
    cooldown: Duration,
    interval_ms: AtomicU64,
    fetching: AtomicBool,
    /// Bumped on stop; ticks started under an older value drop their result.
    generation: AtomicU64,
    state: Mutex<PollerState>,
}

/// Clears the in-flight flag however the tick ends, including cancellation.
struct FetchGuard<'a>(&'a AtomicBool);

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct DriftDetector {
    inner: Arc<Inner>,
}

impl DriftDetector {
    pub fn new(
        config: &SyncConfig,
        source: Arc<dyn ContentSource>,
        engine: InvalidationEngine,
        records: RecordSender,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                engine,
                records,
                content_types: config.content_types.clone(),
                failure_limit: config.poll_failure_limit.max(1),
                cooldown: Duration::from_millis(config.poll_cooldown_ms),
                interval_ms: AtomicU64::new(clamp_poll_interval(config.poll_interval_ms)),
                fetching: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                state: Mutex::new(PollerState::default()),
            }),
        }
    }

    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.cancel.is_some() {
            return;
        }
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        state.cancel = Some(cancel_tx);
        drop(state);

        let period = Duration::from_millis(self.inner.interval_ms.load(Ordering::SeqCst));
        info!(interval_ms = period.as_millis() as u64, "drift detector started");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                // Dropping the tick on cancel discards the in-flight fetch.
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    _ = tick(&inner, false) => {}
                }
            }
            debug!("drift detector loop exited");
        });
    }

    pub fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.inner.state.lock().cancel.take();
        if let Some(cancel) = cancel {
            let _ = cancel.send(true);
            info!("drift detector stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().cancel.is_some()
    }

    /// Run one tick now, bypassing the interval and any cool-down.
    pub async fn force_check(&self) -> PollOutcome {
        tick(&self.inner, true).await
    }

    /// Change the poll period, restarting the loop if it is running.
    /// Returns the period actually applied.
    pub fn set_frequency(&self, ms: u64) -> u64 {
        let ms = clamp_poll_interval(ms);
        self.inner.interval_ms.store(ms, Ordering::SeqCst);
        if self.is_running() {
            self.stop();
            self.start();
        }
        ms
    }

    pub fn status(&self) -> PollerStatus {
        let state = self.inner.state.lock();
        PollerStatus {
            running: state.cancel.is_some(),
            suspended: state.suspended_until.is_some(),
            resumes_at: state.resumes_at,
            consecutive_failures: state.consecutive_failures,
            interval_ms: self.inner.interval_ms.load(Ordering::SeqCst),
            last_poll: state.last_poll,
            changes_detected: state.changes_detected,
        }
    }
}

async fn tick(inner: &Arc<Inner>, forced: bool) -> PollOutcome {
    if inner.fetching.swap(true, Ordering::SeqCst) {
        debug!("previous poll still in flight, skipping tick");
        return PollOutcome::Skipped;
    }
    let _guard = FetchGuard(&inner.fetching);

    {
        let mut state = inner.state.lock();
        if let Some(until) = state.suspended_until {
            if Instant::now() < until && !forced {
                return PollOutcome::Suspended;
            }
            info!("drift detector resuming after cool-down");
            state.suspended_until = None;
            state.resumes_at = None;
            state.consecutive_failures = 0;
        }
    }

    let generation = inner.generation.load(Ordering::SeqCst);
    let started = Instant::now();
    let fetched = fetch_snapshot(inner).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    if inner.generation.load(Ordering::SeqCst) != generation {
        return PollOutcome::Discarded;
    }

    let snapshot = match fetched {
        Ok(snapshot) => snapshot,
        Err(e) => {
            let mut state = inner.state.lock();
            state.consecutive_failures += 1;
            if state.consecutive_failures >= inner.failure_limit {
                state.suspended_until = Some(Instant::now() + inner.cooldown);
                state.resumes_at = Some(
                    Utc::now() + chrono::Duration::from_std(inner.cooldown).unwrap_or_else(|_| chrono::Duration::zero()),
                );
                warn!(
                    failures = state.consecutive_failures,
                    cooldown_ms = inner.cooldown.as_millis() as u64,
                    "snapshot fetch keeps failing, suspending drift detector"
                );
            } else {
                warn!(failures = state.consecutive_failures, error = %e, "snapshot fetch failed");
            }
            drop(state);
            let _ = inner.records.send(SyncRecord::Poll {
                success: false,
                changes: 0,
                duration_ms,
            });
            return PollOutcome::Failed(e.to_string());
        }
    };

    let detected = {
        let mut state = inner.state.lock();
        state.consecutive_failures = 0;
        state.last_poll = Some(snapshot.taken_at);
        let detected = state
            .previous
            .as_ref()
            .map(|previous| detect_changes(previous, &snapshot));
        // Only the latest snapshot is kept; the older one is dropped here.
        state.previous = Some(snapshot);
        if let Some(d) = &detected {
            state.changes_detected += d.len() as u64;
        }
        detected
    };

    let _ = inner.records.send(SyncRecord::Poll {
        success: true,
        changes: detected.as_ref().map_or(0, ChangeDetectionResult::len),
        duration_ms,
    });

    let Some(detected) = detected else {
        debug!("baseline snapshot taken");
        return PollOutcome::Baseline;
    };

    if !detected.is_empty() {
        info!(changes = detected.len(), "drift detected");
    }
    let now = Utc::now();
    for (ty, change) in detected.iter() {
        let event = synthesize_event(ty, change, now);
        if let Err(e) = inner.engine.apply_change(&event, InvalidationTrigger::Drift).await {
            // Immediate invalidation evicts before refetching, so a failure
            // still leaves nothing stale readable.
            warn!(
                content_type = %ty,
                content_id = %change.id,
                error = %e,
                "drift invalidation failed"
            );
        }
    }
    PollOutcome::Changes(detected)
}

async fn fetch_snapshot(inner: &Inner) -> Result<ContentSnapshot, SyncError> {
    let mut snapshot = ContentSnapshot::new(Utc::now());
    for ty in &inner.content_types {
        let records = inner.source.fetch_snapshot(*ty).await?;
        snapshot.insert(*ty, records);
    }
    Ok(snapshot)
}
