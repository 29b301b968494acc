//! Test doubles shared by the module tests.

use crate::error::{FetchError, SyncError};
use crate::source::{ContentFilter, ContentSource};
use crate::types::{ChangeEvent, ContentRecord, ContentStatus, ContentType};
use crate::webhook::{ChangeHandler, HandlerOutcome};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
}

#[derive(Default)]
pub struct MemorySource {
    items: Mutex<BTreeMap<ContentType, BTreeMap<String, (ContentRecord, u64)>>>,
    snapshot_failures: AtomicU32,
    read_failures: AtomicU32,
    snapshot_calls: AtomicUsize,
    read_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an item; every upsert bumps its revision.
    pub fn upsert(&self, ty: ContentType, id: &str, last_modified: DateTime<Utc>, status: ContentStatus) {
        let mut items = self.items.lock();
        let by_id = items.entry(ty).or_default();
        let revision = by_id.get(id).map(|(_, r)| r + 1).unwrap_or(1);
        let record = ContentRecord {
            id: id.to_string(),
            last_modified,
            status,
        };
        by_id.insert(id.to_string(), (record, revision));
    }

    pub fn remove(&self, ty: ContentType, id: &str) {
        if let Some(by_id) = self.items.lock().get_mut(&ty) {
            by_id.remove(id);
        }
    }

    pub fn fail_snapshots(&self, n: u32) {
        self.snapshot_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, n: u32) {
        self.read_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn render(record: &ContentRecord, revision: u64) -> Value {
        json!({
            "id": record.id,
            "status": record.status,
            "lastModified": record.last_modified,
            "revision": revision,
        })
    }

    fn visible(record: &ContentRecord, filter: ContentFilter) -> bool {
        filter == ContentFilter::All || record.status == ContentStatus::Published
    }
}

#[async_trait]
impl ContentSource for MemorySource {
    async fn fetch_snapshot(&self, ty: ContentType) -> Result<Vec<ContentRecord>, FetchError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if Self::take_failure(&self.snapshot_failures) {
            return Err(FetchError::Unavailable("injected failure".into()));
        }
        let items = self.items.lock();
        Ok(items
            .get(&ty)
            .map(|by_id| by_id.values().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn fetch_list(&self, ty: ContentType, filter: ContentFilter) -> Result<Vec<Value>, FetchError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        // Capture before the delay so a slow read returns what was current
        // when it started.
        let result = if Self::take_failure(&self.read_failures) {
            Err(FetchError::Unavailable("injected failure".into()))
        } else {
            let items = self.items.lock();
            Ok(items
                .get(&ty)
                .map(|by_id| {
                    by_id
                        .values()
                        .filter(|(r, _)| Self::visible(r, filter))
                        .map(|(r, rev)| Self::render(r, *rev))
                        .collect()
                })
                .unwrap_or_default())
        };
        self.pause().await;
        result
    }

    async fn fetch_item(
        &self,
        ty: ContentType,
        id: &str,
        filter: ContentFilter,
    ) -> Result<Option<Value>, FetchError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let result = if Self::take_failure(&self.read_failures) {
            Err(FetchError::Unavailable("injected failure".into()))
        } else {
            let items = self.items.lock();
            Ok(items
                .get(&ty)
                .and_then(|by_id| by_id.get(id))
                .filter(|(r, _)| Self::visible(r, filter))
                .map(|(r, rev)| Self::render(r, *rev)))
        };
        self.pause().await;
        result
    }
}

/// Handler double: fails a set number of times, then reports a fixed
/// visibility. Records the instant of every call.
pub struct ScriptedHandler {
    failures_left: AtomicU32,
    visible: bool,
    calls: Mutex<Vec<tokio::time::Instant>>,
}

impl ScriptedHandler {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            visible: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn visible() -> Self {
        Self::failing(0)
    }

    pub fn hidden() -> Self {
        Self {
            visible: false,
            ..Self::failing(0)
        }
    }

    pub fn calls(&self) -> Vec<tokio::time::Instant> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ChangeHandler for ScriptedHandler {
    async fn handle(&self, _event: &ChangeEvent) -> Result<HandlerOutcome, SyncError> {
        self.calls.lock().push(tokio::time::Instant::now());
        if MemorySource::take_failure(&self.failures_left) {
            return Err(SyncError::processing("handler failure"));
        }
        Ok(HandlerOutcome {
            publicly_visible: self.visible,
        })
    }
}
