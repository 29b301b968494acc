//! The invalidation engine: sole writer of the local content cache.
//!
//! Every cached view carries a generation counter. Invalidating a view bumps
//! its generation, and a refetch only writes back if the generation it started
//! under is still current, so a read that began before an invalidation can
//! never repopulate the cache with pre-invalidation data. Concurrent identical
//! immediate invalidations share a single refetch.
//!
//! Generations come from one counter shared by every view and a fetch always
//! starts under a fresh one, so a view's counter can be forgotten once it has
//! neither an entry nor a pending fetch.

use crate::bus::{BroadcastBus, RemoteApplier};
use crate::error::{FetchError, SyncError};
use crate::source::{ContentFilter, ContentSource};
use crate::types::{
    CacheOperation, CacheUpdate, ChangeAction, ChangeEvent, ContentType, InvalidationStrength,
    InvalidationTrigger, RecordSender, SyncRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewScope {
    All,
    Item(String),
}

/// One cacheable read: a list or a single item, under a visibility filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentView {
    pub content_type: ContentType,
    pub scope: ViewScope,
    pub filter: ContentFilter,
}

impl ContentView {
    /// Public listing of a content type.
    pub fn list(content_type: ContentType) -> Self {
        Self {
            content_type,
            scope: ViewScope::All,
            filter: ContentFilter::PublishedOnly,
        }
    }

    /// Public view of one item.
    pub fn item(content_type: ContentType, id: impl Into<String>) -> Self {
        Self {
            content_type,
            scope: ViewScope::Item(id.into()),
            filter: ContentFilter::PublishedOnly,
        }
    }

    pub fn with_filter(mut self, filter: ContentFilter) -> Self {
        self.filter = filter;
        self
    }

    fn touched_by(&self, content_type: ContentType, content_id: Option<&str>) -> bool {
        if self.content_type != content_type {
            return false;
        }
        match (&self.scope, content_id) {
            (_, None) | (ViewScope::All, _) => true,
            (ViewScope::Item(id), Some(target)) => id == target,
        }
    }
}

impl fmt::Display for ContentView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ViewScope::All => write!(f, "{}:all", self.content_type)?,
            ViewScope::Item(id) => write!(f, "{}:{}", self.content_type, id)?,
        }
        if self.filter == ContentFilter::All {
            f.write_str("?status=all")?;
        }
        Ok(())
    }
}

/// Upper bound on cached views before the oldest are evicted.
pub const DEFAULT_MAX_VIEWS: usize = 1024;

struct CacheEntry {
    value: Value,
    fresh: bool,
    /// Generation the value was fetched under; older means stored earlier.
    generation: u64,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, String>>>;

struct InFlight {
    generation: u64,
    from_invalidation: bool,
    fetch: SharedFetch,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ContentView, CacheEntry>,
    generations: HashMap<ContentView, u64>,
    inflight: HashMap<ContentView, InFlight>,
    last_generation: u64,
}

impl CacheState {
    fn generation(&self, view: &ContentView) -> u64 {
        self.generations.get(view).copied().unwrap_or(0)
    }

    fn bump(&mut self, view: &ContentView) -> u64 {
        self.last_generation += 1;
        self.generations.insert(view.clone(), self.last_generation);
        self.last_generation
    }

    /// Drop the generation of a view nothing refers to any more.
    fn prune(&mut self, view: &ContentView) {
        if !self.entries.contains_key(view) && !self.inflight.contains_key(view) {
            self.generations.remove(view);
        }
    }

    fn store(&mut self, view: &ContentView, value: Value, generation: u64, max_views: usize) {
        self.entries.insert(
            view.clone(),
            CacheEntry {
                value,
                fresh: true,
                generation,
            },
        );
        while self.entries.len() > max_views {
            let oldest = self
                .entries
                .iter()
                .filter(|(v, _)| *v != view)
                .min_by_key(|(_, e)| e.generation)
                .map(|(v, _)| v.clone());
            let Some(oldest) = oldest else { break };
            self.entries.remove(&oldest);
            self.prune(&oldest);
            debug!(view = %oldest, "evicted cached view");
        }
    }

    fn affected(&self, content_type: ContentType, content_id: Option<&str>) -> Vec<ContentView> {
        let mut views: Vec<ContentView> = self
            .entries
            .keys()
            .chain(self.inflight.keys())
            .filter(|v| v.touched_by(content_type, content_id))
            .cloned()
            .collect();
        views.sort_by_key(|v| v.to_string());
        views.dedup();
        views
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub fresh: usize,
    pub in_flight: usize,
    /// Views with a live generation counter.
    pub tracked: usize,
}

struct Inner {
    source: Arc<dyn ContentSource>,
    bus: Arc<BroadcastBus>,
    records: RecordSender,
    max_views: usize,
    state: Mutex<CacheState>,
}

#[derive(Clone)]
pub struct InvalidationEngine {
    inner: Arc<Inner>,
}

impl InvalidationEngine {
    pub fn new(source: Arc<dyn ContentSource>, bus: Arc<BroadcastBus>, records: RecordSender) -> Self {
        Self::with_max_views(source, bus, records, DEFAULT_MAX_VIEWS)
    }

    pub fn with_max_views(
        source: Arc<dyn ContentSource>,
        bus: Arc<BroadcastBus>,
        records: RecordSender,
        max_views: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                bus,
                records,
                max_views: max_views.max(1),
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Applier for updates published by other instances. Holds the engine
    /// weakly, so a transport task does not keep it alive.
    pub fn remote_applier(&self) -> Arc<dyn RemoteApplier> {
        Arc::new(RemoteInvalidation {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Serve a view from cache, refetching when it is missing or stale.
    ///
    /// If the refetch of a stale entry fails, the stale value is served.
    pub async fn read(&self, view: &ContentView) -> Result<Value, SyncError> {
        let (fetch, stale) = {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.entries.get(view) {
                if entry.fresh {
                    let value = entry.value.clone();
                    drop(state);
                    self.record(SyncRecord::CacheAccess { hit: true });
                    return Ok(value);
                }
            }
            let stale = state.entries.get(view).map(|e| e.value.clone());
            let current = state.generation(view);
            let joinable = state
                .inflight
                .get(view)
                .filter(|f| f.generation == current)
                .map(|f| f.fetch.clone());
            let fetch = match joinable {
                Some(fetch) => fetch,
                None => self.start_fetch(&mut state, view, false),
            };
            (fetch, stale)
        };
        self.record(SyncRecord::CacheAccess { hit: false });

        match fetch.await {
            Ok(value) => Ok(value),
            Err(e) => match stale {
                Some(value) => {
                    warn!(view = %view, error = %e, "refetch failed, serving stale content");
                    Ok(value)
                }
                None => Err(SyncError::Fetch(FetchError::Unavailable(e))),
            },
        }
    }

    /// Invalidate one item's views and its content type's list views.
    pub async fn invalidate(
        &self,
        content_type: ContentType,
        content_id: &str,
        strength: InvalidationStrength,
        trigger: InvalidationTrigger,
    ) -> Result<CacheUpdate, SyncError> {
        self.execute(content_type, Some(content_id), None, strength, trigger, true)
            .await
    }

    /// Invalidate every cached view of a content type.
    pub async fn invalidate_all(
        &self,
        content_type: ContentType,
        strength: InvalidationStrength,
        trigger: InvalidationTrigger,
    ) -> Result<CacheUpdate, SyncError> {
        self.execute(content_type, None, None, strength, trigger, true)
            .await
    }

    /// Invalidate for a change event, with the strength its action demands.
    pub async fn apply_change(
        &self,
        event: &ChangeEvent,
        trigger: InvalidationTrigger,
    ) -> Result<CacheUpdate, SyncError> {
        self.execute(
            event.content_type,
            Some(&event.content_id),
            Some(event.action),
            event.action.strength(),
            trigger,
            true,
        )
        .await
    }

    pub fn is_fresh(&self, view: &ContentView) -> bool {
        self.inner
            .state
            .lock()
            .entries
            .get(view)
            .is_some_and(|e| e.fresh)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            entries: state.entries.len(),
            fresh: state.entries.values().filter(|e| e.fresh).count(),
            in_flight: state.inflight.len(),
            tracked: state.generations.len(),
        }
    }

    async fn execute(
        &self,
        content_type: ContentType,
        content_id: Option<&str>,
        action: Option<ChangeAction>,
        strength: InvalidationStrength,
        trigger: InvalidationTrigger,
        announce: bool,
    ) -> Result<CacheUpdate, SyncError> {
        let started = Instant::now();
        let keys = match content_id {
            Some(id) => vec![format!("{content_type}:{id}"), format!("{content_type}:all")],
            None => vec![format!("{content_type}:all")],
        };

        let result = match strength {
            InvalidationStrength::Standard => {
                self.mark_stale(content_type, content_id);
                Ok(())
            }
            InvalidationStrength::Immediate => self.refetch(content_type, content_id).await,
        };

        self.record(SyncRecord::CacheOperation(CacheOperation {
            keys: keys.clone(),
            trigger,
            strength,
            success: result.is_ok(),
            duration_ms: started.elapsed().as_millis() as u64,
        }));

        if let Err(e) = result {
            warn!(keys = ?keys, error = %e, "invalidation failed");
            return Err(e);
        }

        let update = CacheUpdate {
            content_type,
            content_id: content_id.map(str::to_string),
            action,
            strength,
            keys,
            at: Utc::now(),
        };
        info!(
            keys = ?update.keys,
            strength = ?strength,
            trigger = ?trigger,
            "cache invalidated"
        );
        if announce {
            self.inner.bus.publish(update.clone());
        }
        Ok(update)
    }

    fn mark_stale(&self, content_type: ContentType, content_id: Option<&str>) {
        let mut state = self.inner.state.lock();
        for view in state.affected(content_type, content_id) {
            state.bump(&view);
            if let Some(entry) = state.entries.get_mut(&view) {
                entry.fresh = false;
            }
        }
    }

    async fn refetch(
        &self,
        content_type: ContentType,
        content_id: Option<&str>,
    ) -> Result<(), SyncError> {
        let fetches: Vec<(ContentView, SharedFetch)> = {
            let mut state = self.inner.state.lock();
            let views = state.affected(content_type, content_id);
            views
                .into_iter()
                .map(|view| {
                    let current = state.generation(&view);
                    let joinable = state
                        .inflight
                        .get(&view)
                        .filter(|f| f.from_invalidation && f.generation == current)
                        .map(|f| f.fetch.clone());
                    let fetch = match joinable {
                        Some(fetch) => {
                            debug!(view = %view, "joining in-flight invalidation");
                            fetch
                        }
                        None => {
                            state.entries.remove(&view);
                            self.start_fetch(&mut state, &view, true)
                        }
                    };
                    (view, fetch)
                })
                .collect()
        };

        let (views, futures): (Vec<_>, Vec<_>) = fetches.into_iter().unzip();
        let failures: Vec<String> = join_all(futures)
            .await
            .into_iter()
            .zip(views)
            .filter_map(|(result, view)| result.err().map(|e| format!("{view}: {e}")))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SyncError::processing(format!(
                "refetch failed for {}",
                failures.join(", ")
            )))
        }
    }

    /// Register a refetch of `view` under a fresh generation. Must be called
    /// with the state lock held.
    fn start_fetch(&self, state: &mut CacheState, view: &ContentView, from_invalidation: bool) -> SharedFetch {
        let generation = state.bump(view);
        let inner = self.inner.clone();
        let task_view = view.clone();

        let fetch = async move {
            let result = fetch_view(inner.source.as_ref(), &task_view).await;
            let mut state = inner.state.lock();
            if state
                .inflight
                .get(&task_view)
                .is_some_and(|f| f.generation == generation)
            {
                state.inflight.remove(&task_view);
            }
            if state.generation(&task_view) == generation {
                match &result {
                    // Missing or hidden items are not kept.
                    Ok(Value::Null) => {
                        state.entries.remove(&task_view);
                    }
                    Ok(value) => state.store(&task_view, value.clone(), generation, inner.max_views),
                    Err(_) => {}
                }
            } else {
                debug!(view = %task_view, "discarding superseded fetch");
            }
            state.prune(&task_view);
            result.map_err(|e| e.to_string())
        }
        .boxed()
        .shared();

        state.inflight.insert(
            view.clone(),
            InFlight {
                generation,
                from_invalidation,
                fetch: fetch.clone(),
            },
        );
        fetch
    }

    fn record(&self, record: SyncRecord) {
        let _ = self.inner.records.send(record);
    }
}

struct RemoteInvalidation {
    inner: Weak<Inner>,
}

#[async_trait]
impl RemoteApplier for RemoteInvalidation {
    async fn apply_remote(&self, update: &CacheUpdate) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let engine = InvalidationEngine { inner };
        // Failures are already logged and recorded by `execute`.
        let _ = engine
            .execute(
                update.content_type,
                update.content_id.as_deref(),
                update.action,
                update.strength,
                InvalidationTrigger::Remote,
                false,
            )
            .await;
    }
}

async fn fetch_view(source: &dyn ContentSource, view: &ContentView) -> Result<Value, FetchError> {
    match &view.scope {
        ViewScope::All => source
            .fetch_list(view.content_type, view.filter)
            .await
            .map(Value::Array),
        ViewScope::Item(id) => Ok(source
            .fetch_item(view.content_type, id, view.filter)
            .await?
            .unwrap_or(Value::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ts, MemorySource};
    use crate::types::{record_channel, ContentStatus, RecordReceiver};
    use std::time::Duration;

    fn setup() -> (Arc<MemorySource>, InvalidationEngine, Arc<BroadcastBus>, RecordReceiver) {
        let source = Arc::new(MemorySource::new());
        source.upsert(ContentType::Article, "A1", ts(0), ContentStatus::Published);
        source.upsert(ContentType::Article, "A2", ts(0), ContentStatus::Draft);
        let bus = Arc::new(BroadcastBus::new());
        let (tx, rx) = record_channel();
        let engine = InvalidationEngine::new(source.clone(), bus.clone(), tx);
        (source, engine, bus, rx)
    }

    fn revision(value: &Value) -> u64 {
        value["revision"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn second_read_is_a_cache_hit() {
        let (source, engine, _bus, mut rx) = setup();
        let view = ContentView::item(ContentType::Article, "A1");
        engine.read(&view).await.unwrap();
        engine.read(&view).await.unwrap();
        assert_eq!(source.read_calls(), 1);

        let mut hits = Vec::new();
        while let Ok(SyncRecord::CacheAccess { hit }) = rx.try_recv() {
            hits.push(hit);
        }
        assert_eq!(hits, vec![false, true]);
    }

    #[tokio::test]
    async fn published_filter_hides_drafts() {
        let (_source, engine, _bus, _rx) = setup();
        let list = engine.read(&ContentView::list(ContentType::Article)).await.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
        let draft = engine.read(&ContentView::item(ContentType::Article, "A2")).await.unwrap();
        assert!(draft.is_null());
        let admin = ContentView::item(ContentType::Article, "A2").with_filter(ContentFilter::All);
        assert!(!engine.read(&admin).await.unwrap().is_null());
    }

    #[tokio::test]
    async fn standard_invalidation_marks_stale_without_fetching() {
        let (source, engine, _bus, _rx) = setup();
        let view = ContentView::item(ContentType::Article, "A1");
        engine.read(&view).await.unwrap();

        engine
            .invalidate(ContentType::Article, "A1", InvalidationStrength::Standard, InvalidationTrigger::Manual)
            .await
            .unwrap();
        assert!(!engine.is_fresh(&view));
        assert_eq!(source.read_calls(), 1);

        source.upsert(ContentType::Article, "A1", ts(5), ContentStatus::Published);
        assert_eq!(revision(&engine.read(&view).await.unwrap()), 2);
    }

    #[tokio::test]
    async fn immediate_invalidation_refreshes_before_returning() {
        let (source, engine, bus, _rx) = setup();
        let item = ContentView::item(ContentType::Article, "A1");
        let list = ContentView::list(ContentType::Article);
        engine.read(&item).await.unwrap();
        engine.read(&list).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus.subscribe(move |u| sink.lock().push(u.keys.clone()));

        source.upsert(ContentType::Article, "A1", ts(5), ContentStatus::Published);
        let update = engine
            .invalidate(ContentType::Article, "A1", InvalidationStrength::Immediate, InvalidationTrigger::Webhook)
            .await
            .unwrap();

        assert_eq!(update.keys, vec!["article:A1", "article:all"]);
        assert!(engine.is_fresh(&item));
        assert!(engine.is_fresh(&list));
        let calls = source.read_calls();
        assert_eq!(revision(&engine.read(&item).await.unwrap()), 2);
        assert_eq!(source.read_calls(), calls);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_immediate_refetch_leaves_nothing_stale_readable() {
        let (source, engine, _bus, _rx) = setup();
        let item = ContentView::item(ContentType::Article, "A1");
        engine.read(&item).await.unwrap();

        source.fail_reads(1);
        let err = engine
            .invalidate(ContentType::Article, "A1", InvalidationStrength::Immediate, InvalidationTrigger::Webhook)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(!engine.is_fresh(&item));

        source.upsert(ContentType::Article, "A1", ts(9), ContentStatus::Published);
        assert_eq!(revision(&engine.read(&item).await.unwrap()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn read_started_before_invalidation_cannot_repopulate() {
        let (source, engine, _bus, _rx) = setup();
        let item = ContentView::item(ContentType::Article, "A1");
        engine.read(&item).await.unwrap();
        engine
            .invalidate(ContentType::Article, "A1", InvalidationStrength::Standard, InvalidationTrigger::Manual)
            .await
            .unwrap();

        source.set_delay(Duration::from_millis(100));
        let slow = {
            let engine = engine.clone();
            let item = item.clone();
            tokio::spawn(async move { engine.read(&item).await })
        };
        tokio::task::yield_now().await;

        source.upsert(ContentType::Article, "A1", ts(5), ContentStatus::Published);
        engine
            .invalidate(ContentType::Article, "A1", InvalidationStrength::Immediate, InvalidationTrigger::Webhook)
            .await
            .unwrap();

        assert_eq!(revision(&slow.await.unwrap().unwrap()), 1);
        assert_eq!(revision(&engine.read(&item).await.unwrap()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_invalidations_share_one_refetch() {
        let (source, engine, _bus, _rx) = setup();
        engine.read(&ContentView::item(ContentType::Article, "A1")).await.unwrap();
        engine.read(&ContentView::list(ContentType::Article)).await.unwrap();
        let before = source.read_calls();

        source.set_delay(Duration::from_millis(50));
        let (a, b) = tokio::join!(
            engine.invalidate(ContentType::Article, "A1", InvalidationStrength::Immediate, InvalidationTrigger::Webhook),
            engine.invalidate(ContentType::Article, "A1", InvalidationStrength::Immediate, InvalidationTrigger::Drift),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(source.read_calls(), before + 2);
        assert_eq!(engine.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn invalidate_all_touches_every_view_of_the_type() {
        let (source, engine, _bus, _rx) = setup();
        source.upsert(ContentType::CaseStudy, "C1", ts(0), ContentStatus::Published);
        let article = ContentView::item(ContentType::Article, "A1");
        let case = ContentView::item(ContentType::CaseStudy, "C1");
        engine.read(&article).await.unwrap();
        engine.read(&case).await.unwrap();

        engine
            .invalidate_all(ContentType::Article, InvalidationStrength::Standard, InvalidationTrigger::Manual)
            .await
            .unwrap();
        assert!(!engine.is_fresh(&article));
        assert!(engine.is_fresh(&case));
    }

    #[tokio::test]
    async fn missing_items_leave_no_bookkeeping() {
        let (source, engine, _bus, _rx) = setup();
        let ghost = ContentView::item(ContentType::Article, "nope");
        assert!(engine.read(&ghost).await.unwrap().is_null());
        assert_eq!(engine.stats().entries, 0);
        assert_eq!(engine.stats().tracked, 0);

        let item = ContentView::item(ContentType::Article, "A1");
        engine.read(&item).await.unwrap();
        assert_eq!(engine.stats().tracked, 1);

        source.remove(ContentType::Article, "A1");
        engine
            .invalidate(ContentType::Article, "A1", InvalidationStrength::Immediate, InvalidationTrigger::Webhook)
            .await
            .unwrap();
        let stats = engine.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.tracked, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn oldest_views_are_evicted_past_the_limit() {
        let source = Arc::new(MemorySource::new());
        for id in ["A1", "A2", "A3"] {
            source.upsert(ContentType::Article, id, ts(0), ContentStatus::Published);
        }
        let (tx, _rx) = record_channel();
        let engine = InvalidationEngine::with_max_views(source.clone(), Arc::new(BroadcastBus::new()), tx, 2);

        let views: Vec<ContentView> = ["A1", "A2", "A3"]
            .into_iter()
            .map(|id| ContentView::item(ContentType::Article, id))
            .collect();
        for view in &views {
            engine.read(view).await.unwrap();
        }

        let stats = engine.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.tracked, 2);
        assert!(!engine.is_fresh(&views[0]));
        assert!(engine.is_fresh(&views[2]));
    }

    #[tokio::test]
    async fn remote_updates_invalidate_without_republishing() {
        let (source, engine, bus, _rx) = setup();
        let item = ContentView::item(ContentType::Article, "A1");
        engine.read(&item).await.unwrap();

        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        let _sub = bus.subscribe(move |_| *counter.lock() += 1);

        source.upsert(ContentType::Article, "A1", ts(5), ContentStatus::Published);
        let update = CacheUpdate {
            content_type: ContentType::Article,
            content_id: Some("A1".into()),
            action: Some(ChangeAction::Update),
            strength: InvalidationStrength::Standard,
            keys: vec!["article:A1".into(), "article:all".into()],
            at: Utc::now(),
        };
        engine.remote_applier().apply_remote(&update).await;

        assert!(!engine.is_fresh(&item));
        assert_eq!(*seen.lock(), 0);
        assert_eq!(revision(&engine.read(&item).await.unwrap()), 2);
    }

    #[tokio::test]
    async fn stale_value_served_when_refetch_fails() {
        let (source, engine, _bus, _rx) = setup();
        let item = ContentView::item(ContentType::Article, "A1");
        engine.read(&item).await.unwrap();
        engine
            .invalidate(ContentType::Article, "A1", InvalidationStrength::Standard, InvalidationTrigger::Manual)
            .await
            .unwrap();
        source.fail_reads(1);
        assert_eq!(revision(&engine.read(&item).await.unwrap()), 1);
    }
}
