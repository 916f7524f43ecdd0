use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use kindex_core::{translate_with_source, ChangeEvent, Document, EventKind, PayloadSource, ResourceKey, ResourceVersion, WatchScope};
use kindex_feed::ChangeFeed;
use kindex_search::{IndexEngine, MemIndex, SearchDebugInfo, SearchQuery};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumer::{self, WatchHandle};
use crate::history::{HistoryLog, HistoryResult, Revision};
use crate::origin::{origin_of, OriginEntry, OriginResult};
use crate::{Counters, Health, Phase, PipelineConfig, PipelineError, WatchState};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Status {
    phase: Phase,
    watch: WatchState,
    bootstrap_version: ResourceVersion,
    failure: Option<String>,
}

/// Last version applied for a uid; deletes leave a tombstone so a late
/// redelivery of an older event cannot resurrect the document.
#[derive(Debug, Clone, Copy)]
struct Applied {
    version: ResourceVersion,
    deleted: bool,
}

struct Writer {
    applied: FxHashMap<String, Applied>,
    /// Deleted uids in deletion order, bounded by `tombstone_limit`.
    tombstones: VecDeque<(String, ResourceVersion)>,
    tombstone_limit: usize,
    history: HistoryLog,
}

impl Writer {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            applied: FxHashMap::default(),
            tombstones: VecDeque::new(),
            tombstone_limit: config.tombstone_limit,
            history: HistoryLog::new(config.history_limit, config.tombstone_limit),
        }
    }

    fn remember(&mut self, uid: String, version: ResourceVersion, deleted: bool) {
        if deleted {
            self.tombstones.push_back((uid.clone(), version));
        }
        self.applied.insert(uid, Applied { version, deleted });
        while self.tombstones.len() > self.tombstone_limit {
            let Some((uid, version)) = self.tombstones.pop_front() else { break };
            // A uid re-added after its delete is live again and stays tracked.
            if self.applied.get(&uid).map(|a| a.deleted && a.version == version).unwrap_or(false) {
                self.applied.remove(&uid);
            }
        }
    }
}

#[derive(Default)]
struct AtomicCounters {
    received: AtomicU64,
    applied: AtomicU64,
    stale: AtomicU64,
    dropped: AtomicU64,
    write_failures: AtomicU64,
    delete_fallbacks: AtomicU64,
}

impl AtomicCounters {
    fn snapshot(&self) -> Counters {
        Counters {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            delete_fallbacks: self.delete_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// What `apply` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Not newer than the version already applied for the uid.
    Stale,
    /// The resource does not belong to the facade's scope.
    OutOfScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub indexed: usize,
    pub skipped: usize,
    pub version: ResourceVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub hits: Vec<kindex_search::Hit>,
    pub debug: SearchDebugInfo,
    /// Documents in the index at query time.
    pub indexed: usize,
}

/// Owns the index for one scope: bootstrap, watch attachment, reads.
pub struct IndexFacade {
    scope: WatchScope,
    feed: Arc<dyn ChangeFeed>,
    engine: Arc<dyn IndexEngine>,
    config: PipelineConfig,
    status: ArcSwap<Status>,
    phase_tx: watch::Sender<Phase>,
    writer: Mutex<Writer>,
    counters: AtomicCounters,
}

impl IndexFacade {
    pub fn new(scope: WatchScope, feed: Arc<dyn ChangeFeed>, engine: Arc<dyn IndexEngine>, config: PipelineConfig) -> Self {
        let (phase_tx, _rx) = watch::channel(Phase::Uninitialized);
        Self {
            scope,
            feed,
            engine,
            writer: Mutex::new(Writer::new(&config)),
            config,
            status: ArcSwap::from_pointee(Status {
                phase: Phase::Uninitialized,
                watch: WatchState::Detached,
                bootstrap_version: ResourceVersion::UNSET,
                failure: None,
            }),
            phase_tx,
            counters: AtomicCounters::default(),
        }
    }

    /// Facade over a fresh [`MemIndex`] built with the configured limits.
    pub fn with_mem_index(scope: WatchScope, feed: Arc<dyn ChangeFeed>, config: PipelineConfig) -> Self {
        let engine = Arc::new(MemIndex::with_limits(config.limits));
        Self::new(scope, feed, engine, config)
    }

    pub fn scope(&self) -> &WatchScope { &self.scope }

    pub fn config(&self) -> &PipelineConfig { &self.config }

    pub fn engine(&self) -> &Arc<dyn IndexEngine> { &self.engine }

    pub fn phase(&self) -> Phase { self.status.load().phase }

    pub fn watch_state(&self) -> WatchState { self.status.load().watch.clone() }

    pub fn counters(&self) -> Counters { self.counters.snapshot() }

    pub fn health(&self) -> Health {
        let st = self.status.load();
        Health {
            scope: self.scope.to_string(),
            phase: st.phase,
            watch: st.watch.clone(),
            docs: self.engine.len(),
            bootstrap_version: st.bootstrap_version,
            failure: st.failure.clone(),
            counters: self.counters.snapshot(),
        }
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> { self.phase_tx.subscribe() }

    /// Wait until the facade is `Ready`, failing on `Failed` or after the
    /// configured ready timeout.
    pub async fn wait_ready(&self) -> Result<(), PipelineError> {
        let mut rx = self.phase_tx.subscribe();
        let wait = async {
            loop {
                let phase = *rx.borrow_and_update();
                match phase {
                    Phase::Ready => return Ok(()),
                    Phase::Failed => {
                        return Err(PipelineError::NotReady(self.status.load().failure.clone().unwrap_or_else(|| "bootstrap failed".into())))
                    }
                    Phase::Uninitialized | Phase::Bootstrapping => {}
                }
                if rx.changed().await.is_err() {
                    return Err(PipelineError::NotReady("facade dropped".into()));
                }
            }
        };
        match tokio::time::timeout(self.config.ready_timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(PipelineError::NotReady(format!("not ready after {:?}", self.config.ready_timeout))),
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, Writer> {
        // Writer state is only mutated after the engine call succeeds, so a
        // poisoned guard still holds consistent data.
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_status(&self, f: impl Fn(&mut Status)) {
        self.status.rcu(|s| {
            let mut next = (**s).clone();
            f(&mut next);
            next
        });
    }

    fn set_phase(&self, phase: Phase) {
        self.update_status(|s| s.phase = phase);
        self.phase_tx.send_replace(phase);
        metrics::gauge!("kindex_ready", if phase == Phase::Ready { 1.0 } else { 0.0 });
    }

    fn fail(&self, err: PipelineError) -> PipelineError {
        let msg = err.to_string();
        self.update_status(|s| s.failure = Some(msg.clone()));
        self.set_phase(Phase::Failed);
        error!(scope = %self.scope, error = %msg, "index bootstrap failed; facade is terminally failed");
        err
    }

    pub(crate) fn set_watch(&self, state: WatchState) {
        debug!(scope = %self.scope, watch = ?state, "watch state");
        self.update_status(|s| s.watch = state.clone());
    }

    /// Full scan of the scope into the index. Only valid from `Uninitialized`;
    /// any failure leaves the facade in the terminal `Failed` phase.
    pub async fn bootstrap(&self, cancel: &CancellationToken) -> Result<BootstrapReport, PipelineError> {
        {
            let _w = self.lock_writer();
            let phase = self.phase();
            if phase != Phase::Uninitialized {
                return Err(PipelineError::InvalidState(format!("bootstrap requested in phase {phase:?}")));
            }
            self.set_phase(Phase::Bootstrapping);
        }
        let t0 = std::time::Instant::now();
        info!(scope = %self.scope, "bootstrap start");

        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.fail(PipelineError::BootstrapFailure("cancelled".into()))),
            res = self.feed.list(&self.scope) => res,
        };
        let snapshot = match listed {
            Ok(s) => s,
            Err(e) => return Err(self.fail(PipelineError::BootstrapFailure(format!("list: {e}")))),
        };

        let mut report = BootstrapReport { indexed: 0, skipped: 0, version: snapshot.version };
        {
            let mut w = self.lock_writer();
            for rec in snapshot.items {
                let doc = match translate_with_source(&ChangeEvent::added(rec)) {
                    Ok((doc, _)) if self.scope.matches(&doc.key) => doc,
                    Ok((doc, _)) => {
                        debug!(key = %doc.key, "bootstrap item outside scope");
                        report.skipped += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "bootstrap item dropped");
                        metrics::counter!("kindex_events_dropped_total", 1u64, "reason" => "bootstrap_translation");
                        report.skipped += 1;
                        continue;
                    }
                };
                let (uid, key, version) = (doc.uid.clone(), doc.key.clone(), doc.version);
                let revision = revision_of(&doc, EventKind::Added);
                if let Err(e) = self.engine.put(doc) {
                    drop(w);
                    return Err(self.fail(PipelineError::BootstrapFailure(format!("index write for {key}: {e}"))));
                }
                w.remember(uid, version, false);
                w.history.record(revision);
                report.indexed += 1;
            }
            self.update_status(|s| s.bootstrap_version = snapshot.version);
            self.set_phase(Phase::Ready);
        }
        metrics::gauge!("index_docs", self.engine.len() as f64);
        info!(scope = %self.scope, indexed = report.indexed, skipped = report.skipped, version = %report.version, took_ms = %t0.elapsed().as_millis(), "bootstrap complete");
        Ok(report)
    }

    /// Subscribe to the feed after the bootstrap version and spawn the watch
    /// consumer. Returns once the subscription is established.
    pub async fn attach_watch(self: &Arc<Self>, cancel: CancellationToken) -> Result<WatchHandle, PipelineError> {
        // Reserve the consumer slot before subscribing so concurrent callers
        // cannot both attach.
        let st = self.status.rcu(|s| {
            let mut next = (**s).clone();
            if s.phase == Phase::Ready && s.watch != WatchState::Running {
                next.watch = WatchState::Running;
            }
            next
        });
        if st.phase != Phase::Ready {
            return Err(PipelineError::InvalidState(format!("attach_watch requires Ready, phase is {:?}", st.phase)));
        }
        if st.watch == WatchState::Running {
            return Err(PipelineError::InvalidState("watch already attached".into()));
        }
        let since = if st.bootstrap_version.is_unset() { None } else { Some(st.bootstrap_version) };
        let stream = match self.feed.watch(&self.scope, since).await {
            Ok(s) => s,
            Err(e) => {
                let err = PipelineError::FeedSubscription(e.to_string());
                self.set_watch(WatchState::Lost(err.to_string()));
                metrics::counter!("kindex_feed_errors_total", 1u64);
                error!(scope = %self.scope, error = %e, "watch subscription failed");
                return Err(err);
            }
        };
        info!(scope = %self.scope, since = ?since, "watch attached");
        let join = tokio::spawn(consumer::run(Arc::clone(self), stream, cancel.clone()));
        Ok(WatchHandle::new(join, cancel))
    }

    /// Bootstrap, then attach the watch.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<WatchHandle, PipelineError> {
        self.bootstrap(&cancel).await?;
        self.attach_watch(cancel).await
    }

    /// Apply one change event to the index following the per-event policy.
    pub fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome, PipelineError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kindex_events_total", 1u64, "kind" => event.kind.as_str());
        let res = self.apply_inner(event);
        match &res {
            Ok(ApplyOutcome::Applied) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ApplyOutcome::Stale) => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("kindex_stale_events_total", 1u64);
            }
            Ok(ApplyOutcome::OutOfScope) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("kindex_events_dropped_total", 1u64, "reason" => "out_of_scope");
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if matches!(e, PipelineError::IndexWriteFailure(_)) {
                    self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("kindex_index_write_failures_total", 1u64);
                }
                metrics::counter!("kindex_events_dropped_total", 1u64, "reason" => e.reason());
            }
        }
        res
    }

    fn apply_inner(&self, event: &ChangeEvent) -> Result<ApplyOutcome, PipelineError> {
        let (doc, source) = translate_with_source(event)?;
        if source == PayloadSource::Previous {
            self.counters.delete_fallbacks.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("kindex_delete_fallback_total", 1u64);
            warn!(uid = %doc.uid, key = %doc.key, "deleted event without current payload; using previous");
        }
        if !self.scope.matches(&doc.key) {
            return Ok(ApplyOutcome::OutOfScope);
        }

        let mut w = self.lock_writer();
        if let Some(prev) = w.applied.get(&doc.uid) {
            // A delete resolved from `previous` carries the last applied
            // version, so only an older one is stale.
            let stale = match source {
                PayloadSource::Current => doc.version <= prev.version,
                PayloadSource::Previous => prev.deleted || doc.version < prev.version,
            };
            if !doc.version.is_unset() && !prev.version.is_unset() && stale {
                debug!(uid = %doc.uid, incoming = %doc.version, stored = %prev.version, tombstone = prev.deleted, "stale event skipped");
                return Ok(ApplyOutcome::Stale);
            }
        }

        let uid = doc.uid.clone();
        let version = doc.version;
        let revision = revision_of(&doc, event.kind);
        let write = |e: kindex_search::IndexError| PipelineError::IndexWriteFailure(format!("{}: {e}", doc.key));
        match event.kind {
            EventKind::Added => self.engine.put(doc.clone()).map_err(write)?,
            EventKind::Deleted => {
                self.engine.delete(&doc.uid, &doc.key).map_err(write)?;
            }
            EventKind::Modified => {
                self.engine.delete(&doc.uid, &doc.key).map_err(write)?;
                if let Err(e) = self.engine.put(doc.clone()) {
                    error!(uid = %doc.uid, key = %doc.key, version = %doc.version, error = %e, "modified resource is no longer indexed: old revision removed, new revision rejected");
                    metrics::counter!("kindex_modified_lost_total", 1u64);
                    return Err(write(e));
                }
            }
        }
        w.remember(uid, version, event.kind == EventKind::Deleted);
        w.history.record(revision);
        Ok(ApplyOutcome::Applied)
    }

    fn ensure_ready(&self) -> Result<(), PipelineError> {
        let st = self.status.load();
        match (&st.phase, &st.watch) {
            (Phase::Ready, WatchState::Lost(reason)) => Err(PipelineError::NotReady(format!("watch feed lost: {reason}"))),
            (Phase::Ready, _) => Ok(()),
            (phase, _) => Err(PipelineError::NotReady(format!("phase {phase:?}"))),
        }
    }

    pub fn search(&self, query: &SearchQuery) -> Result<SearchResult, PipelineError> {
        self.ensure_ready()?;
        let out = self.engine.query(query).map_err(|e| PipelineError::Query(e.to_string()))?;
        Ok(SearchResult { hits: out.hits, debug: out.debug, indexed: self.engine.len() })
    }

    /// Recorded revisions for a key (or every key under a prefix key), newest first.
    pub fn history(&self, key: &ResourceKey, limit: Option<usize>) -> Result<HistoryResult, PipelineError> {
        self.ensure_ready()?;
        let limit = limit.unwrap_or(self.config.history_limit);
        let revisions = self.lock_writer().history.get(key, limit);
        Ok(HistoryResult { key: key.clone(), revisions })
    }

    /// Origin annotations of the indexed documents matching `key`.
    pub fn origin(&self, key: &ResourceKey) -> Result<OriginResult, PipelineError> {
        self.ensure_ready()?;
        let out = self
            .engine
            .query(&SearchQuery::for_key(key).with_limit(usize::MAX))
            .map_err(|e| PipelineError::Query(e.to_string()))?;
        let items = out
            .hits
            .iter()
            .filter_map(|h| self.engine.get(&h.uid))
            .map(|doc| OriginEntry {
                origin: origin_of(&doc, &self.config.origin_prefix),
                key: doc.key,
                uid: doc.uid,
                version: doc.version,
            })
            .collect();
        Ok(OriginResult { key: key.clone(), items })
    }
}

fn revision_of(doc: &Document, action: EventKind) -> Revision {
    Revision {
        key: doc.key.clone(),
        uid: doc.uid.clone(),
        version: doc.version,
        action,
        observed_at: chrono::Utc::now().timestamp_millis(),
        payload: doc.payload.clone(),
    }
}
