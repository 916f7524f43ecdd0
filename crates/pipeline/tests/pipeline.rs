#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kindex_core::{ChangeEvent, ResourceKey, ResourceRecord, ResourceVersion, WatchScope};
use kindex_feed::{ChangeFeed, EventStream, FeedError, ListSnapshot, MemoryStore};
use kindex_pipeline::{IndexFacade, Phase, PipelineConfig, PipelineError, WatchState};
use kindex_search::{IndexLimits, SearchQuery};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn scope() -> WatchScope { WatchScope::new("apps", "Deployment") }

fn key(name: &str) -> ResourceKey { ResourceKey::new("apps", "Deployment", "default", name) }

fn deploy(name: &str, replicas: u32) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": "default"},
        "spec": {"replicas": replicas},
    })
}

fn rec(uid: &str, name: &str, v: i64, replicas: u32) -> ResourceRecord {
    let mut value = deploy(name, replicas);
    value["metadata"]["uid"] = json!(uid);
    ResourceRecord::from_json(ResourceVersion(v), &value)
}

fn facade_over(feed: Arc<dyn ChangeFeed>) -> Arc<IndexFacade> {
    Arc::new(IndexFacade::with_mem_index(scope(), feed, PipelineConfig::default()))
}

/// Poll `cond` until it holds or a second passes.
async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn hits_for(f: &IndexFacade, name: &str) -> Vec<kindex_search::Hit> {
    f.search(&SearchQuery::for_key(&key(name))).unwrap().hits
}

/// Feed with a fixed list and a scripted event stream.
struct ScriptedFeed {
    list: Result<ListSnapshot, FeedError>,
    subscribe: Result<(), FeedError>,
    /// Time the subscription takes to establish.
    subscribe_delay: Option<Duration>,
    events: Mutex<Vec<Result<ChangeEvent, FeedError>>>,
}

impl ScriptedFeed {
    fn new(events: Vec<Result<ChangeEvent, FeedError>>) -> Self {
        Self { list: Ok(ListSnapshot::default()), subscribe: Ok(()), subscribe_delay: None, events: Mutex::new(events) }
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn list(&self, _scope: &WatchScope) -> Result<ListSnapshot, FeedError> { self.list.clone() }

    async fn watch(&self, _scope: &WatchScope, _since: Option<ResourceVersion>) -> Result<EventStream, FeedError> {
        if let Some(d) = self.subscribe_delay {
            tokio::time::sleep(d).await;
        }
        self.subscribe.clone()?;
        let events = std::mem::take(&mut *self.events.lock().unwrap());
        Ok(futures::stream::iter(events).boxed())
    }
}

#[tokio::test]
async fn added_modified_deleted_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let facade = facade_over(store.clone());
    let cancel = CancellationToken::new();
    let report = facade.bootstrap(&cancel).await.unwrap();
    assert_eq!(report.indexed, 0);
    let handle = facade.attach_watch(cancel.clone()).await.unwrap();

    store.create(deploy("web", 1)).unwrap();
    eventually(|| hits_for(&facade, "web").len() == 1).await;

    store.update(deploy("web", 2)).unwrap();
    eventually(|| facade.counters().applied == 2).await;
    let hits = hits_for(&facade, "web");
    assert_eq!(hits.len(), 1);
    let doc = facade.engine().get(&hits[0].uid).unwrap();
    let body: serde_json::Value = serde_json::from_slice(&doc.payload).unwrap();
    assert_eq!(body["spec"]["replicas"], 2);

    store.delete(&key("web")).unwrap();
    eventually(|| facade.counters().applied == 3).await;
    assert!(hits_for(&facade, "web").is_empty());

    let report = handle.stop().await.unwrap();
    assert_eq!(report.applied, 3);
    assert_eq!(facade.watch_state(), WatchState::Detached);
}

#[tokio::test]
async fn bootstrap_then_follow_without_gaps() {
    let store = Arc::new(MemoryStore::new());
    store.create(deploy("a", 1)).unwrap();
    store.create(deploy("b", 1)).unwrap();
    let facade = facade_over(store.clone());
    let cancel = CancellationToken::new();
    facade.bootstrap(&cancel).await.unwrap();
    assert_eq!(facade.engine().len(), 2);

    // Written after the list but before the watch attaches: replayed from `since`.
    store.create(deploy("c", 1)).unwrap();
    let handle = facade.attach_watch(cancel.clone()).await.unwrap();
    eventually(|| facade.engine().len() == 3).await;
    assert_eq!(facade.health().bootstrap_version, ResourceVersion(2));
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn reads_before_ready_fail_fast() {
    let facade = facade_over(Arc::new(MemoryStore::new()));
    let err = facade.search(&SearchQuery::default()).unwrap_err();
    assert!(matches!(err, PipelineError::NotReady(_)));
    assert!(matches!(facade.history(&key("a"), None), Err(PipelineError::NotReady(_))));
    assert!(matches!(facade.origin(&key("a")), Err(PipelineError::NotReady(_))));
}

#[tokio::test]
async fn attach_before_ready_is_rejected() {
    let facade = facade_over(Arc::new(MemoryStore::new()));
    let err = facade.attach_watch(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState(_)));
}

#[tokio::test]
async fn bootstrap_failure_is_terminal() {
    let mut feed = ScriptedFeed::new(Vec::new());
    feed.list = Err(FeedError::Transport("connection reset".into()));
    let facade = facade_over(Arc::new(feed));
    let cancel = CancellationToken::new();
    assert!(matches!(facade.bootstrap(&cancel).await, Err(PipelineError::BootstrapFailure(_))));
    assert_eq!(facade.phase(), Phase::Failed);
    assert!(matches!(facade.wait_ready().await, Err(PipelineError::NotReady(_))));
    assert!(matches!(facade.bootstrap(&cancel).await, Err(PipelineError::InvalidState(_))));
    assert!(matches!(facade.search(&SearchQuery::default()), Err(PipelineError::NotReady(_))));
}

#[tokio::test]
async fn bootstrap_index_rejection_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    store.create(deploy("a", 1)).unwrap();
    store.create(deploy("b", 1)).unwrap();
    let config = PipelineConfig::default().with_limits(IndexLimits { max_docs: Some(1), max_payload_bytes: None });
    let facade = Arc::new(IndexFacade::with_mem_index(scope(), store, config));
    assert!(matches!(facade.bootstrap(&CancellationToken::new()).await, Err(PipelineError::BootstrapFailure(_))));
    assert_eq!(facade.phase(), Phase::Failed);
}

#[tokio::test]
async fn wait_ready_observes_bootstrap() {
    let facade = facade_over(Arc::new(MemoryStore::new()));
    let mut phases = facade.subscribe_phase();
    let waiter = {
        let f = facade.clone();
        tokio::spawn(async move { f.wait_ready().await })
    };
    facade.bootstrap(&CancellationToken::new()).await.unwrap();
    waiter.await.unwrap().unwrap();
    phases.changed().await.unwrap();
    assert_eq!(*phases.borrow(), Phase::Ready);
}

#[tokio::test]
async fn bad_events_do_not_stall_the_stream() {
    let feed = ScriptedFeed::new(vec![
        Ok(ChangeEvent::deleted(None, None)),
        Ok(ChangeEvent::added(ResourceRecord::new(ResourceVersion(1), b"{oops".to_vec()))),
        Ok(ChangeEvent::added(rec("u1", "web", 2, 1))),
    ]);
    let facade = facade_over(Arc::new(feed));
    let cancel = CancellationToken::new();
    facade.bootstrap(&cancel).await.unwrap();
    let report = facade.attach_watch(cancel).await.unwrap().join().await.unwrap();
    assert_eq!(report.received, 3);
    assert_eq!(report.dropped, 2);
    assert_eq!(report.applied, 1);
    assert_eq!(facade.watch_state(), WatchState::Closed);
    assert_eq!(hits_for(&facade, "web").len(), 1);
}

#[tokio::test]
async fn missing_payload_leaves_index_unchanged() {
    let facade = facade_over(Arc::new(MemoryStore::new()));
    facade.bootstrap(&CancellationToken::new()).await.unwrap();
    facade.apply(&ChangeEvent::added(rec("u1", "web", 1, 1))).unwrap();
    let before = facade.search(&SearchQuery::default()).unwrap().hits;
    let err = facade.apply(&ChangeEvent::deleted(None, None)).unwrap_err();
    assert!(matches!(err, PipelineError::MissingPayload(_)));
    assert_eq!(facade.search(&SearchQuery::default()).unwrap().hits, before);
}

#[tokio::test]
async fn index_write_failures_are_counted_and_skipped() {
    let feed = ScriptedFeed::new(vec![
        Ok(ChangeEvent::added(rec("u1", "a", 1, 1))),
        Ok(ChangeEvent::added(rec("u2", "b", 2, 1))),
        Ok(ChangeEvent::deleted(Some(rec("u1", "a", 3, 1)), None)),
        Ok(ChangeEvent::added(rec("u3", "c", 4, 1))),
    ]);
    let config = PipelineConfig::default().with_limits(IndexLimits { max_docs: Some(1), max_payload_bytes: None });
    let facade = Arc::new(IndexFacade::with_mem_index(scope(), Arc::new(feed), config));
    let cancel = CancellationToken::new();
    facade.bootstrap(&cancel).await.unwrap();
    let report = facade.attach_watch(cancel).await.unwrap().join().await.unwrap();
    assert_eq!(report.received, 4);
    assert_eq!(report.applied, 3);
    assert_eq!(facade.counters().write_failures, 1);
    assert_eq!(hits_for(&facade, "c").len(), 1);
    assert!(hits_for(&facade, "b").is_empty());
}

#[tokio::test]
async fn delete_with_only_previous_removes_document() {
    let feed = ScriptedFeed::new(vec![
        Ok(ChangeEvent::added(rec("u1", "web", 1, 1))),
        Ok(ChangeEvent::deleted(None, Some(rec("u1", "web", 2, 1)))),
    ]);
    let facade = facade_over(Arc::new(feed));
    let cancel = CancellationToken::new();
    facade.bootstrap(&cancel).await.unwrap();
    facade.attach_watch(cancel).await.unwrap().join().await.unwrap();
    assert!(hits_for(&facade, "web").is_empty());
    assert_eq!(facade.counters().delete_fallbacks, 1);
}

#[tokio::test]
async fn delete_with_previous_at_indexed_version_removes_document() {
    let feed = ScriptedFeed::new(vec![
        Ok(ChangeEvent::added(rec("u1", "web", 1, 1))),
        Ok(ChangeEvent::deleted(None, Some(rec("u1", "web", 1, 1)))),
    ]);
    let facade = facade_over(Arc::new(feed));
    let cancel = CancellationToken::new();
    facade.bootstrap(&cancel).await.unwrap();
    let report = facade.attach_watch(cancel).await.unwrap().join().await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.stale, 0);
    assert!(hits_for(&facade, "web").is_empty());
}

#[tokio::test]
async fn concurrent_attach_spawns_one_consumer() {
    let mut feed = ScriptedFeed::new(Vec::new());
    feed.subscribe_delay = Some(Duration::from_millis(20));
    let facade = facade_over(Arc::new(feed));
    facade.bootstrap(&CancellationToken::new()).await.unwrap();
    let (a, b) = tokio::join!(
        facade.attach_watch(CancellationToken::new()),
        facade.attach_watch(CancellationToken::new()),
    );
    let (ok, rejected) = match (a, b) {
        (Ok(h), Err(e)) | (Err(e), Ok(h)) => (h, e),
        (a, b) => panic!("expected exactly one attach to succeed, got {:?} / {:?}", a.is_ok(), b.is_ok()),
    };
    assert!(matches!(rejected, PipelineError::InvalidState(_)));
    ok.join().await.unwrap();
    assert_eq!(facade.watch_state(), WatchState::Closed);
}

#[tokio::test]
async fn failed_subscription_releases_the_slot() {
    let mut feed = ScriptedFeed::new(Vec::new());
    feed.subscribe = Err(FeedError::Connect("refused".into()));
    let facade = facade_over(Arc::new(feed));
    let cancel = CancellationToken::new();
    facade.bootstrap(&cancel).await.unwrap();
    assert!(facade.attach_watch(cancel.clone()).await.is_err());
    // Not stuck in Running: a retry reaches the feed again.
    assert!(matches!(facade.attach_watch(cancel).await, Err(PipelineError::FeedSubscription(_))));
}

#[tokio::test]
async fn history_by_name_spans_namespaces() {
    let store = Arc::new(MemoryStore::new());
    let facade = facade_over(store.clone());
    let handle = facade.start(CancellationToken::new()).await.unwrap();
    store.create(deploy("web", 1)).unwrap();
    eventually(|| facade.counters().applied == 1).await;
    let hist = facade.history(&ResourceKey::new("apps", "Deployment", "", "web"), None).unwrap();
    assert_eq!(hist.revisions.len(), 1);
    assert_eq!(hist.revisions[0].key, key("web"));
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_added_is_idempotent() {
    let facade = facade_over(Arc::new(MemoryStore::new()));
    facade.bootstrap(&CancellationToken::new()).await.unwrap();
    let ev = ChangeEvent::added(rec("u1", "web", 1, 1));
    facade.apply(&ev).unwrap();
    let once = facade.search(&SearchQuery::default()).unwrap();
    facade.apply(&ev).unwrap();
    let twice = facade.search(&SearchQuery::default()).unwrap();
    assert_eq!(once.hits, twice.hits);
    assert_eq!(twice.indexed, 1);
}

#[tokio::test]
async fn modified_leaves_exactly_one_fresh_copy() {
    let facade = facade_over(Arc::new(MemoryStore::new()));
    facade.bootstrap(&CancellationToken::new()).await.unwrap();
    facade.apply(&ChangeEvent::added(rec("u1", "web", 1, 1))).unwrap();
    facade.apply(&ChangeEvent::modified(rec("u1", "web", 2, 5), None)).unwrap();
    let hits = hits_for(&facade, "web");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uid, "u1");
    assert_eq!(hits[0].version, ResourceVersion(2));
    let body: serde_json::Value = serde_json::from_slice(&facade.engine().get("u1").unwrap().payload).unwrap();
    assert_eq!(body["spec"]["replicas"], 5);
}

#[tokio::test]
async fn feed_error_is_surfaced() {
    let feed = ScriptedFeed::new(vec![
        Ok(ChangeEvent::added(rec("u1", "web", 1, 1))),
        Err(FeedError::Transport("stream reset".into())),
    ]);
    let facade = facade_over(Arc::new(feed));
    let cancel = CancellationToken::new();
    facade.bootstrap(&cancel).await.unwrap();
    let err = facade.attach_watch(cancel).await.unwrap().join().await.unwrap_err();
    assert!(matches!(err, PipelineError::FeedSubscription(_)));
    assert!(matches!(facade.watch_state(), WatchState::Lost(_)));
    // Lost feed is fatal to readiness until a watch is re-attached.
    assert!(matches!(facade.search(&SearchQuery::default()), Err(PipelineError::NotReady(_))));
}

#[tokio::test]
async fn subscription_failure_is_returned() {
    let mut feed = ScriptedFeed::new(Vec::new());
    feed.subscribe = Err(FeedError::Connect("refused".into()));
    let facade = facade_over(Arc::new(feed));
    let cancel = CancellationToken::new();
    facade.bootstrap(&cancel).await.unwrap();
    assert!(matches!(facade.attach_watch(cancel).await, Err(PipelineError::FeedSubscription(_))));
    assert!(matches!(facade.health().watch, WatchState::Lost(_)));
}

#[tokio::test]
async fn reattach_after_close_resumes() {
    let store = Arc::new(MemoryStore::new());
    let facade = facade_over(store.clone());
    let handle = facade.start(CancellationToken::new()).await.unwrap();
    assert!(matches!(facade.attach_watch(CancellationToken::new()).await, Err(PipelineError::InvalidState(_))));
    handle.stop().await.unwrap();
    let handle = facade.attach_watch(CancellationToken::new()).await.unwrap();
    store.create(deploy("late", 1)).unwrap();
    eventually(|| facade.engine().len() == 1).await;
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn history_and_origin() {
    let store = Arc::new(MemoryStore::new());
    let facade = facade_over(store.clone());
    let handle = facade.start(CancellationToken::new()).await.unwrap();

    let mut provisioned = deploy("dash", 1);
    provisioned["metadata"]["annotations"] = json!({
        "kindex.io/origin-name": "git",
        "kindex.io/origin-path": "deploy/dash.yaml",
    });
    store.create(provisioned.clone()).unwrap();
    provisioned["spec"]["replicas"] = json!(3);
    store.update(provisioned).unwrap();
    store.create(deploy("plain", 1)).unwrap();
    eventually(|| facade.counters().applied == 3).await;

    let hist = facade.history(&key("dash"), None).unwrap();
    let actions: Vec<&str> = hist.revisions.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, vec!["modified", "added"]);

    let all = facade.history(&ResourceKey::new("apps", "Deployment", "", ""), Some(10)).unwrap();
    assert_eq!(all.revisions.len(), 3);

    let origin = facade.origin(&ResourceKey::new("apps", "Deployment", "default", "")).unwrap();
    assert_eq!(origin.items.len(), 2);
    let dash = origin.items.iter().find(|e| e.key.name == "dash").unwrap();
    let info = dash.origin.as_ref().unwrap();
    assert_eq!(info.name, "git");
    assert_eq!(info.path.as_deref(), Some("deploy/dash.yaml"));
    assert!(origin.items.iter().find(|e| e.key.name == "plain").unwrap().origin.is_none());

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_reads_during_writes() {
    let store = Arc::new(MemoryStore::new());
    let facade = facade_over(store.clone());
    let handle = facade.start(CancellationToken::new()).await.unwrap();
    store.create(deploy("steady", 1)).unwrap();
    eventually(|| facade.engine().len() == 1).await;

    let reader = {
        let f = facade.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let out = f.search(&SearchQuery::parse("label:none")).unwrap();
                assert!(out.hits.is_empty());
                tokio::task::yield_now().await;
            }
        })
    };
    for i in 0..50 {
        store.create(deploy(&format!("d{i}"), 1)).unwrap();
    }
    reader.await.unwrap();
    eventually(|| facade.engine().len() == 51).await;
    handle.stop().await.unwrap();
}
