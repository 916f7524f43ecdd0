//! In-process versioned resource store exposing a change feed.
//!
//! Every write bumps a store-wide version, is appended to a bounded event log
//! and broadcast to live subscribers. `watch(since)` replays the retained log
//! after `since` and then follows live writes; the log snapshot and the
//! broadcast subscription are taken under the same lock so nothing is lost or
//! delivered twice at the handoff.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use kindex_core::{translate, ChangeEvent, ResourceKey, ResourceRecord, ResourceVersion, WatchScope};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{ChangeFeed, EventStream, FeedError, ListSnapshot};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("already exists: {0}")]
    AlreadyExists(ResourceKey),
    #[error("not found: {0}")]
    NotFound(ResourceKey),
    #[error("invalid resource: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
struct LoggedEvent {
    version: ResourceVersion,
    /// None for re-emitted events whose identity cannot be derived.
    key: Option<ResourceKey>,
    event: ChangeEvent,
}

struct Stored {
    record: ResourceRecord,
    value: Value,
}

struct Inner {
    version: i64,
    objects: BTreeMap<ResourceKey, Stored>,
    log: VecDeque<LoggedEvent>,
    /// Oldest version still replayable; older `since` values are expired.
    log_floor: i64,
    tx: Option<broadcast::Sender<LoggedEvent>>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    retain: usize,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::with_capacity(4096) }
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// `cap` bounds both the replay log and each subscriber's backlog.
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        let (tx, _rx) = broadcast::channel(cap);
        Self {
            inner: Mutex::new(Inner { version: 0, objects: BTreeMap::new(), log: VecDeque::new(), log_floor: 0, tx: Some(tx) }),
            retain: cap,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a writer panicked mid-call; the maps stay usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current store version.
    pub fn version(&self) -> ResourceVersion { ResourceVersion(self.lock().version) }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn get(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        self.lock().objects.get(key).map(|s| s.record.clone())
    }

    /// Create a resource. A missing `metadata.uid` is generated.
    pub fn create(&self, mut value: Value) -> Result<ResourceRecord, StoreError> {
        ensure_metadata(&mut value)?;
        if value["metadata"].get("uid").and_then(|u| u.as_str()).map(|s| s.is_empty()).unwrap_or(true) {
            value["metadata"]["uid"] = Value::String(uuid::Uuid::new_v4().to_string());
        }
        let mut inner = self.lock();
        let key = key_of(&value)?;
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let record = stamp(&mut inner, &mut value);
        inner.objects.insert(key.clone(), Stored { record: record.clone(), value });
        self.publish(&mut inner, key, ChangeEvent::added(record.clone()));
        Ok(record)
    }

    /// Replace an existing resource. The stored uid is kept.
    pub fn update(&self, mut value: Value) -> Result<ResourceRecord, StoreError> {
        ensure_metadata(&mut value)?;
        let mut inner = self.lock();
        let key = key_from_type_meta(&value)?;
        let (uid, previous) = match inner.objects.get(&key) {
            Some(s) => (s.value["metadata"]["uid"].clone(), s.record.clone()),
            None => return Err(StoreError::NotFound(key)),
        };
        value["metadata"]["uid"] = uid;
        let record = stamp(&mut inner, &mut value);
        inner.objects.insert(key.clone(), Stored { record: record.clone(), value });
        self.publish(&mut inner, key, ChangeEvent::modified(record.clone(), Some(previous)));
        Ok(record)
    }

    /// Delete a resource. The event carries the final state at the delete
    /// version as `current` and the last stored state as `previous`.
    pub fn delete(&self, key: &ResourceKey) -> Result<ResourceRecord, StoreError> {
        let mut inner = self.lock();
        let Some(stored) = inner.objects.remove(key) else {
            return Err(StoreError::NotFound(key.clone()));
        };
        let mut value = stored.value;
        let record = stamp(&mut inner, &mut value);
        self.publish(&mut inner, key.clone(), ChangeEvent::deleted(Some(record.clone()), Some(stored.record)));
        Ok(record)
    }

    /// Deliver an arbitrary event to subscribers without touching stored
    /// state. Models upstream redelivery and malformed notifications.
    pub fn emit(&self, event: ChangeEvent) {
        let mut inner = self.lock();
        let key = translate(&event).ok().map(|d| d.key);
        let version = event.version();
        self.append(&mut inner, LoggedEvent { version, key, event });
    }

    /// Close the feed; live subscribers drain what was sent and then end.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.tx = None;
        debug!("memory store feed closed");
    }

    fn publish(&self, inner: &mut Inner, key: ResourceKey, event: ChangeEvent) {
        metrics::counter!("feed_events_emitted_total", 1u64, "kind" => event.kind.as_str());
        let version = ResourceVersion(inner.version);
        self.append(inner, LoggedEvent { version, key: Some(key), event });
    }

    fn append(&self, inner: &mut Inner, ev: LoggedEvent) {
        if inner.log.len() >= self.retain {
            if let Some(old) = inner.log.pop_front() {
                inner.log_floor = inner.log_floor.max(old.version.0);
            }
        }
        inner.log.push_back(ev.clone());
        if let Some(tx) = &inner.tx {
            // No live subscribers is not an error for a store.
            let _ = tx.send(ev);
        }
    }
}

fn ensure_metadata(value: &mut Value) -> Result<(), StoreError> {
    if !value.is_object() {
        return Err(StoreError::Invalid("resource must be a JSON object".into()));
    }
    if !value.get("metadata").map(|m| m.is_object()).unwrap_or(false) {
        value["metadata"] = serde_json::json!({});
    }
    Ok(())
}

fn key_from_type_meta(value: &Value) -> Result<ResourceKey, StoreError> {
    let s = |v: Option<&Value>| v.and_then(|x| x.as_str()).unwrap_or("").to_string();
    let kind = s(value.get("kind"));
    let name = s(value["metadata"].get("name"));
    if kind.is_empty() || name.is_empty() {
        return Err(StoreError::Invalid("kind and metadata.name are required".into()));
    }
    Ok(ResourceKey::from_type_meta(&s(value.get("apiVersion")), &kind)
        .with_meta(&s(value["metadata"].get("namespace")), &name))
}

fn key_of(value: &Value) -> Result<ResourceKey, StoreError> {
    let record = ResourceRecord::from_json(ResourceVersion::UNSET, value);
    translate(&ChangeEvent::added(record))
        .map(|d| d.key)
        .map_err(|e| StoreError::Invalid(e.to_string()))
}

/// Bump the store version and write it into `metadata.resourceVersion`.
fn stamp(inner: &mut Inner, value: &mut Value) -> ResourceRecord {
    inner.version += 1;
    value["metadata"]["resourceVersion"] = Value::String(inner.version.to_string());
    ResourceRecord::from_json(ResourceVersion(inner.version), value)
}

fn in_scope(scope: &WatchScope, ev: &LoggedEvent) -> bool {
    ev.key.as_ref().map(|k| scope.matches(k)).unwrap_or(true)
}

fn is_newer(since: Option<ResourceVersion>, ev: &LoggedEvent) -> bool {
    match since {
        Some(s) => ev.version.is_unset() || ev.version > s,
        None => true,
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn list(&self, scope: &WatchScope) -> Result<ListSnapshot, FeedError> {
        let inner = self.lock();
        let items = inner
            .objects
            .iter()
            .filter(|(k, _)| scope.matches(k))
            .map(|(_, s)| s.record.clone())
            .collect();
        Ok(ListSnapshot { items, version: ResourceVersion(inner.version) })
    }

    async fn watch(&self, scope: &WatchScope, since: Option<ResourceVersion>) -> Result<EventStream, FeedError> {
        let inner = self.lock();
        let Some(tx) = &inner.tx else {
            return Err(FeedError::Connect("store feed is closed".into()));
        };
        if let Some(s) = since {
            if s.0 < inner.log_floor {
                return Err(FeedError::Transport(format!(
                    "resume version {} is older than retained log (floor {})",
                    s, inner.log_floor
                )));
            }
        }
        let backlog: Vec<Result<ChangeEvent, FeedError>> = match since {
            Some(_) => inner
                .log
                .iter()
                .filter(|ev| in_scope(scope, ev) && is_newer(since, ev))
                .map(|ev| Ok(ev.event.clone()))
                .collect(),
            None => Vec::new(),
        };
        let rx = tx.subscribe();
        drop(inner);
        debug!(scope = %scope, since = ?since, backlog = backlog.len(), "memory watch established");

        let scope = scope.clone();
        let live = futures::stream::unfold(rx, move |mut rx| {
            let scope = scope.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(ev) => {
                            if in_scope(&scope, &ev) && is_newer(since, &ev) {
                                return Some((Ok(ev.event), rx));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => return Some((Err(FeedError::Lagged(n)), rx)),
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(futures::stream::iter(backlog).chain(live).boxed())
    }
}
