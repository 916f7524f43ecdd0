//! Kubernetes change feed: discovery, list and watcher wiring.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kindex_core::{ChangeEvent, ResourceRecord, ResourceVersion, WatchScope};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::{ChangeFeed, EventStream, FeedError, ListSnapshot};

type Seen = FxHashMap<String, ResourceRecord>;

/// Change feed backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeFeed {
    client: Client,
    /// Last list result per scope, keyed by uid; seeds the next watch.
    listed: Arc<Mutex<FxHashMap<String, Seen>>>,
}

impl KubeFeed {
    pub fn new(client: Client) -> Self { Self { client, listed: Arc::default() } }

    /// Connect using the ambient kubeconfig / in-cluster configuration.
    pub async fn try_default() -> Result<Self, FeedError> {
        let client = Client::try_default().await.map_err(|e| FeedError::Connect(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn remember_list(&self, scope: &WatchScope, seen: Seen) {
        self.listed.lock().unwrap_or_else(|e| e.into_inner()).insert(scope.to_string(), seen);
    }

    fn take_list(&self, scope: &WatchScope) -> Seen {
        self.listed.lock().unwrap_or_else(|e| e.into_inner()).remove(&scope.to_string()).unwrap_or_default()
    }

    async fn api_for(&self, scope: &WatchScope) -> Result<Api<DynamicObject>, FeedError> {
        let (ar, namespaced) = find_api_resource(self.client.clone(), scope)
            .await
            .map_err(|e| FeedError::Scope(format!("{e:#}")))?;
        Ok(if namespaced {
            match scope.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

async fn find_api_resource(client: Client, scope: &WatchScope) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let version_ok = scope.version.is_empty() || ar.version == scope.version;
            if ar.group == scope.group && ar.kind == scope.resource_type && version_ok {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("resource not served: {}", scope))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn record_from(obj: &DynamicObject) -> Result<ResourceRecord> {
    let version = obj.metadata.resource_version.as_deref().map(ResourceVersion::parse).unwrap_or_default();
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(ResourceRecord::new(version, serde_json::to_vec(&raw)?))
}

fn uid_of(obj: &DynamicObject) -> Option<&str> { obj.metadata.uid.as_deref() }

/// Turns watcher events into Added/Modified/Deleted using the set of objects
/// already delivered. The watcher only reports "applied" objects, so the
/// seen-set decides between Added and Modified and supplies `previous`.
#[derive(Default)]
struct Reconciler {
    seen: Seen,
}

impl Reconciler {
    /// Start from objects the consumer already holds, e.g. a bootstrap list.
    fn seeded(seen: Seen) -> Self { Self { seen } }

    fn applied(&mut self, obj: &DynamicObject) -> Result<Option<ChangeEvent>> {
        let uid = uid_of(obj).ok_or_else(|| anyhow!("object missing metadata.uid"))?.to_string();
        let rec = record_from(obj)?;
        let ev = match self.seen.get(&uid) {
            Some(prev) if prev.version == rec.version && !rec.version.is_unset() => None,
            Some(prev) => Some(ChangeEvent::modified(rec.clone(), Some(prev.clone()))),
            None => Some(ChangeEvent::added(rec.clone())),
        };
        self.seen.insert(uid, rec);
        Ok(ev)
    }

    fn deleted(&mut self, obj: &DynamicObject) -> Result<ChangeEvent> {
        let rec = record_from(obj)?;
        let previous = uid_of(obj).and_then(|u| self.seen.remove(u));
        Ok(ChangeEvent::deleted(Some(rec), previous))
    }

    /// A relist: present objects are applied, vanished ones are deleted.
    fn restarted(&mut self, list: &[DynamicObject]) -> Result<Vec<ChangeEvent>> {
        let present: FxHashSet<&str> = list.iter().filter_map(uid_of).collect();
        let vanished: Vec<String> = self.seen.keys().filter(|u| !present.contains(u.as_str())).cloned().collect();
        let mut out = Vec::new();
        for uid in vanished {
            if let Some(prev) = self.seen.remove(&uid) {
                out.push(ChangeEvent::deleted(None, Some(prev)));
            }
        }
        for o in list {
            if let Some(ev) = self.applied(o)? {
                out.push(ev);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ChangeFeed for KubeFeed {
    async fn list(&self, scope: &WatchScope) -> Result<ListSnapshot, FeedError> {
        let api = self.api_for(scope).await?;
        let list = api.list(&ListParams::default()).await.map_err(|e| FeedError::Transport(e.to_string()))?;
        let version = list.metadata.resource_version.as_deref().map(ResourceVersion::parse).unwrap_or_default();
        let mut items = Vec::with_capacity(list.items.len());
        let mut seen = Seen::default();
        for o in list.items.iter() {
            match record_from(o) {
                Ok(r) => {
                    if let Some(uid) = uid_of(o) {
                        seen.insert(uid.to_string(), r.clone());
                    }
                    items.push(r);
                }
                Err(e) => warn!(error = %e, name = ?o.metadata.name, "skipping unserializable object"),
            }
        }
        self.remember_list(scope, seen);
        info!(scope = %scope, count = items.len(), version = %version, "kube list complete");
        Ok(ListSnapshot { items, version })
    }

    /// The kube watcher performs its own initial list. When `since` follows a
    /// `list` of the same scope, that list seeds the reconciler, so the
    /// watcher's relist only emits what changed after it: objects deleted in
    /// between come out as Deleted with `previous`, unchanged ones are quiet.
    async fn watch(&self, scope: &WatchScope, since: Option<ResourceVersion>) -> Result<EventStream, FeedError> {
        let api = self.api_for(scope).await?;
        let seed = if since.is_some() { self.take_list(scope) } else { Seen::default() };
        info!(scope = %scope, since = ?since, seeded = seed.len(), "watcher started");
        let reconciler = Arc::new(tokio::sync::Mutex::new(Reconciler::seeded(seed)));
        let stream = watcher::watcher(api, watcher::Config::default())
            .map_err(|e| FeedError::Transport(e.to_string()))
            .and_then(move |ev| {
                let reconciler = Arc::clone(&reconciler);
                async move {
                    let mut r = reconciler.lock().await;
                    let out = match ev {
                        Event::Applied(o) => r.applied(&o).map(|e| e.into_iter().collect::<Vec<_>>()),
                        Event::Deleted(o) => r.deleted(&o).map(|e| vec![e]),
                        Event::Restarted(list) => {
                            debug!(count = list.len(), "watch restart");
                            r.restarted(&list)
                        }
                    };
                    out.map_err(|e| FeedError::Transport(format!("{e:#}")))
                }
            })
            .map_ok(|events| futures::stream::iter(events.into_iter().map(Ok::<_, FeedError>)))
            .try_flatten();
        Ok(stream.boxed())
    }
}
