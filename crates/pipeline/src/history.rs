//! Bounded per-key revision log backing `History` reads.

use std::collections::VecDeque;

use kindex_core::{EventKind, ResourceKey, ResourceVersion};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub key: ResourceKey,
    pub uid: String,
    pub version: ResourceVersion,
    pub action: EventKind,
    /// Unix millis when the pipeline applied the change.
    pub observed_at: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResult {
    pub key: ResourceKey,
    /// Newest first.
    pub revisions: Vec<Revision>,
}

pub(crate) struct HistoryLog {
    limit: usize,
    per_key: FxHashMap<ResourceKey, VecDeque<Revision>>,
    /// Keys whose newest revision was a delete, oldest first.
    deleted: VecDeque<(ResourceKey, ResourceVersion)>,
    max_deleted: usize,
}

impl HistoryLog {
    pub(crate) fn new(limit: usize, max_deleted: usize) -> Self {
        Self { limit, per_key: FxHashMap::default(), deleted: VecDeque::new(), max_deleted }
    }

    pub(crate) fn record(&mut self, rev: Revision) {
        if self.limit == 0 {
            return;
        }
        if rev.action == EventKind::Deleted {
            self.deleted.push_back((rev.key.clone(), rev.version));
        }
        let q = self.per_key.entry(rev.key.clone()).or_default();
        q.push_front(rev);
        q.truncate(self.limit);
        while self.deleted.len() > self.max_deleted {
            let Some((key, version)) = self.deleted.pop_front() else { break };
            // Only forget keys that were not recreated since.
            let gone = self
                .per_key
                .get(&key)
                .and_then(|q| q.front())
                .map(|r| r.action == EventKind::Deleted && r.version == version)
                .unwrap_or(false);
            if gone {
                self.per_key.remove(&key);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn keys(&self) -> usize { self.per_key.len() }

    /// Revisions for an exact key, or merged across every key a prefix key
    /// covers. An empty namespace addresses every namespace.
    pub(crate) fn get(&self, key: &ResourceKey, limit: usize) -> Vec<Revision> {
        let mut out: Vec<Revision> = if key.is_prefix() || key.namespace.is_empty() {
            self.per_key
                .iter()
                .filter(|(k, _)| key.covers(k))
                .flat_map(|(_, q)| q.iter().cloned())
                .collect()
        } else {
            self.per_key.get(key).map(|q| q.iter().cloned().collect()).unwrap_or_default()
        };
        out.sort_by(|a, b| b.version.cmp(&a.version).then_with(|| b.observed_at.cmp(&a.observed_at)));
        out.truncate(limit);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(name: &str, v: i64, action: EventKind) -> Revision { rev_in("prod", name, v, action) }

    fn rev_in(ns: &str, name: &str, v: i64, action: EventKind) -> Revision {
        Revision {
            key: ResourceKey::new("apps", "Deployment", ns, name),
            uid: format!("uid-{name}"),
            version: ResourceVersion(v),
            action,
            observed_at: v,
            payload: Vec::new(),
        }
    }

    #[test]
    fn keeps_newest_first_and_bounded() {
        let mut log = HistoryLog::new(2, 16);
        log.record(rev("a", 1, EventKind::Added));
        log.record(rev("a", 2, EventKind::Modified));
        log.record(rev("a", 3, EventKind::Deleted));
        let got = log.get(&ResourceKey::new("apps", "Deployment", "prod", "a"), 10);
        let versions: Vec<i64> = got.iter().map(|r| r.version.0).collect();
        assert_eq!(versions, vec![3, 2]);
    }

    #[test]
    fn prefix_key_merges() {
        let mut log = HistoryLog::new(4, 16);
        log.record(rev("a", 1, EventKind::Added));
        log.record(rev("b", 2, EventKind::Added));
        let got = log.get(&ResourceKey::new("apps", "Deployment", "prod", ""), 10);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].key.name, "b");
        assert_eq!(log.get(&ResourceKey::new("apps", "Deployment", "prod", ""), 1).len(), 1);
    }

    #[test]
    fn zero_limit_disables_history() {
        let mut log = HistoryLog::new(0, 16);
        log.record(rev("a", 1, EventKind::Added));
        assert!(log.get(&ResourceKey::new("apps", "Deployment", "prod", "a"), 10).is_empty());
    }

    #[test]
    fn empty_namespace_matches_name_in_any_namespace() {
        let mut log = HistoryLog::new(4, 16);
        log.record(rev_in("prod", "web", 1, EventKind::Added));
        log.record(rev_in("dev", "web", 2, EventKind::Added));
        log.record(rev_in("prod", "db", 3, EventKind::Added));
        let got = log.get(&ResourceKey::new("apps", "Deployment", "", "web"), 10);
        let nss: Vec<&str> = got.iter().map(|r| r.key.namespace.as_str()).collect();
        assert_eq!(nss, vec!["dev", "prod"]);
    }

    #[test]
    fn deleted_keys_are_forgotten_oldest_first() {
        let mut log = HistoryLog::new(4, 2);
        log.record(rev("a", 1, EventKind::Added));
        log.record(rev("a", 2, EventKind::Deleted));
        log.record(rev("b", 3, EventKind::Added));
        log.record(rev("b", 4, EventKind::Deleted));
        log.record(rev("c", 5, EventKind::Added));
        log.record(rev("c", 6, EventKind::Deleted));
        assert_eq!(log.keys(), 2);
        assert!(log.get(&ResourceKey::new("apps", "Deployment", "prod", "a"), 10).is_empty());
        assert_eq!(log.get(&ResourceKey::new("apps", "Deployment", "prod", "c"), 10).len(), 2);
    }

    #[test]
    fn recreated_keys_survive_eviction() {
        let mut log = HistoryLog::new(4, 1);
        log.record(rev("a", 1, EventKind::Deleted));
        log.record(rev("a", 2, EventKind::Added));
        log.record(rev("b", 3, EventKind::Deleted));
        assert_eq!(log.get(&ResourceKey::new("apps", "Deployment", "prod", "a"), 10).len(), 2);
        assert_eq!(log.keys(), 2);
    }
}
