//! kindex search: incrementally maintained in-RAM index over documents.
//!
//! The engine is keyed by document uid. Writers replace whole documents;
//! readers take a shared lock, so a query never sees a half-written entry.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use kindex_core::{Document, ResourceKey, ResourceVersion};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod query;

pub use query::{SearchQuery, DEFAULT_LIMIT};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("index full ({max} documents)")]
    Capacity { max: usize },
    #[error("document {uid} payload is {bytes} bytes (max {max})")]
    PayloadTooLarge { uid: String, bytes: usize, max: usize },
    #[error("document has empty uid")]
    EmptyUid,
}

/// Write limits; exceeding them rejects the write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLimits {
    pub max_docs: Option<usize>,
    pub max_payload_bytes: Option<usize>,
}

impl IndexLimits {
    /// Read `KINDEX_MAX_DOCS` and `KINDEX_MAX_PAYLOAD_BYTES`.
    pub fn from_env() -> Self {
        Self {
            max_docs: std::env::var("KINDEX_MAX_DOCS").ok().and_then(|s| s.parse().ok()),
            max_payload_bytes: std::env::var("KINDEX_MAX_PAYLOAD_BYTES").ok().and_then(|s| s.parse().ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub uid: String,
    pub key: ResourceKey,
    pub version: ResourceVersion,
    pub score: f32,
}

/// Candidate counts after each filter stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDebugInfo {
    pub total: usize,
    pub after_labels: usize,
    pub after_annos: usize,
    pub after_key: usize,
    pub after_text: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub hits: Vec<Hit>,
    pub debug: SearchDebugInfo,
}

/// Outbound contract to a search index engine. Implementations are
/// internally synchronized; all methods take `&self`.
pub trait IndexEngine: Send + Sync {
    /// Insert or wholly replace the document with `doc.uid`.
    fn put(&self, doc: Document) -> Result<(), IndexError>;
    /// Remove the document with `uid`; returns whether one was present.
    fn delete(&self, uid: &str, key: &ResourceKey) -> Result<bool, IndexError>;
    fn get(&self, uid: &str) -> Option<Document>;
    fn query(&self, q: &SearchQuery) -> Result<SearchOutcome, IndexError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool { self.len() == 0 }
}

struct Entry {
    doc: Document,
    /// Free-text haystack: `ns/name kind labels`.
    text: String,
}

#[derive(Default)]
struct Inner {
    docs: FxHashMap<String, Entry>,
    label_post: FxHashMap<String, BTreeSet<String>>,     // key=value -> uids
    label_key_post: FxHashMap<String, BTreeSet<String>>, // key -> uids
    anno_post: FxHashMap<String, BTreeSet<String>>,
    anno_key_post: FxHashMap<String, BTreeSet<String>>,
}

fn post(map: &mut FxHashMap<String, BTreeSet<String>>, key: String, uid: &str) {
    map.entry(key).or_default().insert(uid.to_string());
}

fn unpost(map: &mut FxHashMap<String, BTreeSet<String>>, key: &str, uid: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(uid);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

fn display_text(doc: &Document) -> String {
    let mut t = String::new();
    if !doc.key.namespace.is_empty() { t.push_str(&doc.key.namespace); t.push('/'); }
    t.push_str(&doc.key.name);
    t.push(' ');
    t.push_str(&doc.key.resource_type);
    for (k, v) in doc.labels.iter() { t.push(' '); t.push_str(k); t.push(':'); t.push_str(v); }
    t
}

impl Inner {
    fn insert(&mut self, doc: Document) {
        let uid = doc.uid.clone();
        for (k, v) in doc.labels.iter() {
            post(&mut self.label_post, format!("{}={}", k, v), &uid);
            post(&mut self.label_key_post, k.clone(), &uid);
        }
        for (k, v) in doc.annotations.iter() {
            post(&mut self.anno_post, format!("{}={}", k, v), &uid);
            post(&mut self.anno_key_post, k.clone(), &uid);
        }
        let text = display_text(&doc);
        self.docs.insert(uid, Entry { doc, text });
    }

    fn remove(&mut self, uid: &str) -> Option<Document> {
        let entry = self.docs.remove(uid)?;
        for (k, v) in entry.doc.labels.iter() {
            unpost(&mut self.label_post, &format!("{}={}", k, v), uid);
            unpost(&mut self.label_key_post, k, uid);
        }
        for (k, v) in entry.doc.annotations.iter() {
            unpost(&mut self.anno_post, &format!("{}={}", k, v), uid);
            unpost(&mut self.anno_key_post, k, uid);
        }
        Some(entry.doc)
    }
}

/// Narrow `candidates` to the postings for each `(key, value?)` filter.
fn apply_postings(
    candidates: Option<BTreeSet<String>>,
    filters: &[(String, Option<String>)],
    pairs: &FxHashMap<String, BTreeSet<String>>,
    keys: &FxHashMap<String, BTreeSet<String>>,
) -> Option<BTreeSet<String>> {
    let mut cur = candidates;
    for (k, v) in filters {
        let post = match v {
            Some(v) => pairs.get(&format!("{}={}", k, v)),
            None => keys.get(k),
        };
        let next = match (post, cur) {
            (None, _) => BTreeSet::new(),
            (Some(p), None) => p.clone(),
            (Some(p), Some(c)) => c.intersection(p).cloned().collect(),
        };
        cur = Some(next);
    }
    cur
}

/// In-RAM [`IndexEngine`].
#[derive(Default)]
pub struct MemIndex {
    inner: RwLock<Inner>,
    limits: IndexLimits,
}

impl MemIndex {
    pub fn new() -> Self { Self::default() }

    pub fn with_limits(limits: IndexLimits) -> Self { Self { inner: RwLock::default(), limits } }

    pub fn limits(&self) -> IndexLimits { self.limits }

    // A panic while holding the lock leaves maps consistent (each write is a
    // remove followed by an insert), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Inner> { self.inner.read().unwrap_or_else(|e| e.into_inner()) }
    fn write(&self) -> RwLockWriteGuard<'_, Inner> { self.inner.write().unwrap_or_else(|e| e.into_inner()) }
}

impl IndexEngine for MemIndex {
    fn put(&self, doc: Document) -> Result<(), IndexError> {
        if doc.uid.is_empty() {
            return Err(IndexError::EmptyUid);
        }
        if let Some(max) = self.limits.max_payload_bytes {
            if doc.payload.len() > max {
                return Err(IndexError::PayloadTooLarge { uid: doc.uid.clone(), bytes: doc.payload.len(), max });
            }
        }
        let mut inner = self.write();
        let replacing = inner.docs.contains_key(&doc.uid);
        if let Some(max) = self.limits.max_docs {
            if !replacing && inner.docs.len() >= max {
                return Err(IndexError::Capacity { max });
            }
        }
        if replacing {
            inner.remove(&doc.uid);
        }
        debug!(uid = %doc.uid, key = %doc.key, version = %doc.version, replacing, "index put");
        inner.insert(doc);
        metrics::gauge!("index_docs", inner.docs.len() as f64);
        Ok(())
    }

    fn delete(&self, uid: &str, key: &ResourceKey) -> Result<bool, IndexError> {
        let mut inner = self.write();
        let removed = inner.remove(uid);
        if let Some(doc) = &removed {
            if &doc.key != key {
                warn!(uid, stored = %doc.key, requested = %key, "delete key differs from indexed key");
            }
        }
        metrics::gauge!("index_docs", inner.docs.len() as f64);
        Ok(removed.is_some())
    }

    fn get(&self, uid: &str) -> Option<Document> { self.read().docs.get(uid).map(|e| e.doc.clone()) }

    fn len(&self) -> usize { self.read().docs.len() }

    fn query(&self, q: &SearchQuery) -> Result<SearchOutcome, IndexError> {
        let started = std::time::Instant::now();
        let matcher = SkimMatcherV2::default();
        let inner = self.read();
        let total = inner.docs.len();

        // Seed from postings when label/annotation filters are present.
        let seeded = apply_postings(None, &q.labels, &inner.label_post, &inner.label_key_post);
        let after_labels = seeded.as_ref().map(|s| s.len()).unwrap_or(total);
        let seeded = apply_postings(seeded, &q.annotations, &inner.anno_post, &inner.anno_key_post);
        let after_annos = seeded.as_ref().map(|s| s.len()).unwrap_or(total);

        let mut candidates: Vec<&Entry> = match &seeded {
            Some(uids) => uids.iter().filter_map(|u| inner.docs.get(u)).collect(),
            None => inner.docs.values().collect(),
        };
        candidates.retain(|e| q.key_matches(&e.doc.key));
        let after_key = candidates.len();

        if let Some(maxc) = q.max_candidates {
            if candidates.len() > maxc {
                // Deterministic cap regardless of hash order
                candidates.sort_by(|a, b| a.doc.uid.cmp(&b.doc.uid));
                candidates.truncate(maxc);
            }
        }
        metrics::histogram!("search_candidates", candidates.len() as f64);

        let mut scored: Vec<(f32, &Entry)> = Vec::with_capacity(candidates.len());
        for e in candidates {
            let score = if q.text.is_empty() {
                Some(0.0f32)
            } else {
                matcher.fuzzy_match(&e.text, &q.text).map(|s| s as f32)
            };
            if let Some(score) = score {
                if q.min_score.map(|m| score >= m).unwrap_or(true) {
                    scored.push((score, e));
                }
            }
        }
        let after_text = scored.len();

        // Stable ranking
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.total_cmp(sa)
                .then_with(|| a.doc.key.name.cmp(&b.doc.key.name))
                .then_with(|| a.doc.uid.cmp(&b.doc.uid))
        });
        scored.truncate(q.limit);
        let hits = scored
            .into_iter()
            .map(|(score, e)| Hit { uid: e.doc.uid.clone(), key: e.doc.key.clone(), version: e.doc.version, score })
            .collect();
        metrics::histogram!("search_eval_ms", started.elapsed().as_secs_f64() * 1_000.0);
        Ok(SearchOutcome { hits, debug: SearchDebugInfo { total, after_labels, after_annos, after_key, after_text } })
    }
}
