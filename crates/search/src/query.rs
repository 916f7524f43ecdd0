use kindex_core::ResourceKey;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: usize = 50;

/// Structured search criteria.
///
/// Text form (see [`SearchQuery::parse`]): whitespace separated tokens.
/// `g:GROUP`, `k:KIND`, `ns:NAMESPACE`, `name:NAME` are exact key filters;
/// `label:KEY` / `label:KEY=VALUE` and `anno:KEY` / `anno:KEY=VALUE` filter on
/// labels and annotations; anything else is fuzzy free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub group: Option<String>,
    pub resource_type: Option<String>,
    pub namespace: Option<String>,
    pub name: Option<String>,
    /// `(key, Some(value))` requires the pair; `(key, None)` only the key.
    pub labels: Vec<(String, Option<String>)>,
    pub annotations: Vec<(String, Option<String>)>,
    pub text: String,
    pub limit: usize,
    pub max_candidates: Option<usize>,
    pub min_score: Option<f32>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            group: None,
            resource_type: None,
            namespace: None,
            name: None,
            labels: Vec::new(),
            annotations: Vec::new(),
            text: String::new(),
            limit: DEFAULT_LIMIT,
            max_candidates: None,
            min_score: None,
        }
    }
}

fn split_pair(rest: &str) -> (String, Option<String>) {
    match rest.split_once('=') {
        Some((k, v)) => (k.to_string(), Some(v.to_string())),
        None => (rest.to_string(), None),
    }
}

impl SearchQuery {
    pub fn parse(q: &str) -> Self {
        let mut out = SearchQuery::default();
        let mut free_terms: Vec<&str> = Vec::new();
        for tok in q.split_whitespace() {
            if let Some(rest) = tok.strip_prefix("ns:") { out.namespace = Some(rest.to_string()); continue; }
            if let Some(rest) = tok.strip_prefix("g:") { out.group = Some(rest.to_string()); continue; }
            if let Some(rest) = tok.strip_prefix("k:") { if !rest.is_empty() { out.resource_type = Some(rest.to_string()); continue; } }
            if let Some(rest) = tok.strip_prefix("name:") { if !rest.is_empty() { out.name = Some(rest.to_string()); continue; } }
            if let Some(rest) = tok.strip_prefix("label:") { if !rest.is_empty() { out.labels.push(split_pair(rest)); continue; } }
            if let Some(rest) = tok.strip_prefix("anno:") { if !rest.is_empty() { out.annotations.push(split_pair(rest)); continue; } }
            free_terms.push(tok);
        }
        out.text = free_terms.join(" ");
        out
    }

    /// Exact criteria for one key. A prefix key (empty name or namespace)
    /// leaves those dimensions unfiltered.
    pub fn for_key(key: &ResourceKey) -> Self {
        let non_empty = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };
        SearchQuery {
            group: Some(key.group.clone()),
            resource_type: Some(key.resource_type.clone()),
            namespace: non_empty(&key.namespace),
            name: non_empty(&key.name),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn key_matches(&self, key: &ResourceKey) -> bool {
        self.group.as_deref().map(|g| g.eq_ignore_ascii_case(&key.group)).unwrap_or(true)
            && self.resource_type.as_deref().map(|k| k.eq_ignore_ascii_case(&key.resource_type)).unwrap_or(true)
            && self.namespace.as_deref().map(|ns| ns == key.namespace).unwrap_or(true)
            && self.name.as_deref().map(|n| n == key.name).unwrap_or(true)
    }
}
