//! kindex serving API (in-process).
//!
//! This crate defines the traits and wire types frontends (CLI, future RPC)
//! depend on. Every read fails fast with [`ApiError::NotReady`] until the
//! backing facade has bootstrapped.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kindex_core::{EventKind, ResourceKey, ResourceVersion};
use kindex_pipeline::{Health, IndexFacade, OriginResult, PipelineError, Revision};
use kindex_search::{Hit, SearchDebugInfo, SearchQuery};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SearchRequest {
    /// Query text, see `SearchQuery::parse`.
    pub query: String,
    /// Restricts hits to one namespace unless the query names one itself.
    pub namespace: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRequest {
    pub key: ResourceKey,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginRequest {
    pub key: ResourceKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Documents in the index when the request was served.
    pub indexed: usize,
    pub took_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    pub hits: Vec<Hit>,
    pub debug: SearchDebugInfo,
    pub meta: ResponseMeta,
}

/// One recorded revision with its payload decoded for transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevisionView {
    pub key: ResourceKey,
    pub uid: String,
    pub version: ResourceVersion,
    pub action: EventKind,
    /// Unix millis.
    pub observed_at: i64,
    pub object: serde_json::Value,
}

impl From<Revision> for RevisionView {
    fn from(r: Revision) -> Self {
        // Payloads were valid JSON when indexed; fall back to null rather than failing the read.
        let object = serde_json::from_slice(&r.payload).unwrap_or(serde_json::Value::Null);
        Self { key: r.key, uid: r.uid, version: r.version, action: r.action, observed_at: r.observed_at, object }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryResponse {
    pub key: ResourceKey,
    pub revisions: Vec<RevisionView>,
}

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("not_ready: {0}")]
    NotReady(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::NotReady(_) | PipelineError::InvalidState(_) => ApiError::NotReady(e.to_string()),
            PipelineError::Query(_) => ApiError::Validation(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Read surface over one index scope.
#[async_trait::async_trait]
pub trait IndexApi: Send + Sync {
    async fn search(&self, req: SearchRequest) -> ApiResult<SearchResponse>;

    /// Revisions for an exact key, or for every key under a prefix key (empty
    /// name and/or namespace), newest first.
    async fn history(&self, req: HistoryRequest) -> ApiResult<HistoryResponse>;

    async fn origin(&self, req: OriginRequest) -> ApiResult<OriginResult>;

    /// Always answers, ready or not.
    async fn health(&self) -> ApiResult<Health>;
}

fn validate_key(key: &ResourceKey) -> ApiResult<()> {
    if key.resource_type.is_empty() {
        return Err(ApiError::Validation("key needs a resource type".into()));
    }
    Ok(())
}

// ----------------- In-process implementation -----------------

/// In-process implementation delegating to a shared facade.
pub struct InProcApi {
    facade: Arc<IndexFacade>,
}

impl InProcApi {
    pub fn new(facade: Arc<IndexFacade>) -> Self { Self { facade } }

    pub fn facade(&self) -> &Arc<IndexFacade> { &self.facade }
}

#[async_trait::async_trait]
impl IndexApi for InProcApi {
    async fn search(&self, req: SearchRequest) -> ApiResult<SearchResponse> {
        let t0 = Instant::now();
        if req.limit == Some(0) {
            return Err(ApiError::Validation("limit must be greater than zero".into()));
        }
        let mut query = SearchQuery::parse(&req.query);
        if query.namespace.is_none() {
            query.namespace = req.namespace.clone();
        }
        if let Some(limit) = req.limit {
            query.limit = limit;
        }
        debug!(query = %req.query, ns = ?query.namespace, limit = query.limit, "api: search start");
        let out = self.facade.search(&query)?;
        let took_ms = t0.elapsed().as_millis() as u64;
        info!(hits = out.hits.len(), took_ms, "api: search ok");
        Ok(SearchResponse { hits: out.hits, debug: out.debug, meta: ResponseMeta { indexed: out.indexed, took_ms } })
    }

    async fn history(&self, req: HistoryRequest) -> ApiResult<HistoryResponse> {
        validate_key(&req.key)?;
        if req.limit == Some(0) {
            return Err(ApiError::Validation("limit must be greater than zero".into()));
        }
        let res = self.facade.history(&req.key, req.limit)?;
        info!(key = %req.key, revisions = res.revisions.len(), "api: history ok");
        Ok(HistoryResponse { key: res.key, revisions: res.revisions.into_iter().map(RevisionView::from).collect() })
    }

    async fn origin(&self, req: OriginRequest) -> ApiResult<OriginResult> {
        validate_key(&req.key)?;
        let res = self.facade.origin(&req.key)?;
        info!(key = %req.key, items = res.items.len(), "api: origin ok");
        Ok(res)
    }

    async fn health(&self) -> ApiResult<Health> { Ok(self.facade.health()) }
}

// ----------------- Mock implementation -----------------

/// Canned responses for frontend tests.
#[derive(Default)]
pub struct MockApi {
    pub hits: Vec<Hit>,
    pub revisions: Vec<RevisionView>,
    pub origin: Option<OriginResult>,
    pub health: Option<Health>,
    /// When set, every read returns this error.
    pub fail: Option<ApiError>,
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    fn check(&self) -> ApiResult<()> {
        match &self.fail {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl IndexApi for MockApi {
    async fn search(&self, req: SearchRequest) -> ApiResult<SearchResponse> {
        self.check()?;
        let limit = req.limit.unwrap_or(kindex_search::DEFAULT_LIMIT);
        let hits: Vec<Hit> = self.hits.iter().take(limit).cloned().collect();
        Ok(SearchResponse {
            debug: SearchDebugInfo { total: self.hits.len(), ..Default::default() },
            meta: ResponseMeta { indexed: self.hits.len(), took_ms: 0 },
            hits,
        })
    }

    async fn history(&self, req: HistoryRequest) -> ApiResult<HistoryResponse> {
        self.check()?;
        let revisions = self.revisions.iter().filter(|r| req.key.covers(&r.key)).cloned().collect();
        Ok(HistoryResponse { key: req.key, revisions })
    }

    async fn origin(&self, req: OriginRequest) -> ApiResult<OriginResult> {
        self.check()?;
        Ok(self.origin.clone().unwrap_or(OriginResult { key: req.key, items: Vec::new() }))
    }

    async fn health(&self) -> ApiResult<Health> {
        self.health.clone().ok_or_else(|| ApiError::Internal("no health configured".into()))
    }
}
