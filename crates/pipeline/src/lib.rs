//! kindex pipeline: keeps a search index synchronized with a change feed.
//!
//! [`IndexFacade`] owns one index engine for one scope. It bootstraps from a
//! full list, then a watch consumer task applies incremental events in
//! receipt order:
//!
//! | event    | index operations      |
//! |----------|-----------------------|
//! | Added    | put                   |
//! | Deleted  | delete                |
//! | Modified | delete, then put      |
//!
//! Startup is strictly sequenced: `attach_watch` is only accepted once the
//! facade is `Ready` and resumes the feed after the bootstrap list version.
//! A per-uid version guard skips events that are not newer than what was
//! already applied, so redeliveries and the list/watch overlap are harmless.

#![forbid(unsafe_code)]

use kindex_core::TranslateError;
use serde::{Deserialize, Serialize};

mod config;
mod consumer;
mod facade;
mod history;
mod origin;

pub use config::PipelineConfig;
pub use consumer::{ConsumerReport, WatchHandle};
pub use facade::{ApplyOutcome, BootstrapReport, IndexFacade, SearchResult};
pub use history::{HistoryResult, Revision};
pub use origin::{origin_of, OriginEntry, OriginInfo, OriginResult};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("missing payload: {0}")]
    MissingPayload(String),
    #[error("translation failed: {0}")]
    Translation(String),
    #[error("index write failed: {0}")]
    IndexWriteFailure(String),
    #[error("bootstrap failed: {0}")]
    BootstrapFailure(String),
    #[error("feed subscription: {0}")]
    FeedSubscription(String),
    #[error("index not ready: {0}")]
    NotReady(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl From<TranslateError> for PipelineError {
    fn from(e: TranslateError) -> Self {
        match e {
            TranslateError::MissingPayload(_) => PipelineError::MissingPayload(e.to_string()),
            TranslateError::Malformed(_) => PipelineError::Translation(e.to_string()),
        }
    }
}

impl PipelineError {
    /// Label used for the dropped-events counter.
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::MissingPayload(_) => "missing_payload",
            PipelineError::Translation(_) => "translation",
            PipelineError::IndexWriteFailure(_) => "index_write",
            PipelineError::BootstrapFailure(_) => "bootstrap",
            PipelineError::FeedSubscription(_) => "feed",
            PipelineError::NotReady(_) => "not_ready",
            PipelineError::InvalidState(_) => "invalid_state",
            PipelineError::Query(_) => "query",
        }
    }
}

/// Facade lifecycle. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Uninitialized,
    Bootstrapping,
    Ready,
    Failed,
}

/// State of the watch consumer attached to a facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchState {
    Detached,
    Running,
    /// The feed ended gracefully.
    Closed,
    /// The feed failed; the index no longer follows the source.
    Lost(String),
}

/// Counters for events observed by the facade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub received: u64,
    pub applied: u64,
    pub stale: u64,
    pub dropped: u64,
    pub write_failures: u64,
    pub delete_fallbacks: u64,
}

/// Point-in-time view of a facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub scope: String,
    pub phase: Phase,
    pub watch: WatchState,
    pub docs: usize,
    pub bootstrap_version: kindex_core::ResourceVersion,
    pub failure: Option<String>,
    pub counters: Counters,
}
