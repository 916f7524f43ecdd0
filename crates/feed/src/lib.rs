//! kindex feeds: the inbound change-feed contract and its implementations.
//!
//! A feed offers a full `list` of a scope (used for bootstrap) and an ordered
//! `watch` stream of change events. Delivery is at-least-once; transport
//! failures are surfaced as `Err` items instead of silently ending the stream.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use kindex_core::{ChangeEvent, ResourceRecord, ResourceVersion, WatchScope};

pub mod k8s;
pub mod memory;

pub use k8s::KubeFeed;
pub use memory::MemoryStore;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("scope not served: {0}")]
    Scope(String),
    #[error("transport: {0}")]
    Transport(String),
    /// The subscriber fell behind and `n` events were lost.
    #[error("subscriber lagged; {0} events lost")]
    Lagged(u64),
}

/// Result of a full scan.
#[derive(Debug, Clone, Default)]
pub struct ListSnapshot {
    pub items: Vec<ResourceRecord>,
    /// Store version the scan is consistent with; watches resume after it.
    pub version: ResourceVersion,
}

pub type EventStream = BoxStream<'static, Result<ChangeEvent, FeedError>>;

/// Storage-layer change feed for one scope.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Full scan of resources currently in `scope`.
    async fn list(&self, scope: &WatchScope) -> Result<ListSnapshot, FeedError>;

    /// Subscribe to changes in `scope`. With `since`, only events newer than
    /// that version are delivered (where the feed can honor it).
    /// Returns once the subscription is established.
    async fn watch(&self, scope: &WatchScope, since: Option<ResourceVersion>) -> Result<EventStream, FeedError>;
}
