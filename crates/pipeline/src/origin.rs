//! Provenance ("origin") annotations on indexed resources.

use kindex_core::{Document, ResourceKey, ResourceVersion};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OriginInfo {
    pub name: String,
    pub path: Option<String>,
    pub hash: Option<String>,
    /// Unix seconds.
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginEntry {
    pub key: ResourceKey,
    pub uid: String,
    pub version: ResourceVersion,
    /// None when the resource carries no origin annotations.
    pub origin: Option<OriginInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginResult {
    pub key: ResourceKey,
    pub items: Vec<OriginEntry>,
}

/// Read `<prefix>origin-name` (required), `-path`, `-hash`, `-timestamp`.
pub fn origin_of(doc: &Document, prefix: &str) -> Option<OriginInfo> {
    let get = |suffix: &str| doc.annotation(&format!("{prefix}origin-{suffix}")).map(str::to_string);
    let name = get("name")?;
    let timestamp = get("timestamp").and_then(|s| {
        chrono::DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.timestamp())
            .ok()
            .or_else(|| s.parse::<i64>().ok())
    });
    Some(OriginInfo { name, path: get("path"), hash: get("hash"), timestamp })
}
