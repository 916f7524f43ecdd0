//! kindex core types: resource keys, change events and index documents.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod translate;

pub use translate::{translate, translate_with_source, PayloadSource, TranslateError};

/// Composite identity of a resource's logical slot, independent of its version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ResourceKey {
    pub group: String,
    pub resource_type: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(group: &str, resource_type: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            resource_type: resource_type.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Build the group/type half of a key from an API-version string and kind.
    pub fn from_type_meta(api_version: &str, kind: &str) -> Self {
        Self {
            group: derive_group(api_version).to_string(),
            resource_type: kind.to_string(),
            namespace: String::new(),
            name: String::new(),
        }
    }

    /// Complete the key with object metadata.
    pub fn with_meta(mut self, namespace: &str, name: &str) -> Self {
        self.namespace = namespace.to_string();
        self.name = name.to_string();
        self
    }

    /// A key with an empty name addresses every resource under its namespace
    /// (and an empty namespace addresses every namespace).
    pub fn is_prefix(&self) -> bool { self.name.is_empty() }

    /// Whether `other` falls under this key. Exact keys match only themselves.
    pub fn covers(&self, other: &ResourceKey) -> bool {
        if self.group != other.group || !self.resource_type.eq_ignore_ascii_case(&other.resource_type) {
            return false;
        }
        if !self.namespace.is_empty() && self.namespace != other.namespace {
            return false;
        }
        self.name.is_empty() || self.name == other.name
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.group, self.resource_type, self.namespace, self.name)
    }
}

/// Group segment of an API-version string: the text before the first `/`,
/// or empty when there is no `/`. Malformed input degrades to an empty group.
pub fn derive_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

/// Opaque, comparable version token attached to every change notification.
/// Zero means the source had no usable version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ResourceVersion(pub i64);

impl ResourceVersion {
    pub const UNSET: ResourceVersion = ResourceVersion(0);

    pub fn is_unset(self) -> bool { self.0 == 0 }

    /// Parse a textual version (e.g. Kubernetes `metadata.resourceVersion`).
    pub fn parse(s: &str) -> Self {
        s.trim().parse::<i64>().map(ResourceVersion).unwrap_or(Self::UNSET)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// A resource as carried by the feed: its version plus JSON-encoded body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub version: ResourceVersion,
    pub value: Vec<u8>,
}

impl ResourceRecord {
    pub fn new(version: ResourceVersion, value: Vec<u8>) -> Self { Self { version, value } }

    pub fn from_json(version: ResourceVersion, value: &serde_json::Value) -> Self {
        // Serializing a Value cannot fail.
        Self { version, value: serde_json::to_vec(value).unwrap_or_default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
        }
    }
}

/// One notification from the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub current: Option<ResourceRecord>,
    pub previous: Option<ResourceRecord>,
}

impl ChangeEvent {
    pub fn added(current: ResourceRecord) -> Self {
        Self { kind: EventKind::Added, current: Some(current), previous: None }
    }

    pub fn modified(current: ResourceRecord, previous: Option<ResourceRecord>) -> Self {
        Self { kind: EventKind::Modified, current: Some(current), previous }
    }

    pub fn deleted(current: Option<ResourceRecord>, previous: Option<ResourceRecord>) -> Self {
        Self { kind: EventKind::Deleted, current, previous }
    }

    /// Version of whichever record identifies the event.
    pub fn version(&self) -> ResourceVersion {
        self.current
            .as_ref()
            .or(self.previous.as_ref())
            .map(|r| r.version)
            .unwrap_or(ResourceVersion::UNSET)
    }
}

/// The unit handed to the index engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub key: ResourceKey,
    pub uid: String,
    pub version: ResourceVersion,
    pub payload: Vec<u8>,
    /// Labels sorted by key.
    pub labels: SmallVec<[(String, String); 8]>,
    /// Annotations sorted by key.
    pub annotations: SmallVec<[(String, String); 4]>,
    /// Unix seconds from `metadata.creationTimestamp`, 0 when absent.
    pub creation_ts: i64,
}

impl Document {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Scope of a subscription: one resource type, optionally one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchScope {
    pub group: String,
    /// API version; only feeds that need it (Kubernetes discovery) look at it.
    pub version: String,
    pub resource_type: String,
    pub namespace: Option<String>,
}

impl WatchScope {
    pub fn new(group: &str, resource_type: &str) -> Self {
        Self { group: group.to_string(), version: String::new(), resource_type: resource_type.to_string(), namespace: None }
    }

    pub fn in_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Parse `Kind`, `version/Kind` or `group/version/Kind`.
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        let (group, version, kind) = match parts.as_slice() {
            [kind] => ("", "", *kind),
            [version, kind] => ("", *version, *kind),
            [group, version, kind] => (*group, *version, *kind),
            _ => return None,
        };
        if kind.is_empty() {
            return None;
        }
        Some(Self { group: group.to_string(), version: version.to_string(), resource_type: kind.to_string(), namespace: None })
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        self.group == key.group
            && self.resource_type.eq_ignore_ascii_case(&key.resource_type)
            && self.namespace.as_deref().map(|ns| ns == key.namespace).unwrap_or(true)
    }

    /// Prefix key addressing the whole scope.
    pub fn prefix_key(&self) -> ResourceKey {
        ResourceKey::new(&self.group, &self.resource_type, self.namespace.as_deref().unwrap_or(""), "")
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.group.is_empty(), self.version.is_empty()) {
            (true, true) => write!(f, "{}", self.resource_type)?,
            (true, false) => write!(f, "{}/{}", self.version, self.resource_type)?,
            (false, _) => write!(f, "{}/{}/{}", self.group, self.version, self.resource_type)?,
        }
        if let Some(ns) = &self.namespace {
            write!(f, " ns={}", ns)?;
        }
        Ok(())
    }
}

pub mod prelude {
    pub use super::{
        derive_group, translate, ChangeEvent, Document, EventKind, ResourceKey, ResourceRecord, ResourceVersion,
        TranslateError, WatchScope,
    };
}
