//! Change event translation: feed notification -> index document.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::{ChangeEvent, Document, EventKind, ResourceKey, ResourceRecord};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TranslateError {
    /// The event carries neither the record its kind requires nor a usable fallback.
    #[error("change event ({0}) has no resource payload")]
    MissingPayload(&'static str),
    #[error("malformed resource: {0}")]
    Malformed(String),
}

/// Which record of the event the document was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Current,
    /// Deleted event without `current`; identity recovered from `previous`.
    Previous,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeMeta {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: ObjectMeta,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    annotations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    creation_timestamp: Option<String>,
}

/// Translate a change event into the document to index or delete.
pub fn translate(event: &ChangeEvent) -> Result<Document, TranslateError> {
    translate_with_source(event).map(|(doc, _)| doc)
}

/// Like [`translate`], also reporting whether the delete fallback was taken.
pub fn translate_with_source(event: &ChangeEvent) -> Result<(Document, PayloadSource), TranslateError> {
    let (record, source) = match event.kind {
        EventKind::Added | EventKind::Modified => {
            let rec = event.current.as_ref().ok_or(TranslateError::MissingPayload(event.kind.as_str()))?;
            (rec, PayloadSource::Current)
        }
        EventKind::Deleted => match (&event.current, &event.previous) {
            (Some(cur), _) => (cur, PayloadSource::Current),
            (None, Some(prev)) => (prev, PayloadSource::Previous),
            (None, None) => return Err(TranslateError::MissingPayload(event.kind.as_str())),
        },
    };
    Ok((document_from(record)?, source))
}

fn document_from(record: &ResourceRecord) -> Result<Document, TranslateError> {
    let meta: TypeMeta =
        serde_json::from_slice(&record.value).map_err(|e| TranslateError::Malformed(e.to_string()))?;
    if meta.kind.is_empty() {
        return Err(TranslateError::Malformed("missing kind".into()));
    }
    let m = meta.metadata;
    if m.uid.is_empty() {
        return Err(TranslateError::Malformed("missing metadata.uid".into()));
    }
    if m.name.is_empty() {
        return Err(TranslateError::Malformed("missing metadata.name".into()));
    }
    let key = ResourceKey::from_type_meta(&meta.api_version, &meta.kind)
        .with_meta(m.namespace.as_deref().unwrap_or(""), &m.name);
    let creation_ts = m
        .creation_timestamp
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);
    // BTreeMap iteration keeps labels sorted by key
    Ok(Document {
        key,
        uid: m.uid,
        version: record.version,
        payload: record.value.clone(),
        labels: m.labels.unwrap_or_default().into_iter().collect(),
        annotations: m.annotations.unwrap_or_default().into_iter().collect(),
        creation_ts,
    })
}
