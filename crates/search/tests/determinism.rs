#![forbid(unsafe_code)]

use kindex_core::{translate, ChangeEvent, Document, ResourceRecord, ResourceVersion};
use kindex_search::{IndexEngine, MemIndex, SearchQuery};

fn raw(api_version: &str, kind: &str, uid: &str, name: &str, ns: &str, v: i64) -> Document {
    let value = serde_json::json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {
            "name": name,
            "namespace": ns,
            "uid": uid,
            "creationTimestamp": "2020-01-01T00:00:00Z",
            "labels": {"tier": "backend"},
        }
    });
    translate(&ChangeEvent::added(ResourceRecord::from_json(ResourceVersion(v), &value))).unwrap()
}

fn docs() -> Vec<Document> {
    vec![
        raw("v1", "ConfigMap", "u1", "cm-a", "ns1", 1),
        raw("v1", "ConfigMap", "u2", "cm-b", "ns2", 2),
        raw("v1", "ConfigMap", "u3", "cm-a", "ns3", 3),
        raw("cert-manager.io/v1", "Certificate", "u10", "cert-x", "ns1", 4),
        raw("cert-manager.io/v1", "Certificate", "u11", "cert-y", "ns1", 5),
    ]
}

fn canonical(idx: &MemIndex, q: &str) -> Vec<(String, String, String)> {
    idx.query(&SearchQuery::parse(q))
        .unwrap()
        .hits
        .into_iter()
        .map(|h| (h.key.namespace, h.key.name, h.uid))
        .collect()
}

#[test]
fn results_do_not_depend_on_insertion_order() {
    let forward = MemIndex::new();
    for d in docs() {
        forward.put(d).unwrap();
    }
    let backward = MemIndex::new();
    for d in docs().into_iter().rev() {
        backward.put(d).unwrap();
    }

    for q in ["ns:ns1", "label:tier=backend", "cm", "g:cert-manager.io", ""] {
        assert_eq!(canonical(&forward, q), canonical(&backward, q), "query {q:?}");
    }
}

#[test]
fn ties_break_by_name_then_uid() {
    let idx = MemIndex::new();
    for d in docs().into_iter().rev() {
        idx.put(d).unwrap();
    }
    let hits = canonical(&idx, "k:ConfigMap");
    let names: Vec<(&str, &str)> = hits.iter().map(|(_, n, u)| (n.as_str(), u.as_str())).collect();
    assert_eq!(names, vec![("cm-a", "u1"), ("cm-a", "u3"), ("cm-b", "u2")]);
}

#[test]
fn group_filter_separates_resource_types() {
    let idx = MemIndex::new();
    for d in docs() {
        idx.put(d).unwrap();
    }
    let certs = canonical(&idx, "g:cert-manager.io ns:ns1");
    assert_eq!(certs.len(), 2);
    assert!(certs.iter().all(|(_, name, _)| name.starts_with("cert-")));
    let core = canonical(&idx, "k:configmap ns:ns1");
    assert_eq!(core, vec![("ns1".to_string(), "cm-a".to_string(), "u1".to_string())]);
}
