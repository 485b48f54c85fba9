//! In-process object store. Backs the engine's test suites and demo runs;
//! behaves like a tiny API server: managed metadata (uid, resourceVersion,
//! creationTimestamp), merge-style apply, preconditioned delete, and change
//! events fanned out to live subscribers.

use std::sync::Mutex;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use speil_core::{meta, ChangeEvent, Error, EventKind, KindId, Result, Uid};

use crate::{CancelHandle, DeleteStatus, EventStream, MutableStore, ObjectStore};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjKey {
    kind: KindId,
    namespace: String,
    name: String,
}

struct Subscriber {
    kind: KindId,
    namespace: String,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct State {
    objects: FxHashMap<ObjKey, Value>,
    subs: Vec<Subscriber>,
    next_rv: u64,
    apply_calls: u64,
    delete_calls: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document as an out-of-band actor would: no mutation counters,
    /// but managed fields are still filled in when missing so the result looks
    /// like something a server stored. Fires an `Applied` event.
    pub fn put_raw(&self, kind: &KindId, namespace: &str, mut obj: Value) {
        let name = meta::name(&obj).unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        state.next_rv += 1;
        let rv = state.next_rv;
        fill_managed_fields(&mut obj, namespace, rv, false);
        let key = ObjKey { kind: kind.clone(), namespace: namespace.to_string(), name: name.clone() };
        state.objects.insert(key, obj);
        broadcast(&mut state, kind, namespace, EventKind::Applied, &name);
    }

    /// Remove a document unconditionally (out-of-band actor). Fires a
    /// `Deleted` event when something was there.
    pub fn remove_raw(&self, kind: &KindId, namespace: &str, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let key = ObjKey { kind: kind.clone(), namespace: namespace.to_string(), name: name.to_string() };
        let existed = state.objects.remove(&key).is_some();
        if existed {
            broadcast(&mut state, kind, namespace, EventKind::Deleted, name);
        }
        existed
    }

    /// Synchronous read for test assertions.
    pub fn get_sync(&self, kind: &KindId, namespace: &str, name: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        let key = ObjKey { kind: kind.clone(), namespace: namespace.to_string(), name: name.to_string() };
        state.objects.get(&key).cloned()
    }

    /// Mutation API calls issued through [`MutableStore::apply`].
    pub fn apply_calls(&self) -> u64 {
        self.state.lock().unwrap().apply_calls
    }

    /// Mutation API calls issued through [`MutableStore::delete`].
    pub fn delete_calls(&self) -> u64 {
        self.state.lock().unwrap().delete_calls
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: &KindId, namespace: &str, name: &str) -> Result<Option<Value>> {
        Ok(self.get_sync(kind, namespace, name))
    }

    async fn list(
        &self,
        kind: &KindId,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>> {
        let wanted = match label_selector {
            Some(s) => Some(parse_selector(s)?),
            None => None,
        };
        let state = self.state.lock().unwrap();
        let mut out: Vec<Value> = state
            .objects
            .iter()
            .filter(|(k, _)| &k.kind == kind && k.namespace == namespace)
            .filter(|(_, obj)| match &wanted {
                Some(pairs) => pairs
                    .iter()
                    .all(|(lk, lv)| meta::label(obj, lk) == Some(lv.as_str())),
                None => true,
            })
            .map(|(_, obj)| obj.clone())
            .collect();
        out.sort_by_key(|o| meta::name(o).unwrap_or_default().to_string());
        Ok(out)
    }

    async fn subscribe(&self, kind: &KindId, namespace: &str) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut state = self.state.lock().unwrap();
        state.subs.push(Subscriber {
            kind: kind.clone(),
            namespace: namespace.to_string(),
            tx,
        });
        Ok(EventStream { rx, cancel: CancelHandle::detached() })
    }
}

#[async_trait]
impl MutableStore for MemoryStore {
    async fn apply(&self, kind: &KindId, namespace: &str, desired: &Value) -> Result<Value> {
        let name = meta::name(desired)
            .ok_or_else(|| Error::validation("apply object missing metadata.name"))?
            .to_string();
        let mut state = self.state.lock().unwrap();
        state.apply_calls += 1;
        let key = ObjKey { kind: kind.clone(), namespace: namespace.to_string(), name: name.clone() };
        let stored = match state.objects.get(&key) {
            None => {
                let mut doc = desired.clone();
                state.next_rv += 1;
                let rv = state.next_rv;
                fill_managed_fields(&mut doc, namespace, rv, true);
                debug!(kind = %kind, ns = %namespace, name = %name, rv, "memory apply: create");
                state.objects.insert(key, doc.clone());
                broadcast(&mut state, kind, namespace, EventKind::Applied, &name);
                doc
            }
            Some(current) => {
                let merged = merge_apply(current, desired);
                if &merged == current {
                    // Server-style no-op: same resourceVersion, no event.
                    return Ok(current.clone());
                }
                let mut doc = merged;
                state.next_rv += 1;
                let rv = state.next_rv;
                set_resource_version(&mut doc, rv);
                debug!(kind = %kind, ns = %namespace, name = %name, rv, "memory apply: update");
                state.objects.insert(key, doc.clone());
                broadcast(&mut state, kind, namespace, EventKind::Applied, &name);
                doc
            }
        };
        Ok(stored)
    }

    async fn delete(
        &self,
        kind: &KindId,
        namespace: &str,
        name: &str,
        expected_uid: Uid,
    ) -> Result<DeleteStatus> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        let key = ObjKey { kind: kind.clone(), namespace: namespace.to_string(), name: name.to_string() };
        let Some(current) = state.objects.get(&key) else {
            return Ok(DeleteStatus::AlreadyGone);
        };
        let live = meta::uid(current)
            .map(speil_core::parse_uid)
            .transpose()?
            .ok_or_else(|| Error::validation(format!("stored object {namespace}/{name} has no uid")))?;
        if live != expected_uid {
            debug!(kind = %kind, ns = %namespace, name = %name, "memory delete: uid mismatch, leaving object");
            return Ok(DeleteStatus::UidMismatch);
        }
        state.objects.remove(&key);
        broadcast(&mut state, kind, namespace, EventKind::Deleted, name);
        Ok(DeleteStatus::Deleted)
    }
}

/// Fill in the fields a server owns. `fresh_uid` replaces any incoming uid;
/// otherwise one is only assigned when missing (out-of-band inserts may pin
/// their own to simulate recreation races).
fn fill_managed_fields(obj: &mut Value, namespace: &str, rv: u64, fresh_uid: bool) {
    let Some(map) = obj.as_object_mut() else {
        return;
    };
    let meta = map
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    let Some(meta_map) = meta.as_object_mut() else {
        return;
    };
    meta_map.insert("namespace".into(), Value::String(namespace.to_string()));
    if fresh_uid || !meta_map.contains_key("uid") {
        meta_map.insert(
            "uid".into(),
            Value::String(uuid::Uuid::new_v4().hyphenated().to_string()),
        );
    }
    meta_map.insert("resourceVersion".into(), Value::String(rv.to_string()));
    meta_map.entry("creationTimestamp").or_insert_with(|| {
        Value::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
    });
}

fn set_resource_version(obj: &mut Value, rv: u64) {
    if let Some(meta_map) = obj
        .get_mut("metadata")
        .and_then(|m| m.as_object_mut())
    {
        meta_map.insert("resourceVersion".into(), Value::String(rv.to_string()));
    }
}

/// Merge semantics of apply: non-metadata sections asserted wholesale,
/// metadata labels/annotations merged per key. Everything else under metadata
/// stays server-managed; sections only the live object carries survive.
fn merge_apply(current: &Value, desired: &Value) -> Value {
    let mut out = current.clone();
    let Some(want) = desired.as_object() else {
        return out;
    };
    let Some(out_map) = out.as_object_mut() else {
        return desired.clone();
    };
    for (k, v) in want {
        if k != "metadata" {
            out_map.insert(k.clone(), v.clone());
        }
    }
    if let Some(want_meta) = want.get("metadata").and_then(|m| m.as_object()) {
        let meta = out_map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(meta_map) = meta.as_object_mut() {
            for section in ["labels", "annotations"] {
                let Some(want_map) = want_meta.get(section).and_then(|m| m.as_object()) else {
                    continue;
                };
                let dst = meta_map
                    .entry(section)
                    .or_insert_with(|| Value::Object(Default::default()));
                if let Some(dst_map) = dst.as_object_mut() {
                    for (k, v) in want_map {
                        dst_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
    }
    out
}

fn parse_selector(s: &str) -> Result<Vec<(String, String)>> {
    s.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Error::validation(format!("invalid label selector segment {p:?}")))
        })
        .collect()
}

fn broadcast(state: &mut State, kind: &KindId, namespace: &str, ev: EventKind, name: &str) {
    let event = ChangeEvent {
        kind: ev,
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    state.subs.retain(|s| {
        if &s.kind != kind || s.namespace != namespace {
            return true;
        }
        match s.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(kind = %kind, ns = %namespace, "subscriber lagging, dropping change event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_replaces_sections_and_merges_labels() {
        let current = serde_json::json!({
            "metadata": {
                "name": "cfg",
                "labels": { "foreign": "yes", "app": "old" },
                "uid": "u-1"
            },
            "data": { "a": "1", "b": "2" },
            "status": { "observed": true }
        });
        let desired = serde_json::json!({
            "metadata": { "name": "cfg", "labels": { "app": "new" } },
            "data": { "a": "1" }
        });
        let merged = merge_apply(&current, &desired);
        // data is asserted wholesale: "b" goes away
        assert_eq!(merged["data"], serde_json::json!({ "a": "1" }));
        // labels merge per key: foreign survives, app updated
        assert_eq!(merged["metadata"]["labels"]["foreign"], "yes");
        assert_eq!(merged["metadata"]["labels"]["app"], "new");
        // server-managed and unasserted fields survive
        assert_eq!(merged["metadata"]["uid"], "u-1");
        assert_eq!(merged["status"]["observed"], true);
    }

    #[test]
    fn selector_parsing() {
        assert_eq!(
            parse_selector("a=1, b = 2").unwrap(),
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
        assert!(parse_selector("nonsense").is_err());
        assert!(parse_selector("").unwrap().is_empty());
    }
}
