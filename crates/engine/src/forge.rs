//! Ownership marking and the projection of local objects into their remote
//! siblings.

use serde_json::{Map, Value};

use speil_core::{meta, parse_uid, Error, Result, Uid};

/// Label stamped on every reflected object.
pub const MANAGED_BY_LABEL: &str = "reflection.speil.dev/managed-by";
pub const MANAGED_BY_VALUE: &str = "speil";
/// Annotation carrying the uid of the local source object.
pub const SOURCE_UID_ANNOTATION: &str = "reflection.speil.dev/source-uid";

/// Annotations that must not ride along to the remote cluster: client-side
/// bookkeeping, and service-account wiring that only means something locally.
const SCRUBBED_ANNOTATIONS: [&str; 3] = [
    "kubectl.kubernetes.io/last-applied-configuration",
    "kubernetes.io/service-account.name",
    "kubernetes.io/service-account.uid",
];

/// True when the object carries the ownership marker.
pub fn is_managed(obj: &Value) -> bool {
    meta::label(obj, MANAGED_BY_LABEL) == Some(MANAGED_BY_VALUE)
}

/// Source uid recorded on a reflected object, when present and well formed.
pub fn source_uid(obj: &Value) -> Option<Uid> {
    meta::annotation(obj, SOURCE_UID_ANNOTATION).and_then(|s| parse_uid(s).ok())
}

/// Build the desired remote sibling of a local object: the translated payload
/// sections, the local name under the remote namespace, carried-over labels
/// and annotations, and the ownership marker on top. Server-managed metadata
/// is never asserted.
pub fn remote_sibling(local: &Value, translated: Value, remote_namespace: &str) -> Result<Value> {
    let name = meta::name(local)
        .ok_or_else(|| Error::validation("local object missing metadata.name"))?;
    let uid = meta::uid(local)
        .ok_or_else(|| Error::validation("local object missing metadata.uid"))?;
    parse_uid(uid)?;

    let mut map = match translated {
        Value::Object(m) => m,
        Value::Null => Map::new(),
        other => {
            return Err(Error::validation(format!(
                "translated payload must be an object, got {other}"
            )))
        }
    };
    for field in ["apiVersion", "kind"] {
        if let Some(v) = local.get(field) {
            map.insert(field.into(), v.clone());
        }
    }

    let mut labels = Map::new();
    if let Some(src) = local
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
    {
        for (k, v) in src {
            labels.insert(k.clone(), v.clone());
        }
    }
    labels.insert(MANAGED_BY_LABEL.into(), Value::String(MANAGED_BY_VALUE.into()));

    let mut annotations = Map::new();
    if let Some(src) = local
        .get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.as_object())
    {
        for (k, v) in src {
            if SCRUBBED_ANNOTATIONS.contains(&k.as_str()) {
                continue;
            }
            annotations.insert(k.clone(), v.clone());
        }
    }
    annotations.insert(SOURCE_UID_ANNOTATION.into(), Value::String(uid.to_string()));

    let mut metadata = Map::new();
    metadata.insert("name".into(), Value::String(name.to_string()));
    metadata.insert("namespace".into(), Value::String(remote_namespace.to_string()));
    metadata.insert("labels".into(), Value::Object(labels));
    metadata.insert("annotations".into(), Value::Object(annotations));
    map.insert("metadata".into(), Value::Object(metadata));

    Ok(Value::Object(map))
}

/// Level check: the remote object already holds everything `desired` asserts.
///
/// Sections listed in `owned` compare exactly (an empty asserted section and
/// an absent live one count as equal, since servers drop empty maps). Other
/// sections compare on asserted keys only. Marker and carried metadata must
/// hold key for key.
pub fn converged(desired: &Value, current: &Value, owned: &[&str]) -> bool {
    let (Some(want), Some(have)) = (desired.as_object(), current.as_object()) else {
        return false;
    };

    for (section, wv) in want {
        if matches!(section.as_str(), "metadata" | "apiVersion" | "kind") {
            continue;
        }
        let ok = match have.get(section) {
            None => is_effectively_empty(wv),
            Some(hv) if owned.contains(&section.as_str()) => {
                wv == hv || (is_effectively_empty(wv) && is_effectively_empty(hv))
            }
            Some(hv) => asserted_subset(wv, hv),
        };
        if !ok {
            return false;
        }
    }

    let have_meta = have.get("metadata").and_then(|m| m.as_object());
    if let Some(wm) = want.get("metadata").and_then(|m| m.as_object()) {
        for section in ["labels", "annotations"] {
            let Some(ws) = wm.get(section).and_then(|s| s.as_object()) else {
                continue;
            };
            let hs = have_meta
                .and_then(|m| m.get(section))
                .and_then(|s| s.as_object());
            for (k, v) in ws {
                if hs.and_then(|m| m.get(k)) != Some(v) {
                    return false;
                }
            }
        }
    }
    true
}

fn is_effectively_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

/// Every key asserted in `want` holds in `have`. Objects recurse, arrays
/// match element for element, scalars compare exactly.
fn asserted_subset(want: &Value, have: &Value) -> bool {
    match (want, have) {
        (Value::Object(wm), Value::Object(hm)) => wm.iter().all(|(k, wv)| match hm.get(k) {
            Some(hv) => asserted_subset(wv, hv),
            None => is_effectively_empty(wv),
        }),
        (Value::Array(wa), Value::Array(ha)) => {
            wa.len() == ha.len() && wa.iter().zip(ha).all(|(w, h)| asserted_subset(w, h))
        }
        _ => want == have,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_cfg() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cfg",
                "namespace": "demo",
                "uid": "8c2f0a1e-13d4-4b7e-9a0a-1f2e3d4c5b6a",
                "labels": { "app": "web" },
                "annotations": {
                    "team": "core",
                    "kubectl.kubernetes.io/last-applied-configuration": "{...}"
                },
                "resourceVersion": "42"
            },
            "data": { "k": "v" }
        })
    }

    #[test]
    fn sibling_carries_marker_and_identity() {
        let local = local_cfg();
        let sibling =
            remote_sibling(&local, json!({ "data": { "k": "v" } }), "demo-remote").unwrap();

        assert!(is_managed(&sibling));
        assert_eq!(
            source_uid(&sibling),
            Some(parse_uid("8c2f0a1e-13d4-4b7e-9a0a-1f2e3d4c5b6a").unwrap())
        );
        assert_eq!(sibling["metadata"]["name"], "cfg");
        assert_eq!(sibling["metadata"]["namespace"], "demo-remote");
        assert_eq!(sibling["metadata"]["labels"]["app"], "web");
        assert_eq!(sibling["metadata"]["annotations"]["team"], "core");
        // client-side bookkeeping does not ride along
        assert!(sibling["metadata"]["annotations"]
            .get("kubectl.kubernetes.io/last-applied-configuration")
            .is_none());
        // server-managed metadata is never asserted
        assert!(sibling["metadata"].get("resourceVersion").is_none());
        assert!(sibling["metadata"].get("uid").is_none());
    }

    #[test]
    fn sibling_requires_identity_fields() {
        let no_uid = json!({ "metadata": { "name": "x" } });
        assert!(remote_sibling(&no_uid, json!({}), "r").is_err());
        let bad_uid = json!({ "metadata": { "name": "x", "uid": "nope" } });
        assert!(remote_sibling(&bad_uid, json!({}), "r").is_err());
    }

    #[test]
    fn owned_sections_converge_on_exact_equality() {
        let desired = json!({ "data": { "a": "1" }, "metadata": {} });
        let same = json!({ "data": { "a": "1" }, "metadata": { "uid": "u" } });
        let extra_key = json!({ "data": { "a": "1", "b": "2" } });
        assert!(converged(&desired, &same, &["data"]));
        assert!(!converged(&desired, &extra_key, &["data"]));
    }

    #[test]
    fn empty_owned_section_matches_absent_live_one() {
        let desired = json!({ "data": {}, "binaryData": {} });
        let live = json!({ "metadata": { "uid": "u" } });
        assert!(converged(&desired, &live, &["data", "binaryData"]));
    }

    #[test]
    fn unowned_sections_converge_on_asserted_keys() {
        // The remote control plane fills in addressing the engine cleared.
        let desired = json!({
            "spec": {
                "selector": { "app": "web" },
                "ports": [ { "port": 80, "protocol": "TCP" } ]
            }
        });
        let live = json!({
            "spec": {
                "selector": { "app": "web" },
                "clusterIP": "10.0.0.7",
                "ports": [ { "port": 80, "protocol": "TCP", "nodePort": 31234 } ]
            }
        });
        assert!(converged(&desired, &live, &[]));

        let drifted = json!({
            "spec": {
                "selector": { "app": "other" },
                "clusterIP": "10.0.0.7",
                "ports": [ { "port": 80, "protocol": "TCP", "nodePort": 31234 } ]
            }
        });
        assert!(!converged(&desired, &drifted, &[]));
    }

    #[test]
    fn missing_marker_label_blocks_convergence() {
        let local = local_cfg();
        let desired = remote_sibling(&local, json!({ "data": { "k": "v" } }), "r").unwrap();
        let mut live = desired.clone();
        live["metadata"]["labels"]
            .as_object_mut()
            .unwrap()
            .remove(MANAGED_BY_LABEL);
        assert!(!converged(&desired, &live, &["data"]));
        assert!(converged(&desired, &desired.clone(), &["data"]));
    }
}
