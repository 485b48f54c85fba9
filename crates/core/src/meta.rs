//! Accessors over raw JSON object documents. Resources flow through the
//! engine as `serde_json::Value`, so the common metadata lookups live here.

use serde_json::Value;

pub fn metadata(obj: &Value) -> Option<&serde_json::Map<String, Value>> {
    obj.get("metadata").and_then(|m| m.as_object())
}

pub fn name(obj: &Value) -> Option<&str> {
    metadata(obj).and_then(|m| m.get("name")).and_then(|v| v.as_str())
}

pub fn namespace(obj: &Value) -> Option<&str> {
    metadata(obj).and_then(|m| m.get("namespace")).and_then(|v| v.as_str())
}

pub fn uid(obj: &Value) -> Option<&str> {
    metadata(obj).and_then(|m| m.get("uid")).and_then(|v| v.as_str())
}

pub fn resource_version(obj: &Value) -> Option<&str> {
    metadata(obj).and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str())
}

pub fn label<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    metadata(obj)
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.get(key))
        .and_then(|v| v.as_str())
}

pub fn annotation<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    metadata(obj)
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_metadata() {
        let obj = serde_json::json!({
            "metadata": {
                "name": "cfg",
                "namespace": "demo",
                "uid": "u-1",
                "resourceVersion": "7",
                "labels": { "app": "web" },
                "annotations": { "note": "hi" }
            }
        });
        assert_eq!(name(&obj), Some("cfg"));
        assert_eq!(namespace(&obj), Some("demo"));
        assert_eq!(uid(&obj), Some("u-1"));
        assert_eq!(resource_version(&obj), Some("7"));
        assert_eq!(label(&obj, "app"), Some("web"));
        assert_eq!(annotation(&obj, "note"), Some("hi"));
        assert_eq!(label(&obj, "missing"), None);
    }

    #[test]
    fn tolerates_absent_metadata() {
        let obj = serde_json::json!({ "data": {} });
        assert_eq!(name(&obj), None);
        assert_eq!(uid(&obj), None);
    }
}
